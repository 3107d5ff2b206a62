//! Object-model lock manager.
//!
//! A queued, FIFO-fair mutex whose holder is a connection id. The accept
//! path force-releases on disconnect, so a crashed client can never wedge
//! model writers.

use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dcs_core::error::{ErrorType, IpcError};

#[derive(Default)]
struct LockState {
    holder: Option<u32>,
    queue: VecDeque<(u32, oneshot::Sender<()>)>,
}

#[derive(Default)]
pub struct LockManager {
    state: Mutex<LockState>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self) -> Option<u32> {
        self.state.lock().expect("lock state poisoned").holder
    }

    pub fn is_held_by(&self, conn_id: u32) -> bool {
        self.holder() == Some(conn_id)
    }

    /// Wait in line for the lock. Locks are not reentrant: a second acquire
    /// by the current holder fails immediately with `AlreadyHeld`.
    pub async fn acquire(&self, conn_id: u32, cancel: &CancellationToken) -> Result<(), IpcError> {
        let waiter = {
            let mut state = self.state.lock().expect("lock state poisoned");
            if state.holder == Some(conn_id) {
                return Err(IpcError::new(
                    ErrorType::AlreadyHeld,
                    "the object model lock is already held by this connection",
                ));
            }
            if state.holder.is_none() && state.queue.is_empty() {
                state.holder = Some(conn_id);
                debug!(event = "model_lock_acquired", conn_id);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back((conn_id, tx));
            rx
        };

        tokio::select! {
            granted = waiter => match granted {
                Ok(()) => {
                    debug!(event = "model_lock_acquired", conn_id, queued = true);
                    Ok(())
                }
                // The grant side only drops a waiter when its connection is
                // being torn down.
                Err(_) => Err(IpcError::cancelled()),
            },
            _ = cancel.cancelled() => {
                self.remove_waiter(conn_id);
                Err(IpcError::cancelled())
            }
        }
    }

    /// Release an explicitly held lock. `NotHeld` when the caller is not the
    /// holder.
    pub fn release(&self, conn_id: u32) -> Result<(), IpcError> {
        let mut state = self.state.lock().expect("lock state poisoned");
        if state.holder != Some(conn_id) {
            return Err(IpcError::new(
                ErrorType::NotHeld,
                "the object model lock is not held by this connection",
            ));
        }
        Self::hand_over(&mut state);
        debug!(event = "model_lock_released", conn_id);
        Ok(())
    }

    /// Disconnect cleanup: drop any queued wait and force-release a held
    /// lock. Total — safe to call for connections that never locked.
    pub fn release_for_connection(&self, conn_id: u32) {
        let mut state = self.state.lock().expect("lock state poisoned");
        state.queue.retain(|(waiter, _)| *waiter != conn_id);
        if state.holder == Some(conn_id) {
            Self::hand_over(&mut state);
            debug!(event = "model_lock_force_released", conn_id);
        }
    }

    fn hand_over(state: &mut LockState) {
        state.holder = None;
        while let Some((next, tx)) = state.queue.pop_front() {
            if tx.send(()).is_ok() {
                state.holder = Some(next);
                break;
            }
        }
    }

    fn remove_waiter(&self, conn_id: u32) {
        let mut state = self.state.lock().expect("lock state poisoned");
        state.queue.retain(|(waiter, _)| *waiter != conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn exclusive_with_fifo_handover() {
        let lock = Arc::new(LockManager::new());
        let cancel = CancellationToken::new();

        lock.acquire(1, &cancel).await.expect("first acquire");
        assert_eq!(lock.holder(), Some(1));

        let second = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(2, &cancel).await })
        };
        let third = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                // Give connection 2 time to queue first.
                tokio::time::sleep(Duration::from_millis(50)).await;
                lock.acquire(3, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lock.holder(), Some(1));

        lock.release(1).expect("release");
        second.await.expect("join").expect("second acquire");
        assert_eq!(lock.holder(), Some(2));

        lock.release(2).expect("release");
        third.await.expect("join").expect("third acquire");
        assert_eq!(lock.holder(), Some(3));
    }

    #[tokio::test]
    async fn reacquire_fails_already_held() {
        let lock = LockManager::new();
        let cancel = CancellationToken::new();
        lock.acquire(7, &cancel).await.expect("acquire");
        let err = lock.acquire(7, &cancel).await.expect_err("reacquire");
        assert_eq!(err.error_type, ErrorType::AlreadyHeld);
    }

    #[tokio::test]
    async fn foreign_release_fails_not_held() {
        let lock = LockManager::new();
        let cancel = CancellationToken::new();
        lock.acquire(1, &cancel).await.expect("acquire");
        let err = lock.release(2).expect_err("foreign release");
        assert_eq!(err.error_type, ErrorType::NotHeld);
    }

    #[tokio::test]
    async fn disconnect_force_release_hands_to_next_waiter() {
        let lock = Arc::new(LockManager::new());
        let cancel = CancellationToken::new();
        lock.acquire(1, &cancel).await.expect("acquire");

        let waiter = {
            let lock = lock.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { lock.acquire(2, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        lock.release_for_connection(1);
        waiter.await.expect("join").expect("handover");
        assert_eq!(lock.holder(), Some(2));
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_the_queue() {
        let lock = Arc::new(LockManager::new());
        let cancel = CancellationToken::new();
        lock.acquire(1, &cancel).await.expect("acquire");

        let waiter_cancel = CancellationToken::new();
        let waiter = {
            let lock = lock.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { lock.acquire(2, &waiter_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();
        let err = waiter.await.expect("join").expect_err("cancelled");
        assert_eq!(err.error_type, ErrorType::Cancelled);

        // The abandoned wait must not receive the lock later.
        lock.release(1).expect("release");
        assert_eq!(lock.holder(), None);
    }
}
