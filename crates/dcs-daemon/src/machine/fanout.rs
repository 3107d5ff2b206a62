//! Subscription fanout.
//!
//! The model store publishes every new snapshot here. Each subscriber owns
//! a single-entry latest-wins slot: publishing overwrites whatever was
//! pending, and the subscribe processor drains the slot strictly after the
//! previous acknowledge. Because patch frames are computed against the
//! last *delivered* state at drain time, a burst of K updates collapses
//! into one frame that reflects all of them — keys are never silently
//! dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use dcs_core::init::SubscriptionMode;
use dcs_core::model::{diff_merge_patch, filter_keys};
use serde_json::Value;

struct SubscriberState {
    last_sent: Value,
    latest: Value,
    dirty: bool,
}

pub struct Subscriber {
    conn_id: u32,
    mode: SubscriptionMode,
    filter: Option<Vec<String>>,
    initial: Value,
    state: Mutex<SubscriberState>,
    notify: Notify,
}

impl Subscriber {
    /// Frame 0: the full snapshot, unfiltered. The key filter restricts
    /// which *changes* are delivered, not what the initial state shows.
    pub fn initial_frame(&self) -> Value {
        self.initial.clone()
    }

    fn publish(&self, snapshot: &Value) {
        let filtered = filter_keys(snapshot, self.filter.as_deref());
        let mut state = self.state.lock().expect("subscriber state poisoned");
        if filtered == state.last_sent {
            state.latest = filtered;
            state.dirty = false;
            return;
        }
        state.latest = filtered;
        state.dirty = true;
        drop(state);
        self.notify.notify_one();
    }

    fn try_take(&self) -> Option<Value> {
        let mut state = self.state.lock().expect("subscriber state poisoned");
        if !state.dirty {
            return None;
        }
        let frame = match self.mode {
            SubscriptionMode::Full => state.latest.clone(),
            SubscriptionMode::Patch => {
                match diff_merge_patch(&state.last_sent, &state.latest) {
                    Some(patch) => patch,
                    None => {
                        state.dirty = false;
                        return None;
                    }
                }
            }
        };
        state.last_sent = state.latest.clone();
        state.dirty = false;
        Some(frame)
    }

    /// Wait for the next frame to deliver. Returns `None` on cancellation.
    pub async fn next_frame(&self, cancel: &CancellationToken) -> Option<Value> {
        loop {
            if let Some(frame) = self.try_take() {
                return Some(frame);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

#[derive(Default)]
pub struct Fanout {
    subscribers: RwLock<HashMap<u32, Arc<Subscriber>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        conn_id: u32,
        mode: SubscriptionMode,
        filter: Option<Vec<String>>,
        snapshot: &Value,
    ) -> Arc<Subscriber> {
        let filtered = filter_keys(snapshot, filter.as_deref());
        let subscriber = Arc::new(Subscriber {
            conn_id,
            mode,
            filter,
            initial: snapshot.clone(),
            state: Mutex::new(SubscriberState {
                last_sent: filtered.clone(),
                latest: filtered,
                dirty: false,
            }),
            notify: Notify::new(),
        });
        self.subscribers
            .write()
            .expect("subscriber table poisoned")
            .insert(conn_id, subscriber.clone());
        info!(event = "subscriber_registered", conn_id, mode = ?mode);
        subscriber
    }

    pub fn unregister(&self, conn_id: u32) {
        if self
            .subscribers
            .write()
            .expect("subscriber table poisoned")
            .remove(&conn_id)
            .is_some()
        {
            info!(event = "subscriber_unregistered", conn_id);
        }
    }

    /// Model changed; fold the new snapshot into every pending slot.
    pub fn publish(&self, snapshot: &Value) {
        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .read()
            .expect("subscriber table poisoned")
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber.publish(snapshot);
            debug!(event = "fanout_publish", conn_id = subscriber.conn_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::model::merge_patch;
    use serde_json::json;

    #[test]
    fn patch_subscriber_collapses_bursts_without_losing_keys() {
        let fanout = Fanout::new();
        let snapshot = json!({"state": {"status": "idle"}, "heat": {"bed": 20.0}});
        let sub = fanout.register(1, SubscriptionMode::Patch, None, &snapshot);

        // Three updates before the subscriber drains once.
        fanout.publish(&json!({"state": {"status": "busy"}, "heat": {"bed": 20.0}}));
        fanout.publish(&json!({"state": {"status": "busy"}, "heat": {"bed": 45.5}}));
        fanout.publish(&json!({"state": {"status": "printing"}, "heat": {"bed": 60.0}}));

        let patch = sub.try_take().expect("pending frame");
        let mut replayed = snapshot.clone();
        merge_patch(&mut replayed, &patch);
        assert_eq!(
            replayed,
            json!({"state": {"status": "printing"}, "heat": {"bed": 60.0}})
        );
        assert!(sub.try_take().is_none(), "slot drained");
    }

    #[test]
    fn key_filter_suppresses_unrelated_updates() {
        let fanout = Fanout::new();
        let snapshot = json!({"state": {"status": "idle"}, "heat": {"bed": 20.0}});
        let sub = fanout.register(
            1,
            SubscriptionMode::Patch,
            Some(vec!["state".to_string()]),
            &snapshot,
        );
        // Frame 0 is always the whole snapshot; the filter only gates
        // subsequent frames.
        assert_eq!(sub.initial_frame(), snapshot);

        fanout.publish(&json!({"state": {"status": "idle"}, "heat": {"bed": 99.0}}));
        assert!(sub.try_take().is_none(), "filtered-out change, no frame");

        fanout.publish(&json!({"state": {"status": "printing"}, "heat": {"bed": 99.0}}));
        assert_eq!(
            sub.try_take().expect("frame"),
            json!({"state": {"status": "printing"}})
        );
    }

    #[test]
    fn full_subscriber_always_gets_the_newest_snapshot() {
        let fanout = Fanout::new();
        let snapshot = json!({"state": {"status": "idle"}});
        let sub = fanout.register(1, SubscriptionMode::Full, None, &snapshot);

        fanout.publish(&json!({"state": {"status": "halted"}}));
        fanout.publish(&json!({"state": {"status": "printing"}}));
        assert_eq!(
            sub.try_take().expect("frame"),
            json!({"state": {"status": "printing"}})
        );
    }

    #[tokio::test]
    async fn next_frame_returns_none_on_cancel() {
        let fanout = Fanout::new();
        let sub = fanout.register(1, SubscriptionMode::Full, None, &json!({}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(sub.next_frame(&cancel).await, None);
    }
}
