//! Interceptor registry and offer/verdict plumbing.
//!
//! The code pipeline consults this registry at each stage. An offer is
//! pushed into the owning connection's processor over a bounded channel and
//! the pipeline suspends until the verdict arrives; a disconnected
//! interceptor counts as Ignore so a dead client can never stall a code.

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dcs_core::code::{Code, InterceptOptions, InterceptionStage, Message};
use dcs_core::error::IpcError;

/// Client's ruling on one offered code.
#[derive(Debug)]
pub enum Verdict {
    Ignore,
    Cancel,
    Resolve(Message),
}

/// What the pipeline does next after a stage ran.
#[derive(Debug)]
pub enum InterceptOutcome {
    Continue,
    Resolved(Message),
    Cancelled,
}

pub struct Offer {
    pub code: Code,
    pub verdict: oneshot::Sender<Verdict>,
}

struct InterceptorHandle {
    conn_id: u32,
    options: InterceptOptions,
    offers: mpsc::Sender<Offer>,
}

/// Offers queue shallowly: a slow interceptor back-pressures the pipeline,
/// which is exactly the blocking contract interception promises.
const OFFER_QUEUE: usize = 8;

#[derive(Default)]
pub struct InterceptorRegistry {
    stages: RwLock<HashMap<InterceptionStage, Vec<InterceptorHandle>>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection as an interceptor; the returned receiver feeds
    /// its processor loop.
    pub fn register(&self, conn_id: u32, options: InterceptOptions) -> mpsc::Receiver<Offer> {
        let (tx, rx) = mpsc::channel(OFFER_QUEUE);
        let stage = options.stage;
        self.stages
            .write()
            .expect("interceptor table poisoned")
            .entry(stage)
            .or_default()
            .push(InterceptorHandle {
                conn_id,
                options,
                offers: tx,
            });
        info!(event = "interceptor_registered", conn_id, stage = ?stage);
        rx
    }

    pub fn unregister(&self, conn_id: u32) {
        let mut stages = self.stages.write().expect("interceptor table poisoned");
        for handles in stages.values_mut() {
            handles.retain(|handle| handle.conn_id != conn_id);
        }
        info!(event = "interceptor_unregistered", conn_id);
    }

    /// Run one stage for a code. Interceptors are consulted in registration
    /// order; the first Cancel or Resolve verdict wins.
    pub async fn intercept(
        &self,
        stage: InterceptionStage,
        code: &Code,
        cancel: &CancellationToken,
    ) -> Result<InterceptOutcome, IpcError> {
        let targets: Vec<(u32, mpsc::Sender<Offer>)> = {
            let stages = self.stages.read().expect("interceptor table poisoned");
            let Some(handles) = stages.get(&stage) else {
                return Ok(InterceptOutcome::Continue);
            };
            handles
                .iter()
                .filter(|handle| Some(handle.conn_id) != code.source_connection)
                .filter(|handle| handle.options.matches(code))
                .map(|handle| (handle.conn_id, handle.offers.clone()))
                .collect()
        };

        for (conn_id, offers) in targets {
            let (verdict_tx, verdict_rx) = oneshot::channel();
            let offer = Offer {
                code: code.clone(),
                verdict: verdict_tx,
            };
            let delivered = tokio::select! {
                sent = offers.send(offer) => sent.is_ok(),
                _ = cancel.cancelled() => return Err(IpcError::cancelled()),
            };
            if !delivered {
                debug!(event = "intercept_offer_dropped", conn_id, stage = ?stage);
                continue;
            }

            let verdict = tokio::select! {
                verdict = verdict_rx => verdict,
                _ = cancel.cancelled() => return Err(IpcError::cancelled()),
            };
            match verdict {
                // Dropped without an answer: connection went away, same as
                // Ignore.
                Err(_) => {
                    debug!(event = "intercept_verdict_lost", conn_id, stage = ?stage);
                }
                Ok(Verdict::Ignore) => {}
                Ok(Verdict::Cancel) => {
                    warn!(event = "code_cancelled_by_interceptor", conn_id, stage = ?stage);
                    return Ok(InterceptOutcome::Cancelled);
                }
                Ok(Verdict::Resolve(message)) => {
                    debug!(event = "code_resolved_by_interceptor", conn_id, stage = ?stage);
                    return Ok(InterceptOutcome::Resolved(message));
                }
            }
        }
        Ok(InterceptOutcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::code::CodeChannel;
    use std::sync::Arc;

    fn g28(channel: CodeChannel) -> Code {
        Code::from_text("G28", channel).expect("parse")
    }

    #[tokio::test]
    async fn verdicts_flow_back_in_offer_order() {
        let registry = Arc::new(InterceptorRegistry::new());
        let mut offers = registry.register(1, InterceptOptions::default());
        let cancel = CancellationToken::new();

        let answer = tokio::spawn(async move {
            let first = offers.recv().await.expect("first offer");
            let _ = first.verdict.send(Verdict::Ignore);
            let second = offers.recv().await.expect("second offer");
            let _ = second
                .verdict
                .send(Verdict::Resolve(Message::success("handled")));
        });

        let outcome = registry
            .intercept(InterceptionStage::PreCode, &g28(CodeChannel::HTTP), &cancel)
            .await
            .expect("intercept");
        assert!(matches!(outcome, InterceptOutcome::Continue));

        let outcome = registry
            .intercept(InterceptionStage::PreCode, &g28(CodeChannel::HTTP), &cancel)
            .await
            .expect("intercept");
        match outcome {
            InterceptOutcome::Resolved(message) => assert_eq!(message.content, "handled"),
            other => panic!("expected resolve, got {other:?}"),
        }
        answer.await.expect("join");
    }

    #[tokio::test]
    async fn own_codes_and_filtered_codes_are_skipped() {
        let registry = InterceptorRegistry::new();
        let options = InterceptOptions {
            channels: Some([CodeChannel::HTTP].into_iter().collect()),
            ..InterceptOptions::default()
        };
        let mut offers = registry.register(9, options);
        let cancel = CancellationToken::new();

        let mut own = g28(CodeChannel::HTTP);
        own.source_connection = Some(9);
        let outcome = registry
            .intercept(InterceptionStage::PreCode, &own, &cancel)
            .await
            .expect("intercept");
        assert!(matches!(outcome, InterceptOutcome::Continue));

        let outcome = registry
            .intercept(InterceptionStage::PreCode, &g28(CodeChannel::Telnet), &cancel)
            .await
            .expect("intercept");
        assert!(matches!(outcome, InterceptOutcome::Continue));
        assert!(offers.try_recv().is_err(), "no offer should have been made");
    }

    #[tokio::test]
    async fn dropped_interceptor_counts_as_ignore() {
        let registry = InterceptorRegistry::new();
        let offers = registry.register(3, InterceptOptions::default());
        drop(offers);
        let outcome = registry
            .intercept(
                InterceptionStage::PreCode,
                &g28(CodeChannel::HTTP),
                &CancellationToken::new(),
            )
            .await
            .expect("intercept");
        assert!(matches!(outcome, InterceptOutcome::Continue));
    }
}
