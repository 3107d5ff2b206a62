//! The live object model mirror.
//!
//! One shared JSON tree whose top-level keys form the patch namespace.
//! Every mutation happens under the write lock, bumps the generation
//! counter and publishes the fresh snapshot to the fanout, so reads are
//! snapshot-consistent and patches are ordered against a single
//! modification sequence.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use dcs_core::code::Message;
use dcs_core::error::IpcError;
use dcs_core::model::{lookup_path, merge_patch, set_path};
use serde_json::{json, Value};

use super::fanout::Fanout;

/// Messages kept in the model's `messages` list before old ones roll off.
const MESSAGE_BACKLOG: usize = 128;

pub struct ModelStore {
    model: RwLock<Value>,
    generation: watch::Sender<u64>,
    fanout: Arc<Fanout>,
}

impl ModelStore {
    pub fn new(fanout: Arc<Fanout>) -> Self {
        Self {
            model: RwLock::new(default_model()),
            generation: watch::channel(0).0,
            fanout,
        }
    }

    pub async fn snapshot(&self) -> Value {
        self.model.read().await.clone()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Apply a merge patch under one top-level key.
    pub async fn patch(&self, key: &str, patch: &Value) -> Result<(), IpcError> {
        if key.is_empty() {
            return Err(IpcError::invalid_argument("patch key must not be empty"));
        }
        self.mutate(|model| {
            let Value::Object(map) = model else {
                return Err(IpcError::invalid_argument("object model is not an object"));
            };
            let slot = map.entry(key.to_string()).or_insert(Value::Null);
            merge_patch(slot, patch);
            Ok(())
        })
        .await
    }

    /// Set a single dotted property path.
    pub async fn set(&self, property_path: &str, value: Value) -> Result<(), IpcError> {
        self.mutate(|model| {
            if set_path(model, property_path, value) {
                Ok(())
            } else {
                Err(IpcError::invalid_argument(format!(
                    "cannot set object model path {property_path:?}"
                )))
            }
        })
        .await
    }

    /// Evaluate a dotted path expression against the current model.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, IpcError> {
        let model = self.model.read().await;
        lookup_path(&model, expression).cloned().ok_or_else(|| {
            IpcError::invalid_argument(format!("expression {expression:?} does not resolve"))
        })
    }

    /// Append to the model's rolling `messages` list.
    pub async fn push_message(&self, message: &Message) -> Result<(), IpcError> {
        let entry = serde_json::to_value(message)
            .map_err(|err| IpcError::invalid_argument(err.to_string()))?;
        self.mutate(|model| {
            let messages = model
                .get_mut("messages")
                .and_then(Value::as_array_mut)
                .ok_or_else(|| IpcError::invalid_argument("model has no messages list"))?;
            messages.push(entry);
            if messages.len() > MESSAGE_BACKLOG {
                let excess = messages.len() - MESSAGE_BACKLOG;
                messages.drain(..excess);
            }
            Ok(())
        })
        .await
    }

    /// Block until the model generation advances past the current one.
    pub async fn wait_for_change(&self, cancel: &CancellationToken) -> Result<u64, IpcError> {
        let mut rx = self.generation.subscribe();
        let seen = *rx.borrow_and_update();
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(IpcError::cancelled());
                    }
                    let current = *rx.borrow_and_update();
                    if current > seen {
                        return Ok(current);
                    }
                }
                _ = cancel.cancelled() => return Err(IpcError::cancelled()),
            }
        }
    }

    async fn mutate<F>(&self, apply: F) -> Result<(), IpcError>
    where
        F: FnOnce(&mut Value) -> Result<(), IpcError>,
    {
        let snapshot = {
            let mut model = self.model.write().await;
            apply(&mut model)?;
            model.clone()
        };
        self.generation.send_modify(|generation| *generation += 1);
        debug!(event = "model_updated", generation = self.generation());
        self.fanout.publish(&snapshot);
        Ok(())
    }
}

/// Seed tree: the standard namespaces exist from boot so that patch keys
/// and subscription filters resolve before the firmware has reported
/// anything.
fn default_model() -> Value {
    json!({
        "state": {
            "status": "idle",
            "upTime": 0,
        },
        "move": {
            "axes": [],
        },
        "heat": {
            "heaters": [],
        },
        "sensors": {
            "endstops": [],
            "probes": [],
        },
        "job": {
            "file": Value::Null,
            "duration": Value::Null,
        },
        "network": {
            "hostname": "duet3",
        },
        "messages": [],
        "plugins": {},
        "userSessions": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcs_core::init::SubscriptionMode;

    fn store() -> (Arc<Fanout>, ModelStore) {
        let fanout = Arc::new(Fanout::new());
        let model = ModelStore::new(fanout.clone());
        (fanout, model)
    }

    #[tokio::test]
    async fn patch_bumps_generation_and_publishes() {
        let (fanout, model) = store();
        let sub = fanout.register(1, SubscriptionMode::Patch, None, &model.snapshot().await);

        model
            .patch("state", &json!({"status": "printing"}))
            .await
            .expect("patch");
        assert_eq!(model.generation(), 1);
        assert_eq!(
            model.evaluate("state.status").await.expect("evaluate"),
            json!("printing")
        );

        let frame = sub.next_frame(&CancellationToken::new()).await.expect("frame");
        assert_eq!(frame, json!({"state": {"status": "printing"}}));
    }

    #[tokio::test]
    async fn set_path_and_evaluate() {
        let (_fanout, model) = store();
        model
            .set("network.hostname", json!("workshop"))
            .await
            .expect("set");
        assert_eq!(
            model.evaluate("network.hostname").await.expect("evaluate"),
            json!("workshop")
        );
        let err = model.evaluate("state.nope").await.expect_err("unresolved");
        assert_eq!(err.error_type, dcs_core::ErrorType::InvalidArgument);
    }

    #[tokio::test]
    async fn wait_for_change_sees_the_next_generation() {
        let (_fanout, model) = store();
        let model = Arc::new(model);
        let waiter = {
            let model = model.clone();
            tokio::spawn(async move {
                model.wait_for_change(&CancellationToken::new()).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        model.patch("heat", &json!({"bed": 60.0})).await.expect("patch");
        let generation = waiter.await.expect("join").expect("changed");
        assert_eq!(generation, 1);
    }

    #[tokio::test]
    async fn message_backlog_is_bounded() {
        let (_fanout, model) = store();
        for i in 0..(MESSAGE_BACKLOG + 10) {
            model
                .push_message(&Message::success(format!("m{i}")))
                .await
                .expect("push");
        }
        let messages = model.evaluate("messages").await.expect("messages");
        assert_eq!(messages.as_array().expect("array").len(), MESSAGE_BACKLOG);
    }
}
