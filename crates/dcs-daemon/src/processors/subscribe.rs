//! Subscribe-mode processor.
//!
//! Frame 0 is the full filtered snapshot. After that, every push waits for
//! the previous frame's acknowledge, which is the per-subscriber
//! backpressure: the fanout's latest-wins slot keeps collapsing updates
//! while the client is slow, so the next push always reflects everything
//! that happened since the last one.

use std::sync::Arc;
use tracing::{debug, warn};

use dcs_core::command::{decode_command, Command};
use dcs_core::error::{ErrorType, IpcError};
use dcs_core::init::SubscribeOptions;
use dcs_core::response::Response;

use crate::connection::{Connection, FrameReader};
use crate::server::Daemon;

pub async fn run(
    daemon: Arc<Daemon>,
    conn: Arc<Connection>,
    mut reader: FrameReader,
    options: SubscribeOptions,
) {
    let snapshot = daemon.model.snapshot().await;
    let subscriber = daemon
        .fanout
        .register(conn.id, options.mode, options.filter, &snapshot);

    if conn.send_frame(&subscriber.initial_frame()).await.is_err() {
        daemon.fanout.unregister(conn.id);
        return;
    }

    'protocol: loop {
        // Wait for the acknowledge of the frame just sent.
        match reader.read_frame(&conn.cancel).await {
            Ok(Some(frame)) => match decode_command(&frame) {
                Ok(Command::Acknowledge) => {}
                // Anything but an acknowledge breaks the lockstep, which is
                // fatal: the error frame must say so before the close.
                Ok(other) => {
                    let err =
                        IpcError::protocol(format!("expected Acknowledge, got {}", other.name()));
                    warn!(event = "subscribe_bad_frame", conn_id = conn.id, error = %err);
                    let _ = conn.send_frame(&Response::error(&err)).await;
                    break;
                }
                Err(err) => {
                    let err = IpcError::protocol(format!(
                        "expected Acknowledge, undecodable frame: {}",
                        err.message
                    ));
                    warn!(event = "subscribe_bad_frame", conn_id = conn.id, error = %err);
                    let _ = conn.send_frame(&Response::error(&err)).await;
                    break;
                }
            },
            Ok(None) => break,
            Err(err) if err.error_type == ErrorType::Cancelled => break,
            Err(err) => {
                let _ = conn.send_frame(&Response::error(&err)).await;
                break;
            }
        }

        // Acknowledged; deliver the next pending update. Keep reading so a
        // disconnect or early frame surfaces while idle.
        tokio::select! {
            frame = subscriber.next_frame(&conn.cancel) => {
                let Some(frame) = frame else { break };
                if conn.send_frame(&frame).await.is_err() {
                    break;
                }
                debug!(event = "subscription_pushed", conn_id = conn.id);
            }
            early = reader.read_frame(&conn.cancel) => {
                match early {
                    Ok(None) => break,
                    Ok(Some(_)) => {
                        let err = IpcError::protocol("acknowledge before a frame was pushed");
                        warn!(event = "subscribe_bad_frame", conn_id = conn.id, error = %err);
                        let _ = conn.send_frame(&Response::error(&err)).await;
                        break 'protocol;
                    }
                    Err(_) => break,
                }
            }
        }
    }

    daemon.fanout.unregister(conn.id);
}
