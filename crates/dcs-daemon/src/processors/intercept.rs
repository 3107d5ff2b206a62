//! Intercept-mode processor.
//!
//! Offers codes matching the connection's filter and pairs verdict frames
//! with offers in FIFO order. Between offer and verdict the client may run
//! auxiliary commands, which are dispatched inline and answered before any
//! later verdict frame is consumed. A verdict without an outstanding offer
//! or an undecodable frame while one is outstanding means the two sides
//! have lost sync, which is fatal by design.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use dcs_core::code::{InterceptOptions, Message};
use dcs_core::command::{decode_command, Command};
use dcs_core::error::{ErrorType, IpcError};
use dcs_core::response::Response;

use crate::connection::{Connection, FrameReader};
use crate::dispatch::{dispatch, DispatchContext};
use crate::machine::interceptors::Verdict;
use crate::server::Daemon;

pub async fn run(
    daemon: Arc<Daemon>,
    conn: Arc<Connection>,
    mut reader: FrameReader,
    options: InterceptOptions,
) {
    let mut offers = daemon.interceptors.register(conn.id, options);
    let mut outstanding: VecDeque<oneshot::Sender<Verdict>> = VecDeque::new();

    loop {
        tokio::select! {
            offer = offers.recv() => {
                let Some(offer) = offer else { break };
                if conn.send_frame(&offer.code).await.is_err() {
                    break;
                }
                debug!(event = "code_offered", conn_id = conn.id, code = %offer.code);
                outstanding.push_back(offer.verdict);
            }
            frame = reader.read_frame(&conn.cancel) => {
                let frame = match frame {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) if err.error_type == ErrorType::Cancelled => break,
                    Err(err) => {
                        warn!(event = "frame_error", conn_id = conn.id, error = %err);
                        let _ = conn.send_frame(&Response::error(&err)).await;
                        break;
                    }
                };

                let command = match decode_command(&frame) {
                    Ok(command) => command,
                    Err(err) => {
                        if outstanding.is_empty() {
                            if conn.send_frame(&Response::error(&err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        // Cannot tell a broken verdict from a broken aux
                        // command; the verdict pairing is no longer
                        // trustworthy.
                        let desync = IpcError::protocol(format!(
                            "undecodable frame while a verdict is outstanding: {}",
                            err.message
                        ));
                        warn!(event = "intercept_desync", conn_id = conn.id, error = %desync);
                        let _ = conn.send_frame(&Response::error(&desync)).await;
                        break;
                    }
                };

                let verdict = match command {
                    Command::Ignore => Some(Verdict::Ignore),
                    Command::Cancel => Some(Verdict::Cancel),
                    Command::Resolve { result } => {
                        Some(Verdict::Resolve(result.unwrap_or_else(|| Message::success(""))))
                    }
                    aux => {
                        let ctx = DispatchContext {
                            daemon: &daemon,
                            conn: &conn,
                            bridge: None,
                        };
                        let response = match dispatch(&ctx, aux).await {
                            Ok(Some(result)) => Response::ok_with(result),
                            Ok(None) => Response::ok(),
                            Err(err) if err.is_fatal() => {
                                let _ = conn.send_frame(&Response::error(&err)).await;
                                break;
                            }
                            Err(err) => Response::error(&err),
                        };
                        if conn.send_frame(&response).await.is_err() {
                            break;
                        }
                        None
                    }
                };

                if let Some(verdict) = verdict {
                    let Some(pending) = outstanding.pop_front() else {
                        let err = IpcError::protocol("verdict received without an outstanding offer");
                        warn!(event = "intercept_desync", conn_id = conn.id, error = %err);
                        let _ = conn.send_frame(&Response::error(&err)).await;
                        break;
                    };
                    debug!(event = "verdict_received", conn_id = conn.id, verdict = ?verdict);
                    // A receiver dropped mid-teardown is equivalent to
                    // Ignore on the pipeline side.
                    let _ = pending.send(verdict);
                }
            }
        }
    }

    daemon.interceptors.unregister(conn.id);
    // Dropping the outstanding queue resolves every blocked code as
    // Ignore.
}
