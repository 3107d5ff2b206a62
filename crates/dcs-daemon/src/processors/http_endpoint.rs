//! PluginHttpEndpoint-mode processor.
//!
//! The command loop here only ever sees `AddHttpEndpoint` and
//! `RemoveHttpEndpoint`. In between, the connection carries the HTTP
//! bridge: side-channel requests are pushed to the client as
//! request frames and its response frames are matched back FIFO.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use dcs_core::command::decode_command;
use dcs_core::endpoint::HttpEndpointResponse;
use dcs_core::error::{ErrorType, IpcError};
use dcs_core::response::Response;

use crate::connection::{Connection, FrameReader};
use crate::dispatch::{dispatch, DispatchContext};
use crate::endpoints::BridgeRequest;
use crate::server::Daemon;

/// Bridge requests queued towards one connection before the side-channel
/// accept loops start blocking.
const BRIDGE_QUEUE: usize = 16;

pub async fn run(daemon: Arc<Daemon>, conn: Arc<Connection>, mut reader: FrameReader) {
    let (bridge_tx, mut bridge_rx) = mpsc::channel::<BridgeRequest>(BRIDGE_QUEUE);
    let mut outstanding: VecDeque<oneshot::Sender<HttpEndpointResponse>> = VecDeque::new();

    loop {
        tokio::select! {
            bridged = bridge_rx.recv() => {
                let Some(bridged) = bridged else { break };
                if conn.send_frame(&bridged.request).await.is_err() {
                    break;
                }
                debug!(
                    event = "endpoint_request_relayed",
                    conn_id = conn.id,
                    namespace = %bridged.request.namespace,
                    path = %bridged.request.path
                );
                outstanding.push_back(bridged.respond);
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

                // Frames with a command discriminator are endpoint
                // registration commands; anything else must be the answer
                // to the oldest relayed request.
                if frame.get("command").is_some() {
                    let response = match decode_command(&frame) {
                        Ok(command) => {
                            let ctx = DispatchContext {
                                daemon: &daemon,
                                conn: &conn,
                                bridge: Some(&bridge_tx),
                            };
                            match dispatch(&ctx, command).await {
                                Ok(Some(result)) => Response::ok_with(result),
                                Ok(None) => Response::ok(),
                                Err(err) if err.is_fatal() => {
                                    let _ = conn.send_frame(&Response::error(&err)).await;
                                    break;
                                }
                                Err(err) => Response::error(&err),
                            }
                        }
                        Err(err) => Response::error(&err),
                    };
                    if conn.send_frame(&response).await.is_err() {
                        break;
                    }
                    continue;
                }

                let Some(pending) = outstanding.pop_front() else {
                    let err = IpcError::protocol("response frame without a relayed request");
                    warn!(event = "endpoint_desync", conn_id = conn.id, error = %err);
                    let _ = conn.send_frame(&Response::error(&err)).await;
                    break;
                };
                match serde_json::from_value::<HttpEndpointResponse>(frame) {
                    Ok(response) => {
                        // Side connection may have given up; nothing to do.
                        let _ = pending.send(response);
                    }
                    Err(err) => {
                        let err = IpcError::protocol(format!("invalid endpoint response: {err}"));
                        warn!(event = "endpoint_desync", conn_id = conn.id, error = %err);
                        let _ = conn.send_frame(&Response::error(&err)).await;
                        break;
                    }
                }
            }
        }
    }

    // Registry entries and their sockets disappear with the connection;
    // dropping the outstanding queue answers in-flight side requests with
    // 503.
    daemon.endpoints.remove_for_connection(conn.id);
}
