//! Command-mode processor: strict serial request/response.
//!
//! PluginService connections run this same loop; the dispatcher's mode
//! whitelist is what narrows their command set.

use std::sync::Arc;
use tracing::{debug, warn};

use dcs_core::command::decode_command;
use dcs_core::error::ErrorType;
use dcs_core::response::Response;

use crate::connection::{Connection, FrameReader};
use crate::dispatch::{dispatch, DispatchContext};
use crate::server::Daemon;

pub async fn run(daemon: Arc<Daemon>, conn: Arc<Connection>, mut reader: FrameReader) {
    loop {
        let frame = match reader.read_frame(&conn.cancel).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(err) if err.error_type == ErrorType::Cancelled => break,
            Err(err) => {
                warn!(event = "frame_error", conn_id = conn.id, error = %err);
                let _ = conn.send_frame(&Response::error(&err)).await;
                break;
            }
        };

        let response = match decode_command(&frame) {
            Ok(command) => {
                debug!(event = "command_received", conn_id = conn.id, command = command.name());
                let ctx = DispatchContext {
                    daemon: &daemon,
                    conn: &conn,
                    bridge: None,
                };
                match dispatch(&ctx, command).await {
                    Ok(Some(result)) => Response::ok_with(result),
                    Ok(None) => Response::ok(),
                    Err(err) if err.is_fatal() => {
                        warn!(event = "command_fatal", conn_id = conn.id, error = %err);
                        let _ = conn.send_frame(&Response::error(&err)).await;
                        break;
                    }
                    Err(err) => Response::error(&err),
                }
            }
            // Unknown or malformed commands are reported; the connection
            // stays usable.
            Err(err) => Response::error(&err),
        };

        if conn.send_frame(&response).await.is_err() {
            break;
        }
    }
}
