//! Accept-side handshake and mode selection.
//!
//! Server-hello, client-hello, init-response — in that order, before any
//! other frame. Validation failures are answered with a failing
//! init-response and the socket is closed; only a successful handshake
//! produces a [`Connection`] and hands it to its mode's processor.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dcs_core::error::{ErrorType, IpcError};
use dcs_core::frame::encode_frame;
use dcs_core::init::{ClientInit, InitResponse, ServerInit, PROTOCOL_VERSION};
use dcs_core::session::{Permission, SessionMode};

use crate::connection::{Connection, FrameReader};
use crate::processors;
use crate::server::Daemon;

pub async fn serve(daemon: Arc<Daemon>, stream: UnixStream) {
    let peer_pid = stream
        .peer_cred()
        .ok()
        .and_then(|cred| cred.pid())
        .unwrap_or(-1);

    let (read_half, mut write_half) = stream.into_split();
    let max_frame_bytes = daemon.settings.max_frame_bytes;
    let mut reader = FrameReader::new(read_half, max_frame_bytes);

    let server_hello = ServerInit {
        version: PROTOCOL_VERSION,
    };
    if write_frame(&mut write_half, &server_hello, max_frame_bytes)
        .await
        .is_err()
    {
        return;
    }

    let hello = match read_client_hello(&mut reader).await {
        Ok(hello) => hello,
        Err(err) => {
            warn!(event = "handshake_failed", peer_pid, error = %err);
            let _ = write_frame(&mut write_half, &InitResponse::error(&err), max_frame_bytes).await;
            return;
        }
    };

    if let Err(err) = validate(&daemon, &hello) {
        warn!(event = "handshake_failed", peer_pid, mode = %hello.mode, error = %err);
        let _ = write_frame(&mut write_half, &InitResponse::error(&err), max_frame_bytes).await;
        return;
    }

    let id = daemon.next_connection_id();
    let conn = Connection::new(
        id,
        peer_pid,
        hello.permissions.clone(),
        hello.plugin.clone(),
        hello.mode,
        write_half,
        max_frame_bytes,
    );
    if conn.send_frame(&InitResponse::ok(id)).await.is_err() {
        return;
    }

    info!(
        event = "client_connected",
        conn_id = id,
        peer_pid,
        mode = %hello.mode,
        plugin = hello.plugin.as_deref().unwrap_or_default()
    );

    match hello.mode {
        SessionMode::Command | SessionMode::PluginService => {
            processors::command::run(daemon.clone(), conn.clone(), reader).await;
        }
        SessionMode::Intercept => {
            let options = hello.intercept_options.unwrap_or_default();
            processors::intercept::run(daemon.clone(), conn.clone(), reader, options).await;
        }
        SessionMode::Subscribe => {
            let options = hello.subscribe_options.unwrap_or_default();
            processors::subscribe::run(daemon.clone(), conn.clone(), reader, options).await;
        }
        SessionMode::PluginHttpEndpoint => {
            processors::http_endpoint::run(daemon.clone(), conn.clone(), reader).await;
        }
    }

    // Total cleanup: the processors already release what they registered,
    // but the lock and any stragglers must be gone before the connection
    // object is.
    conn.close();
    daemon.lock.release_for_connection(id);
    daemon.interceptors.unregister(id);
    daemon.fanout.unregister(id);
    daemon.endpoints.remove_for_connection(id);
    info!(event = "client_disconnected", conn_id = id);
}

async fn read_client_hello(reader: &mut FrameReader) -> Result<ClientInit, IpcError> {
    let cancel = CancellationToken::new();
    let frame = reader
        .read_frame(&cancel)
        .await?
        .ok_or_else(|| IpcError::protocol("connection closed before client hello"))?;
    serde_json::from_value(frame)
        .map_err(|err| IpcError::protocol(format!("invalid client hello: {err}")))
}

fn validate(daemon: &Daemon, hello: &ClientInit) -> Result<(), IpcError> {
    if hello.version > PROTOCOL_VERSION {
        return Err(IpcError::new(
            ErrorType::IncompatibleVersion,
            format!(
                "client speaks protocol version {}, server speaks {}",
                hello.version, PROTOCOL_VERSION
            ),
        ));
    }

    // The socket itself is gated by filesystem permissions, so local peers
    // are trusted with what they ask for; a connection claiming to act for
    // an installed plugin is additionally bounded by that plugin's
    // manifest.
    if let Some(plugin) = &hello.plugin {
        if let Some(declared) = daemon.plugins.declared_permissions(plugin) {
            let excess: HashSet<Permission> =
                hello.permissions.difference(&declared).copied().collect();
            if !excess.is_empty() {
                return Err(IpcError::permission_denied(format!(
                    "plugin {plugin} does not declare {excess:?}"
                )));
            }
        }
    }

    let mode_requirement = match hello.mode {
        SessionMode::Intercept => Some(Permission::ReadGCodes),
        SessionMode::PluginHttpEndpoint => Some(Permission::RegisterHttpEndpoints),
        SessionMode::PluginService => Some(Permission::ManagePlugins),
        SessionMode::Command | SessionMode::Subscribe => None,
    };
    if let Some(required) = mode_requirement {
        if !hello.permissions.contains(&required) {
            return Err(IpcError::permission_denied(format!(
                "{required:?} required for {} mode",
                hello.mode
            )));
        }
    }
    Ok(())
}

async fn write_frame<T: serde::Serialize>(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
    max_frame_bytes: usize,
) -> Result<(), IpcError> {
    let bytes =
        encode_frame(value, max_frame_bytes).map_err(|err| IpcError::protocol(err.to_string()))?;
    write_half.write_all(&bytes).await?;
    write_half.flush().await?;
    Ok(())
}
