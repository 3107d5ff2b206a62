//! Command dispatcher.
//!
//! Sole authority over the mode whitelist and the caller's permission set;
//! handlers behind it trust both checks. Kinds marked lock-implicit run
//! under the object-model lock manager unless the caller already holds the
//! lock explicitly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use dcs_core::code::{Code, Message, MessageType};
use dcs_core::command::Command;
use dcs_core::error::IpcError;
use dcs_core::session::Permission;
use serde_json::{json, Map, Value};

use crate::connection::Connection;
use crate::endpoints::{BridgeRequest, EndpointKey};
use crate::server::Daemon;

pub struct DispatchContext<'a> {
    pub daemon: &'a Arc<Daemon>,
    pub conn: &'a Arc<Connection>,
    /// Relay channel for HTTP bridge requests; present only on
    /// PluginHttpEndpoint-mode connections.
    pub bridge: Option<&'a mpsc::Sender<BridgeRequest>>,
}

/// Resolve, authorize and run one command. `Ok(None)` is a void success.
pub async fn dispatch(ctx: &DispatchContext<'_>, command: Command) -> Result<Option<Value>, IpcError> {
    if !command.allowed_in(ctx.conn.mode) {
        return Err(IpcError::wrong_mode(command.name()));
    }
    check_permissions(ctx.conn, &command)?;

    if command.needs_model_lock() && !ctx.daemon.lock.is_held_by(ctx.conn.id) {
        ctx.daemon
            .lock
            .acquire(ctx.conn.id, &ctx.conn.cancel)
            .await?;
        let result = execute(ctx, command).await;
        let _ = ctx.daemon.lock.release(ctx.conn.id);
        result
    } else {
        execute(ctx, command).await
    }
}

fn check_permissions(conn: &Connection, command: &Command) -> Result<(), IpcError> {
    // A plugin may write its own data without ManagePlugins.
    if let Command::SetPluginData { plugin, .. } = command {
        let target = plugin.as_deref().or(conn.plugin.as_deref());
        let own = target.is_some() && target == conn.plugin.as_deref();
        if own || conn.has_permissions(&[Permission::ManagePlugins]) {
            return Ok(());
        }
        return Err(IpcError::permission_denied("ManagePlugins required"));
    }

    let required = command.required_permissions();
    if !conn.has_permissions(required) {
        let missing = required
            .iter()
            .find(|perm| !conn.permissions.contains(perm))
            .map(|perm| format!("{perm:?} required"))
            .unwrap_or_else(|| "permission denied".to_string());
        return Err(IpcError::permission_denied(missing));
    }
    Ok(())
}

async fn execute(ctx: &DispatchContext<'_>, command: Command) -> Result<Option<Value>, IpcError> {
    let daemon = ctx.daemon;
    let conn = ctx.conn;
    match command {
        Command::Code(mut code) => {
            code.source_connection = Some(conn.id);
            let result = daemon.pipeline.submit(code, &conn.cancel).await?;
            Ok(Some(to_value(&result)?))
        }
        Command::SimpleCode { code, channel } => {
            let mut parsed = Code::from_text(&code, channel)?;
            parsed.source_connection = Some(conn.id);
            let result = daemon.pipeline.submit(parsed, &conn.cancel).await?;
            Ok(Some(Value::String(result.content)))
        }
        Command::Flush { channel } => {
            daemon.pipeline.flush(channel, &conn.cancel).await?;
            Ok(Some(Value::Bool(true)))
        }
        Command::EvaluateExpression { expression, .. } => {
            Ok(Some(daemon.model.evaluate(&expression).await?))
        }
        Command::GetObjectModel => Ok(Some(daemon.model.snapshot().await)),
        Command::LockObjectModel => {
            daemon.lock.acquire(conn.id, &conn.cancel).await?;
            Ok(None)
        }
        Command::UnlockObjectModel => {
            daemon.lock.release(conn.id)?;
            Ok(None)
        }
        Command::PatchObjectModel { key, patch } => {
            daemon.model.patch(&key, &patch).await?;
            Ok(None)
        }
        Command::SetObjectModel {
            property_path,
            value,
        } => {
            daemon.model.set(&property_path, value).await?;
            Ok(None)
        }
        Command::SyncObjectModel => {
            daemon.model.wait_for_change(&conn.cancel).await?;
            Ok(None)
        }
        Command::GetFileInfo { file_name } => {
            let info = daemon.files.file_info(&file_name).await?;
            Ok(Some(to_value(&info)?))
        }
        Command::ResolvePath { path } => {
            let resolved = daemon.files.resolve(&path)?;
            Ok(Some(Value::String(resolved.to_string_lossy().into_owned())))
        }
        Command::AddUserSession {
            access_level,
            session_type,
            origin,
        } => {
            let id = daemon.sessions.add(access_level, session_type, origin);
            Ok(Some(Value::from(id)))
        }
        Command::RemoveUserSession { id } => {
            daemon.sessions.remove(id)?;
            Ok(None)
        }
        Command::AddHttpEndpoint {
            endpoint_type,
            namespace,
            path,
            is_upload_request,
        } => {
            let bridge = ctx
                .bridge
                .ok_or_else(|| IpcError::wrong_mode("AddHttpEndpoint"))?;
            let socket_path = daemon.endpoints.register(
                conn.id,
                EndpointKey {
                    method: endpoint_type,
                    namespace,
                    path,
                },
                is_upload_request,
                bridge.clone(),
            )?;
            Ok(Some(Value::String(
                socket_path.to_string_lossy().into_owned(),
            )))
        }
        Command::RemoveHttpEndpoint {
            endpoint_type,
            namespace,
            path,
        } => {
            daemon.endpoints.remove(
                conn.id,
                &EndpointKey {
                    method: endpoint_type,
                    namespace,
                    path,
                },
            )?;
            Ok(None)
        }
        Command::InstallPlugin { plugin_file } => {
            let path = plugin_path(daemon, &plugin_file)?;
            let id = daemon.plugins.install(&path)?;
            let entry = json!({"name": id, "running": false, "data": {}});
            daemon
                .model
                .patch("plugins", &keyed_patch(&id, entry))
                .await?;
            Ok(Some(Value::String(id)))
        }
        Command::StartPlugin { plugin } => {
            daemon.plugins.start(&plugin)?;
            daemon
                .model
                .patch("plugins", &keyed_patch(&plugin, json!({"running": true})))
                .await?;
            Ok(None)
        }
        Command::StopPlugin { plugin } => {
            daemon.plugins.stop(&plugin)?;
            daemon
                .model
                .patch("plugins", &keyed_patch(&plugin, json!({"running": false})))
                .await?;
            Ok(None)
        }
        Command::UninstallPlugin { plugin } => {
            daemon.plugins.uninstall(&plugin)?;
            daemon
                .model
                .patch("plugins", &keyed_patch(&plugin, Value::Null))
                .await?;
            Ok(None)
        }
        Command::SetPluginData { plugin, key, value } => {
            let target = plugin
                .or_else(|| conn.plugin.clone())
                .ok_or_else(|| IpcError::invalid_argument("no target plugin"))?;
            let data = daemon.plugins.set_data(&target, &key, value)?;
            daemon
                .model
                .patch("plugins", &keyed_patch(&target, json!({"data": data})))
                .await?;
            Ok(None)
        }
        Command::WriteMessage {
            message_type,
            content,
            output_message,
            log_message,
        } => {
            match message_type {
                MessageType::Error => warn!(event = "machine_message", kind = "error", content = %content),
                MessageType::Warning => warn!(event = "machine_message", kind = "warning", content = %content),
                MessageType::Success => info!(event = "machine_message", kind = "info", content = %content),
            }
            if log_message {
                info!(event = "console_message_logged", content = %content);
            }
            if output_message {
                let message = Message {
                    message_type,
                    content,
                    time: chrono::Utc::now(),
                };
                daemon.model.push_message(&message).await?;
            }
            Ok(None)
        }
        Command::SetUpdateStatus { updating } => {
            daemon.set_updating(updating);
            let status = if updating { "updating" } else { "idle" };
            daemon.model.set("state.status", Value::from(status)).await?;
            Ok(None)
        }
        // Verdicts and acknowledgements are consumed by their processors
        // and can never reach the dispatcher in their own mode.
        Command::Ignore | Command::Cancel | Command::Resolve { .. } | Command::Acknowledge => {
            Err(IpcError::protocol("flow-control frame outside its protocol position"))
        }
    }
}

fn keyed_patch(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn plugin_path(daemon: &Daemon, plugin_file: &str) -> Result<PathBuf, IpcError> {
    let path = Path::new(plugin_file);
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        daemon.files.resolve(plugin_file)
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, IpcError> {
    serde_json::to_value(value).map_err(|err| IpcError::protocol(err.to_string()))
}
