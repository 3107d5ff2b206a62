//! Handshake frames exchanged before any command.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::code::InterceptOptions;
use crate::error::{ErrorType, IpcError};
use crate::session::{Permission, SessionMode};

/// Version of the command protocol spoken by this build.
pub const PROTOCOL_VERSION: u32 = 12;

/// First frame on the socket, written by the server immediately on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInit {
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionMode {
    Full,
    Patch,
}

impl Default for SubscriptionMode {
    fn default() -> Self {
        Self::Full
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeOptions {
    #[serde(default)]
    pub mode: SubscriptionMode,
    /// Restriction to a set of top-level object model keys; `None`
    /// subscribes to everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<String>>,
}

/// First frame from the client, declaring mode, version and the permission
/// set it wants honored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInit {
    pub mode: SessionMode,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default)]
    pub permissions: HashSet<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe_options: Option<SubscribeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercept_options: Option<InterceptOptions>,
}

impl ClientInit {
    pub fn new(mode: SessionMode) -> Self {
        Self {
            mode,
            version: PROTOCOL_VERSION,
            plugin: None,
            permissions: HashSet::new(),
            subscribe_options: None,
            intercept_options: None,
        }
    }

    pub fn with_permissions<I: IntoIterator<Item = Permission>>(mut self, perms: I) -> Self {
        self.permissions.extend(perms);
        self
    }
}

/// Third handshake frame: accept or refuse the client-hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl InitResponse {
    pub fn ok(session_id: u32) -> Self {
        Self {
            success: true,
            session_id: Some(session_id),
            error_type: None,
            error_message: None,
        }
    }

    pub fn error(err: &IpcError) -> Self {
        Self {
            success: false,
            session_id: None,
            error_type: Some(err.error_type),
            error_message: Some(err.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn minimal_client_hello_decodes() {
        let hello: ClientInit =
            serde_json::from_value(json!({"mode": "Command", "version": 12})).expect("decode");
        assert_eq!(hello.mode, SessionMode::Command);
        assert_eq!(hello.version, PROTOCOL_VERSION);
        assert!(hello.permissions.is_empty());
    }

    #[test]
    fn subscribe_hello_carries_patch_options() {
        let hello: ClientInit = serde_json::from_value(json!({
            "mode": "Subscribe",
            "version": 12,
            "subscribeOptions": {"mode": "Patch", "filter": ["state"]}
        }))
        .expect("decode");
        let options = hello.subscribe_options.expect("options");
        assert_eq!(options.mode, SubscriptionMode::Patch);
        assert_eq!(options.filter.as_deref(), Some(&["state".to_string()][..]));
    }

    #[test]
    fn unrecognized_mode_is_a_decode_error() {
        let result =
            serde_json::from_value::<ClientInit>(json!({"mode": "Telnet", "version": 12}));
        assert!(result.is_err());
    }

    #[test]
    fn init_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(InitResponse::ok(7)).expect("serialize"),
            json!({"success": true, "sessionId": 7})
        );
    }
}
