//! The tagged-union command codec.
//!
//! Every request frame carries a `command` discriminator naming its kind;
//! the remaining fields are that kind's parameters. Kind names and field
//! names are wire-stable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::code::{Code, CodeChannel, Message};
use crate::error::IpcError;
use crate::session::{AccessLevel, Permission, SessionMode, SessionType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum HttpEndpointType {
    GET,
    POST,
    PUT,
    PATCH,
    TRACE,
    DELETE,
    OPTIONS,
    WebSocket,
}

impl HttpEndpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::PATCH => "PATCH",
            Self::TRACE => "TRACE",
            Self::DELETE => "DELETE",
            Self::OPTIONS => "OPTIONS",
            Self::WebSocket => "WebSocket",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    Code(Code),
    #[serde(rename_all = "camelCase")]
    SimpleCode {
        code: String,
        #[serde(default)]
        channel: CodeChannel,
    },
    #[serde(rename_all = "camelCase")]
    Flush {
        #[serde(default)]
        channel: CodeChannel,
    },
    #[serde(rename_all = "camelCase")]
    EvaluateExpression {
        #[serde(default)]
        channel: CodeChannel,
        expression: String,
    },
    GetObjectModel,
    LockObjectModel,
    UnlockObjectModel,
    #[serde(rename_all = "camelCase")]
    PatchObjectModel {
        key: String,
        patch: Value,
    },
    #[serde(rename_all = "camelCase")]
    SetObjectModel {
        property_path: String,
        value: Value,
    },
    SyncObjectModel,
    #[serde(rename_all = "camelCase")]
    GetFileInfo {
        file_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ResolvePath {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    AddUserSession {
        access_level: AccessLevel,
        session_type: SessionType,
        origin: String,
    },
    #[serde(rename_all = "camelCase")]
    RemoveUserSession {
        id: u32,
    },
    #[serde(rename_all = "camelCase")]
    AddHttpEndpoint {
        endpoint_type: HttpEndpointType,
        namespace: String,
        path: String,
        #[serde(default)]
        is_upload_request: bool,
    },
    #[serde(rename_all = "camelCase")]
    RemoveHttpEndpoint {
        endpoint_type: HttpEndpointType,
        namespace: String,
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    InstallPlugin {
        plugin_file: String,
    },
    #[serde(rename_all = "camelCase")]
    StartPlugin {
        plugin: String,
    },
    #[serde(rename_all = "camelCase")]
    StopPlugin {
        plugin: String,
    },
    #[serde(rename_all = "camelCase")]
    UninstallPlugin {
        plugin: String,
    },
    #[serde(rename_all = "camelCase")]
    SetPluginData {
        #[serde(default)]
        plugin: Option<String>,
        key: String,
        value: Value,
    },
    #[serde(rename_all = "camelCase")]
    WriteMessage {
        #[serde(rename = "type", default)]
        message_type: crate::code::MessageType,
        content: String,
        #[serde(default = "default_true")]
        output_message: bool,
        #[serde(default)]
        log_message: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetUpdateStatus {
        updating: bool,
    },
    // Intercept verdicts; consumed by the intercept processor, never by the
    // dispatcher.
    Ignore,
    Cancel,
    #[serde(rename_all = "camelCase")]
    Resolve {
        #[serde(default)]
        result: Option<Message>,
    },
    // Subscribe-mode flow control.
    Acknowledge,
}

fn default_true() -> bool {
    true
}

/// Every wire-recognized command name, used to tell `UnknownCommand` apart
/// from a decode failure of a known kind.
const COMMAND_NAMES: [&str; 27] = [
    "Code",
    "SimpleCode",
    "Flush",
    "EvaluateExpression",
    "GetObjectModel",
    "LockObjectModel",
    "UnlockObjectModel",
    "PatchObjectModel",
    "SetObjectModel",
    "SyncObjectModel",
    "GetFileInfo",
    "ResolvePath",
    "AddUserSession",
    "RemoveUserSession",
    "AddHttpEndpoint",
    "RemoveHttpEndpoint",
    "InstallPlugin",
    "StartPlugin",
    "StopPlugin",
    "UninstallPlugin",
    "SetPluginData",
    "WriteMessage",
    "SetUpdateStatus",
    "Ignore",
    "Cancel",
    "Resolve",
    "Acknowledge",
];

/// Decode a raw frame into a [`Command`], distinguishing the three failure
/// classes the protocol reports separately.
pub fn decode_command(frame: &Value) -> Result<Command, IpcError> {
    let name = frame
        .get("command")
        .and_then(Value::as_str)
        .ok_or_else(|| IpcError::deserialization("frame has no command discriminator"))?;
    if !COMMAND_NAMES.contains(&name) {
        return Err(IpcError::unknown_command(name));
    }
    serde_json::from_value(frame.clone())
        .map_err(|err| IpcError::deserialization(format!("invalid {name} command: {err}")))
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Code(_) => "Code",
            Self::SimpleCode { .. } => "SimpleCode",
            Self::Flush { .. } => "Flush",
            Self::EvaluateExpression { .. } => "EvaluateExpression",
            Self::GetObjectModel => "GetObjectModel",
            Self::LockObjectModel => "LockObjectModel",
            Self::UnlockObjectModel => "UnlockObjectModel",
            Self::PatchObjectModel { .. } => "PatchObjectModel",
            Self::SetObjectModel { .. } => "SetObjectModel",
            Self::SyncObjectModel => "SyncObjectModel",
            Self::GetFileInfo { .. } => "GetFileInfo",
            Self::ResolvePath { .. } => "ResolvePath",
            Self::AddUserSession { .. } => "AddUserSession",
            Self::RemoveUserSession { .. } => "RemoveUserSession",
            Self::AddHttpEndpoint { .. } => "AddHttpEndpoint",
            Self::RemoveHttpEndpoint { .. } => "RemoveHttpEndpoint",
            Self::InstallPlugin { .. } => "InstallPlugin",
            Self::StartPlugin { .. } => "StartPlugin",
            Self::StopPlugin { .. } => "StopPlugin",
            Self::UninstallPlugin { .. } => "UninstallPlugin",
            Self::SetPluginData { .. } => "SetPluginData",
            Self::WriteMessage { .. } => "WriteMessage",
            Self::SetUpdateStatus { .. } => "SetUpdateStatus",
            Self::Ignore => "Ignore",
            Self::Cancel => "Cancel",
            Self::Resolve { .. } => "Resolve",
            Self::Acknowledge => "Acknowledge",
        }
    }

    /// Permissions the dispatcher requires of the calling connection.
    pub fn required_permissions(&self) -> &'static [Permission] {
        match self {
            Self::Code(_)
            | Self::SimpleCode { .. }
            | Self::Flush { .. }
            | Self::EvaluateExpression { .. }
            | Self::WriteMessage { .. } => &[Permission::CommandExecution],
            Self::GetObjectModel | Self::SyncObjectModel => &[Permission::ObjectModelRead],
            Self::LockObjectModel
            | Self::UnlockObjectModel
            | Self::PatchObjectModel { .. }
            | Self::SetObjectModel { .. } => &[Permission::ObjectModelReadWrite],
            Self::GetFileInfo { .. } | Self::ResolvePath { .. } => &[Permission::FileSystemAccess],
            Self::AddUserSession { .. } | Self::RemoveUserSession { .. } => {
                &[Permission::ManageUserSessions]
            }
            Self::AddHttpEndpoint { .. } | Self::RemoveHttpEndpoint { .. } => {
                &[Permission::RegisterHttpEndpoints]
            }
            Self::InstallPlugin { .. }
            | Self::StartPlugin { .. }
            | Self::StopPlugin { .. }
            | Self::UninstallPlugin { .. }
            | Self::SetUpdateStatus { .. } => &[Permission::ManagePlugins],
            // Checked specially by the dispatcher: a plugin may write its
            // own data without ManagePlugins.
            Self::SetPluginData { .. } => &[],
            Self::Ignore | Self::Cancel | Self::Resolve { .. } | Self::Acknowledge => &[],
        }
    }

    /// Kinds serialized under the object-model lock when the caller does not
    /// already hold it.
    pub fn needs_model_lock(&self) -> bool {
        matches!(
            self,
            Self::PatchObjectModel { .. } | Self::SetObjectModel { .. }
        )
    }

    /// Mode whitelist enforced by the dispatcher.
    pub fn allowed_in(&self, mode: SessionMode) -> bool {
        match self {
            Self::Ignore | Self::Cancel | Self::Resolve { .. } => mode == SessionMode::Intercept,
            Self::Acknowledge => mode == SessionMode::Subscribe,
            Self::AddHttpEndpoint { .. } | Self::RemoveHttpEndpoint { .. } => {
                mode == SessionMode::PluginHttpEndpoint
            }
            Self::AddUserSession { .. } | Self::RemoveUserSession { .. } => {
                mode == SessionMode::Command
            }
            Self::InstallPlugin { .. }
            | Self::StartPlugin { .. }
            | Self::StopPlugin { .. }
            | Self::UninstallPlugin { .. }
            | Self::SetPluginData { .. }
            | Self::SetUpdateStatus { .. } => {
                matches!(mode, SessionMode::Command | SessionMode::PluginService)
            }
            Self::WriteMessage { .. } => matches!(
                mode,
                SessionMode::Command | SessionMode::Intercept | SessionMode::PluginService
            ),
            _ => matches!(mode, SessionMode::Command | SessionMode::Intercept),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn discriminator_round_trip() {
        let cmd = Command::SimpleCode {
            code: "G28".to_string(),
            channel: CodeChannel::HTTP,
        };
        let value = serde_json::to_value(&cmd).expect("serialize");
        assert_eq!(
            value,
            json!({"command": "SimpleCode", "code": "G28", "channel": "HTTP"})
        );
        assert_eq!(decode_command(&value).expect("decode"), cmd);
    }

    #[test]
    fn code_command_flattens_code_fields() {
        let frame = json!({
            "command": "Code",
            "type": "G",
            "majorNumber": 28,
            "channel": "HTTP",
            "parameters": [{"letter": "X", "value": null}]
        });
        let Command::Code(code) = decode_command(&frame).expect("decode") else {
            panic!("expected Code command");
        };
        assert_eq!(code.major_number, Some(28));
        assert_eq!(code.channel, CodeChannel::HTTP);
    }

    #[test]
    fn unknown_and_malformed_commands_are_distinct() {
        let unknown = decode_command(&json!({"command": "Reboot"})).expect_err("unknown");
        assert_eq!(unknown.error_type, crate::error::ErrorType::UnknownCommand);

        let malformed =
            decode_command(&json!({"command": "RemoveUserSession", "id": "nope"}))
                .expect_err("malformed");
        assert_eq!(
            malformed.error_type,
            crate::error::ErrorType::DeserializationError
        );

        let missing = decode_command(&json!({"id": 3})).expect_err("missing discriminator");
        assert_eq!(
            missing.error_type,
            crate::error::ErrorType::DeserializationError
        );
    }

    #[test]
    fn every_command_name_is_known() {
        // Spot-check that the name table and the serde tags agree.
        for cmd in [
            Command::GetObjectModel,
            Command::LockObjectModel,
            Command::Acknowledge,
            Command::Ignore,
            Command::Resolve { result: None },
        ] {
            let value = serde_json::to_value(&cmd).expect("serialize");
            assert_eq!(
                value.get("command").and_then(Value::as_str),
                Some(cmd.name())
            );
            assert!(COMMAND_NAMES.contains(&cmd.name()));
        }
    }

    #[test]
    fn mode_whitelist_matches_protocol() {
        let endpoint = Command::AddHttpEndpoint {
            endpoint_type: HttpEndpointType::GET,
            namespace: "x".to_string(),
            path: "y".to_string(),
            is_upload_request: false,
        };
        assert!(!endpoint.allowed_in(SessionMode::Command));
        assert!(endpoint.allowed_in(SessionMode::PluginHttpEndpoint));

        assert!(Command::GetObjectModel.allowed_in(SessionMode::Command));
        assert!(Command::GetObjectModel.allowed_in(SessionMode::Intercept));
        assert!(!Command::GetObjectModel.allowed_in(SessionMode::Subscribe));

        assert!(Command::Acknowledge.allowed_in(SessionMode::Subscribe));
        assert!(!Command::Acknowledge.allowed_in(SessionMode::Command));

        assert!(Command::Ignore.allowed_in(SessionMode::Intercept));
        assert!(!Command::Ignore.allowed_in(SessionMode::Command));
    }
}
