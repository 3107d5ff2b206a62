use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire-level error discriminator carried in the `errorType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    ProtocolError,
    DeserializationError,
    UnknownCommand,
    WrongMode,
    PermissionDenied,
    InvalidArgument,
    NotFound,
    AlreadyExists,
    NamespaceReserved,
    AlreadyRegistered,
    AlreadyHeld,
    NotHeld,
    Cancelled,
    IncompatibleVersion,
    IoError,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolError => "ProtocolError",
            Self::DeserializationError => "DeserializationError",
            Self::UnknownCommand => "UnknownCommand",
            Self::WrongMode => "WrongMode",
            Self::PermissionDenied => "PermissionDenied",
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::NamespaceReserved => "NamespaceReserved",
            Self::AlreadyRegistered => "AlreadyRegistered",
            Self::AlreadyHeld => "AlreadyHeld",
            Self::NotHeld => "NotHeld",
            Self::Cancelled => "Cancelled",
            Self::IncompatibleVersion => "IncompatibleVersion",
            Self::IoError => "IoError",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error that can be reported back to an IPC peer.
///
/// Fatal kinds (`ProtocolError`, `IoError`) terminate the connection after a
/// best-effort error frame; everything else is answered and the connection
/// keeps going.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct IpcError {
    pub error_type: ErrorType,
    pub message: String,
}

impl IpcError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ProtocolError, message)
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::new(ErrorType::DeserializationError, message)
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::new(ErrorType::UnknownCommand, format!("unknown command {name}"))
    }

    pub fn wrong_mode(name: &str) -> Self {
        Self::new(
            ErrorType::WrongMode,
            format!("command {name} is not available in this connection mode"),
        )
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorType::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorType::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorType::AlreadyExists, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorType::Cancelled, "operation cancelled")
    }

    pub fn io(err: &std::io::Error) -> Self {
        Self::new(ErrorType::IoError, err.to_string())
    }

    /// Whether this error must tear down the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self.error_type, ErrorType::ProtocolError | ErrorType::IoError)
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        Self::io(&err)
    }
}
