use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Connection mode negotiated at handshake. Immutable for the lifetime of
/// the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionMode {
    Command,
    Intercept,
    Subscribe,
    PluginService,
    PluginHttpEndpoint,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "Command",
            Self::Intercept => "Intercept",
            Self::Subscribe => "Subscribe",
            Self::PluginService => "PluginService",
            Self::PluginHttpEndpoint => "PluginHttpEndpoint",
        };
        f.write_str(name)
    }
}

/// Capability bit presented in the client-hello and checked per command by
/// the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    CommandExecution,
    ObjectModelRead,
    ObjectModelReadWrite,
    FileSystemAccess,
    ReadGCodes,
    ManageUserSessions,
    RegisterHttpEndpoints,
    ManagePlugins,
}

impl Permission {
    pub const ALL: [Permission; 8] = [
        Permission::CommandExecution,
        Permission::ObjectModelRead,
        Permission::ObjectModelReadWrite,
        Permission::FileSystemAccess,
        Permission::ReadGCodes,
        Permission::ManageUserSessions,
        Permission::RegisterHttpEndpoints,
        Permission::ManagePlugins,
    ];
}

pub fn full_permissions() -> HashSet<Permission> {
    Permission::ALL.iter().copied().collect()
}

/// Access granted to a registered user session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessLevel {
    ReadOnly,
    ReadWrite,
}

/// Transport through which a user session was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionType {
    Local,
    HTTP,
    Telnet,
}
