//! User session registry.
//!
//! Sessions describe *users* of the machine (a web UI login, a Telnet
//! shell), not IPC connections, so they deliberately survive the
//! connection that registered them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;
use tracing::info;

use dcs_core::error::IpcError;
use dcs_core::session::{AccessLevel, SessionType};

#[derive(Debug, Clone)]
pub struct UserSession {
    pub id: u32,
    pub access_level: AccessLevel,
    pub session_type: SessionType,
    pub origin: String,
}

#[derive(Default)]
pub struct SessionRegistry {
    next_id: AtomicU32,
    sessions: RwLock<HashMap<u32, UserSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        access_level: AccessLevel,
        session_type: SessionType,
        origin: String,
    ) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = UserSession {
            id,
            access_level,
            session_type,
            origin,
        };
        info!(
            event = "user_session_added",
            id,
            session_type = ?session.session_type,
            origin = %session.origin
        );
        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(id, session);
        id
    }

    pub fn remove(&self, id: u32) -> Result<(), IpcError> {
        match self
            .sessions
            .write()
            .expect("session table poisoned")
            .remove(&id)
        {
            Some(_) => {
                info!(event = "user_session_removed", id);
                Ok(())
            }
            None => Err(IpcError::not_found(format!("no user session {id}"))),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.read().expect("session table poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_removal_is_checked() {
        let registry = SessionRegistry::new();
        let a = registry.add(AccessLevel::ReadWrite, SessionType::HTTP, "::1".into());
        let b = registry.add(AccessLevel::ReadOnly, SessionType::Telnet, "::1".into());
        assert_ne!(a, b);
        assert_eq!(registry.count(), 2);

        registry.remove(a).expect("remove");
        let err = registry.remove(a).expect_err("double remove");
        assert_eq!(err.error_type, dcs_core::ErrorType::NotFound);
        assert_eq!(registry.count(), 1);
    }
}
