//! Ephemeral per-connection client sessions.
//!
//! A session is bookkeeping only — `{client_id, name, last_acked_version}` —
//! created when a client joins a document and discarded when it disconnects.
//! Sessions carry no authority over document state: the coordinator owns the
//! document; the registry just remembers who is connected and how far each
//! client has been acknowledged.
//!
//! The registry is owned by the document's coordinator task, so no locking.

use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

use crate::protocol::SessionInfo;

/// One connected client of one document.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: Uuid,
    pub name: String,
    /// Highest document version this client has been acknowledged through.
    pub last_acked_version: u64,
    pub connected_at: Instant,
}

/// Per-document session registry.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, ClientSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { sessions: HashMap::new() }
    }

    /// Open (or reopen) a session at the given document version.
    ///
    /// A reconnect with the same client id replaces the stale session.
    pub fn open(&mut self, info: SessionInfo, at_version: u64) {
        self.sessions.insert(
            info.client_id,
            ClientSession {
                client_id: info.client_id,
                name: info.name,
                last_acked_version: at_version,
                connected_at: Instant::now(),
            },
        );
    }

    /// Close a session. Returns it for logging, if it existed.
    pub fn close(&mut self, client_id: &Uuid) -> Option<ClientSession> {
        self.sessions.remove(client_id)
    }

    /// Record that a client has been acknowledged through `version`.
    /// Acks only move forward.
    pub fn record_ack(&mut self, client_id: &Uuid, version: u64) {
        if let Some(session) = self.sessions.get_mut(client_id) {
            if version > session.last_acked_version {
                session.last_acked_version = version;
            }
        }
    }

    pub fn last_acked(&self, client_id: &Uuid) -> Option<u64> {
        self.sessions.get(client_id).map(|s| s.last_acked_version)
    }

    pub fn contains(&self, client_id: &Uuid) -> bool {
        self.sessions.contains_key(client_id)
    }

    pub fn get(&self, client_id: &Uuid) -> Option<&ClientSession> {
        self.sessions.get(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All connected sessions, in no particular order.
    pub fn sessions(&self) -> impl Iterator<Item = &ClientSession> {
        self.sessions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(n: u128, name: &str) -> SessionInfo {
        SessionInfo::with_id(Uuid::from_u128(n), name)
    }

    #[test]
    fn test_open_and_close() {
        let mut registry = SessionRegistry::new();
        assert!(registry.is_empty());

        registry.open(info(1, "Alice"), 5);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&Uuid::from_u128(1)));
        assert_eq!(registry.last_acked(&Uuid::from_u128(1)), Some(5));

        let closed = registry.close(&Uuid::from_u128(1)).unwrap();
        assert_eq!(closed.name, "Alice");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_unknown_session() {
        let mut registry = SessionRegistry::new();
        assert!(registry.close(&Uuid::from_u128(9)).is_none());
    }

    #[test]
    fn test_acks_only_move_forward() {
        let mut registry = SessionRegistry::new();
        registry.open(info(1, "Alice"), 3);

        registry.record_ack(&Uuid::from_u128(1), 7);
        assert_eq!(registry.last_acked(&Uuid::from_u128(1)), Some(7));

        registry.record_ack(&Uuid::from_u128(1), 4);
        assert_eq!(registry.last_acked(&Uuid::from_u128(1)), Some(7));
    }

    #[test]
    fn test_ack_for_unknown_client_is_ignored() {
        let mut registry = SessionRegistry::new();
        registry.record_ack(&Uuid::from_u128(1), 7);
        assert_eq!(registry.last_acked(&Uuid::from_u128(1)), None);
    }

    #[test]
    fn test_reconnect_replaces_session() {
        let mut registry = SessionRegistry::new();
        registry.open(info(1, "Alice"), 3);
        registry.record_ack(&Uuid::from_u128(1), 9);

        // Reconnect at a later version: fresh session, fresh ack floor.
        registry.open(info(1, "Alice"), 12);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.last_acked(&Uuid::from_u128(1)), Some(12));
    }

    #[test]
    fn test_sessions_iteration() {
        let mut registry = SessionRegistry::new();
        registry.open(info(1, "Alice"), 0);
        registry.open(info(2, "Bob"), 0);

        let names: Vec<&str> = registry.sessions().map(|s| s.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
    }
}
