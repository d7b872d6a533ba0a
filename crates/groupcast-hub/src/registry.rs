//! Live connection registry.
//!
//! The registry owns metadata only. The transport keeps the socket; the hub
//! keeps a [`ConnectionRecord`] per accepted connection, keyed by
//! [`ConnectionId`] in a sharded `DashMap`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use groupcast_core::{ConnectionId, Params, SessionId, UserId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::errors::HubError;
use crate::groups::GroupTable;

/// A connection as handed over by the transport layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    /// Transport-issued identifier.
    pub id: ConnectionId,
    /// Request path the client connected to.
    pub path: String,
    /// Session resolved by the outer layer, if any.
    pub session: Option<SessionId>,
    /// Authenticated user resolved by the outer layer, if any.
    pub user: Option<UserId>,
}

impl Connection {
    /// Anonymous connection without session or user.
    pub fn new(id: impl Into<ConnectionId>, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            session: None,
            user: None,
        }
    }

    /// Attach a session reference.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Attach an authenticated user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<UserId>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Connect stages and `on_connect` are running.
    Connecting,
    /// Accepted; messages are dispatched.
    Open,
    /// `on_disconnect` is running.
    Closing,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Connecting, Self::Open | Self::Closed)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }
}

/// Per-connection metadata held by the registry.
pub struct ConnectionRecord {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Path the connection was opened on.
    pub path: String,
    /// Name of the consumer that accepted it.
    pub consumer: String,
    /// Captures from the consumer's path pattern.
    pub path_params: Params,
    /// Resolved consumer group, if the consumer declares a template.
    pub group: Option<String>,
    /// When the connection was accepted by the hub.
    pub connected_at: DateTime<Utc>,
    session: RwLock<Option<SessionId>>,
    user: RwLock<Option<UserId>>,
    state: Mutex<ConnectionState>,
    /// Serializes message handling and disconnect for this connection.
    pub(crate) inbox: tokio::sync::Mutex<()>,
}

impl ConnectionRecord {
    /// Create a record in the `Connecting` state.
    pub fn new(
        connection: &Connection,
        consumer: impl Into<String>,
        path_params: Params,
        group: Option<String>,
    ) -> Self {
        Self {
            id: connection.id.clone(),
            path: connection.path.clone(),
            consumer: consumer.into(),
            path_params,
            group,
            connected_at: Utc::now(),
            session: RwLock::new(connection.session.clone()),
            user: RwLock::new(connection.user.clone()),
            state: Mutex::new(ConnectionState::Connecting),
            inbox: tokio::sync::Mutex::new(()),
        }
    }

    /// Bound session, if any.
    pub fn session(&self) -> Option<SessionId> {
        self.session.read().clone()
    }

    /// Bind (or rebind) this connection to a session.
    pub fn bind_session(&self, session: SessionId) {
        *self.session.write() = Some(session);
    }

    /// Authenticated user, if any.
    pub fn user(&self) -> Option<UserId> {
        self.user.read().clone()
    }

    /// Bind (or rebind) this connection to a user.
    pub fn bind_user(&self, user: UserId) {
        *self.user.write() = Some(user);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Move to `next` if the transition is legal. Returns whether it moved.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            debug!(conn_id = %self.id, from = ?*state, to = ?next, "state transition");
            *state = next;
            true
        } else {
            false
        }
    }

    /// Serializable snapshot for diagnostics.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            path: self.path.clone(),
            consumer: self.consumer.clone(),
            group: self.group.clone(),
            session: self.session(),
            user: self.user(),
            state: self.state(),
            connected_at: self.connected_at,
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("consumer", &self.consumer)
            .field("group", &self.group)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a connection.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    /// Connection identifier.
    pub id: ConnectionId,
    /// Path the connection was opened on.
    pub path: String,
    /// Accepting consumer.
    pub consumer: String,
    /// Consumer group.
    pub group: Option<String>,
    /// Bound session.
    pub session: Option<SessionId>,
    /// Bound user.
    pub user: Option<UserId>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Accept time.
    pub connected_at: DateTime<Utc>,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionRecord>>,
    groups: Arc<GroupTable>,
}

impl ConnectionRegistry {
    /// Create a registry that clears memberships from `groups` on unregister.
    pub fn new(groups: Arc<GroupTable>) -> Self {
        Self {
            connections: DashMap::new(),
            groups,
        }
    }

    /// Register a connection. A duplicate ID is a transport bug.
    pub fn register(&self, record: Arc<ConnectionRecord>) -> Result<(), HubError> {
        match self.connections.entry(record.id.clone()) {
            Entry::Occupied(_) => {
                warn!(conn_id = %record.id, "duplicate connection id");
                Err(HubError::DuplicateConnection {
                    id: record.id.clone(),
                })
            }
            Entry::Vacant(slot) => {
                debug!(conn_id = %record.id, consumer = %record.consumer, "connection registered");
                let _ = slot.insert(record);
                Ok(())
            }
        }
    }

    /// Remove a connection and all of its group memberships.
    ///
    /// Idempotent: unknown IDs return `None` and still have memberships
    /// cleared.
    pub fn unregister(&self, id: &ConnectionId) -> Option<Arc<ConnectionRecord>> {
        let left = self.groups.remove_all(id);
        let removed = self.connections.remove(id).map(|(_, record)| record);
        if removed.is_some() {
            debug!(conn_id = %id, groups_left = left.len(), "connection unregistered");
        }
        removed
    }

    /// Whether `id` is registered.
    pub fn exists(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Look up a registered connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionRecord>> {
        self.connections.get(id).map(|r| Arc::clone(r.value()))
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// IDs of all registered connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|r| r.key().clone()).collect()
    }

    /// Snapshots of all registered connections.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections.iter().map(|r| r.value().info()).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn record(id: &str) -> Arc<ConnectionRecord> {
        Arc::new(ConnectionRecord::new(
            &Connection::new(id, "/ws/chat/"),
            "chat",
            Params::new(),
            None,
        ))
    }

    fn registry() -> (ConnectionRegistry, Arc<GroupTable>) {
        let groups = Arc::new(GroupTable::new());
        (ConnectionRegistry::new(Arc::clone(&groups)), groups)
    }

    #[test]
    fn register_then_lookup() {
        let (reg, _) = registry();
        reg.register(record("c1")).unwrap();
        assert!(reg.exists(&ConnectionId::from("c1")));
        assert_eq!(reg.get(&ConnectionId::from("c1")).unwrap().consumer, "chat");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ids(), vec![ConnectionId::from("c1")]);
    }

    #[test]
    fn duplicate_register_fails() {
        let (reg, _) = registry();
        reg.register(record("c1")).unwrap();
        assert_matches!(
            reg.register(record("c1")),
            Err(HubError::DuplicateConnection { id }) if id.as_str() == "c1"
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn unregister_clears_groups() {
        let (reg, groups) = registry();
        let id = ConnectionId::from("c1");
        reg.register(record("c1")).unwrap();
        let _ = groups.add("room_5", &id).unwrap();
        let _ = groups.add("lobby", &id).unwrap();

        assert!(reg.unregister(&id).is_some());
        assert!(!reg.exists(&id));
        assert!(groups.groups_of(&id).is_empty());
        assert_eq!(groups.group_count(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (reg, _) = registry();
        let id = ConnectionId::from("c1");
        reg.register(record("c1")).unwrap();
        assert!(reg.unregister(&id).is_some());
        assert!(reg.unregister(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn state_machine_transitions() {
        let rec = record("c1");
        assert_eq!(rec.state(), ConnectionState::Connecting);
        assert!(!rec.transition(ConnectionState::Closing));
        assert!(rec.transition(ConnectionState::Open));
        assert!(!rec.transition(ConnectionState::Open));
        assert!(rec.transition(ConnectionState::Closing));
        assert!(rec.transition(ConnectionState::Closed));
        assert!(!rec.transition(ConnectionState::Open));
    }

    #[test]
    fn connecting_may_close_directly() {
        let rec = record("c1");
        assert!(rec.transition(ConnectionState::Closed));
        assert_eq!(rec.state(), ConnectionState::Closed);
    }

    #[test]
    fn bind_session_and_user() {
        let rec = record("c1");
        assert!(rec.session().is_none());
        rec.bind_session(SessionId::from("s1"));
        rec.bind_user(UserId::from("u1"));
        assert_eq!(rec.session().unwrap().as_str(), "s1");
        assert_eq!(rec.user().unwrap().as_str(), "u1");
    }

    #[test]
    fn connection_builder_carries_identity() {
        let conn = Connection::new("c1", "/ws/").with_session("s1").with_user("u1");
        let rec = ConnectionRecord::new(&conn, "chat", Params::new(), None);
        assert_eq!(rec.session().unwrap().as_str(), "s1");
        assert_eq!(rec.user().unwrap().as_str(), "u1");
    }

    #[test]
    fn info_serializes_camel_case() {
        let rec = record("c1");
        let _ = rec.transition(ConnectionState::Open);
        let json = serde_json::to_value(rec.info()).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["state"], "open");
        assert!(json.get("connectedAt").is_some());
    }
}
