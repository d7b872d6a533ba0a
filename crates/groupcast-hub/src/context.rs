//! Per-invocation handler context.

use std::sync::Arc;

use bytes::Bytes;
use groupcast_core::{ConnectionId, Params, SessionId, UserId};
use serde::Serialize;

use crate::broadcast::Broadcaster;
use crate::errors::{DeliveryFailure, HandlerError, HubError};
use crate::groups::GroupTable;
use crate::registry::{ConnectionRecord, ConnectionRegistry};

/// Shared hub services reachable from every handler.
pub struct Services {
    /// Group membership table.
    pub groups: Arc<GroupTable>,
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out and direct sends.
    pub broadcaster: Arc<Broadcaster>,
}

/// What a stage, lifecycle hook or handler sees about the current connection.
///
/// Cheap to clone: the connection record and services are shared.
#[derive(Clone)]
pub struct HandlerContext {
    connection: Arc<ConnectionRecord>,
    params: Params,
    services: Arc<Services>,
}

impl HandlerContext {
    /// Build a context for `connection` with the given captures.
    pub fn new(connection: Arc<ConnectionRecord>, params: Params, services: Arc<Services>) -> Self {
        Self {
            connection,
            params,
            services,
        }
    }

    /// The connection this invocation belongs to.
    pub fn connection(&self) -> &Arc<ConnectionRecord> {
        &self.connection
    }

    /// Shorthand for the connection ID.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection.id
    }

    /// A captured parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// All captured parameters (path captures merged with route captures).
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Return a copy with `name` set to `value`.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.params.insert(name.into(), value.into());
        self
    }

    /// Return a copy with `captures` layered over the current parameters.
    #[must_use]
    pub fn with_params(mut self, captures: Params) -> Self {
        self.params.extend(captures);
        self
    }

    /// Bound session.
    pub fn session(&self) -> Option<SessionId> {
        self.connection.session()
    }

    /// Authenticated user.
    pub fn user(&self) -> Option<UserId> {
        self.connection.user()
    }

    /// The consumer group resolved at connect time.
    pub fn group(&self) -> Option<&str> {
        self.connection.group.as_deref()
    }

    /// Add this connection to `group`.
    pub fn join(&self, group: &str) -> Result<bool, HubError> {
        self.services.groups.add(group, &self.connection.id)
    }

    /// Remove this connection from `group`.
    pub fn leave(&self, group: &str) -> bool {
        self.services.groups.discard(group, &self.connection.id)
    }

    /// Whether this connection is in `group`.
    pub fn is_member(&self, group: &str) -> bool {
        self.services.groups.contains(group, &self.connection.id)
    }

    /// Send `payload` back to this connection.
    pub async fn reply(&self, payload: impl Into<Bytes>) -> Result<(), DeliveryFailure> {
        self.services
            .broadcaster
            .send(&self.connection.id, payload.into())
            .await
    }

    /// Serialize `value` and send it back to this connection.
    ///
    /// A delivery failure is already logged by the broadcaster and is not
    /// reported as a handler error.
    pub async fn reply_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), HandlerError> {
        let payload = serde_json::to_vec(value)?;
        let _ = self.reply(payload).await;
        Ok(())
    }

    /// Fan `payload` out to `group`. Returns successful deliveries.
    pub async fn broadcast(&self, group: &str, payload: impl Into<Bytes>) -> usize {
        self.services.broadcaster.broadcast(group, payload.into()).await
    }

    /// Serialize `value` and fan it out to `group`.
    pub async fn broadcast_json<T: Serialize + ?Sized>(&self, group: &str, value: &T) -> Result<usize, HandlerError> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.broadcast(group, payload).await)
    }

    /// Group table.
    pub fn groups(&self) -> &Arc<GroupTable> {
        &self.services.groups
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.services.registry
    }

    /// Broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.services.broadcaster
    }
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("connection", &self.connection.id)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::time::Duration;

    use super::*;
    use crate::registry::Connection;
    use crate::transport::ChannelTransport;

    /// Services over a `ChannelTransport`, plus the transport for opening queues.
    pub(crate) fn services() -> (Arc<Services>, Arc<ChannelTransport>) {
        let groups = Arc::new(GroupTable::new());
        let transport = Arc::new(ChannelTransport::new(8));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&groups),
            Arc::clone(&transport) as Arc<dyn crate::transport::Transport>,
            Duration::from_secs(1),
        ));
        let services = Arc::new(Services {
            registry: Arc::new(ConnectionRegistry::new(Arc::clone(&groups))),
            groups,
            broadcaster,
        });
        (services, transport)
    }

    /// Context for a fresh connection `id` on `/ws/`.
    pub(crate) fn context(id: &str, services: &Arc<Services>) -> HandlerContext {
        context_for(Connection::new(id, "/ws/"), services)
    }

    /// Context for an arbitrary connection.
    pub(crate) fn context_for(connection: Connection, services: &Arc<Services>) -> HandlerContext {
        let record = Arc::new(ConnectionRecord::new(&connection, "test", Params::new(), None));
        HandlerContext::new(record, Params::new(), Arc::clone(services))
    }
}
