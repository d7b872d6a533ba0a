//! Connection lifecycle and message dispatch.
//!
//! Drives each connection through `Connecting → Open → Closing → Closed`,
//! picks its consumer at connect time, and routes its messages one at a time
//! in arrival order.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use groupcast_core::{ConnectionId, Message};
use metrics::{counter, gauge};
use tracing::{debug, info, instrument, warn};

use crate::consumer::Consumer;
use crate::context::{HandlerContext, Services};
use crate::errors::{HubError, Rejection};
use crate::metrics::{
    HUB_CONNECTIONS_ACTIVE, HUB_CONNECTIONS_REJECTED_TOTAL, HUB_CONNECTIONS_TOTAL,
    HUB_MESSAGES_DROPPED_TOTAL, HUB_MESSAGES_TOTAL,
};
use crate::pipeline::Phase;
use crate::registry::{Connection, ConnectionRecord, ConnectionState};
use crate::router::{Dispatch, DropReason};

/// Result of a connect attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Registered and open.
    Accepted,
    /// Refused. Nothing was registered and no membership remains.
    Rejected(Rejection),
}

impl ConnectOutcome {
    /// Whether the connection was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Removes an ID from the in-flight connect map when dropped.
struct ConnectingGuard<'a> {
    map: &'a DashMap<ConnectionId, bool>,
    id: ConnectionId,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.map.remove(&self.id);
    }
}

/// Routes connection events to mounted consumers.
pub struct Dispatcher {
    consumers: Vec<Consumer>,
    services: Arc<Services>,
    handler_timeout: Duration,
    /// In-flight connects, flagged `true` once their disconnect has arrived.
    connecting: DashMap<ConnectionId, bool>,
}

impl Dispatcher {
    /// Create a dispatcher over `consumers`, tried in order.
    pub fn new(consumers: Vec<Consumer>, services: Arc<Services>, handler_timeout: Duration) -> Self {
        Self {
            consumers,
            services,
            handler_timeout,
            connecting: DashMap::new(),
        }
    }

    /// Mounted consumers in match order.
    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    fn consumer(&self, name: &str) -> Option<&Consumer> {
        self.consumers.iter().find(|c| c.name() == name)
    }

    /// Handle a new connection.
    ///
    /// A duplicate ID (already registered or mid-connect) is a transport bug
    /// and fails with [`HubError::DuplicateConnection`]. Connect stages and
    /// the `on_connect` hook share the handler timeout; running out of time,
    /// or a disconnect for this ID arriving first, rejects the connection.
    #[instrument(skip_all, fields(conn_id = %connection.id, path = %connection.path))]
    pub async fn on_connect(&self, connection: Connection) -> Result<ConnectOutcome, HubError> {
        match self.connecting.entry(connection.id.clone()) {
            Entry::Occupied(_) => {
                warn!("connect already in progress for this id");
                return Err(HubError::DuplicateConnection { id: connection.id });
            }
            Entry::Vacant(slot) => {
                let _ = slot.insert(false);
            }
        }
        let guard = ConnectingGuard {
            map: &self.connecting,
            id: connection.id.clone(),
        };
        if self.services.registry.exists(&connection.id) {
            warn!("connection id already registered");
            return Err(HubError::DuplicateConnection { id: connection.id });
        }

        let Some((consumer, path_params)) = self
            .consumers
            .iter()
            .find_map(|c| c.match_path(&connection.path).map(|p| (c, p)))
        else {
            return Ok(self.reject(&connection.id, None, Rejection::new("no consumer for path")));
        };

        let group = match consumer.resolve_group(&path_params) {
            Ok(group) => group,
            Err(err) => {
                return Ok(self.reject(&connection.id, None, Rejection::new(err.to_string())));
            }
        };

        let record = Arc::new(ConnectionRecord::new(
            &connection,
            consumer.name(),
            path_params.clone(),
            group.clone(),
        ));
        let ctx = HandlerContext::new(Arc::clone(&record), path_params, Arc::clone(&self.services));

        let accepted = tokio::time::timeout(self.handler_timeout, async {
            match consumer.pipeline().run(Phase::Connect, ctx, None).await {
                Ok(ctx) => consumer.lifecycle().on_connect(&ctx).await,
                Err(rejection) => Err(rejection),
            }
        })
        .await;
        match accepted {
            Ok(Ok(())) => {}
            Ok(Err(rejection)) => return Ok(self.reject(&connection.id, Some(&record), rejection)),
            Err(_) => {
                warn!(timeout = ?self.handler_timeout, "connect hooks timed out");
                let rejection = Rejection::new(format!("connect timed out after {:?}", self.handler_timeout));
                return Ok(self.reject(&connection.id, Some(&record), rejection));
            }
        }

        // The connecting entry stays locked while admitting, so a concurrent
        // disconnect either flags it first or finds the connection registered.
        let admitted = match self.connecting.get_mut(&connection.id) {
            Some(closed) if *closed => None,
            _ => Some(self.admit(&record, group.as_deref())),
        };
        match admitted {
            None => {
                return Ok(self.reject(
                    &connection.id,
                    Some(&record),
                    Rejection::new("closed while connecting"),
                ));
            }
            Some(Err(err)) => {
                let _ = self.services.groups.remove_all(&connection.id);
                let _ = record.transition(ConnectionState::Closed);
                return Err(err);
            }
            Some(Ok(())) => {}
        }
        drop(guard);

        counter!(HUB_CONNECTIONS_TOTAL).increment(1);
        gauge!(HUB_CONNECTIONS_ACTIVE).increment(1.0);
        info!(consumer = consumer.name(), group = ?group, "connection accepted");
        Ok(ConnectOutcome::Accepted)
    }

    fn admit(&self, record: &Arc<ConnectionRecord>, group: Option<&str>) -> Result<(), HubError> {
        if let Some(group) = group {
            let _ = self.services.groups.add(group, &record.id)?;
        }
        self.services.registry.register(Arc::clone(record))?;
        let _ = record.transition(ConnectionState::Open);
        Ok(())
    }

    fn reject(&self, id: &ConnectionId, record: Option<&Arc<ConnectionRecord>>, rejection: Rejection) -> ConnectOutcome {
        let undone = self.services.groups.remove_all(id);
        if let Some(record) = record {
            let _ = record.transition(ConnectionState::Closed);
        }
        counter!(HUB_CONNECTIONS_REJECTED_TOTAL).increment(1);
        info!(reason = %rejection, undone_memberships = undone.len(), "connection rejected");
        ConnectOutcome::Rejected(rejection)
    }

    /// Flag an in-flight connect for `id` as closed. Returns `false` when no
    /// connect is in flight or it has already registered.
    fn flag_pending_connect(&self, id: &ConnectionId) -> bool {
        let Some(mut closed) = self.connecting.get_mut(id) else {
            return false;
        };
        if self.services.registry.exists(id) {
            return false;
        }
        *closed = true;
        true
    }

    /// Handle one inbound payload.
    ///
    /// Messages from the same connection are handled one at a time. Nothing
    /// here fails the connection: every problem becomes a [`Dispatch`]
    /// outcome.
    #[instrument(skip_all, fields(conn_id = %id))]
    pub async fn on_message(&self, id: &ConnectionId, raw: Bytes) -> Dispatch {
        counter!(HUB_MESSAGES_TOTAL).increment(1);

        let Some(record) = self.services.registry.get(id) else {
            debug!("message for unknown connection");
            return dropped(DropReason::UnknownConnection);
        };
        let _inbox = record.inbox.lock().await;
        if record.state() != ConnectionState::Open {
            debug!(state = ?record.state(), "message for connection that is not open");
            return dropped(DropReason::NotOpen);
        }
        let Some(consumer) = self.consumer(&record.consumer) else {
            return dropped(DropReason::UnknownConnection);
        };

        let message = match Message::parse(&raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, bytes = raw.len(), "malformed message, dropping");
                return dropped(DropReason::Malformed);
            }
        };

        let ctx = HandlerContext::new(
            Arc::clone(&record),
            record.path_params.clone(),
            Arc::clone(&self.services),
        );
        let ctx = match consumer.pipeline().run(Phase::Receive, ctx, Some(&message)).await {
            Ok(ctx) => ctx,
            Err(rejection) => {
                info!(reason = %rejection, "message rejected by stage");
                return dropped(DropReason::Rejected(rejection));
            }
        };

        match consumer.router().dispatch(ctx, message, self.handler_timeout).await {
            Dispatch::Dropped(reason) => dropped(reason),
            outcome => outcome,
        }
    }

    /// Handle a disconnect.
    ///
    /// Waits for any in-flight message, runs `on_disconnect` once (bounded by
    /// the handler timeout), then clears the registration and every group
    /// membership. A disconnect for a connect still in flight makes that
    /// connect reject. Returns `false` for unknown or already-closing
    /// connections.
    #[instrument(skip_all, fields(conn_id = %id))]
    pub async fn on_disconnect(&self, id: &ConnectionId) -> bool {
        if self.flag_pending_connect(id) {
            info!("disconnect arrived mid-connect, connect will be rejected");
            return true;
        }
        let Some(record) = self.services.registry.get(id) else {
            debug!("disconnect for unknown connection");
            return false;
        };
        let _inbox = record.inbox.lock().await;
        if !record.transition(ConnectionState::Closing) {
            debug!(state = ?record.state(), "disconnect already handled");
            return false;
        }

        if let Some(consumer) = self.consumer(&record.consumer) {
            let ctx = HandlerContext::new(
                Arc::clone(&record),
                record.path_params.clone(),
                Arc::clone(&self.services),
            );
            if tokio::time::timeout(self.handler_timeout, consumer.lifecycle().on_disconnect(&ctx))
                .await
                .is_err()
            {
                warn!(timeout = ?self.handler_timeout, "disconnect hook timed out");
            }
        }

        let _ = self.services.registry.unregister(id);
        let _ = record.transition(ConnectionState::Closed);
        gauge!(HUB_CONNECTIONS_ACTIVE).decrement(1.0);
        let lifetime = (chrono::Utc::now() - record.connected_at).to_std().unwrap_or_default();
        info!(duration_secs = lifetime.as_secs_f64(), "connection closed");
        true
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("consumers", &self.consumers)
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

fn dropped(reason: DropReason) -> Dispatch {
    counter!(HUB_MESSAGES_DROPPED_TOTAL, "reason" => reason.label()).increment(1);
    Dispatch::Dropped(reason)
}
