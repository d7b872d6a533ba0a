//! The hub facade.
//!
//! Owns the group table, registry, broadcaster and dispatcher, and exposes the
//! three entry points a transport calls: [`Hub::on_connect`],
//! [`Hub::on_message`] and [`Hub::on_disconnect`].

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use groupcast_core::ConnectionId;
use groupcast_settings::HubSettings;
use tracing::info;

use crate::broadcast::Broadcaster;
use crate::consumer::Consumer;
use crate::context::Services;
use crate::dispatcher::{ConnectOutcome, Dispatcher};
use crate::errors::HubError;
use crate::groups::GroupTable;
use crate::registry::{Connection, ConnectionInfo, ConnectionRegistry};
use crate::router::Dispatch;
use crate::transport::Transport;

/// Builder for [`Hub`].
pub struct HubBuilder {
    settings: HubSettings,
    transport: Arc<dyn Transport>,
    consumers: Vec<Consumer>,
}

impl HubBuilder {
    /// Mount a consumer. Consumers are tried in mount order.
    #[must_use]
    pub fn mount(mut self, consumer: Consumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Validate settings and consumers, then assemble the hub.
    pub fn build(self) -> Result<Hub, HubError> {
        self.settings.validate()?;

        let mut names = HashSet::new();
        for consumer in &self.consumers {
            if !names.insert(consumer.name()) {
                return Err(HubError::DuplicateConsumer {
                    name: consumer.name().to_owned(),
                });
            }
        }

        let groups = Arc::new(if self.settings.retain_empty_groups {
            GroupTable::retaining_empty()
        } else {
            GroupTable::new()
        });
        let services = Arc::new(Services {
            registry: Arc::new(ConnectionRegistry::new(Arc::clone(&groups))),
            broadcaster: Arc::new(Broadcaster::new(
                Arc::clone(&groups),
                self.transport,
                self.settings.send_timeout(),
            )),
            groups,
        });

        info!(
            consumers = self.consumers.len(),
            send_timeout_ms = self.settings.send_timeout_ms,
            handler_timeout_ms = self.settings.handler_timeout_ms,
            "hub built"
        );
        let dispatcher = Dispatcher::new(self.consumers, Arc::clone(&services), self.settings.handler_timeout());
        Ok(Hub {
            settings: self.settings,
            services,
            dispatcher,
        })
    }
}

/// Group pub/sub hub.
pub struct Hub {
    settings: HubSettings,
    services: Arc<Services>,
    dispatcher: Dispatcher,
}

impl Hub {
    /// Start building a hub that sends through `transport`.
    pub fn builder(settings: HubSettings, transport: Arc<dyn Transport>) -> HubBuilder {
        HubBuilder {
            settings,
            transport,
            consumers: Vec::new(),
        }
    }

    /// A new connection arrived.
    pub async fn on_connect(&self, connection: Connection) -> Result<ConnectOutcome, HubError> {
        self.dispatcher.on_connect(connection).await
    }

    /// A connection sent a payload.
    pub async fn on_message(&self, id: &ConnectionId, raw: Bytes) -> Dispatch {
        self.dispatcher.on_message(id, raw).await
    }

    /// A connection went away.
    ///
    /// Returns `true` when the connection was closed here, or when its
    /// connect was still in flight and will now be rejected.
    pub async fn on_disconnect(&self, id: &ConnectionId) -> bool {
        self.dispatcher.on_disconnect(id).await
    }

    /// Disconnect every open connection. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for id in self.services.registry.ids() {
            if self.dispatcher.on_disconnect(&id).await {
                closed += 1;
            }
        }
        info!(closed, "closed all connections");
        closed
    }

    /// Server-side push to a group. Returns successful deliveries.
    pub async fn broadcast(&self, group: &str, payload: impl Into<Bytes>) -> usize {
        self.services.broadcaster.broadcast(group, payload.into()).await
    }

    /// Drop empty groups kept by `retainEmptyGroups`.
    pub fn prune_empty_groups(&self) -> usize {
        self.services.groups.prune_empty()
    }

    /// Snapshots of every registered connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.services.registry.snapshot()
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

    /// Mounted consumers in match order.
    pub fn consumers(&self) -> &[Consumer] {
        self.dispatcher.consumers()
    }

    /// Settings the hub was built with.
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("settings", &self.settings)
            .field("dispatcher", &self.dispatcher)
            .field("connections", &self.services.registry.len())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
