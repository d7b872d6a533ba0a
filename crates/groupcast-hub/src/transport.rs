//! The seam between the hub and whatever moves bytes to clients.
//!
//! [`Transport::send`] is the only way the hub talks to a connection. It never
//! fails loudly: it reports success as a `bool`, and the hub turns `false`
//! (and slow sends) into logged [`DeliveryFailure`]s.
//!
//! [`ChannelTransport`] is the in-process implementation: each connection owns
//! a bounded mpsc queue drained by the socket writer task.
//!
//! [`DeliveryFailure`]: crate::errors::DeliveryFailure

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use groupcast_core::ConnectionId;
use groupcast_settings::HubSettings;
use tokio::sync::mpsc;
use tracing::debug;

/// Per-connection send primitive provided by the transport layer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `payload` to the connection's writer.
    ///
    /// Returns `false` if the connection is gone or cannot accept the
    /// payload. Must not panic.
    async fn send(&self, connection: &ConnectionId, payload: Bytes) -> bool;
}

struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
    dropped: Arc<AtomicU64>,
}

/// Transport backed by one bounded tokio mpsc queue per connection.
///
/// `send` waits for queue space, so a stalled reader applies backpressure
/// until the hub's send timeout gives up on it.
pub struct ChannelTransport {
    queues: DashMap<ConnectionId, OutboundQueue>,
    capacity: usize,
}

impl ChannelTransport {
    /// Create a transport whose queues hold `capacity` payloads each.
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Create a transport whose queues hold `hub.outboundBuffer` payloads.
    pub fn from_settings(settings: &HubSettings) -> Self {
        Self::new(settings.outbound_buffer)
    }

    /// Per-connection queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Open (or replace) the outbound queue for `connection`.
    ///
    /// The returned receiver is drained by the socket writer.
    pub fn open(&self, connection: ConnectionId) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let queue = OutboundQueue {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        if self.queues.insert(connection.clone(), queue).is_some() {
            debug!(conn_id = %connection, "replaced outbound queue");
        }
        rx
    }

    /// Close the outbound queue for `connection`. Returns whether it existed.
    pub fn close(&self, connection: &ConnectionId) -> bool {
        self.queues.remove(connection).is_some()
    }

    /// Payloads refused for `connection` since its queue was opened.
    pub fn dropped(&self, connection: &ConnectionId) -> u64 {
        self.queues
            .get(connection)
            .map_or(0, |q| q.dropped.load(Ordering::Relaxed))
    }

    /// Number of open queues.
    pub fn len(&self) -> usize {
        self.queues.len()
    }

    /// Whether no queue is open.
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, connection: &ConnectionId, payload: Bytes) -> bool {
        // Clone out of the map so no shard lock is held across the await.
        let Some((tx, dropped)) = self
            .queues
            .get(connection)
            .map(|q| (q.tx.clone(), Arc::clone(&q.dropped)))
        else {
            return false;
        };
        if tx.send(payload).await.is_ok() {
            true
        } else {
            let _ = dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }
}
