//! Group fan-out.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use groupcast_core::ConnectionId;
use metrics::counter;
use tracing::{debug, instrument, warn};

use crate::errors::DeliveryFailure;
use crate::groups::GroupTable;
use crate::metrics::{HUB_DELIVERIES_TOTAL, HUB_DELIVERY_FAILURES_TOTAL};
use crate::transport::Transport;

/// Delivers payloads to single connections and to whole groups.
///
/// Member lists are snapshotted and the group table lock released before any
/// send, so a slow member never blocks joins, leaves, or other broadcasts.
/// Per-member failures are logged and counted, never raised.
pub struct Broadcaster {
    groups: Arc<GroupTable>,
    transport: Arc<dyn Transport>,
    send_timeout: Duration,
}

impl Broadcaster {
    /// Create a broadcaster bounding each send by `send_timeout`.
    pub fn new(groups: Arc<GroupTable>, transport: Arc<dyn Transport>, send_timeout: Duration) -> Self {
        Self {
            groups,
            transport,
            send_timeout,
        }
    }

    /// Upper bound on a single send.
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Deliver `payload` to every member of `group`.
    ///
    /// Returns the number of successful deliveries. An unknown or empty group
    /// yields zero.
    #[instrument(skip_all, fields(group = %group))]
    pub async fn broadcast(&self, group: &str, payload: Bytes) -> usize {
        self.fan_out(group, payload, None).await
    }

    /// Like [`Self::broadcast`], skipping `excluded` (usually the sender).
    #[instrument(skip_all, fields(group = %group, excluded = %excluded))]
    pub async fn broadcast_except(&self, group: &str, payload: Bytes, excluded: &ConnectionId) -> usize {
        self.fan_out(group, payload, Some(excluded)).await
    }

    /// Deliver `payload` to one connection, bounded by the send timeout.
    pub async fn send(&self, connection: &ConnectionId, payload: Bytes) -> Result<(), DeliveryFailure> {
        let outcome = match tokio::time::timeout(self.send_timeout, self.transport.send(connection, payload)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(DeliveryFailure::Rejected),
            Err(_) => Err(DeliveryFailure::TimedOut(self.send_timeout)),
        };
        match outcome {
            Ok(()) => counter!(HUB_DELIVERIES_TOTAL).increment(1),
            Err(failure) => {
                warn!(conn_id = %connection, error = %failure, "delivery failed");
                counter!(HUB_DELIVERY_FAILURES_TOTAL, "kind" => failure.kind()).increment(1);
            }
        }
        outcome
    }

    async fn fan_out(&self, group: &str, payload: Bytes, excluded: Option<&ConnectionId>) -> usize {
        let members = self.groups.members(group);
        let recipients: Vec<ConnectionId> = members
            .into_iter()
            .filter(|m| Some(m) != excluded)
            .collect();
        if recipients.is_empty() {
            debug!(group, "broadcast to empty group");
            return 0;
        }

        let sends = recipients.iter().map(|m| self.send(m, payload.clone()));
        let delivered = join_all(sends).await.into_iter().filter(Result::is_ok).count();
        debug!(group, recipients = recipients.len(), delivered, "broadcast complete");
        delivered
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
