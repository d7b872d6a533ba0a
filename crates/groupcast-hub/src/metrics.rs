//! Metric names and the optional Prometheus recorder.
//!
//! The hub records through the `metrics` facade; nothing is collected unless
//! the embedding process installs a recorder.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Call once at startup, before any connection is accepted. The returned
/// handle renders the text exposition format.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from an installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const HUB_CONNECTIONS_TOTAL: &str = "hub_connections_total";
/// Connections currently open (gauge).
pub const HUB_CONNECTIONS_ACTIVE: &str = "hub_connections_active";
/// Connections rejected at connect time (counter).
pub const HUB_CONNECTIONS_REJECTED_TOTAL: &str = "hub_connections_rejected_total";
/// Inbound messages received (counter).
pub const HUB_MESSAGES_TOTAL: &str = "hub_messages_total";
/// Inbound messages dropped (counter, labels: reason).
pub const HUB_MESSAGES_DROPPED_TOTAL: &str = "hub_messages_dropped_total";
/// Successful per-member deliveries (counter).
pub const HUB_DELIVERIES_TOTAL: &str = "hub_deliveries_total";
/// Failed per-member deliveries (counter, labels: kind).
pub const HUB_DELIVERY_FAILURES_TOTAL: &str = "hub_delivery_failures_total";
/// Handler run time in seconds (histogram, labels: route).
pub const HUB_HANDLER_DURATION_SECONDS: &str = "hub_handler_duration_seconds";
