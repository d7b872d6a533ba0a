//! Settings type definitions.
//!
//! All types use camelCase field names on the wire and `#[serde(default)]`, so
//! a partial JSON file only needs to name the values it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "logging": { "level": "debug" },
///   "hub": { "sendTimeoutMs": 2000, "retainEmptyGroups": true }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupcastSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name, used in log output.
    pub name: String,
    /// Logging configuration.
    pub logging: LoggingSettings,
    /// Hub behaviour: timeouts, buffers, group retention.
    pub hub: HubSettings,
}

impl Default for GroupcastSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            name: "groupcast".to_string(),
            logging: LoggingSettings::default(),
            hub: HubSettings::default(),
        }
    }
}

impl GroupcastSettings {
    /// Reject values the hub cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.hub.validate()
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingSettings {
    /// Install the global `tracing` subscriber these settings describe.
    ///
    /// `RUST_LOG` still wins over `level`. Only the first call in a process
    /// takes effect.
    pub fn init_subscriber(&self) {
        if self.json {
            groupcast_core::logging::init_json_subscriber(&self.level);
        } else {
            groupcast_core::logging::init_subscriber(&self.level);
        }
    }
}

/// Hub configuration passed to the hub builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Upper bound on a single per-connection send, in milliseconds.
    pub send_timeout_ms: u64,
    /// Upper bound on a single handler invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Capacity of each connection's outbound queue in `ChannelTransport`.
    pub outbound_buffer: usize,
    /// Keep groups whose membership dropped to zero until `prune_empty` runs.
    pub retain_empty_groups: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            handler_timeout_ms: 30_000,
            outbound_buffer: 256,
            retain_empty_groups: false,
        }
    }
}

impl HubSettings {
    /// Send timeout as a [`Duration`].
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Handler timeout as a [`Duration`].
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    /// Reject zero timeouts and an empty outbound buffer.
    pub fn validate(&self) -> Result<()> {
        if self.send_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.sendTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.handler_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.handlerTimeoutMs must be greater than zero".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.outboundBuffer must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
