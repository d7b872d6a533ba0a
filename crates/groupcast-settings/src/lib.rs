//! # groupcast-settings
//!
//! Configuration with layered sources. Settings are resolved in priority order:
//! 1. **Compiled defaults**: [`GroupcastSettings::default()`]
//! 2. **Settings file**: `~/.groupcast/settings.json`, deep-merged over defaults
//! 3. **Environment variables**: `GROUPCAST_*` overrides (highest priority)
//!
//! There is no process-wide settings singleton. The resolved value is passed
//! to the hub explicitly at construction time.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::{GroupcastSettings, HubSettings, LoggingSettings};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = GroupcastSettings::default();
        let _path = settings_path();
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
        assert_eq!(merged["y"], 2);
    }
}
