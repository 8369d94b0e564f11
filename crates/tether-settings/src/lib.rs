//! # tether-settings
//!
//! Configuration for the Tether realtime client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`ClientSettings::default()`]
//! 2. **User file**: `~/.tether/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TETHER_*` overrides (highest priority)
//!
//! There is no global instance: the host loads settings once and hands them
//! to the client it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn re_exports_work() {
        let _settings = ClientSettings::default();
        let _path = settings_path();
    }

    #[test]
    fn default_settings_are_valid() {
        let settings = ClientSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.heartbeat.interval_ms, 30_000);
        assert_eq!(settings.reconnect.base_delay_ms, 1000);
        assert_eq!(settings.queue.capacity, 1000);
        assert_eq!(settings.queue.overflow, OverflowPolicy::RejectNew);
        assert_eq!(settings.requests.offline_policy, OfflineRequestPolicy::FailFast);
        assert!(settings.auto_reconnect);
    }
}
