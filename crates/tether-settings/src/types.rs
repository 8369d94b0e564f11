//! Client settings types.
//!
//! All structs use camelCase JSON and `#[serde(default)]`, so a settings file
//! only needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Top-level realtime client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket endpoint (e.g. `ws://127.0.0.1:8080/ws`).
    pub server_url: String,
    /// Recover abnormal closes automatically.
    pub auto_reconnect: bool,
    /// How long to wait for the welcome message after the socket opens.
    pub handshake_timeout_ms: u64,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_buffer_size: usize,
    /// Reconnection backoff.
    pub reconnect: ReconnectSettings,
    /// Liveness monitoring.
    pub heartbeat: HeartbeatSettings,
    /// Offline outbound buffering.
    pub queue: QueueSettings,
    /// Request/response behaviour.
    pub requests: RequestSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8080/ws".to_string(),
            auto_reconnect: true,
            handshake_timeout_ms: 10_000,
            event_buffer_size: 64,
            reconnect: ReconnectSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            queue: QueueSettings::default(),
            requests: RequestSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Handshake timeout as a [`Duration`].
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Reject combinations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() {
            return Err(SettingsError::InvalidValue("serverUrl must not be empty".into()));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "handshakeTimeoutMs must be > 0".into(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(SettingsError::InvalidValue("eventBufferSize must be > 0".into()));
        }
        self.reconnect.validate()?;
        self.heartbeat.validate()?;
        if self.queue.capacity == 0 {
            return Err(SettingsError::InvalidValue("queue.capacity must be > 0".into()));
        }
        if self.requests.default_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "requests.defaultTimeoutMs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Delay before the first reconnect attempt.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay (before jitter).
    pub max_delay_ms: u64,
    /// Reconnect attempts allowed before giving up.
    pub max_attempts: u32,
    /// Symmetric jitter factor (0.1 = ±10%).
    pub jitter_factor: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter_factor: 0.1,
        }
    }
}

impl ReconnectSettings {
    fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "reconnect.baseDelayMs must be > 0".into(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.baseDelayMs ({}) exceeds maxDelayMs ({})",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.jitterFactor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }
}

/// Heartbeat parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval between pings in milliseconds.
    pub interval_ms: u64,
    /// Intervals without inbound traffic before the socket is declared dead.
    pub missed_beats: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            missed_beats: 2,
        }
    }
}

impl HeartbeatSettings {
    /// Ping interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.intervalMs must be > 0".into(),
            ));
        }
        if self.missed_beats == 0 {
            return Err(SettingsError::InvalidValue(
                "heartbeat.missedBeats must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// What the outbound queue does when it is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Refuse the new message; the caller sees `QueueFull`.
    #[default]
    RejectNew,
    /// Evict the oldest queued message to make room.
    DropOldest,
}

/// Outbound queue parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueSettings {
    /// Maximum queued messages.
    pub capacity: usize,
    /// Behaviour when full.
    pub overflow: OverflowPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            overflow: OverflowPolicy::RejectNew,
        }
    }
}

/// What `request()` does while the connection is not usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OfflineRequestPolicy {
    /// Fail immediately with `NotConnected`.
    #[default]
    FailFast,
    /// Queue the request envelope; its timeout keeps running.
    Queue,
}

/// Request/response parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestSettings {
    /// Timeout used by `request_default`.
    pub default_timeout_ms: u64,
    /// Offline behaviour.
    pub offline_policy: OfflineRequestPolicy,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            offline_policy: OfflineRequestPolicy::FailFast,
        }
    }
}

impl RequestSettings {
    /// Default timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
