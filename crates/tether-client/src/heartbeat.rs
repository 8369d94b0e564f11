//! Heartbeat liveness tracking.
//!
//! Any inbound frame counts as activity. At each interval tick the monitor
//! decides whether to send another ping or declare the socket dead. The tick
//! source itself is a single `tokio::time::Interval` owned by the connection
//! pump, so one live connection never has more than one heartbeat.

use std::time::Duration;

use tether_settings::HeartbeatSettings;
use tokio::time::Instant;

/// What to do on a heartbeat tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Beat {
    /// Connection looks healthy; send a ping.
    Ping,
    /// No inbound traffic for the whole liveness window.
    Dead {
        /// How long the socket has been silent.
        silent_for: Duration,
    },
}

/// Per-connection liveness state.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    missed_beats: u32,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    /// Start monitoring at `now`.
    pub fn new(settings: &HeartbeatSettings, now: Instant) -> Self {
        Self {
            interval: settings.interval(),
            missed_beats: settings.missed_beats.max(1),
            last_activity: now,
        }
    }

    /// Ping interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence tolerated before the socket is declared dead.
    pub fn liveness_window(&self) -> Duration {
        self.interval.saturating_mul(self.missed_beats)
    }

    /// Record inbound traffic.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Evaluate a tick.
    pub fn on_tick(&self, now: Instant) -> Beat {
        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for >= self.liveness_window() {
            Beat::Dead { silent_for }
        } else {
            Beat::Ping
        }
    }
}
