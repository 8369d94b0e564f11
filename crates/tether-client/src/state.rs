//! Connection state, snapshots, and lifecycle events.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tether_core::{ClientError, SessionId};

/// Connection state machine.
///
/// ```text
/// Disconnected ─connect─▶ Connecting ─open─▶ Authenticating ─welcome─▶ Connected
///      ▲                      │                   │                       │
///      │                      └──── failure ──────┴───── abnormal close ──┤
///      │                                 ▼                                │
///      └──── exhausted / disabled ── Reconnecting ◀───────────────────────┘
///      └──────────────────── Closing ◀── disconnect()
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No socket and no attempt in progress.
    #[default]
    Disconnected,
    /// Opening the socket.
    Connecting,
    /// Socket open; waiting for the welcome message.
    Authenticating,
    /// Welcome received; traffic flows.
    Connected,
    /// Waiting out a backoff delay before the next attempt.
    Reconnecting,
    /// `disconnect()` in progress.
    Closing,
}

impl ConnectionState {
    /// Wire-style name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }

    /// Whether application traffic can be written now.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the client, for diagnostics and UI.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Session id from the latest welcome, while connected.
    pub session_id: Option<SessionId>,
    /// Authenticated user, when the server reported one.
    pub user_id: Option<String>,
    /// Whether a credential is remembered for reconnects.
    pub has_credential: bool,
    /// Last inbound traffic.
    pub last_activity: Option<DateTime<Utc>>,
    /// Reconnect attempts since the last successful connect.
    pub reconnect_attempts: u32,
    /// Requests awaiting a response.
    pub pending_requests: usize,
    /// Frames waiting in the outbound queue.
    pub queued_messages: usize,
    /// Channels with at least one live handler.
    pub channels: Vec<String>,
}

/// Lifecycle notifications, delivered over a broadcast channel.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// Welcome received.
    Connected {
        /// Server-assigned session id.
        session_id: SessionId,
    },
    /// The client reached `Disconnected`.
    Disconnected {
        /// Terminal error, or `None` for a requested disconnect.
        error: Option<ClientError>,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// Attempt number (1-based).
        attempt: u32,
        /// Backoff before the attempt.
        delay: Duration,
    },
    /// A failure worth surfacing: connection errors, server `error`
    /// envelopes, exhaustion.
    Error(ClientError),
}
