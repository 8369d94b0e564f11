//! Error taxonomy for the realtime client.
//!
//! Every failure a caller can observe is a [`ClientError`]. The type is
//! `Clone` so a single terminal failure (reconnect budget exhausted, explicit
//! disconnect) can be delivered to every outstanding request and to the
//! lifecycle listeners without re-constructing it per recipient.

use thiserror::Error;

/// Errors surfaced by the realtime client.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    /// No usable credential could be resolved.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Operation attempted while the connection is not usable.
    #[error("not connected (state: {state})")]
    NotConnected {
        /// State name at the time of the call.
        state: String,
    },

    /// A request exceeded its deadline.
    #[error("request {method} ({request_id}) timed out after {timeout_ms}ms")]
    Timeout {
        /// Correlation id of the request.
        request_id: String,
        /// Method that was called.
        method: String,
        /// Deadline that elapsed.
        timeout_ms: u64,
    },

    /// The reconnect budget is spent; the client gave up.
    #[error("connection exhausted after {attempts} reconnect attempts")]
    ConnectionExhausted {
        /// Number of reconnect attempts made.
        attempts: u32,
    },

    /// The operation was in flight during `disconnect()` / `dispose()`.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Malformed or unrecognized inbound payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with `success: false`.
    #[error("[{code}] {message}")]
    Remote {
        /// Server-side error code.
        code: String,
        /// Server-side message.
        message: String,
    },

    /// The outbound queue is full and the overflow policy rejects new messages.
    #[error("outbound queue full (capacity {capacity})")]
    QueueFull {
        /// Configured queue capacity.
        capacity: usize,
    },

    /// Socket-level failure (open, read, or write).
    #[error("transport error: {0}")]
    Transport(String),

    /// Payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client has been disposed and can no longer be used.
    #[error("client disposed")]
    Disposed,
}

impl ClientError {
    /// Machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "AUTHENTICATION_FAILED",
            Self::NotConnected { .. } => "NOT_CONNECTED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::ConnectionExhausted { .. } => "CONNECTION_EXHAUSTED",
            Self::Cancelled(_) => "CANCELLED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Disposed => "DISPOSED",
        }
    }

    /// Whether the reconnection policy should retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout { .. })
    }

    /// Whether this error ends the connection for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionExhausted { .. } | Self::Authentication(_) | Self::Disposed
        )
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn timeout_display() {
        let err = ClientError::Timeout {
            request_id: "req_1".into(),
            method: "echo".into(),
            timeout_ms: 100,
        };
        assert_eq!(err.to_string(), "request echo (req_1) timed out after 100ms");
    }

    #[test]
    fn not_connected_display_includes_state() {
        let err = ClientError::NotConnected {
            state: "reconnecting".into(),
        };
        assert!(err.to_string().contains("reconnecting"));
    }

    #[test]
    fn remote_display() {
        let err = ClientError::Remote {
            code: "METHOD_NOT_FOUND".into(),
            message: "no such method".into(),
        };
        assert_eq!(err.to_string(), "[METHOD_NOT_FOUND] no such method");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ClientError::Authentication("x".into()).code(), "AUTHENTICATION_FAILED");
        assert_eq!(ClientError::Cancelled("x".into()).code(), "CANCELLED");
        assert_eq!(
            ClientError::ConnectionExhausted { attempts: 3 }.code(),
            "CONNECTION_EXHAUSTED"
        );
        assert_eq!(ClientError::Protocol("x".into()).code(), "PROTOCOL_ERROR");
        assert_eq!(ClientError::Disposed.code(), "DISPOSED");
    }

    #[test]
    fn retryable_classification() {
        assert!(ClientError::Transport("reset".into()).is_retryable());
        assert!(!ClientError::Authentication("none".into()).is_retryable());
        assert!(!ClientError::ConnectionExhausted { attempts: 1 }.is_retryable());
    }

    #[test]
    fn terminal_classification() {
        assert!(ClientError::ConnectionExhausted { attempts: 1 }.is_terminal());
        assert!(ClientError::Disposed.is_terminal());
        assert!(!ClientError::Transport("reset".into()).is_terminal());
    }

    #[test]
    fn serde_json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: ClientError = json_err.into();
        assert_matches!(err, ClientError::Serialization(_));
    }

    #[test]
    fn clone_preserves_variant() {
        let err = ClientError::ConnectionExhausted { attempts: 3 };
        assert_eq!(err.clone(), err);
    }
}
