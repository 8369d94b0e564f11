//! Wire envelopes for the realtime protocol.
//!
//! Every frame is a JSON object carrying `type` and `timestamp`. Outbound
//! frames are modelled by [`ClientMessage`]; inbound frames are decoded once,
//! at the socket boundary, into [`ServerMessage`]. Frames whose `type` is not
//! recognized decode to [`ServerMessage::Unknown`] so newer servers can add
//! message kinds without breaking older clients.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ClientError;
use crate::ids::{RequestId, SessionId};

/// Current UTC time in the wire timestamp format (RFC 3339, millisecond precision).
pub fn wire_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// Frames the client sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Identification sent right after the socket opens.
    Authenticate {
        /// Bearer credential.
        token: String,
    },
    /// Correlated request.
    Request {
        /// Correlation id echoed back as `requestId`.
        id: RequestId,
        /// Method name (e.g. `memory.search`).
        method: String,
        /// Parameters object.
        params: Value,
    },
    /// Start receiving pushes for the listed channels.
    Subscribe {
        /// Channel names.
        channels: Vec<String>,
    },
    /// Stop receiving pushes for the listed channels.
    Unsubscribe {
        /// Channel names.
        channels: Vec<String>,
    },
    /// Liveness probe.
    Ping,
    /// Answer to a server `ping`.
    Pong,
}

#[derive(Serialize)]
struct Stamped<'a> {
    #[serde(flatten)]
    message: &'a ClientMessage,
    timestamp: String,
}

impl ClientMessage {
    /// Wire `type` string of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Request { .. } => "request",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Serialize with a fresh `timestamp` field.
    pub fn to_json(&self) -> Result<String, ClientError> {
        let stamped = Stamped {
            message: self,
            timestamp: wire_timestamp(),
        };
        Ok(serde_json::to_string(&stamped)?)
    }
}

/// Add a `timestamp` to a caller-composed payload if it has none.
///
/// Non-object payloads are returned unchanged.
pub fn stamp_payload(mut payload: Value) -> Value {
    if let Value::Object(ref mut map) = payload {
        if !map.contains_key("timestamp") {
            let _ = map.insert("timestamp".into(), Value::String(wire_timestamp()));
        }
    }
    payload
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// Error body of a failed response.
///
/// Servers send either a bare string or a `{code, message}` object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseError {
    /// Structured error.
    Structured {
        /// Machine-readable code.
        #[serde(default = "default_error_code")]
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// Bare message.
    Message(String),
}

fn default_error_code() -> String {
    "REMOTE_ERROR".into()
}

impl ResponseError {
    /// Convert into the caller-facing error.
    pub fn into_client_error(self) -> ClientError {
        match self {
            Self::Structured { code, message } => ClientError::Remote { code, message },
            Self::Message(message) => ClientError::Remote {
                code: default_error_code(),
                message,
            },
        }
    }
}

/// Frames the server sends, decoded once at the boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerMessage {
    /// Welcome message; marks the transition into Connected.
    ConnectionEstablished {
        /// Session id assigned by the server.
        connection_id: SessionId,
        /// Authenticated user, when the server reports one.
        user_id: Option<String>,
    },
    /// Answer to a correlated request.
    Response {
        /// Id of the request being answered.
        request_id: RequestId,
        /// Whether the call succeeded.
        success: bool,
        /// Result payload on success.
        result: Option<Value>,
        /// Error payload on failure.
        error: Option<ResponseError>,
    },
    /// Server push on a named channel.
    ChannelEvent {
        /// Channel name.
        channel: String,
        /// The frame's `type`, if it carried one.
        event_type: Option<String>,
        /// Event payload.
        data: Value,
    },
    /// Server liveness probe.
    Ping,
    /// Answer to a client `ping`.
    Pong,
    /// Server-reported error not tied to a request.
    Error {
        /// Machine-readable code, if given.
        code: Option<String>,
        /// Human-readable message.
        message: String,
    },
    /// Well-formed frame with a `type` this client does not understand.
    Unknown {
        /// The unrecognized `type`.
        message_type: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    #[serde(default)]
    request_id: Option<RequestId>,
    #[serde(default)]
    id: Option<RequestId>,
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

impl ServerMessage {
    /// Decode a text frame.
    ///
    /// Returns [`ClientError::Protocol`] for malformed payloads: invalid JSON,
    /// non-object roots, missing `type` on non-channel frames, or known types
    /// lacking their required fields.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ClientError::Protocol(format!("invalid JSON: {e}")))?;
        let Value::Object(obj) = value else {
            return Err(ClientError::Protocol("frame is not a JSON object".into()));
        };

        let message_type = obj.get("type").and_then(Value::as_str).map(str::to_owned);
        match message_type.as_deref() {
            Some("connection_established" | "connection.established") => {
                decode_established(&obj)
            }
            Some("response") => decode_response(obj),
            Some("ping") => Ok(Self::Ping),
            Some("pong") => Ok(Self::Pong),
            Some("error") => Ok(Self::Error {
                code: obj.get("code").and_then(Value::as_str).map(str::to_owned),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified server error")
                    .to_owned(),
            }),
            _ => {
                if let Some(channel) = obj.get("channel").and_then(Value::as_str) {
                    return Ok(Self::ChannelEvent {
                        channel: channel.to_owned(),
                        event_type: message_type,
                        data: obj.get("data").cloned().unwrap_or(Value::Null),
                    });
                }
                match message_type {
                    Some(message_type) => Ok(Self::Unknown { message_type }),
                    None => Err(ClientError::Protocol("frame has no type".into())),
                }
            }
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::Response { .. } => "response",
            Self::ChannelEvent { .. } => "channel_event",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
            Self::Unknown { .. } => "unknown",
        }
    }
}

fn decode_established(obj: &Map<String, Value>) -> Result<ServerMessage, ClientError> {
    // Fields may sit at the top level or under `data`.
    let body = match obj.get("data") {
        Some(Value::Object(data)) => data,
        _ => obj,
    };
    let field = |names: &[&str]| {
        names
            .iter()
            .find_map(|name| body.get(*name).and_then(Value::as_str))
            .map(str::to_owned)
    };
    let connection_id = field(&["connection_id", "connectionId", "clientId", "sessionId"])
        .ok_or_else(|| ClientError::Protocol("welcome message without connection id".into()))?;
    Ok(ServerMessage::ConnectionEstablished {
        connection_id: SessionId::from(connection_id),
        user_id: field(&["user_id", "userId"]),
    })
}

fn decode_response(obj: Map<String, Value>) -> Result<ServerMessage, ClientError> {
    let raw: RawResponse = serde_json::from_value(Value::Object(obj))
        .map_err(|e| ClientError::Protocol(format!("malformed response: {e}")))?;
    let request_id = raw
        .request_id
        .or(raw.id)
        .ok_or_else(|| ClientError::Protocol("response without requestId".into()))?;
    Ok(ServerMessage::Response {
        request_id,
        success: raw.success,
        result: raw.result,
        error: raw.error,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
