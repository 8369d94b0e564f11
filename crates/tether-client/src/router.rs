//! Inbound message routing.
//!
//! Responses go to the correlation table, channel pushes to the registry.
//! Everything else is handed back to the connection pump as a [`Routed`]
//! value, since answering a ping or surfacing a server error needs the socket
//! or the event channel.

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::{ClientError, RequestId, ServerMessage};
use tracing::{debug, trace, warn};

use crate::correlator::Correlator;
use crate::registry::{ChannelRegistry, invoke_handlers};

/// What the router did with a message.
#[derive(Clone, Debug, PartialEq)]
pub enum Routed {
    /// A pending request was settled.
    Settled(RequestId),
    /// Response for a request that is no longer pending; discarded.
    LateResponse(RequestId),
    /// Channel push delivered to this many handlers.
    Delivered {
        /// Channel name.
        channel: String,
        /// Handlers that ran to completion.
        handlers: usize,
    },
    /// Server ping; the caller should answer with a pong.
    PingReceived,
    /// Server pong.
    PongReceived,
    /// Server-reported error not tied to a request.
    ServerError(ClientError),
    /// Welcome received on an established connection.
    UnexpectedWelcome,
    /// Unrecognized message type; ignored.
    Ignored(String),
}

/// Routes decoded server messages.
pub struct Router<'a> {
    correlator: &'a Mutex<Correlator>,
    registry: &'a Mutex<ChannelRegistry>,
}

impl<'a> Router<'a> {
    /// Router over the given tables.
    pub fn new(correlator: &'a Mutex<Correlator>, registry: &'a Mutex<ChannelRegistry>) -> Self {
        Self {
            correlator,
            registry,
        }
    }

    /// Route one message.
    pub fn route(&self, message: ServerMessage) -> Routed {
        match message {
            ServerMessage::Response {
                request_id,
                success,
                result,
                error,
            } => {
                let outcome = if success {
                    Ok(result.unwrap_or(Value::Null))
                } else {
                    Err(error.map_or_else(
                        || ClientError::Remote {
                            code: "REMOTE_ERROR".into(),
                            message: "request failed".into(),
                        },
                        |e| e.into_client_error(),
                    ))
                };
                if self.correlator.lock().resolve(&request_id, outcome) {
                    trace!(%request_id, success, "response settled");
                    Routed::Settled(request_id)
                } else {
                    warn!(%request_id, "response for unknown or expired request, discarding");
                    Routed::LateResponse(request_id)
                }
            }
            ServerMessage::ChannelEvent { channel, data, .. } => {
                // Snapshot under the lock, invoke outside it.
                let handlers = self.registry.lock().handlers(&channel);
                if handlers.is_empty() {
                    debug!(channel, "push for channel without handlers");
                }
                let delivered = invoke_handlers(&channel, &handlers, &data);
                Routed::Delivered {
                    channel,
                    handlers: delivered,
                }
            }
            ServerMessage::Ping => Routed::PingReceived,
            ServerMessage::Pong => Routed::PongReceived,
            ServerMessage::Error { code, message } => Routed::ServerError(ClientError::Remote {
                code: code.unwrap_or_else(|| "SERVER_ERROR".into()),
                message,
            }),
            ServerMessage::ConnectionEstablished { .. } => Routed::UnexpectedWelcome,
            ServerMessage::Unknown { message_type } => {
                debug!(message_type, "ignoring unknown message type");
                Routed::Ignored(message_type)
            }
        }
    }
}
