//! # tether-client
//!
//! Realtime WebSocket client for the Tether protocol.
//!
//! A single [`RealtimeClient`] owns one logical connection and provides:
//!
//! - **Lifecycle**: credential resolution, authenticate handshake, state
//!   machine with [`ClientEvent`] notifications
//! - **Requests**: correlated request/response with per-call timeouts
//! - **Channels**: reference-counted subscriptions with handler fan-out
//! - **Resilience**: heartbeat liveness, exponential reconnect with jitter,
//!   bounded offline queue flushed in order on reconnect
//!
//! The socket is pluggable through [`Connector`]; [`WsConnector`] is the
//! `tokio-tungstenite` implementation.

#![deny(unsafe_code)]

pub mod client;
pub mod correlator;
pub mod credentials;
mod driver;
pub mod heartbeat;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod router;
pub mod state;
pub mod transport;

pub use client::{ClientBuilder, RealtimeClient, Subscription};
pub use credentials::{
    CredentialPrompt, CredentialSource, CredentialSources, CredentialStore, FileCredentialStore,
    StaticCredential,
};
pub use state::{ClientEvent, ConnectionSnapshot, ConnectionState};
pub use tether_core::{ClientError, Result};
pub use transport::{CloseInfo, Connector, Frame, FrameSink, FrameStream, Socket, WsConnector};
