//! # tether-core
//!
//! Foundation types shared by the Tether realtime client crates.
//!
//! - **Errors**: [`ClientError`] taxonomy via `thiserror`, with stable codes
//! - **Branded IDs**: [`RequestId`], [`SubscriptionId`], [`SessionId`]
//! - **Wire envelopes**: [`ClientMessage`] (outbound) and [`ServerMessage`]
//!   (inbound, decoded once at the boundary)
//! - **Backoff**: exponential delay with symmetric jitter
//! - **Logging**: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod protocol;
pub mod retry;

pub use errors::{ClientError, Result};
pub use ids::{RequestId, SessionId, SubscriptionId};
pub use protocol::{ClientMessage, ResponseError, ServerMessage};
