//! Socket abstraction.
//!
//! The client drives a [`Socket`]: a boxed sink and stream of [`Frame`]s.
//! [`WsConnector`] produces sockets over `tokio-tungstenite`; tests plug in
//! in-memory connectors through the same [`Connector`] trait.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt, future};
use tether_core::ClientError;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

/// Close code for a client-requested shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Code and reason carried by a close frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloseInfo {
    /// WebSocket close code.
    pub code: u16,
    /// Free-form reason.
    pub reason: String,
}

impl CloseInfo {
    /// Normal closure with `reason`.
    pub fn normal(reason: &str) -> Self {
        Self {
            code: NORMAL_CLOSURE,
            reason: reason.to_owned(),
        }
    }
}

/// Transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload (every protocol envelope).
    Text(String),
    /// Transport ping.
    Ping(Vec<u8>),
    /// Transport pong.
    Pong(Vec<u8>),
    /// Close handshake.
    Close(Option<CloseInfo>),
}

/// Outbound half of a socket.
pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = ClientError> + Send>>;

/// Inbound half of a socket.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, ClientError>> + Send>>;

/// An open socket, already split.
pub struct Socket {
    /// Write half.
    pub sink: FrameSink,
    /// Read half. `None` from the stream means the peer went away.
    pub stream: FrameStream,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

/// Opens sockets to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a socket. Errors are reported as [`ClientError::Transport`].
    async fn connect(&self, url: &str) -> Result<Socket, ClientError>;
}

/// Connector backed by `tokio-tungstenite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Socket, ClientError> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(format!("WebSocket connect: {e}")))?;
        debug!(url, status = %response.status(), "websocket opened");

        let (write, read) = ws.split();
        let sink = write
            .sink_map_err(|e| ClientError::Transport(e.to_string()))
            .with(|frame: Frame| future::ready(Ok::<_, ClientError>(frame_to_message(frame))));
        let stream = read.filter_map(|item| {
            future::ready(match item {
                Ok(message) => message_to_frame(message).map(Ok),
                Err(e) => Some(Err(ClientError::Transport(e.to_string()))),
            })
        });
        Ok(Socket {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Convert an outbound frame to a tungstenite message.
pub fn frame_to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close(info) => Message::Close(info.map(|info| CloseFrame {
            code: CloseCode::from(info.code),
            reason: info.reason.into(),
        })),
    }
}

/// Convert an inbound tungstenite message to a frame.
///
/// Binary messages carrying valid UTF-8 are treated as text; other binary
/// payloads and raw frames are dropped.
pub fn message_to_frame(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(Frame::Text(text)),
            Err(_) => {
                debug!(len = bytes.len(), "dropping non-UTF-8 binary frame");
                None
            }
        },
        Message::Ping(data) => Some(Frame::Ping(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(close) => Some(Frame::Close(close.map(|c| CloseInfo {
            code: u16::from(c.code),
            reason: c.reason.as_str().to_owned(),
        }))),
        Message::Frame(_) => None,
    }
}
