//! In-memory socket pair for driving the client from a scripted server.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_client::{ClientError, CloseInfo, Connector, Frame, RealtimeClient, Socket};
use tether_settings::ClientSettings;
use tokio::sync::mpsc;

/// Upper bound on any single wait. Generous because paused-clock tests
/// advance straight through it.
pub const WAIT: Duration = Duration::from_secs(300);

/// Connector handing each new socket to a [`MemoryServer`].
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<ServerConn>,
    attempts: AtomicU32,
    refuse: AtomicBool,
}

impl MemoryConnector {
    /// Number of `connect` calls so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Refuse (or accept again) subsequent connections.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _url: &str) -> Result<Socket, ClientError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Transport("connection refused".into()));
        }
        let (client_tx, server_rx) = fmpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<Frame, ClientError>>();
        self.accept_tx
            .send(ServerConn {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| ClientError::Transport("server gone".into()))?;
        Ok(Socket {
            sink: Box::pin(client_tx.sink_map_err(|e| ClientError::Transport(e.to_string()))),
            stream: Box::pin(client_rx),
        })
    }
}

/// Accept side of the in-memory transport.
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<ServerConn>,
}

impl MemoryServer {
    /// Wait for the client to open a socket.
    pub async fn accept(&mut self) -> ServerConn {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }
}

/// Create a connected connector/server pair.
pub fn memory_pair() -> (Arc<MemoryConnector>, MemoryServer) {
    let (accept_tx, accepted) = mpsc::unbounded_channel();
    let connector = Arc::new(MemoryConnector {
        accept_tx,
        attempts: AtomicU32::new(0),
        refuse: AtomicBool::new(false),
    });
    (connector, MemoryServer { accepted })
}

/// Server end of one socket.
pub struct ServerConn {
    incoming: fmpsc::UnboundedReceiver<Frame>,
    outgoing: fmpsc::UnboundedSender<Result<Frame, ClientError>>,
}

impl ServerConn {
    /// Next frame from the client, or `None` once it hung up.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        tokio::time::timeout(WAIT, self.incoming.next())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next text frame, parsed.
    pub async fn recv_json(&mut self) -> Value {
        match self.next_frame().await.expect("client hung up") {
            Frame::Text(text) => serde_json::from_str(&text).expect("client sent invalid JSON"),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next text frame of the given `type`, skipping heartbeat pings.
    pub async fn recv_type(&mut self, message_type: &str) -> Value {
        loop {
            let value = self.recv_json().await;
            if value["type"] == message_type {
                return value;
            }
            assert_eq!(value["type"], "ping", "unexpected frame while waiting for {message_type}: {value}");
        }
    }

    /// Send a JSON envelope.
    pub fn send_json(&self, value: Value) {
        self.send_raw(&value.to_string());
    }

    /// Send raw text.
    pub fn send_raw(&self, text: &str) {
        let _ = self.outgoing.unbounded_send(Ok(Frame::Text(text.to_owned())));
    }

    /// Send the welcome message.
    pub fn welcome(&self, session_id: &str) {
        self.send_json(json!({
            "type": "connection_established",
            "connection_id": session_id,
            "timestamp": "2026-01-01T00:00:00.000Z",
        }));
    }

    /// Read the authenticate envelope and answer with a welcome.
    pub async fn accept_auth(&mut self, session_id: &str) -> Value {
        let auth = self.recv_json().await;
        assert_eq!(auth["type"], "authenticate");
        self.welcome(session_id);
        auth
    }

    /// Answer a request envelope successfully.
    pub fn respond(&self, request: &Value, result: Value) {
        self.send_json(json!({
            "type": "response",
            "requestId": request["id"],
            "success": true,
            "result": result,
        }));
    }

    /// Push an event on a channel.
    pub fn push(&self, channel: &str, data: Value) {
        self.send_json(json!({
            "type": "channel.event",
            "channel": channel,
            "data": data,
        }));
    }

    /// Drop the connection abnormally.
    pub fn fail(self) {
        let _ = self
            .outgoing
            .unbounded_send(Err(ClientError::Transport("connection reset".into())));
    }

    /// Wait for the client's close frame.
    pub async fn expect_close(&mut self) -> Option<CloseInfo> {
        loop {
            match self.next_frame().await.expect("client hung up without a close frame") {
                Frame::Close(info) => return info,
                Frame::Text(text) => assert!(text.contains("\"ping\""), "unexpected frame before close: {text}"),
                Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }
}

/// Settings with short backoff so reconnect tests stay quick.
pub fn test_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    settings.server_url = "ws://memory.test/ws".into();
    settings.reconnect.base_delay_ms = 100;
    settings.reconnect.max_delay_ms = 1_000;
    settings
}

/// A client that completed its handshake, with the server end.
pub struct Harness {
    pub client: RealtimeClient,
    pub connector: Arc<MemoryConnector>,
    pub server: MemoryServer,
    pub conn: ServerConn,
}

/// Connect a client with `settings` and complete the handshake.
pub async fn connected(settings: ClientSettings) -> Harness {
    let (connector, mut server) = memory_pair();
    let client = RealtimeClient::builder(settings)
        .connector(connector.clone())
        .build();
    let connecting = tokio::spawn({
        let client = client.clone();
        async move { client.connect(Some("tok-test".into())).await }
    });
    let mut conn = server.accept().await;
    let _ = conn.accept_auth("sess-1").await;
    connecting
        .await
        .expect("connect task panicked")
        .expect("connect failed");
    Harness {
        client,
        connector,
        server,
        conn,
    }
}
