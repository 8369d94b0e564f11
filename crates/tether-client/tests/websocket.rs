//! Round trip over a real WebSocket using the default connector.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tether_client::{ConnectionState, RealtimeClient};
use tether_settings::ClientSettings;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal server: checks the token, welcomes, echoes request params, and
/// reports the close code the client used.
async fn spawn_server(close_tx: oneshot::Sender<Option<u16>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let _ = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut close_tx = Some(close_tx);

        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let value: Value = serde_json::from_str(text.as_str()).unwrap();
                    let reply = match value["type"].as_str() {
                        Some("authenticate") => {
                            assert_eq!(value["token"], "tok-ws");
                            json!({"type": "connection_established", "connection_id": "ws-1", "user_id": "u-7"})
                        }
                        Some("request") => json!({
                            "type": "response",
                            "requestId": value["id"],
                            "success": true,
                            "result": value["params"],
                        }),
                        _ => continue,
                    };
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
                Message::Close(frame) => {
                    if let Some(tx) = close_tx.take() {
                        let _ = tx.send(frame.map(|f| u16::from(f.code)));
                    }
                    break;
                }
                _ => {}
            }
        }
    });

    format!("ws://{addr}/ws")
}

#[tokio::test]
async fn connect_request_disconnect() {
    let (close_tx, close_rx) = oneshot::channel();
    let url = spawn_server(close_tx).await;

    let mut settings = ClientSettings::default();
    settings.server_url = url;
    let client = RealtimeClient::new(settings);

    tokio::time::timeout(TIMEOUT, client.connect(Some("tok-ws".into())))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let snapshot = client.state();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.session_id.unwrap().as_str(), "ws-1");
    assert_eq!(snapshot.user_id.as_deref(), Some("u-7"));

    let result = client
        .request("echo", json!({"msg": "over the wire"}), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result, json!({"msg": "over the wire"}));

    client.disconnect().await;
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);

    let code = tokio::time::timeout(TIMEOUT, close_rx)
        .await
        .expect("server never saw a close frame")
        .unwrap();
    assert_eq!(code, Some(1000));
}

#[tokio::test]
async fn unreachable_server_without_reconnect_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut settings = ClientSettings::default();
    settings.server_url = format!("ws://{addr}/ws");
    settings.auto_reconnect = false;
    let client = RealtimeClient::new(settings);

    let err = tokio::time::timeout(TIMEOUT, client.connect(Some("tok".into())))
        .await
        .expect("connect timed out")
        .unwrap_err();
    assert!(matches!(err, tether_client::ClientError::Transport(_)), "{err:?}");
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
