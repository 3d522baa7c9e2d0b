#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use axum::Router;
use cipherx_sdk::stream::proto::{ClientMessage, ServerMessage, StreamSubscription};
use cipherx_sdk::{
    CipherXClient, ClientOptions, RetryPolicy, Signal, StreamEvent, StreamOptions,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const TEST_API_KEY: &str = "test-api-key";
pub const SOL_ADDRESS: &str = "So11111111111111111111111111111111111111112";
pub const BONK_ADDRESS: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";

/// Mock server bound to an ephemeral port; aborted on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn spawn_server(app: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    TestServer { addr, task }
}

pub fn fast_retry(max_attempts: usize) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        jitter: Duration::ZERO,
    }
}

pub fn options_for(addr: SocketAddr) -> ClientOptions {
    ClientOptions::default()
        .with_base_url(format!("http://{addr}"))
        .with_stream_url(format!("ws://{addr}/v1/ws"))
        .with_retry_policy(fast_retry(3))
        .with_stream_options(StreamOptions {
            reconnect: fast_retry(3),
            handshake_timeout: Duration::from_secs(2),
            ..StreamOptions::default()
        })
}

pub fn client_for(addr: SocketAddr) -> CipherXClient {
    CipherXClient::with_options(TEST_API_KEY, options_for(addr)).expect("build client")
}

pub fn api_key_matches(headers: &HeaderMap) -> bool {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == TEST_API_KEY)
}

pub fn signal_json(id: &str, symbol: &str, address: &str, confidence: f64) -> Value {
    json!({
        "id": id,
        "token": {"address": address, "symbol": symbol},
        "action": "BUY",
        "confidence": confidence,
        "targetPrice": 2.5,
        "stopLoss": 1.8,
        "reasoning": "volume expansion on breakout"
    })
}

pub fn signal(id: &str, confidence: f64) -> Signal {
    serde_json::from_value(signal_json(id, "SOL", SOL_ADDRESS, confidence)).expect("signal")
}

pub fn token_json(address: &str, symbol: &str) -> Value {
    json!({
        "address": address,
        "symbol": symbol,
        "price": 171.25,
        "priceChange24h": 3.4,
        "volume24h": 1_250_000_000.0,
        "marketCap": 80_000_000_000.0,
        "riskScore": 12.0
    })
}

pub async fn send_server_message(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), String> {
    let payload = msg
        .to_text()
        .map_err(|err| format!("failed to encode server message: {err}"))?;
    socket
        .send(Message::Text(payload))
        .await
        .map_err(|err| format!("failed to send server message: {err}"))
}

pub async fn recv_client_message(socket: &mut WebSocket) -> Result<ClientMessage, String> {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                return ClientMessage::from_text(text.as_ref())
                    .map_err(|err| format!("failed to decode client message: {err}"));
            }
            Some(Ok(Message::Ping(payload))) => {
                socket
                    .send(Message::Pong(payload))
                    .await
                    .map_err(|err| format!("failed to send pong: {err}"))?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err("websocket closed before expected client message".to_string());
            }
            Some(Ok(_)) => return Err("received unexpected non-text websocket frame".to_string()),
            Some(Err(err)) => return Err(format!("websocket receive error: {err}")),
            None => return Err("websocket stream ended unexpectedly".to_string()),
        }
    }
}

/// Sends `hello_ok` and waits for the client's `subscribe`.
pub async fn accept_subscription(socket: &mut WebSocket) -> Result<StreamSubscription, String> {
    send_server_message(
        socket,
        &ServerMessage::HelloOk {
            session_id: "session-7".to_string(),
            server_time_ms: 1_700_000_000_000,
        },
    )
    .await?;

    match recv_client_message(socket).await? {
        ClientMessage::Subscribe(subscription) => Ok(subscription),
        other => Err(format!("expected subscribe, got {other:?}")),
    }
}

pub fn event_channel() -> (
    impl Fn(&StreamEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<StreamEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |event: &StreamEvent| {
        let _ = tx.send(event.clone());
    };
    (handler, rx)
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for stream event")
        .expect("event channel closed")
}

/// Skips state changes and faults until the next signal.
pub async fn next_signal(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Signal {
    loop {
        if let StreamEvent::Signal(signal) = next_event(rx).await {
            return signal;
        }
    }
}
