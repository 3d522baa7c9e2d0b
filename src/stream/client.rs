//! Websocket stream client and reconnecting connection worker.
//!
//! The worker owns the socket, performs the `hello_ok`/`subscribe` handshake
//! on every (re)connect, and hands decoded events to the dispatcher. Outbound
//! messages issued while disconnected are queued and flushed once the next
//! session opens.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::{StreamOptions, STREAM_ENDPOINT};
use crate::error::ErrorKind;
use crate::retry::with_timeout;
use crate::stream::connection::{
    ConnectionState, Dispatcher, Handler, Lifecycle, StreamConnection, StreamEvent, StreamFault,
};
use crate::stream::proto::{ClientMessage, ServerMessage, StreamSubscription};
use crate::transport::API_KEY_HEADER;

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Entry point for creating stream connections.
#[derive(Clone)]
pub struct StreamClient {
    api_key: Option<SecretString>,
    endpoint: String,
    options: StreamOptions,
}

impl StreamClient {
    /// Creates a stream client for production mode.
    pub fn new(api_key: SecretString) -> Self {
        Self::with_options(Some(api_key), StreamOptions::default())
    }

    pub fn with_options(api_key: Option<SecretString>, options: StreamOptions) -> Self {
        Self {
            api_key,
            endpoint: STREAM_ENDPOINT.to_string(),
            options,
        }
    }

    /// Points the client at another stream endpoint, such as
    /// [`LOCAL_STREAM_ENDPOINT`](crate::config::LOCAL_STREAM_ENDPOINT).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim().to_string();
        self
    }

    /// Starts building a connection so handlers are in place before the
    /// first event.
    pub fn subscribe(&self) -> StreamBuilder {
        StreamBuilder {
            client: self.clone(),
            subscription: StreamSubscription::all(),
            handlers: Vec::new(),
        }
    }

    /// Opens a connection without any handlers registered yet.
    pub async fn connect(
        &self,
        subscription: StreamSubscription,
    ) -> Result<StreamConnection, StreamError> {
        self.open(subscription, Vec::new()).await
    }

    async fn open(
        &self,
        subscription: StreamSubscription,
        handlers: Vec<Handler>,
    ) -> Result<StreamConnection, StreamError> {
        let api_key = self.api_key.clone().ok_or(StreamError::MissingApiKey)?;
        validate_subscription(&subscription)?;

        let dispatcher = Dispatcher::new(self.options.handler_queue_capacity, Handle::current());
        for handler in handlers {
            dispatcher.register(handler);
        }
        let lifecycle = Arc::new(Lifecycle::new(dispatcher));

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = Worker {
            url: self.endpoint().to_string(),
            api_key,
            subscription,
            options: self.options.clone(),
            lifecycle: Arc::clone(&lifecycle),
        };
        tokio::spawn(worker.run(outbound_rx, shutdown_rx));

        Ok(StreamConnection::new(lifecycle, outbound_tx, shutdown_tx))
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Collects a subscription and handlers, then connects.
pub struct StreamBuilder {
    client: StreamClient,
    subscription: StreamSubscription,
    handlers: Vec<Handler>,
}

impl StreamBuilder {
    pub fn subscription(mut self, subscription: StreamSubscription) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn min_confidence(mut self, min_confidence: f64) -> Self {
        self.subscription.min_confidence = Some(min_confidence);
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.subscription.tokens.push(token.into());
        self
    }

    pub fn on_event<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Handler::Event(Box::new(handler)));
        self
    }

    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&StreamFault) + Send + Sync + 'static,
    {
        self.handlers.push(Handler::Error(Box::new(handler)));
        self
    }

    pub async fn connect(self) -> Result<StreamConnection, StreamError> {
        self.client.open(self.subscription, self.handlers).await
    }
}

/// Errors produced by stream transport and protocol handling.
#[derive(Debug, Error)]
pub enum StreamError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    #[error("api key is not configured")]
    MissingApiKey,

    /// Server rejected the credential during the websocket upgrade.
    #[error("stream rejected credential: {0}")]
    Unauthorized(String),

    /// Outbound message queue has been closed.
    #[error("send queue is closed")]
    SendQueueClosed,

    #[error("invalid subscription: {0}")]
    InvalidSubscription(String),

    /// Stream protocol or handshake contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingApiKey | Self::Unauthorized(_) | Self::InvalidApiKeyHeader(_) => {
                ErrorKind::Auth
            }
            Self::Json(_) => ErrorKind::Decode,
            Self::InvalidSubscription(_) => ErrorKind::InvalidRequest,
            Self::WebSocket(_) | Self::SendQueueClosed | Self::Protocol(_) => {
                ErrorKind::Connection
            }
        }
    }
}

pub(crate) fn validate_subscription(subscription: &StreamSubscription) -> Result<(), StreamError> {
    if let Some(min) = subscription.min_confidence {
        if !min.is_finite() || !(0.0..=1.0).contains(&min) {
            return Err(StreamError::InvalidSubscription(format!(
                "min_confidence must be within [0, 1], got {min}"
            )));
        }
    }
    if subscription.tokens.iter().any(|token| token.trim().is_empty()) {
        return Err(StreamError::InvalidSubscription(
            "token filters must not be empty".to_string(),
        ));
    }
    Ok(())
}

enum SessionOutcome {
    Shutdown,
    Disconnected,
}

struct Worker {
    url: String,
    api_key: SecretString,
    subscription: StreamSubscription,
    options: StreamOptions,
    lifecycle: Arc<Lifecycle>,
}

impl Worker {
    async fn run(
        mut self,
        mut outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut pending = VecDeque::new();
        let max_failures = self.options.reconnect.max_attempts.max(1);
        let mut failures = 0usize;
        let mut ever_opened = false;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self
                .run_connected_session(
                    &mut outbound_rx,
                    &mut shutdown_rx,
                    &mut pending,
                    &mut ever_opened,
                )
                .await
            {
                Ok(SessionOutcome::Shutdown) => break,
                Ok(SessionOutcome::Disconnected) => {
                    warn!(event = "stream_disconnected", url = %self.url);
                    failures = 0;
                }
                Err(StreamError::Unauthorized(message)) => {
                    self.lifecycle
                        .fail(StreamFault::terminal(ErrorKind::Auth, message));
                    return;
                }
                Err(err) => {
                    failures += 1;
                    warn!(
                        event = "stream_connect_failed",
                        url = %self.url,
                        attempt = failures,
                        max_attempts = max_failures,
                        error = %err
                    );
                    if failures >= max_failures {
                        self.lifecycle.fail(StreamFault::terminal(
                            ErrorKind::Connection,
                            format!("gave up after {failures} failed connection attempts"),
                        ));
                        return;
                    }
                }
            }

            if ever_opened {
                self.lifecycle.transition(ConnectionState::Reconnecting);
            }

            let delay = self.options.reconnect.delay_for_attempt(failures.max(1));
            debug!(
                event = "stream_reconnect_scheduled",
                attempt = failures,
                max_attempts = max_failures,
                delay_ms = delay.as_millis() as u64
            );
            if !self
                .collect_messages_during_delay(delay, &mut outbound_rx, &mut shutdown_rx, &mut pending)
                .await
            {
                break;
            }
        }

        self.lifecycle.transition(ConnectionState::Closed);
        debug!(event = "stream_worker_stopped", url = %self.url);
    }

    async fn run_connected_session(
        &mut self,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
        pending: &mut VecDeque<ClientMessage>,
        ever_opened: &mut bool,
    ) -> Result<SessionOutcome, StreamError> {
        let timeout = self.options.handshake_timeout;
        let mut socket = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Ok(SessionOutcome::Shutdown),
            result = with_timeout(timeout, self.handshake()) => match result {
                Ok(socket) => socket?,
                Err(_) => {
                    return Err(StreamError::Protocol(format!(
                        "handshake did not complete within {timeout:?}"
                    )));
                }
            },
        };

        *ever_opened = true;
        self.lifecycle.transition(ConnectionState::Open);

        while let Some(next) = pending.pop_front() {
            if send_client_message(&mut socket, &next).await.is_err() {
                pending.push_front(next);
                return Ok(SessionOutcome::Disconnected);
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    let _ = socket.close(None).await;
                    return Ok(SessionOutcome::Shutdown);
                }
                maybe_outbound = outbound_rx.recv() => {
                    match maybe_outbound {
                        Some(client_msg) => {
                            if let ClientMessage::Subscribe(subscription) = &client_msg {
                                self.subscription = subscription.clone();
                            }
                            if send_client_message(&mut socket, &client_msg).await.is_err() {
                                pending.push_front(client_msg);
                                return Ok(SessionOutcome::Disconnected);
                            }
                        }
                        None => {
                            let _ = socket.close(None).await;
                            return Ok(SessionOutcome::Shutdown);
                        }
                    }
                }
                maybe_inbound = socket.next() => {
                    match maybe_inbound {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Ping(payload))) => {
                            if socket.send(Message::Pong(payload)).await.is_err() {
                                return Ok(SessionOutcome::Disconnected);
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            self.lifecycle.dispatcher().dispatch(&StreamEvent::Error(
                                StreamFault::decode("received unexpected binary frame"),
                            ));
                        }
                        Some(Ok(Message::Close(_))) => return Ok(SessionOutcome::Disconnected),
                        Some(Ok(_)) => {}
                        Some(Err(_)) => return Ok(SessionOutcome::Disconnected),
                        None => return Ok(SessionOutcome::Disconnected),
                    }
                }
            }
        }
    }

    /// Connects, authenticates, waits for `hello_ok`, and subscribes.
    async fn handshake(&self) -> Result<Socket, StreamError> {
        let mut request = self.url.as_str().into_client_request()?;
        let api_key_header = self.api_key.expose_secret().parse()?;
        request.headers_mut().insert(API_KEY_HEADER, api_key_header);

        let (mut socket, _) = connect_async(request).await.map_err(|err| match err {
            WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                StreamError::Unauthorized(format!("upgrade rejected with {}", response.status()))
            }
            other => StreamError::WebSocket(other),
        })?;

        match recv_server_message_before_subscribe(&mut socket).await? {
            ServerMessage::HelloOk { session_id, .. } => {
                debug!(event = "stream_hello_ok", session_id = %session_id);
            }
            ServerMessage::Error { code, message } if code == "unauthorized" => {
                return Err(StreamError::Unauthorized(message));
            }
            _ => {
                return Err(StreamError::Protocol(
                    "expected first server message to be hello_ok".to_string(),
                ));
            }
        }

        let subscribe = ClientMessage::Subscribe(self.subscription.clone());
        send_client_message(&mut socket, &subscribe).await?;
        Ok(socket)
    }

    fn handle_text(&self, text: &str) {
        let dispatcher = self.lifecycle.dispatcher();
        match ServerMessage::from_text(text) {
            Ok(ServerMessage::Signal { signal }) => {
                dispatcher.dispatch(&StreamEvent::Signal(signal));
            }
            Ok(ServerMessage::Error { code, message }) => {
                warn!(event = "stream_server_error", code = %code, message = %message);
                dispatcher.dispatch(&StreamEvent::Error(StreamFault::server(code, message)));
            }
            Ok(ServerMessage::Pong { server_time_ms }) => {
                debug!(event = "stream_pong", server_time_ms);
            }
            Ok(ServerMessage::HelloOk { .. }) => {}
            Err(err) => {
                warn!(event = "stream_decode_failed", error = %err);
                dispatcher.dispatch(&StreamEvent::Error(StreamFault::decode(format!(
                    "undecodable stream message: {err}"
                ))));
            }
        }
    }

    /// Sleeps for `delay` while queueing outbound messages.
    ///
    /// Returns `false` when the connection was closed meanwhile.
    async fn collect_messages_during_delay(
        &mut self,
        delay: Duration,
        outbound_rx: &mut mpsc::UnboundedReceiver<ClientMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
        pending: &mut VecDeque<ClientMessage>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => return false,
                _ = &mut sleep => return true,
                maybe_message = outbound_rx.recv() => {
                    match maybe_message {
                        // The next handshake sends the latest subscription.
                        Some(ClientMessage::Subscribe(subscription)) => {
                            self.subscription = subscription;
                        }
                        Some(message) => pending.push_back(message),
                        None => return false,
                    }
                }
            }
        }
    }
}

async fn recv_server_message_before_subscribe<S>(
    socket: &mut WebSocketStream<S>,
) -> Result<ServerMessage, StreamError>
where
    WebSocketStream<S>:
        futures_util::Sink<Message, Error = WsError> + Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => return Ok(ServerMessage::from_text(&text)?),
            Some(Ok(Message::Ping(payload))) => {
                socket.send(Message::Pong(payload)).await?;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) => {
                return Err(StreamError::Protocol(
                    "socket closed before hello_ok".to_string(),
                ));
            }
            Some(Ok(_)) => {
                return Err(StreamError::Protocol(
                    "received non-text frame before hello_ok".to_string(),
                ));
            }
            Some(Err(err)) => return Err(StreamError::WebSocket(err)),
            None => {
                return Err(StreamError::Protocol(
                    "socket ended before hello_ok".to_string(),
                ));
            }
        }
    }
}

async fn send_client_message<S>(
    socket: &mut WebSocketStream<S>,
    message: &ClientMessage,
) -> Result<(), StreamError>
where
    WebSocketStream<S>: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    let text = message.to_text()?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}
