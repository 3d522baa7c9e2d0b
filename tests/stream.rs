mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use cipherx_sdk::stream::proto::{ClientMessage, ServerMessage, StreamSubscription};
use cipherx_sdk::{CipherXClient, ConnectionState, ErrorKind, StreamEvent, StreamFault};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

use common::{
    accept_subscription, api_key_matches, client_for, event_channel, next_event, next_signal,
    options_for, recv_client_message, send_server_message, signal, spawn_server,
};

fn signal_message(id: &str, confidence: f64) -> ServerMessage {
    ServerMessage::Signal {
        signal: signal(id, confidence),
    }
}

fn ws_route<F, Fut>(script: F) -> Router
where
    F: Fn(WebSocket) -> Fut + Clone + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Router::new().route(
        "/v1/ws",
        get(move |ws: WebSocketUpgrade, headers: HeaderMap| {
            let script = script.clone();
            async move {
                if !api_key_matches(&headers) {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                ws.on_upgrade(script).into_response()
            }
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_delivers_signals_in_arrival_order() {
    let (subscription_tx, subscription_rx) = oneshot::channel::<StreamSubscription>();
    let subscription_tx = Arc::new(Mutex::new(Some(subscription_tx)));
    let app = ws_route(move |mut socket: WebSocket| {
        let subscription_tx = Arc::clone(&subscription_tx);
        async move {
            let subscription = accept_subscription(&mut socket).await.expect("subscribe");
            let tx = subscription_tx.lock().expect("lock").take();
            if let Some(tx) = tx {
                let _ = tx.send(subscription);
            }
            for index in 0..5 {
                let message = signal_message(&format!("sig-{index}"), 0.9);
                send_server_message(&mut socket, &message)
                    .await
                    .expect("send signal");
            }
            while socket.recv().await.is_some() {}
        }
    });
    let server = spawn_server(app).await;
    let client = client_for(server.addr);

    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .min_confidence(0.85)
        .on_event(handler)
        .connect()
        .await
        .expect("connect");

    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::StateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Open,
        }
    );
    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(next_signal(&mut events).await.id);
    }
    assert_eq!(ids, ["sig-0", "sig-1", "sig-2", "sig-3", "sig-4"]);

    let subscription = timeout(Duration::from_secs(1), subscription_rx)
        .await
        .expect("subscription in time")
        .expect("subscription sent");
    assert_eq!(subscription.min_confidence, Some(0.85));
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_handler_runs_after_close_returns() {
    let app = ws_route(|mut socket: WebSocket| async move {
        if accept_subscription(&mut socket).await.is_err() {
            return;
        }
        let mut index = 0u64;
        loop {
            let message = signal_message(&format!("tick-{index}"), 0.9);
            if send_server_message(&mut socket, &message).await.is_err() {
                return;
            }
            index += 1;
            sleep(Duration::from_millis(5)).await;
        }
    });
    let server = spawn_server(app).await;
    let client = client_for(server.addr);

    let delivered = Arc::new(AtomicUsize::new(0));
    let connection = client
        .stream()
        .on_event({
            let delivered = Arc::clone(&delivered);
            move |event| {
                if matches!(event, StreamEvent::Signal(_)) {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .connect()
        .await
        .expect("connect");

    timeout(Duration::from_secs(3), async {
        while delivered.load(Ordering::SeqCst) < 3 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("signals before close");

    connection.close();
    let at_close = delivered.load(Ordering::SeqCst);
    sleep(Duration::from_millis(150)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), at_close);

    connection.close();
    assert!(connection.is_closed());
    assert!(connection.update_subscription(StreamSubscription::all()).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconnects_and_resubscribes_after_disconnect() {
    let connections = Arc::new(AtomicUsize::new(0));
    let subscriptions = Arc::new(Mutex::new(Vec::new()));
    let app = ws_route({
        let connections = Arc::clone(&connections);
        let subscriptions = Arc::clone(&subscriptions);
        move |mut socket: WebSocket| {
            let connections = Arc::clone(&connections);
            let subscriptions = Arc::clone(&subscriptions);
            async move {
                let attempt = connections.fetch_add(1, Ordering::SeqCst);
                let Ok(subscription) = accept_subscription(&mut socket).await else {
                    return;
                };
                subscriptions.lock().expect("lock").push(subscription);
                let message = signal_message(&format!("conn-{attempt}"), 0.9);
                let _ = send_server_message(&mut socket, &message).await;
                if attempt == 0 {
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
                while socket.recv().await.is_some() {}
            }
        }
    });
    let server = spawn_server(app).await;
    let client = client_for(server.addr);

    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .token("SOL")
        .on_event(handler)
        .connect()
        .await
        .expect("connect");

    let mut seen = Vec::new();
    // open, conn-0, reconnecting, open, conn-1
    while seen.len() < 5 {
        seen.push(next_event(&mut events).await);
    }
    let signal_ids: Vec<&str> = seen
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Signal(signal) => Some(signal.id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(signal_ids, ["conn-0", "conn-1"]);
    assert!(seen.contains(&StreamEvent::StateChanged {
        from: ConnectionState::Open,
        to: ConnectionState::Reconnecting,
    }));
    assert!(seen.contains(&StreamEvent::StateChanged {
        from: ConnectionState::Reconnecting,
        to: ConnectionState::Open,
    }));

    let subscriptions = subscriptions.lock().expect("lock").clone();
    assert_eq!(subscriptions.len(), 2);
    assert!(subscriptions
        .iter()
        .all(|subscription| subscription.tokens == ["SOL"]));

    connection.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_endpoint_ends_with_one_terminal_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = client_for(addr);
    let terminal_faults = Arc::new(Mutex::new(Vec::<StreamFault>::new()));
    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .on_event(handler)
        .on_error({
            let terminal_faults = Arc::clone(&terminal_faults);
            move |fault| terminal_faults.lock().expect("lock").push(fault.clone())
        })
        .connect()
        .await
        .expect("connect returns a handle");

    let final_state = timeout(
        Duration::from_secs(5),
        connection.wait_for_state(ConnectionState::Closed),
    )
    .await
    .expect("closed in time");
    assert_eq!(final_state, ConnectionState::Closed);

    match next_event(&mut events).await {
        StreamEvent::Error(fault) => {
            assert!(fault.terminal);
            assert_eq!(fault.kind, ErrorKind::Connection);
        }
        other => panic!("expected terminal error, got {other:?}"),
    }
    assert_eq!(
        next_event(&mut events).await,
        StreamEvent::StateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Closed,
        }
    );
    sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err());

    let faults = terminal_faults.lock().expect("lock");
    assert_eq!(faults.len(), 1);
    assert!(faults[0].terminal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_attempts_failed_connects() {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/ws",
        get({
            let upgrades = Arc::clone(&upgrades);
            move || {
                let upgrades = Arc::clone(&upgrades);
                async move {
                    upgrades.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }
        }),
    );
    let server = spawn_server(app).await;
    // Reconnect policy allows three attempts.
    let client = client_for(server.addr);

    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .on_event(handler)
        .connect()
        .await
        .expect("connect returns a handle");

    let final_state = timeout(
        Duration::from_secs(5),
        connection.wait_for_state(ConnectionState::Closed),
    )
    .await
    .expect("closed in time");
    assert_eq!(final_state, ConnectionState::Closed);
    assert_eq!(upgrades.load(Ordering::SeqCst), 3);

    match next_event(&mut events).await {
        StreamEvent::Error(fault) => {
            assert!(fault.terminal);
            assert_eq!(fault.kind, ErrorKind::Connection);
        }
        other => panic!("expected terminal error, got {other:?}"),
    }
    sleep(Duration::from_millis(100)).await;
    assert_eq!(upgrades.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credential_closes_without_retrying() {
    let upgrades = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/ws",
        get({
            let upgrades = Arc::clone(&upgrades);
            move || {
                let upgrades = Arc::clone(&upgrades);
                async move {
                    upgrades.fetch_add(1, Ordering::SeqCst);
                    StatusCode::UNAUTHORIZED
                }
            }
        }),
    );
    let server = spawn_server(app).await;
    let client = CipherXClient::with_options("revoked-key", options_for(server.addr))
        .expect("client");

    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .on_event(handler)
        .connect()
        .await
        .expect("connect returns a handle");

    match next_event(&mut events).await {
        StreamEvent::Error(fault) => {
            assert!(fault.terminal);
            assert_eq!(fault.kind, ErrorKind::Auth);
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    assert_eq!(
        connection.wait_for_state(ConnectionState::Closed).await,
        ConnectionState::Closed
    );
    assert_eq!(upgrades.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undecodable_message_is_reported_and_stream_continues() {
    let app = ws_route(|mut socket: WebSocket| async move {
        if accept_subscription(&mut socket).await.is_err() {
            return;
        }
        let _ = socket
            .send(Message::Text(r#"{"type":"signal","signal":{"id":42}}"#.to_string()))
            .await;
        let _ = send_server_message(
            &mut socket,
            &ServerMessage::Error {
                code: "rate_limited".to_string(),
                message: "too many subscriptions".to_string(),
            },
        )
        .await;
        let _ = send_server_message(&mut socket, &signal_message("sig-after", 0.93)).await;
        while socket.recv().await.is_some() {}
    });
    let server = spawn_server(app).await;
    let client = client_for(server.addr);

    let (handler, mut events) = event_channel();
    let connection = client
        .stream()
        .on_event(handler)
        .connect()
        .await
        .expect("connect");

    let mut faults = Vec::new();
    let recovered = loop {
        match next_event(&mut events).await {
            StreamEvent::Error(fault) => faults.push(fault),
            StreamEvent::Signal(signal) => break signal,
            StreamEvent::StateChanged { .. } => {}
        }
    };
    assert_eq!(recovered.id, "sig-after");
    assert_eq!(faults.len(), 2);
    assert_eq!(faults[0].kind, ErrorKind::Decode);
    assert_eq!(faults[1].code.as_deref(), Some("rate_limited"));
    assert!(faults.iter().all(|fault| !fault.terminal));
    assert_eq!(connection.state(), ConnectionState::Open);

    connection.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscription_update_and_ping_reach_server() {
    let (received_tx, mut received_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let app = ws_route(move |mut socket: WebSocket| {
        let received_tx = received_tx.clone();
        async move {
            if accept_subscription(&mut socket).await.is_err() {
                return;
            }
            while let Ok(message) = recv_client_message(&mut socket).await {
                if let ClientMessage::Ping { .. } = message {
                    let _ = send_server_message(
                        &mut socket,
                        &ServerMessage::Pong {
                            server_time_ms: 1_700_000_000_500,
                        },
                    )
                    .await;
                }
                let _ = received_tx.send(message);
            }
        }
    });
    let server = spawn_server(app).await;
    let client = client_for(server.addr);

    let connection = client.open_stream().await.expect("connect");
    assert_eq!(
        timeout(
            Duration::from_secs(3),
            connection.wait_for_state(ConnectionState::Open)
        )
        .await
        .expect("open in time"),
        ConnectionState::Open
    );

    let update = StreamSubscription::all().min_confidence(0.9).token("BONK");
    connection
        .update_subscription(update.clone())
        .expect("queue subscription");
    connection.send_ping(1_700_000_000_000).expect("queue ping");

    let first = timeout(Duration::from_secs(2), received_rx.recv())
        .await
        .expect("subscription in time")
        .expect("message");
    assert_eq!(first, ClientMessage::Subscribe(update));
    let second = timeout(Duration::from_secs(2), received_rx.recv())
        .await
        .expect("ping in time")
        .expect("message");
    assert_eq!(
        second,
        ClientMessage::Ping {
            client_time_ms: 1_700_000_000_000
        }
    );

    connection.close();
}
