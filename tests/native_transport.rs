//! Runs the WebSocket transport against an in-process axum server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use lms_realtime::{
    ChannelEvent, ConnectionState, EventKind, Handler, RealtimeChannel, RealtimeConfig,
    ReconnectConfig,
};
use lms_shared::Frame;
use serde_json::json;

#[derive(Clone, Default)]
struct Backend {
    received: Arc<Mutex<Vec<Frame>>>,
    connections: Arc<AtomicUsize>,
}

impl Backend {
    fn events(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|f| f.event.clone())
            .collect()
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(backend): State<Backend>) -> Response {
    ws.on_upgrade(move |socket| session(socket, backend))
}

async fn session(mut socket: WebSocket, backend: Backend) {
    let connection = backend.connections.fetch_add(1, Ordering::SeqCst);

    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(envelope) = Frame::decode(text.as_str()) else {
            continue;
        };
        let frame = envelope.payload;
        backend.received.lock().unwrap().push(frame.clone());

        match frame.event.as_str() {
            "join" => {
                let reply = Frame::new(
                    "new_notification",
                    json!({
                        "id": "n1",
                        "title": "Welcome",
                        "message": format!("Hello {}", frame.data.as_str().unwrap_or_default()),
                        "type": "announcement",
                        "createdAt": "2026-03-01T09:00:00Z"
                    }),
                );
                let text = reply.encode().unwrap();
                if socket.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            // First connection only: kick the client after it joins a room
            "join_conversation" if connection == 0 => {
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
            _ => {}
        }
    }
}

async fn upgrade_and_close(ws: WebSocketUpgrade, State(backend): State<Backend>) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        backend.connections.fetch_add(1, Ordering::SeqCst);
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn start(backend: Backend) -> String {
    serve(Router::new().route("/ws", get(upgrade)).with_state(backend)).await
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn wait_until(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn fast_reconnect(max_attempts: u32) -> ReconnectConfig {
    ReconnectConfig {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 20,
        ..ReconnectConfig::default()
    }
}

#[tokio::test]
async fn join_is_first_and_notifications_arrive() {
    let backend = Backend::default();
    let endpoint = start(backend.clone()).await;
    let channel = RealtimeChannel::with_websocket(RealtimeConfig::default().with_endpoint(endpoint));

    channel.connect("user-1").unwrap();
    let notes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&notes);
    channel.on(
        EventKind::NewNotification,
        Handler::new(move |event| {
            if let ChannelEvent::Notification(n) = event {
                sink.lock().unwrap().push(n.message.clone());
            }
        }),
    );

    wait_until(|| !notes.lock().unwrap().is_empty()).await;
    assert!(channel.is_connected());
    assert_eq!(notes.lock().unwrap()[0], "Hello user-1");

    let received = backend.received.lock().unwrap().clone();
    assert_eq!(received[0], Frame::new("join", json!("user-1")));

    channel.disconnect();
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn server_close_reconnects_and_rejoins_rooms() {
    let backend = Backend::default();
    let endpoint = start(backend.clone()).await;
    let config = RealtimeConfig::default()
        .with_endpoint(endpoint)
        .with_reconnect(fast_reconnect(3));
    let channel = RealtimeChannel::with_websocket(config);

    channel.connect("user-1").unwrap();
    wait_until(|| channel.is_connected()).await;
    channel.join_conversation("conv-7");

    wait_until(|| backend.connections.load(Ordering::SeqCst) == 2).await;
    wait_until(|| backend.events().len() >= 4).await;
    assert_eq!(
        backend.events(),
        vec!["join", "join_conversation", "join", "join_conversation"]
    );
    assert!(channel.is_connected());
    assert_eq!(channel.joined_rooms(), vec!["conv-7".to_string()]);

    channel.disconnect();
}

#[tokio::test]
async fn unreachable_server_fails_after_bounded_attempts() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let config = RealtimeConfig::default()
        .with_endpoint(endpoint)
        .with_reconnect(fast_reconnect(2));
    let channel = RealtimeChannel::with_websocket(config);

    channel.connect("user-1").unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&attempts);
    channel.on(
        EventKind::ReconnectAttempt,
        Handler::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    let seen = Arc::clone(&failed);
    channel.on(
        EventKind::ReconnectFailed,
        Handler::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    wait_until(|| failed.load(Ordering::SeqCst) == 1).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(matches!(channel.status(), ConnectionState::Failed { .. }));
    assert!(!channel.is_connected());
}

#[tokio::test]
async fn server_that_always_closes_ends_in_failure() {
    let backend = Backend::default();
    let endpoint = serve(
        Router::new()
            .route("/ws", get(upgrade_and_close))
            .with_state(backend.clone()),
    )
    .await;
    let config = RealtimeConfig::default()
        .with_endpoint(endpoint)
        .with_reconnect(fast_reconnect(2));
    let channel = RealtimeChannel::with_websocket(config);

    channel.connect("user-1").unwrap();
    let failed = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failed);
    channel.on(
        EventKind::ReconnectFailed,
        Handler::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    wait_until(|| matches!(channel.status(), ConnectionState::Failed { .. })).await;
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    assert!(!channel.is_connected());

    // The first connection plus one per allowed reconnect, then nothing more
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.connections.load(Ordering::SeqCst), 3);
    assert!(matches!(channel.status(), ConnectionState::Failed { .. }));
}
