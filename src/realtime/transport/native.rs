//! Native WebSocket transport using tokio-tungstenite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use lms_shared::Frame;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{
    ConnectRequest, DisconnectReason, EventSink, Socket, Transport, TransportError,
    TransportEvent,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connection that stays up this long resets the reconnect budget.
const STABLE_AFTER: Duration = Duration::from_secs(30);

/// Opens one tokio task per socket; requires a running tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl Transport for WebSocketTransport {
    fn open(
        &self,
        request: ConnectRequest,
        sink: EventSink,
    ) -> Result<Arc<dyn Socket>, TransportError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        let (sender, receiver) = unbounded();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared::default());

        runtime.spawn(connection_loop(
            request,
            Arc::clone(&shared),
            receiver,
            control_rx,
            sink,
        ));

        Ok(Arc::new(WebSocketSocket {
            shared,
            sender,
            control: control_tx,
        }))
    }
}

enum Control {
    Reconnect,
    Close,
}

#[derive(Default)]
struct SocketShared {
    id: Mutex<Option<String>>,
    live: AtomicBool,
    closed: AtomicBool,
}

impl SocketShared {
    fn set_live(&self, id: Option<String>) {
        self.live.store(id.is_some(), Ordering::SeqCst);
        *self.id.lock().unwrap_or_else(|e| e.into_inner()) = id;
    }
}

struct WebSocketSocket {
    shared: Arc<SocketShared>,
    sender: UnboundedSender<Frame>,
    control: mpsc::UnboundedSender<Control>,
}

impl Socket for WebSocketSocket {
    fn id(&self) -> Option<String> {
        self.shared
            .id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.is_live() {
            return Err(TransportError::NotConnected);
        }
        self.sender
            .unbounded_send(frame)
            .map_err(|_| TransportError::Closed)
    }

    fn reconnect(&self) {
        let _ = self.control.send(Control::Reconnect);
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            let _ = self.control.send(Control::Close);
        }
    }
}

/// Connect, pump frames until the connection drops, and reconnect with
/// backoff until the attempt budget runs out or the socket is closed.
async fn connection_loop(
    request: ConnectRequest,
    shared: Arc<SocketShared>,
    mut outgoing: UnboundedReceiver<Frame>,
    mut control: mpsc::UnboundedReceiver<Control>,
    sink: EventSink,
) {
    let url = request.url.to_string();
    let mut attempt = 0u32;
    // Connections in a row that dropped before becoming stable
    let mut unstable = 0u32;

    loop {
        if attempt > 0 {
            sink(TransportEvent::ReconnectAttempt { attempt });
        }

        let connecting = tokio::time::timeout(request.connect_timeout, connect_async(url.as_str()));
        let result = tokio::select! {
            result = connecting => result,
            _ = wait_for_close(&mut control) => {
                crate::log_debug!("Socket to {} closed while connecting", url);
                return;
            }
        };

        let message = match result {
            Ok(Ok((stream, _response))) => {
                let mut stale = 0usize;
                while let Ok(Some(_)) = outgoing.try_next() {
                    stale += 1;
                }
                if stale > 0 {
                    crate::log_debug!("Dropped {} frames queued for a previous connection", stale);
                }

                let connection_id = uuid::Uuid::new_v4().to_string();
                shared.set_live(Some(connection_id.clone()));
                crate::log_info!("WebSocket connected to {} ({})", url, connection_id);
                sink(TransportEvent::Connected { connection_id });
                if attempt > 0 {
                    sink(TransportEvent::Reconnected { attempts: attempt });
                }
                attempt = 0;

                let opened_at = Instant::now();
                let reason = pump(stream, &mut outgoing, &mut control, &sink).await;
                shared.set_live(None);
                crate::log_info!("WebSocket to {} closed: {}", url, reason);
                sink(TransportEvent::Disconnected {
                    reason: reason.clone(),
                });

                if reason == DisconnectReason::ClientInitiated {
                    return;
                }
                if opened_at.elapsed() >= STABLE_AFTER {
                    unstable = 0;
                }
                if !request.reconnect.allows_attempt(unstable) {
                    crate::log_error!(
                        "WebSocket to {} keeps dropping; giving up after {} reconnects",
                        url,
                        unstable
                    );
                    shared.closed.store(true, Ordering::SeqCst);
                    sink(TransportEvent::ReconnectFailed { attempts: unstable });
                    return;
                }

                // Only an explicit reconnect follows a server close
                if reason == DisconnectReason::ServerInitiated
                    && !wait_for_reconnect(&mut control).await
                {
                    return;
                }
                let delay = request.reconnect.delay_for_attempt(unstable);
                if !sleep_unless_closed(delay, &mut control).await {
                    return;
                }
                unstable += 1;
                if reason != DisconnectReason::ServerInitiated {
                    attempt = 1;
                }
                continue;
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timed out after {}ms",
                request.connect_timeout.as_millis()
            ),
        };

        crate::log_error!("WebSocket error for {}: {}", url, message);
        sink(TransportEvent::ConnectError {
            message: message.clone(),
        });
        if attempt > 0 {
            sink(TransportEvent::ReconnectError { attempt, message });
        }

        // Check if we should retry
        if !request.reconnect.allows_attempt(attempt) {
            shared.closed.store(true, Ordering::SeqCst);
            sink(TransportEvent::ReconnectFailed { attempts: attempt });
            return;
        }

        let delay = request.reconnect.delay_for_attempt(attempt);
        crate::log_info!(
            "Reconnecting to {} in {}ms (attempt {})",
            url,
            delay,
            attempt + 1
        );
        if !sleep_unless_closed(delay, &mut control).await {
            return;
        }
        attempt += 1;
    }
}

/// Drive one live connection until it ends, returning why it ended.
async fn pump(
    stream: WsStream,
    outgoing: &mut UnboundedReceiver<Frame>,
    control: &mut mpsc::UnboundedReceiver<Control>,
    sink: &EventSink,
) -> DisconnectReason {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                    Ok(envelope) => sink(TransportEvent::Frame(envelope.payload)),
                    Err(e) => crate::log_error!("Failed to parse message: {}", e),
                },
                Some(Ok(Message::Close(_))) => return DisconnectReason::ServerInitiated,
                // Pong is handled automatically by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => return DisconnectReason::TransportError(e.to_string()),
                None => return DisconnectReason::TransportClose,
            },
            frame = outgoing.next() => match frame {
                Some(frame) => match frame.encode() {
                    Ok(json) => {
                        crate::log_debug!("Sending {}", frame.event);
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            return DisconnectReason::TransportError(e.to_string());
                        }
                    }
                    Err(e) => crate::log_error!("Serialize failed: {}", e),
                },
                None => {
                    let _ = write.send(Message::Close(None)).await;
                    return DisconnectReason::ClientInitiated;
                }
            },
            command = control.recv() => match command {
                Some(Control::Reconnect) => {}
                Some(Control::Close) | None => {
                    let _ = write.send(Message::Close(None)).await;
                    return DisconnectReason::ClientInitiated;
                }
            },
        }
    }
}

/// Resolves once the socket is closed (or every handle dropped).
async fn wait_for_close(control: &mut mpsc::UnboundedReceiver<Control>) {
    while let Some(Control::Reconnect) = control.recv().await {}
}

/// Returns false if the socket was closed instead.
async fn wait_for_reconnect(control: &mut mpsc::UnboundedReceiver<Control>) -> bool {
    matches!(control.recv().await, Some(Control::Reconnect))
}

/// Returns false if the socket was closed while waiting.
async fn sleep_unless_closed(delay_ms: u32, control: &mut mpsc::UnboundedReceiver<Control>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(delay_ms as u64)) => true,
        _ = wait_for_close(control) => false,
    }
}
