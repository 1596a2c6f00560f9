//! The realtime channel: one connection per client, bound to one user.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use lms_shared::{ChatMessage, ClientCommand, Frame, ReadReceipt};
use serde_json::Value;

use super::event::{ChannelEvent, EventKind, Handler};
use super::registry::HandlerRegistry;
use super::state::ConnectionState;
use super::transport::{
    ConnectRequest, DisconnectReason, EventSink, Socket, Transport, TransportEvent,
    WebSocketTransport,
};
use crate::config::RealtimeConfig;
use crate::session::Session;

/// Read-only view of one underlying connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    generation: u64,
    user_id: String,
    socket: Arc<dyn Socket>,
}

impl ConnectionHandle {
    /// Identifier of the live connection; `None` until it comes up.
    pub fn id(&self) -> Option<String> {
        self.socket.id()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_live(&self) -> bool {
        self.socket.is_live()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.generation == other.generation && Arc::ptr_eq(&self.socket, &other.socket)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("user_id", &self.user_id)
            .field("id", &self.id())
            .finish()
    }
}

/// Process-wide realtime channel.
///
/// Construct one at startup and hand clones to whoever needs it; clones
/// share the same connection, rooms and handlers.
///
/// No method panics or returns an error for a missing connection: misuse
/// is logged and the call does nothing. Use [`RealtimeChannel::is_connected`]
/// or the lifecycle events to observe the connection.
///
/// Handlers that need the channel should capture a [`WeakRealtimeChannel`]
/// from [`RealtimeChannel::downgrade`]. A handler holding a strong clone
/// keeps the channel and its socket alive until `disconnect`.
#[derive(Clone)]
pub struct RealtimeChannel {
    shared: Arc<Shared>,
}

/// Non-owning handle to a [`RealtimeChannel`].
#[derive(Clone)]
pub struct WeakRealtimeChannel {
    shared: Weak<Shared>,
}

impl WeakRealtimeChannel {
    /// The channel, unless every strong handle is gone.
    pub fn upgrade(&self) -> Option<RealtimeChannel> {
        self.shared.upgrade().map(|shared| RealtimeChannel { shared })
    }
}

struct Shared {
    config: RealtimeConfig,
    transport: Box<dyn Transport>,
    inner: Mutex<ChannelInner>,
}

#[derive(Default)]
struct ChannelInner {
    state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
    /// Bumped for every socket so late events from a replaced one are ignored
    generation: u64,
    user_id: Option<String>,
    rooms: BTreeSet<String>,
    handlers: HandlerRegistry,
    pending: VecDeque<Frame>,
}

impl ChannelInner {
    /// Forget everything tied to the current user. Returns the socket to
    /// close and how many handlers were dropped.
    fn reset(&mut self) -> (Option<Arc<dyn Socket>>, usize) {
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.user_id = None;
        self.rooms.clear();
        self.pending.clear();
        let handlers = self.handlers.clear();
        (self.socket.take(), handlers)
    }

    fn handle(&self) -> Option<ConnectionHandle> {
        Some(ConnectionHandle {
            generation: self.generation,
            user_id: self.user_id.clone()?,
            socket: Arc::clone(self.socket.as_ref()?),
        })
    }
}

impl RealtimeChannel {
    pub fn new(config: RealtimeConfig, transport: impl Transport) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                transport: Box::new(transport),
                inner: Mutex::new(ChannelInner::default()),
            }),
        }
    }

    /// Channel over the native WebSocket transport.
    pub fn with_websocket(config: RealtimeConfig) -> Self {
        Self::new(config, WebSocketTransport)
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.shared.config
    }

    pub fn downgrade(&self) -> WeakRealtimeChannel {
        WeakRealtimeChannel {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Connect as `user_id`.
    ///
    /// Returns the existing handle when a connection for the same user is
    /// live or still coming up. A different user replaces the current
    /// session entirely (as [`RealtimeChannel::disconnect`] would). The
    /// returned connection is not necessarily live yet.
    pub fn connect(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connect_with_token(user_id, None)
    }

    /// Connect for an authenticated session, passing its token along.
    pub fn connect_session(&self, session: &Session) -> Option<ConnectionHandle> {
        if !session.is_authenticated() {
            crate::log_error!("connect: session is not authenticated");
            return None;
        }
        self.connect_with_token(&session.user_id, session.token.as_deref())
    }

    fn connect_with_token(&self, user_id: &str, token: Option<&str>) -> Option<ConnectionHandle> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            crate::log_error!("connect: user id is required");
            return None;
        }

        let mut inner = self.shared.lock();
        let mut retired = None;

        match inner.user_id.as_deref() {
            Some(current) if current == user_id => {
                if let Some(socket) = inner.socket.as_ref() {
                    if inner.state.is_connected() && socket.is_live() {
                        crate::log_debug!("connect: already connected as {}", user_id);
                        return inner.handle();
                    }
                    if inner.state.is_connecting() {
                        crate::log_debug!("connect: connection for {} already in progress", user_id);
                        return inner.handle();
                    }
                }
                crate::log_info!(
                    "connect: replacing {:?} connection for {}",
                    inner.state,
                    user_id
                );
                retired = inner.socket.take();
            }
            Some(current) => {
                crate::log_warn!(
                    "connect: switching from {} to {}; clearing the previous session",
                    current,
                    user_id
                );
                let (socket, handlers) = inner.reset();
                crate::log_debug!("connect: dropped {} handler(s)", handlers);
                retired = socket;
            }
            None => {}
        }

        let opened = self.shared.open(&mut inner, user_id, token);
        let failure = match &opened {
            Ok(_) => None,
            Err(message) => {
                crate::log_error!("connect: could not open realtime connection: {}", message);
                inner.state = ConnectionState::Failed {
                    reason: message.clone(),
                };
                let event = ChannelEvent::ConnectError {
                    message: message.clone(),
                };
                let handlers = inner.handlers.snapshot(&event.kind());
                Some((event, handlers))
            }
        };
        drop(inner);

        if let Some(socket) = retired {
            socket.close();
        }
        if let Some((event, handlers)) = failure {
            dispatch(&event, handlers);
        }
        opened.ok()
    }

    /// Subscribe to a conversation room.
    pub fn join_conversation(&self, conversation_id: &str) {
        self.change_room("join_conversation", conversation_id, true);
    }

    /// Unsubscribe from a conversation room.
    pub fn leave_conversation(&self, conversation_id: &str) {
        self.change_room("leave_conversation", conversation_id, false);
    }

    /// Relay a chat message. At most once; nothing is acknowledged.
    pub fn send_message(&self, message: ChatMessage) {
        self.emit_command("send_message", ClientCommand::SendMessage(message));
    }

    /// Acknowledge messages as read. At most once; nothing is acknowledged.
    pub fn mark_as_read(&self, receipt: ReadReceipt) {
        self.emit_command("mark_as_read", ClientCommand::MarkRead(receipt));
    }

    /// Emit an app-level event by name.
    pub fn emit(&self, event: &str, data: Value) {
        let event = event.trim();
        if event.is_empty() || EventKind::from_name(event).is_lifecycle() {
            crate::log_error!("emit: '{}' is not a valid event name", event);
            return;
        }
        self.emit_frame("emit", Frame::new(event, data));
    }

    /// Register `handler` for `kind`. Handlers run in registration order and
    /// are never deduplicated.
    pub fn on(&self, kind: EventKind, handler: Handler) {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Disconnected {
            crate::log_error!(
                "on('{}'): realtime channel is not initialized; call connect first",
                kind
            );
            return;
        }
        crate::log_debug!("on('{}'): handler registered", kind);
        inner.handlers.add(kind, handler);
    }

    /// Remove `handler` for `kind`, or every handler for `kind` when
    /// `handler` is `None`.
    pub fn off(&self, kind: &EventKind, handler: Option<&Handler>) {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Disconnected {
            crate::log_error!(
                "off('{}'): realtime channel is not initialized; call connect first",
                kind
            );
            return;
        }
        let removed = match handler {
            Some(handler) => inner.handlers.remove(kind, handler),
            None => inner.handlers.remove_all(kind),
        };
        crate::log_debug!("off('{}'): removed {} handler(s)", kind, removed);
    }

    /// Drop every handler and room, close the connection and return to
    /// `Disconnected`. Safe to call at any time.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        if inner.state == ConnectionState::Disconnected && inner.socket.is_none() {
            crate::log_debug!("disconnect: already disconnected");
            return;
        }
        let (socket, handlers) = inner.reset();
        drop(inner);

        if let Some(socket) = socket {
            socket.close();
        }
        crate::log_info!(
            "Realtime channel disconnected; cleared {} handler(s)",
            handlers
        );
    }

    /// True only if the channel saw the connection come up and the socket
    /// still reports itself live.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.lock();
        inner.state.is_connected() && inner.socket.as_ref().is_some_and(|s| s.is_live())
    }

    pub fn status(&self) -> ConnectionState {
        self.shared.lock().state.clone()
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.shared.lock().handle()
    }

    pub fn user_id(&self) -> Option<String> {
        self.shared.lock().user_id.clone()
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.shared.lock().rooms.iter().cloned().collect()
    }

    pub fn handler_count(&self, kind: &EventKind) -> usize {
        self.shared.lock().handlers.count(kind)
    }

    pub fn registered_handlers(&self) -> usize {
        self.shared.lock().handlers.len()
    }

    fn change_room(&self, op: &str, conversation_id: &str, join: bool) {
        let conversation_id = conversation_id.trim();
        if conversation_id.is_empty() {
            crate::log_error!("{}: conversation id is required", op);
            return;
        }

        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        match &inner.state {
            ConnectionState::Disconnected => {
                crate::log_error!("{}: realtime channel is not initialized; call connect first", op);
                return;
            }
            ConnectionState::Failed { reason } => {
                crate::log_error!("{}: realtime connection failed ({})", op, reason);
                return;
            }
            _ => {}
        }

        if join {
            inner.rooms.insert(conversation_id.to_string());
        } else {
            inner.rooms.remove(conversation_id);
        }

        // Rooms are (re)joined on every connect
        if !inner.state.is_connected() {
            crate::log_debug!("{}: '{}' applies once connected", op, conversation_id);
            return;
        }
        let socket = inner.socket.clone();
        drop(guard);

        let command = if join {
            ClientCommand::JoinConversation(conversation_id.to_string())
        } else {
            ClientCommand::LeaveConversation(conversation_id.to_string())
        };
        if let (Some(socket), Some(frame)) = (socket, command_frame(command)) {
            send(socket.as_ref(), op, frame);
        }
    }

    fn emit_command(&self, op: &str, command: ClientCommand) {
        if let Some(frame) = command_frame(command) {
            self.emit_frame(op, frame);
        }
    }

    fn emit_frame(&self, op: &str, frame: Frame) {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        let socket = match &inner.state {
            ConnectionState::Disconnected => {
                crate::log_error!("{}: realtime channel is not initialized; call connect first", op);
                return;
            }
            ConnectionState::Failed { reason } => {
                crate::log_error!(
                    "{}: realtime connection failed ({}); dropping '{}'",
                    op,
                    reason,
                    frame.event
                );
                return;
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting { .. } => {
                if inner.pending.len() >= self.shared.config.max_buffered_emits {
                    crate::log_warn!("{}: emit buffer full; dropping '{}'", op, frame.event);
                } else {
                    crate::log_debug!("{}: buffering '{}' until connected", op, frame.event);
                    inner.pending.push_back(frame);
                }
                return;
            }
            ConnectionState::Connected => inner.socket.clone(),
        };
        drop(guard);

        if let Some(socket) = socket {
            send(socket.as_ref(), op, frame);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(socket) = inner.socket.take() {
            crate::log_debug!("Realtime channel dropped; closing its socket");
            socket.close();
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a fresh socket for `user_id`. Keeps handlers and rooms.
    fn open(
        self: &Arc<Self>,
        inner: &mut ChannelInner,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<ConnectionHandle, String> {
        inner.generation += 1;
        inner.user_id = Some(user_id.to_string());

        let url = self
            .config
            .socket_url(token)
            .map_err(|e| format!("invalid socket url '{}': {}", self.config.endpoint, e))?;
        crate::log_info!("Connecting to {} as {}", self.config.endpoint, user_id);

        let request = ConnectRequest {
            url,
            reconnect: self.config.reconnect.clone(),
            connect_timeout: self.config.connect_timeout,
        };
        let generation = inner.generation;
        let weak: Weak<Shared> = Arc::downgrade(self);
        let sink: EventSink = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_transport_event(generation, event);
            }
        });

        let socket = self
            .transport
            .open(request, sink)
            .map_err(|e| e.to_string())?;
        inner.socket = Some(Arc::clone(&socket));
        inner.state = ConnectionState::Connecting;

        Ok(ConnectionHandle {
            generation,
            user_id: user_id.to_string(),
            socket,
        })
    }

    fn on_transport_event(&self, generation: u64, event: TransportEvent) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let socket = match inner.socket.as_ref() {
            Some(socket) if inner.generation == generation => Arc::clone(socket),
            _ => {
                crate::log_debug!("Ignoring {:?} from a replaced connection", event);
                return;
            }
        };

        let mut outgoing = Vec::new();
        let mut reconnect = false;

        let event = match event {
            TransportEvent::Connected { connection_id } => {
                crate::log_info!("Realtime channel connected ({})", connection_id);
                inner.state = ConnectionState::Connected;
                if let Some(user_id) = inner.user_id.clone() {
                    outgoing.extend(command_frame(ClientCommand::Join(user_id)));
                }
                for room in &inner.rooms {
                    outgoing.extend(command_frame(ClientCommand::JoinConversation(room.clone())));
                }
                outgoing.extend(inner.pending.drain(..));
                ChannelEvent::Connected { connection_id }
            }
            TransportEvent::Disconnected { reason } => {
                match &reason {
                    DisconnectReason::ServerInitiated => {
                        crate::log_warn!("Server closed the realtime connection; reconnecting");
                        inner.state = ConnectionState::Connecting;
                        reconnect = true;
                    }
                    DisconnectReason::TransportClose | DisconnectReason::TransportError(_) => {
                        crate::log_warn!("Realtime connection lost ({}); reconnecting", reason);
                        inner.state = ConnectionState::Reconnecting { attempt: 0 };
                    }
                    DisconnectReason::ClientInitiated => {
                        crate::log_warn!("Realtime socket closed underneath the channel");
                        inner.state = ConnectionState::Failed {
                            reason: reason.to_string(),
                        };
                    }
                }
                ChannelEvent::Disconnected { reason }
            }
            TransportEvent::ConnectError { message } => {
                crate::log_error!("Realtime connect error: {}", message);
                ChannelEvent::ConnectError { message }
            }
            TransportEvent::ReconnectAttempt { attempt } => {
                crate::log_info!(
                    "Realtime reconnect attempt {}/{}",
                    attempt,
                    self.config.reconnect.max_attempts
                );
                inner.state = ConnectionState::Reconnecting { attempt };
                ChannelEvent::ReconnectAttempt { attempt }
            }
            TransportEvent::ReconnectError { attempt, message } => {
                crate::log_warn!("Realtime reconnect attempt {} failed: {}", attempt, message);
                ChannelEvent::ReconnectError { attempt, message }
            }
            TransportEvent::Reconnected { attempts } => {
                crate::log_info!("Realtime channel reconnected after {} attempt(s)", attempts);
                ChannelEvent::Reconnected { attempts }
            }
            TransportEvent::ReconnectFailed { attempts } => {
                let reason = format!("gave up after {} reconnect attempt(s)", attempts);
                crate::log_error!("Realtime channel {}", reason);
                inner.state = ConnectionState::Failed { reason };
                inner.pending.clear();
                ChannelEvent::ReconnectFailed { attempts }
            }
            TransportEvent::Frame(frame) => {
                if EventKind::from_name(&frame.event).is_lifecycle() {
                    crate::log_warn!("Ignoring server event with reserved name '{}'", frame.event);
                    return;
                }
                match ChannelEvent::from_frame(frame) {
                    Ok(event) => event,
                    Err(e) => {
                        crate::log_error!("Dropping server event: {}", e);
                        return;
                    }
                }
            }
        };

        let handlers = inner.handlers.snapshot(&event.kind());
        drop(guard);

        for frame in outgoing {
            send(socket.as_ref(), "connect", frame);
        }
        if reconnect {
            socket.reconnect();
        }
        dispatch(&event, handlers);
    }
}

fn command_frame(command: ClientCommand) -> Option<Frame> {
    let name = command.event_name();
    match command.into_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            crate::log_error!("Failed to encode '{}': {}", name, e);
            None
        }
    }
}

fn send(socket: &dyn Socket, op: &str, frame: Frame) {
    let event = frame.event.clone();
    if let Err(e) = socket.send(frame) {
        crate::log_warn!("{}: '{}' not sent: {}", op, event, e);
    }
}

/// Run handlers outside any lock; a panicking handler does not stop the rest.
fn dispatch(event: &ChannelEvent, handlers: Vec<Handler>) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler.call(event))).is_err() {
            crate::log_error!("Handler for '{}' panicked", event.kind());
        }
    }
}
