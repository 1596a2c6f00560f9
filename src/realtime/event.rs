//! Typed events dispatched by the realtime channel.

use std::fmt;
use std::sync::Arc;

use lms_shared::{
    event_names, Announcement, ChatMessage, Frame, Notification, ReadReceipt, ServerEvent,
};
use serde_json::Value;

use super::transport::DisconnectReason;

/// Key under which handlers are registered.
///
/// Lifecycle kinds are produced by the channel itself; the rest come from
/// the server. `Custom` covers app events without a typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    ConnectError,
    Reconnect,
    ReconnectAttempt,
    ReconnectError,
    ReconnectFailed,
    NewNotification,
    Announcement,
    NewMessage,
    MessagesRead,
    ServerError,
    Custom(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            event_names::CONNECT => EventKind::Connect,
            event_names::DISCONNECT => EventKind::Disconnect,
            event_names::CONNECT_ERROR => EventKind::ConnectError,
            event_names::RECONNECT => EventKind::Reconnect,
            event_names::RECONNECT_ATTEMPT => EventKind::ReconnectAttempt,
            event_names::RECONNECT_ERROR => EventKind::ReconnectError,
            event_names::RECONNECT_FAILED => EventKind::ReconnectFailed,
            event_names::NEW_NOTIFICATION => EventKind::NewNotification,
            event_names::ANNOUNCEMENT => EventKind::Announcement,
            event_names::NEW_MESSAGE => EventKind::NewMessage,
            event_names::MESSAGES_READ => EventKind::MessagesRead,
            event_names::ERROR => EventKind::ServerError,
            other => EventKind::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Connect => event_names::CONNECT,
            EventKind::Disconnect => event_names::DISCONNECT,
            EventKind::ConnectError => event_names::CONNECT_ERROR,
            EventKind::Reconnect => event_names::RECONNECT,
            EventKind::ReconnectAttempt => event_names::RECONNECT_ATTEMPT,
            EventKind::ReconnectError => event_names::RECONNECT_ERROR,
            EventKind::ReconnectFailed => event_names::RECONNECT_FAILED,
            EventKind::NewNotification => event_names::NEW_NOTIFICATION,
            EventKind::Announcement => event_names::ANNOUNCEMENT,
            EventKind::NewMessage => event_names::NEW_MESSAGE,
            EventKind::MessagesRead => event_names::MESSAGES_READ,
            EventKind::ServerError => event_names::ERROR,
            EventKind::Custom(name) => name,
        }
    }

    /// Connection lifecycle kinds; the server may not emit these by name.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::Connect
                | EventKind::Disconnect
                | EventKind::ConnectError
                | EventKind::Reconnect
                | EventKind::ReconnectAttempt
                | EventKind::ReconnectError
                | EventKind::ReconnectFailed
        )
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        EventKind::from_name(name)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected { connection_id: String },
    Disconnected { reason: DisconnectReason },
    ConnectError { message: String },
    Reconnected { attempts: u32 },
    ReconnectAttempt { attempt: u32 },
    ReconnectError { attempt: u32, message: String },
    ReconnectFailed { attempts: u32 },
    Notification(Notification),
    Announcement(Announcement),
    Message(ChatMessage),
    MessagesRead(ReadReceipt),
    ServerError { code: String, message: String },
    Custom { event: String, data: Value },
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Connected { .. } => EventKind::Connect,
            ChannelEvent::Disconnected { .. } => EventKind::Disconnect,
            ChannelEvent::ConnectError { .. } => EventKind::ConnectError,
            ChannelEvent::Reconnected { .. } => EventKind::Reconnect,
            ChannelEvent::ReconnectAttempt { .. } => EventKind::ReconnectAttempt,
            ChannelEvent::ReconnectError { .. } => EventKind::ReconnectError,
            ChannelEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            ChannelEvent::Notification(_) => EventKind::NewNotification,
            ChannelEvent::Announcement(_) => EventKind::Announcement,
            ChannelEvent::Message(_) => EventKind::NewMessage,
            ChannelEvent::MessagesRead(_) => EventKind::MessagesRead,
            ChannelEvent::ServerError { .. } => EventKind::ServerError,
            ChannelEvent::Custom { event, .. } => EventKind::Custom(event.clone()),
        }
    }

    /// Turn a server frame into an event. Frames with a known name but an
    /// unreadable payload are rejected.
    pub fn from_frame(frame: Frame) -> Result<Self, lms_shared::ProtocolError> {
        match ServerEvent::from_frame(&frame) {
            Some(typed) => Ok(typed?.into()),
            None => Ok(ChannelEvent::Custom {
                event: frame.event,
                data: frame.data,
            }),
        }
    }
}

impl From<ServerEvent> for ChannelEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::NewNotification(n) => ChannelEvent::Notification(n),
            ServerEvent::Announcement(a) => ChannelEvent::Announcement(a),
            ServerEvent::NewMessage(m) => ChannelEvent::Message(m),
            ServerEvent::MessagesRead(r) => ChannelEvent::MessagesRead(r),
            ServerEvent::Error { code, message } => ChannelEvent::ServerError { code, message },
        }
    }
}

/// A registered callback. Clones share identity, so a clone can be passed
/// to `off` to remove the original registration.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(&ChannelEvent) + Send + Sync>);

impl Handler {
    pub fn new(f: impl Fn(&ChannelEvent) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn call(&self, event: &ChannelEvent) {
        (self.0)(event)
    }

    pub fn same_as(&self, other: &Handler) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_through_kinds() {
        for name in [
            "connect",
            "disconnect",
            "connect_error",
            "reconnect",
            "reconnect_attempt",
            "reconnect_error",
            "reconnect_failed",
            "new_notification",
            "announcement",
            "new_message",
            "messages_read",
            "error",
            "grade_posted",
        ] {
            assert_eq!(EventKind::from_name(name).as_str(), name);
        }
        assert_eq!(EventKind::from("ping"), EventKind::Custom("ping".into()));
    }

    #[test]
    fn lifecycle_kinds() {
        assert!(EventKind::Connect.is_lifecycle());
        assert!(EventKind::ReconnectFailed.is_lifecycle());
        assert!(!EventKind::Announcement.is_lifecycle());
        assert!(!EventKind::Custom("connect_soon".into()).is_lifecycle());
    }

    #[test]
    fn frames_become_typed_or_custom_events() {
        let event = ChannelEvent::from_frame(Frame::new(
            "new_message",
            json!({"conversationId": "c1", "senderId": "u2", "content": "hi"}),
        ))
        .unwrap();
        assert_eq!(event.kind(), EventKind::NewMessage);
        assert!(matches!(event, ChannelEvent::Message(ref m) if m.content == "hi"));

        let event = ChannelEvent::from_frame(Frame::new("ping", json!(1))).unwrap();
        assert_eq!(
            event,
            ChannelEvent::Custom {
                event: "ping".into(),
                data: json!(1)
            }
        );
        assert_eq!(event.kind(), EventKind::Custom("ping".into()));

        assert!(ChannelEvent::from_frame(Frame::new("new_message", json!("oops"))).is_err());
    }

    #[test]
    fn handler_identity_follows_clones() {
        let h1 = Handler::new(|_| {});
        let h2 = Handler::new(|_| {});
        assert!(h1.same_as(&h1.clone()));
        assert!(!h1.same_as(&h2));
    }
}
