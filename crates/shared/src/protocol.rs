//! LMS realtime socket protocol.
//!
//! Every frame on the socket is a JSON text message of the form
//!
//! ```text
//! { "id": "<uuid>", "event": "<name>", "data": <payload>, "ts": "<rfc3339>" }
//! ```
//!
//! Outgoing commands form a closed set ([`ClientCommand`]); incoming app
//! events the client knows how to type are listed in [`ServerEvent`]. Any
//! other event name travels as a plain [`Frame`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::models::{Announcement, ChatMessage, Notification, ReadReceipt};

/// Wire names of the events exchanged with the realtime backend.
pub mod event_names {
    pub const JOIN: &str = "join";
    pub const JOIN_CONVERSATION: &str = "join_conversation";
    pub const LEAVE_CONVERSATION: &str = "leave_conversation";
    pub const SEND_MESSAGE: &str = "send_message";
    pub const MARK_READ: &str = "mark_read";

    pub const CONNECT: &str = "connect";
    pub const DISCONNECT: &str = "disconnect";
    pub const CONNECT_ERROR: &str = "connect_error";
    pub const RECONNECT: &str = "reconnect";
    pub const RECONNECT_ATTEMPT: &str = "reconnect_attempt";
    pub const RECONNECT_ERROR: &str = "reconnect_error";
    pub const RECONNECT_FAILED: &str = "reconnect_failed";

    pub const NEW_NOTIFICATION: &str = "new_notification";
    pub const ANNOUNCEMENT: &str = "announcement";
    pub const NEW_MESSAGE: &str = "new_message";
    pub const MESSAGES_READ: &str = "messages_read";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsEnvelope<T> {
    pub id: String,
    #[serde(flatten)]
    pub payload: T,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl<T> WsEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            ts: Utc::now(),
            correlation_id: None,
        }
    }
}

/// An untyped event: a name plus an arbitrary JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Wrap the frame in a fresh envelope and serialize it for the socket.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&WsEnvelope::new(self))?)
    }

    /// Parse a text message received from the socket.
    pub fn decode(text: &str) -> Result<WsEnvelope<Frame>, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Commands the client sends to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    /// Associate the connection with the user's private notification room
    #[serde(rename = "join")]
    Join(String),
    #[serde(rename = "join_conversation")]
    JoinConversation(String),
    #[serde(rename = "leave_conversation")]
    LeaveConversation(String),
    #[serde(rename = "send_message")]
    SendMessage(ChatMessage),
    #[serde(rename = "mark_read")]
    MarkRead(ReadReceipt),
}

impl ClientCommand {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientCommand::Join(_) => event_names::JOIN,
            ClientCommand::JoinConversation(_) => event_names::JOIN_CONVERSATION,
            ClientCommand::LeaveConversation(_) => event_names::LEAVE_CONVERSATION,
            ClientCommand::SendMessage(_) => event_names::SEND_MESSAGE,
            ClientCommand::MarkRead(_) => event_names::MARK_READ,
        }
    }

    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let value = serde_json::to_value(&self)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// App-level events pushed by the backend that have a known payload shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "new_notification")]
    NewNotification(Notification),
    #[serde(rename = "announcement")]
    Announcement(Announcement),
    #[serde(rename = "new_message")]
    NewMessage(ChatMessage),
    #[serde(rename = "messages_read")]
    MessagesRead(ReadReceipt),
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn is_known(event: &str) -> bool {
        matches!(
            event,
            event_names::NEW_NOTIFICATION
                | event_names::ANNOUNCEMENT
                | event_names::NEW_MESSAGE
                | event_names::MESSAGES_READ
                | event_names::ERROR
        )
    }

    /// Type a frame. Returns `None` when the event name is not one of ours.
    pub fn from_frame(frame: &Frame) -> Option<Result<Self, ProtocolError>> {
        if !Self::is_known(&frame.event) {
            return None;
        }
        let typed = serde_json::to_value(frame)
            .and_then(serde_json::from_value)
            .map_err(|source| ProtocolError::InvalidPayload {
                event: frame.event.clone(),
                source,
            });
        Some(typed)
    }
}
