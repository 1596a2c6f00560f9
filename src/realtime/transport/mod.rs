//! Transport seam between the channel and the actual socket.
//!
//! A [`Transport`] opens [`Socket`]s. A socket connects in the background,
//! reconnects on its own after transport drops, and reports everything that
//! happens to it through the [`EventSink`] it was opened with.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lms_shared::Frame;
use url::Url;

use crate::config::ReconnectConfig;

mod native;

pub use native::WebSocketTransport;

/// Why a live connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The backend closed the connection; no automatic reconnect follows
    ServerInitiated,
    /// `Socket::close` was called
    ClientInitiated,
    /// The stream ended without a close frame
    TransportClose,
    TransportError(String),
}

impl DisconnectReason {
    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::ServerInitiated => "io server disconnect",
            DisconnectReason::ClientInitiated => "io client disconnect",
            DisconnectReason::TransportClose => "transport close",
            DisconnectReason::TransportError(_) => "transport error",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::TransportError(message) => {
                write!(f, "{}: {}", self.as_str(), message)
            }
            _ => f.write_str(self.as_str()),
        }
    }
}

/// What a socket reports to its owner, in the order it happens.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected { connection_id: String },
    Disconnected { reason: DisconnectReason },
    ConnectError { message: String },
    ReconnectAttempt { attempt: u32 },
    ReconnectError { attempt: u32, message: String },
    /// Sent right after `Connected` when a reconnect succeeds
    Reconnected { attempts: u32 },
    /// Automatic reconnection gave up; the socket is dead
    ReconnectFailed { attempts: u32 },
    Frame(Frame),
}

pub type EventSink = Arc<dyn Fn(TransportEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub reconnect: ReconnectConfig,
    pub connect_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is closed")]
    Closed,
    #[error("no async runtime available to drive the socket")]
    NoRuntime,
    #[error(transparent)]
    Protocol(#[from] lms_shared::ProtocolError),
}

pub trait Transport: Send + Sync + 'static {
    /// Start connecting. Must return without invoking `sink`; every event
    /// is delivered later from the socket's own task.
    fn open(&self, request: ConnectRequest, sink: EventSink)
        -> Result<Arc<dyn Socket>, TransportError>;
}

pub trait Socket: Send + Sync {
    /// Identifier of the current live connection, if any.
    fn id(&self) -> Option<String>;

    fn is_live(&self) -> bool;

    /// Queue a frame for the live connection. Fire-and-forget.
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Reconnect after a server-initiated disconnect.
    fn reconnect(&self);

    /// Close for good. At most a final `Disconnected { ClientInitiated }`
    /// is reported after this.
    fn close(&self);
}
