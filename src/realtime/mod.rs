//! Realtime notification channel.
//!
//! One [`RealtimeChannel`] per process carries notifications, announcements
//! and chat traffic for the logged-in user. It owns the socket, the rooms
//! the user joined and the handlers the UI registered:
//!
//! - `connect` binds the channel to a user and announces them with `join`
//!   once the socket is up
//! - rooms are remembered and re-joined after every reconnect
//! - `disconnect` (logout) drops the socket, the rooms and every handler
//!
//! The socket itself sits behind the [`transport::Transport`] seam; the
//! native implementation is [`WebSocketTransport`].

mod channel;
pub mod event;
pub mod registry;
pub mod state;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use channel::{ConnectionHandle, RealtimeChannel, WeakRealtimeChannel};
pub use event::{ChannelEvent, EventKind, Handler};
pub use state::ConnectionState;
pub use transport::{DisconnectReason, WebSocketTransport};
