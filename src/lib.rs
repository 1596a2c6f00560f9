//! Realtime notification client for the LMS.
//!
//! See [`realtime::RealtimeChannel`] for the channel itself and
//! [`session::bind_channel`] for keeping it in step with login state.

pub mod logging;
pub mod api_client;
pub mod config;
pub mod realtime;
pub mod session;
pub mod storage;

pub use api_client::ApiClient;
pub use config::{RealtimeConfig, ReconnectConfig};
pub use realtime::{
    ChannelEvent, ConnectionHandle, ConnectionState, EventKind, Handler, RealtimeChannel,
    WeakRealtimeChannel,
};
pub use session::{AuthState, Session, SessionStore};
pub use storage::Storage;
