//! Shared types for the LMS realtime client and anything that speaks its
//! socket protocol.

pub mod models;
pub mod protocol;
pub mod error;

pub use models::*;
pub use protocol::*;
pub use error::*;
