//! sm-core: Shared protocol and configuration for shellmux
//!
//! This crate provides the RPC wire types, session event definitions,
//! error taxonomy and configuration structures used by the server and
//! the reconnecting client.

pub mod config;
pub mod error;
pub mod events;
pub mod rpc;
pub mod time;

pub use error::{ConfigError, ProtocolError, SessionError};
pub use events::SessionEvent;
