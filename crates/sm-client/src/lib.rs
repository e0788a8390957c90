//! shellmux client
//!
//! [`ReconnectingClient`] talks to a running `sm-server` over its JSON-lines
//! RPC interface, reconnecting with exponential backoff whenever the
//! connection drops.

pub mod backoff;
pub mod client;
pub mod error;
pub mod state;

pub use backoff::ExponentialBackoff;
pub use client::ReconnectingClient;
pub use error::ClientError;
pub use state::ConnectionState;

pub use sm_core::config::{BackoffConfig, ClientConfig};
pub use sm_core::events::SessionEvent;
