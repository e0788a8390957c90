//! sm-server: PTY session multiplexer
//!
//! Runs interactive shells in pseudo-terminals and exposes them over a
//! newline-delimited JSON RPC interface. Many connections can drive and
//! observe the same sessions; output and lifecycle events are pushed to the
//! connections subscribed to them.

pub mod health;
pub mod rpc;
pub mod session;
pub mod state;

pub use rpc::RpcServer;
pub use session::{SessionManager, SessionOptions};
pub use state::ServerState;
