//! JSON-lines RPC transport and event fan-out

pub mod dispatch;
pub mod router;
mod server;

pub use dispatch::{dispatch, handle_line, DispatchError};
pub use router::{spawn_router, ConnectionId, RouterClosed, RouterHandle, SubscriptionState};
pub use server::{RpcServer, MAX_LINE_LENGTH};
