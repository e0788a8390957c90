//! Client connection state

use std::fmt;
use std::time::Duration;

/// Where the client is in its connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport; a connect attempt is about to start
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before retry number `attempt`
    Reconnecting { attempt: u32, delay: Duration },
    /// Closed by the caller; terminal
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {} in {:?})", attempt, delay)
            }
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}
