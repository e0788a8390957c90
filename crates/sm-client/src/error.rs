//! Client error types

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by [`crate::ReconnectingClient`]
#[derive(Error, Debug)]
pub enum ClientError {
    /// No connection was established within the connect timeout
    #[error("Timed out after {0:?} waiting for a connection")]
    ConnectionTimeout(Duration),

    /// The server did not answer within the request timeout
    #[error("Request {method} timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },

    /// The connection dropped while the request was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// The client was closed
    #[error("Client closed")]
    ClientClosed,

    /// The server answered with an error
    #[error("{0}")]
    Remote(String),

    /// The server's reply could not be understood
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(e.to_string())
    }
}
