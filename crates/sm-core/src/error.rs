//! Core error types for shellmux

use std::path::PathBuf;
use thiserror::Error;

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// A session with this id is already registered
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session process has exited
    #[error("Session is not alive: {0}")]
    NotAlive(String),

    /// PTY allocation or shell spawn failed
    #[error("Failed to spawn session: {0}")]
    Spawn(String),

    /// Writing to or signalling the PTY failed
    #[error("PTY I/O failed: {0}")]
    Io(String),

    /// Search pattern did not compile
    #[error("Invalid search pattern: {0}")]
    InvalidPattern(String),

    /// Signal name not recognised
    #[error("Unknown signal: {0}")]
    InvalidSignal(String),

    /// Configured session cap reached
    #[error("Session limit exceeded ({0} sessions)")]
    LimitExceeded(usize),
}

/// Errors raised while decoding RPC traffic
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The line was not a valid request document
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Method name is not part of the protocol
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Parameters did not match the method's schema
    #[error("Invalid params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
