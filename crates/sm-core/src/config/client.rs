//! Reconnecting client configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Configuration for the reconnecting RPC client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to connect to
    pub address: String,

    /// How long `request()` waits for a connection before failing
    #[serde(rename = "connect_timeout_ms", with = "duration_millis")]
    pub connect_timeout: Duration,

    /// Per-request response deadline
    #[serde(rename = "request_timeout_ms", with = "duration_millis")]
    pub request_timeout: Duration,

    /// Reconnect delay policy
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7420".to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration pointed at a specific address
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(rename = "initial_ms", with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(rename = "max_ms", with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}
