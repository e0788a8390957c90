//! Server configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::duration_millis;

/// Configuration for the session server daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the RPC listener binds to
    pub bind_address: String,

    /// Address of the HTTP health endpoint (disabled when unset)
    pub health_address: Option<String>,

    /// Accept RPC connections from non-loopback peers
    pub allow_remote: bool,

    /// Per-connection outbound queue capacity (responses + events)
    pub outbound_queue_capacity: usize,

    /// Session manager settings
    pub sessions: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7420".to_string(),
            health_address: Some("127.0.0.1:7421".to_string()),
            allow_remote: false,
            outbound_queue_capacity: 1024,
            sessions: SessionConfig::default(),
        }
    }
}

/// Settings for session lifecycle, command execution and log retention
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum lines retained per session log buffer
    pub log_capacity: usize,

    /// Heuristic command-completion window
    #[serde(rename = "command_timeout_ms", with = "duration_millis")]
    pub command_timeout: Duration,

    /// How long a graceful kill waits before escalating
    #[serde(rename = "kill_grace_period_ms", with = "duration_millis")]
    pub kill_grace_period: Duration,

    /// Liveness poll interval during a graceful kill
    #[serde(rename = "kill_poll_interval_ms", with = "duration_millis")]
    pub kill_poll_interval: Duration,

    /// Delay after spawn before startup output is discarded
    #[serde(rename = "startup_settle_ms", with = "duration_millis")]
    pub startup_settle: Duration,

    /// Shell used when a create request names none
    pub default_shell: Option<String>,

    /// Environment applied to every session before its overrides
    pub default_env: BTreeMap<String, String>,

    /// Upper bound on matches returned by a log search
    pub max_search_matches: usize,

    /// Log lines returned with a service start result
    pub service_tail_lines: usize,

    /// Optional cap on concurrently registered sessions
    pub max_sessions: Option<usize>,

    /// Initial PTY width
    pub cols: u16,

    /// Initial PTY height
    pub rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let mut default_env = BTreeMap::new();
        default_env.insert("TERM".to_string(), "xterm-256color".to_string());

        Self {
            log_capacity: 10_000,
            command_timeout: Duration::from_millis(2000),
            kill_grace_period: Duration::from_secs(3),
            kill_poll_interval: Duration::from_millis(100),
            startup_settle: Duration::from_millis(150),
            default_shell: None,
            default_env,
            max_search_matches: 100,
            service_tail_lines: 50,
            max_sessions: None,
            cols: 120,
            rows: 40,
        }
    }
}
