//! Shared server state

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use sm_core::config::ServerConfig;
use sm_core::rpc::Health;

use crate::rpc::router::{spawn_router, ConnectionId, RouterHandle};
use crate::session::{PtyBackend, SessionManager};

/// State shared by the RPC listener, every connection and the health endpoint
pub struct ServerState {
    /// Configuration
    pub config: ServerConfig,
    /// Session manager
    pub sessions: SessionManager,
    /// Subscription router
    pub router: RouterHandle,
    /// When the server started
    started: Instant,
    next_connection: AtomicU64,
    router_task: JoinHandle<()>,
}

impl ServerState {
    /// Build the manager on the native PTY and start the router.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::new(config.sessions.clone(), events_tx);
        Self::assemble(config, sessions, events_rx)
    }

    /// Same as [`ServerState::new`] with a custom PTY backend
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn PtyBackend>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = SessionManager::with_backend(config.sessions.clone(), backend, events_tx);
        Self::assemble(config, sessions, events_rx)
    }

    fn assemble(
        config: ServerConfig,
        sessions: SessionManager,
        events_rx: mpsc::UnboundedReceiver<sm_core::SessionEvent>,
    ) -> Arc<Self> {
        let (router, router_task) = spawn_router(sessions.clone(), events_rx);
        Arc::new(Self {
            config,
            sessions,
            router,
            started: Instant::now(),
            next_connection: AtomicU64::new(1),
            router_task,
        })
    }

    /// Allocate an id for a new connection
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Process-wide health snapshot
    pub fn health(&self) -> Health {
        Health {
            status: "ok".to_string(),
            sessions: self.sessions.session_count(),
            uptime_secs: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Kill every session and stop the router
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
        self.router_task.abort();
    }
}
