//! HTTP health endpoint

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use sm_core::rpc::Health;

use crate::state::ServerState;

/// Router serving `GET /health`
pub fn health_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<Health> {
    Json(state.health())
}

/// Serve the health endpoint on an already bound listener until `shutdown` fires
pub async fn serve_health(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let address = listener.local_addr().context("Health listener has no address")?;
    tracing::info!("Health endpoint listening on http://{}/health", address);

    axum::serve(listener, health_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Health endpoint failed")
}
