//! shellmux session server
//!
//! Hosts PTY-backed shell sessions and serves them to local clients over
//! JSON-lines RPC.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sm_core::config::{self, ServerConfig};
use sm_server::health::serve_health;
use sm_server::{RpcServer, ServerState};

#[derive(Parser)]
#[command(name = "sm-server")]
#[command(about = "shellmux PTY session server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RPC bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Health endpoint bind address (overrides config)
    #[arg(long)]
    health_bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("shellmux server starting...");

    // Load configuration
    let mut config: ServerConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ServerConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ServerConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    if let Some(health_bind) = args.health_bind {
        config.health_address = Some(health_bind);
    }

    let state = ServerState::new(config);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    if let Some(address) = state.config.health_address.clone() {
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind health endpoint to {}", address))?;
        let health_state = state.clone();
        let health_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_health(listener, health_state, health_cancel).await {
                tracing::error!("{:#}", e);
            }
        });
    }

    let server = RpcServer::bind(state.clone(), cancel.clone()).await?;
    let result = server.run().await;

    cancel.cancel();
    state.shutdown().await;

    tracing::info!("shellmux server shutdown complete");
    result
}

/// Cancel `cancel` on Ctrl+C or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel.cancel();
    });
}
