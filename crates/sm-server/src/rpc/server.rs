//! RPC listener
//!
//! Accepts TCP connections speaking newline-delimited JSON. Each connection
//! gets a writer task draining its bounded outbound queue; every request runs
//! on its own task so a slow call never blocks the rest of the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use sm_core::error::ProtocolError;
use sm_core::rpc::{RpcResponse, ServerMessage};

use super::dispatch::handle_line;
use crate::state::ServerState;

/// Longest accepted request line
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// JSON-lines RPC server
pub struct RpcServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Bind to the configured address
    pub async fn bind(state: Arc<ServerState>, shutdown: CancellationToken) -> Result<Self> {
        let address = state.config.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind RPC server to {}", address))?;

        Ok(Self {
            listener,
            state,
            shutdown,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("RPC listener has no local address")
    }

    /// Accept connections until shutdown
    pub async fn run(self) -> Result<()> {
        tracing::info!("RPC server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("RPC server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if !self.state.config.allow_remote && !peer.ip().is_loopback() {
                            tracing::warn!("Rejected non-localhost connection from {}", peer);
                            continue;
                        }

                        let state = Arc::clone(&self.state);
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state, shutdown).await {
                                tracing::warn!("RPC client {} error: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept RPC connection: {}", e);
                    }
                },
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let connection = state.next_connection_id();
    tracing::info!(connection, "Client connected from {}", peer);

    let (read_half, write_half) = stream.into_split();
    let mut requests = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.config.outbound_queue_capacity.max(1));
    state.router.register(connection, outbound_tx.clone());

    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if let Err(e) = writer.send(line).await {
                tracing::debug!(connection, "Write failed: {}", e);
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            frame = requests.next() => match frame {
                None => break Ok(()),
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }

                    let state = Arc::clone(&state);
                    let outbound = outbound_tx.clone();
                    tokio::spawn(async move {
                        let response = handle_line(&state, connection, &line).await;
                        send_response(&outbound, response).await;
                    });
                }
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    let error = ProtocolError::InvalidRequest(format!(
                        "line exceeds {} bytes",
                        MAX_LINE_LENGTH
                    ));
                    tracing::warn!(connection, "{}", error);
                    send_response(&outbound_tx, RpcResponse::error(None, error.to_string())).await;
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    break Err(anyhow::Error::new(e).context("Failed to read request"));
                }
            },
        }
    };

    state.router.unregister(connection);
    drop(outbound_tx);
    // Finishes once in-flight requests have queued their responses
    if writer_task.await.is_err() {
        tracing::debug!(connection, "Writer task panicked");
    }

    tracing::info!(connection, "Client disconnected");
    result
}

async fn send_response(outbound: &mpsc::Sender<String>, response: RpcResponse) {
    match ServerMessage::Response(response).to_line() {
        Ok(line) => {
            if outbound.send(line).await.is_err() {
                tracing::debug!("Connection closed before response was sent");
            }
        }
        Err(e) => tracing::warn!("Failed to encode response: {}", e),
    }
}
