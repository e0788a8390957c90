//! Reconnecting RPC client
//!
//! A background task owns the TCP connection. It connects, pumps requests
//! and responses while connected, and on any transport failure rejects every
//! in-flight request and starts over after an exponential backoff delay. It
//! never gives up until [`ReconnectingClient::close`] is called.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use sm_core::config::ClientConfig;
use sm_core::events::SessionEvent;
use sm_core::rpc::{
    CommandResult, CreateSessionParams, EnvResult, ExecParams, Health, InputParams, KillAllParams,
    KillAllResult, KillParams, KillResult, OutputParams, OutputResult, PwdResult, ResizeParams,
    RpcCall, SearchParams, SearchResult, ServerMessage, ServiceParams, ServiceResult, SessionInfo,
    SessionRef, SignalParams, SubscribeAck, SubscribeParams, UnsubscribeParams,
};

use crate::backoff::ExponentialBackoff;
use crate::error::ClientError;
use crate::state::ConnectionState;

/// Longest accepted line from the server
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Events buffered per subscriber before it starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 1024;

type PendingReply = oneshot::Sender<Result<Value, ClientError>>;

/// Outbound queue and in-flight requests of the current connection.
///
/// Kept under one lock so a request is never registered against a
/// connection that is already being torn down.
#[derive(Default)]
struct Link {
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<u64, PendingReply>,
}

struct ClientInner {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<SessionEvent>,
    link: Mutex<Link>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Client that keeps a connection to the server alive across failures
pub struct ReconnectingClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingClient {
    /// Start connecting to `config.address` in the background.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(ClientInner {
            config,
            state,
            events,
            link: Mutex::new(Link::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let task = tokio::spawn(connection_loop(Arc::clone(&inner)));

        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Receive pushed session events.
    ///
    /// Subscriptions are not restored after a reconnect; re-issue
    /// [`ReconnectingClient::subscribe`] once the state is connected again.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stop reconnecting, drop the connection and reject in-flight requests
    pub async fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("Closing client");
        }
        self.inner.shutdown.cancel();
        self.inner.fail_pending(|| ClientError::ClientClosed);

        let task = self.task.lock().take();
        if let Some(task) = task {
            if task.await.is_err() {
                tracing::debug!("Connection task panicked");
            }
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Send a call and wait for its raw result
    pub async fn request(&self, call: RpcCall) -> Result<Value, ClientError> {
        let method = call.method();
        let connect_deadline = Instant::now() + self.inner.config.connect_timeout;

        let (id, reply) = loop {
            self.wait_connected(connect_deadline).await?;

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let line = serde_json::to_string(&call.clone().into_request(id)?)?;
            // Dropped between the state change and now; wait for the next connection
            if let Some(reply) = self.inner.send_request(id, line) {
                break (id, reply);
            }
        };

        tracing::debug!(id, method, "Request sent");

        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::ConnectionLost),
            Err(_) => {
                self.inner.link.lock().pending.remove(&id);
                tracing::warn!(id, method, "Request timed out");
                Err(ClientError::RequestTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn wait_connected(&self, deadline: Instant) -> Result<(), ClientError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ClientError::ClientClosed);
        }

        let mut state = self.inner.state.subscribe();
        let waited = tokio::time::timeout_at(
            deadline,
            state.wait_for(|s| s.is_connected() || s.is_closed()),
        )
        .await;

        match waited {
            Err(_) => Err(ClientError::ConnectionTimeout(
                self.inner.config.connect_timeout,
            )),
            Ok(Err(_)) => Err(ClientError::ClientClosed),
            Ok(Ok(current)) => {
                if current.is_closed() {
                    Err(ClientError::ClientClosed)
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn call<T: DeserializeOwned>(&self, call: RpcCall) -> Result<T, ClientError> {
        let value = self.request(call).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn call_unit(&self, call: RpcCall) -> Result<(), ClientError> {
        self.request(call).await.map(|_| ())
    }

    pub async fn create_session(&self, params: CreateSessionParams) -> Result<SessionInfo, ClientError> {
        self.call(RpcCall::CreateSession(params)).await
    }

    /// Run a command; completes after the server's completion window
    pub async fn exec(&self, session_id: &str, command: &str) -> Result<CommandResult, ClientError> {
        self.call(RpcCall::Exec(ExecParams {
            session_id: session_id.to_string(),
            command: command.to_string(),
            timeout_ms: None,
        }))
        .await
    }

    pub async fn output(&self, session_id: &str, lines: Option<usize>) -> Result<OutputResult, ClientError> {
        self.call(RpcCall::Output(OutputParams {
            session_id: session_id.to_string(),
            lines,
        }))
        .await
    }

    pub async fn search(
        &self,
        session_id: &str,
        pattern: &str,
        context_lines: usize,
    ) -> Result<SearchResult, ClientError> {
        self.call(RpcCall::Search(SearchParams {
            session_id: session_id.to_string(),
            pattern: pattern.to_string(),
            context_lines: Some(context_lines),
        }))
        .await
    }

    pub async fn list(&self) -> Result<Vec<SessionInfo>, ClientError> {
        self.call(RpcCall::List).await
    }

    pub async fn kill(&self, session_id: &str, graceful: bool) -> Result<KillResult, ClientError> {
        self.call(RpcCall::Kill(KillParams {
            session_id: session_id.to_string(),
            graceful: Some(graceful),
        }))
        .await
    }

    pub async fn kill_all(&self, graceful: bool) -> Result<KillAllResult, ClientError> {
        self.call(RpcCall::KillAll(KillAllParams {
            graceful: Some(graceful),
        }))
        .await
    }

    pub async fn input(&self, session_id: &str, input: &str, append_newline: bool) -> Result<(), ClientError> {
        self.call_unit(RpcCall::Input(InputParams {
            session_id: session_id.to_string(),
            input: input.to_string(),
            append_newline: Some(append_newline),
        }))
        .await
    }

    pub async fn signal(&self, session_id: &str, signal: &str) -> Result<(), ClientError> {
        self.call_unit(RpcCall::Signal(SignalParams {
            session_id: session_id.to_string(),
            signal: Some(signal.to_string()),
        }))
        .await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ClientError> {
        self.call_unit(RpcCall::Resize(ResizeParams {
            session_id: session_id.to_string(),
            cols,
            rows,
        }))
        .await
    }

    pub async fn env(&self, session_id: &str) -> Result<EnvResult, ClientError> {
        self.call(RpcCall::Env(SessionRef {
            session_id: session_id.to_string(),
        }))
        .await
    }

    pub async fn pwd(&self, session_id: &str) -> Result<PwdResult, ClientError> {
        self.call(RpcCall::Pwd(SessionRef {
            session_id: session_id.to_string(),
        }))
        .await
    }

    pub async fn start_service(&self, params: ServiceParams) -> Result<ServiceResult, ClientError> {
        self.call(RpcCall::StartService(params)).await
    }

    pub async fn subscribe(&self, params: SubscribeParams) -> Result<SubscribeAck, ClientError> {
        self.call(RpcCall::Subscribe(params)).await
    }

    pub async fn unsubscribe(&self, params: UnsubscribeParams) -> Result<SubscribeAck, ClientError> {
        self.call(RpcCall::Unsubscribe(params)).await
    }

    pub async fn health(&self) -> Result<Health, ClientError> {
        self.call(RpcCall::Health).await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.call_unit(RpcCall::Ping).await
    }
}

impl Drop for ReconnectingClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl ClientInner {
    /// Register a pending request and queue its line on the live connection
    fn send_request(&self, id: u64, line: String) -> Option<oneshot::Receiver<Result<Value, ClientError>>> {
        let mut link = self.link.lock();
        let outbound = link.outbound.as_ref()?;
        if outbound.send(line).is_err() {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        link.pending.insert(id, tx);
        Some(rx)
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            // Closed is terminal
            if current.is_closed() || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            tracing::debug!(%state, "Connection state changed");
        }
    }

    /// Detach the current connection and reject everything in flight
    fn fail_pending(&self, error: impl Fn() -> ClientError) {
        let pending = {
            let mut link = self.link.lock();
            link.outbound = None;
            std::mem::take(&mut link.pending)
        };

        if !pending.is_empty() {
            tracing::debug!("Rejecting {} pending request(s)", pending.len());
        }
        for (_, reply) in pending {
            let _ = reply.send(Err(error()));
        }
    }

    fn handle_line(&self, line: &str) {
        let message = match serde_json::from_str::<ServerMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed server message: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Response(response) => {
                let Some(id) = response.id else {
                    tracing::warn!(
                        "Server rejected a request: {}",
                        response.error.unwrap_or_default()
                    );
                    return;
                };
                let Some(reply) = self.link.lock().pending.remove(&id) else {
                    tracing::debug!(id, "Response for unknown or expired request");
                    return;
                };

                let result = match response.error {
                    Some(error) => Err(ClientError::Remote(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = reply.send(result);
            }
            ServerMessage::Event(envelope) => {
                let name = envelope.event.clone();
                match SessionEvent::from_envelope(envelope) {
                    Ok(Some(event)) => {
                        // No receivers is fine
                        let _ = self.events.send(event);
                    }
                    Ok(None) => tracing::debug!(event = %name, "Ignoring unknown event"),
                    Err(e) => tracing::warn!(event = %name, "Malformed event payload: {}", e),
                }
            }
        }
    }
}

/// Connect, serve, and reconnect until shutdown
async fn connection_loop(inner: Arc<ClientInner>) {
    let mut backoff = ExponentialBackoff::from_config(&inner.config.backoff);
    let address = inner.config.address.clone();

    loop {
        inner.set_state(ConnectionState::Connecting);
        tracing::debug!("Connecting to {}", address);

        let attempt = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            attempt = tokio::time::timeout(
                inner.config.connect_timeout,
                TcpStream::connect(&address),
            ) => attempt,
        };

        match attempt {
            Ok(Ok(stream)) => {
                backoff.reset();
                tracing::info!("Connected to {}", address);
                serve_connection(&inner, stream).await;
                if inner.shutdown.is_cancelled() {
                    break;
                }
                tracing::warn!("Connection to {} lost", address);
            }
            Ok(Err(e)) => tracing::debug!("Connection to {} failed: {}", address, e),
            Err(_) => tracing::debug!("Connection to {} timed out", address),
        }

        inner.set_state(ConnectionState::Disconnected);

        let delay = backoff.next_delay();
        let attempt = backoff.attempts();
        inner.set_state(ConnectionState::Reconnecting { attempt, delay });
        tracing::debug!("Reconnecting in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    inner.fail_pending(|| ClientError::ClientClosed);
    inner.set_state(ConnectionState::Closed);
    tracing::debug!("Connection task exiting");
}

/// Pump one live connection until it fails or the client closes
async fn serve_connection(inner: &ClientInner, stream: TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
    }

    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut writer = FramedWrite::new(write_half, LinesCodec::new());

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    inner.link.lock().outbound = Some(outbound_tx);
    inner.set_state(ConnectionState::Connected);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            line = outbound_rx.recv() => match line {
                Some(line) => {
                    if let Err(e) = writer.send(line).await {
                        tracing::warn!("Failed to send request: {}", e);
                        break;
                    }
                }
                None => break,
            },
            frame = lines.next() => match frame {
                Some(Ok(line)) => inner.handle_line(&line),
                Some(Err(e)) => {
                    tracing::warn!("Failed to read from server: {}", e);
                    break;
                }
                None => {
                    tracing::debug!("Server closed the connection");
                    break;
                }
            },
        }
    }

    if inner.shutdown.is_cancelled() {
        inner.fail_pending(|| ClientError::ClientClosed);
    } else {
        inner.fail_pending(|| ClientError::ConnectionLost);
    }
}
