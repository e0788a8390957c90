//! Session manager
//!
//! Public operations over the [`SessionRegistry`]. Each session runs three
//! tasks: a blocking PTY reader, an output pump (sole writer of the log
//! buffer, also watching for process exit) and a command worker draining the
//! session's queue in submission order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::RegexBuilder;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use sm_core::config::SessionConfig;
use sm_core::error::SessionError;
use sm_core::events::{
    CommandFinishedPayload, CommandStartPayload, ExitPayload, InputPayload, OutputPayload,
    SessionEvent, SignalPayload,
};
use sm_core::rpc::{
    CommandResult, EnvResult, KillAllResult, KillResult, OutputResult, PwdResult, SearchResult,
    ServiceParams, ServiceResult, SessionInfo,
};
use sm_core::time::current_time_millis;

use super::decode::Utf8Stream;
use super::handle::{CommandRequest, Session};
use super::pty::{resolve_shell, NativePtyBackend, PtyBackend, SessionSignal, SpawnRequest};
use super::reader::spawn_pty_reader;
use super::registry::SessionRegistry;
use super::service::classify_output;

/// How often the pump polls the child for exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest the pump keeps draining output after the child has exited
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// Wait for the pump to observe exit after a forced kill
const EXIT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(1);

/// Chunks buffered between the blocking reader and the pump
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[cfg(windows)]
const LINE_TERMINATOR: &str = "\r\n";
#[cfg(not(windows))]
const LINE_TERMINATOR: &str = "\n";

/// Options for a new session
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub shell: Option<String>,
}

/// Creates, drives and terminates shell sessions
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: SessionConfig,
    registry: SessionRegistry,
    backend: Arc<dyn PtyBackend>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionManager {
    /// Manager backed by the host's native PTY
    pub fn new(config: SessionConfig, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self::with_backend(config, Arc::new(NativePtyBackend::new()), events)
    }

    pub fn with_backend(
        config: SessionConfig,
        backend: Arc<dyn PtyBackend>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                registry: SessionRegistry::new(),
                backend,
                events,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Number of registered sessions
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Ids of every live session, oldest first
    pub fn live_session_ids(&self) -> Vec<String> {
        self.inner
            .registry
            .list()
            .iter()
            .filter(|s| s.is_alive())
            .map(|s| s.id().to_string())
            .collect()
    }

    fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn get_alive(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self.get(id)?;
        if session.is_alive() {
            Ok(session)
        } else {
            Err(SessionError::NotAlive(id.to_string()))
        }
    }

    /// Spawn a shell in a new PTY and register it under `id`
    pub async fn create_session(
        &self,
        id: &str,
        options: SessionOptions,
    ) -> Result<SessionInfo, SessionError> {
        let config = &self.inner.config;

        if let Some(max) = config.max_sessions {
            if self.inner.registry.len() >= max {
                return Err(SessionError::LimitExceeded(max));
            }
        }
        if self.inner.registry.contains(id) {
            return Err(SessionError::AlreadyExists(id.to_string()));
        }

        let shell = resolve_shell(options.shell.as_deref(), config.default_shell.as_deref());
        let cwd = match options.cwd {
            Some(cwd) => cwd,
            None => std::env::current_dir()
                .map_err(|e| SessionError::Spawn(format!("No working directory: {}", e)))?,
        };
        if !cwd.is_dir() {
            return Err(SessionError::Spawn(format!(
                "Working directory does not exist: {}",
                cwd.display()
            )));
        }

        let mut env = config.default_env.clone();
        env.extend(options.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let spawned = self.inner.backend.spawn(&SpawnRequest {
            shell: shell.clone(),
            cwd: cwd.clone(),
            env,
            cols: config.cols,
            rows: config.rows,
        })?;

        let (session, command_rx) = Session::new(
            id.to_string(),
            shell,
            cwd,
            options.env,
            spawned.handle,
            config.log_capacity,
        );
        let session = Arc::new(session);

        // Lost a race with a concurrent create of the same id
        if let Err(e) = self.inner.registry.insert(Arc::clone(&session)) {
            if let Err(kill_err) = session.force_kill() {
                tracing::warn!(session_id = %id, "Failed to reap duplicate session: {}", kill_err);
            }
            return Err(e);
        }

        tracing::info!(
            session_id = %id,
            shell = %session.shell(),
            pid = ?session.pid(),
            "Session created"
        );
        self.inner.emit(SessionEvent::Created(session.info()));

        let (chunk_tx, chunk_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        spawn_pty_reader(id.to_string(), spawned.reader, chunk_tx);
        tokio::spawn(pump_output(
            Arc::clone(&self.inner),
            Arc::clone(&session),
            chunk_rx,
        ));
        tokio::spawn(run_command_queue(
            Arc::clone(&self.inner),
            Arc::clone(&session),
            command_rx,
        ));

        // Drop the shell's startup banner and first prompt
        tokio::time::sleep(config.startup_settle).await;
        if !session.clear_startup_noise() {
            tracing::debug!(session_id = %id, "Session used during startup, keeping its log");
        }

        Ok(session.info())
    }

    /// Queue `command` and wait for its time-based completion
    pub async fn exec_command(
        &self,
        id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, SessionError> {
        let session = self.get_alive(id)?;
        let (respond, response) = oneshot::channel();

        session.enqueue(CommandRequest {
            command: command.to_string(),
            submitted_at: Instant::now(),
            timeout: timeout.unwrap_or(self.inner.config.command_timeout),
            respond,
        })?;
        tracing::debug!(session_id = %id, command = %command, "Command queued");

        response
            .await
            .map_err(|_| SessionError::NotAlive(id.to_string()))?
    }

    /// Write raw input, bypassing the command queue
    pub fn send_input(&self, id: &str, input: &str, append_newline: bool) -> Result<(), SessionError> {
        let session = self.get_alive(id)?;

        let mut data = input.to_string();
        if append_newline {
            data.push_str(LINE_TERMINATOR);
        }
        session.write(data.as_bytes())?;

        self.inner.emit(SessionEvent::Input {
            session_id: id.to_string(),
            payload: InputPayload {
                input: input.to_string(),
                append_newline,
                timestamp: current_time_millis(),
            },
        });
        Ok(())
    }

    /// Deliver a signal by name, bypassing the command queue
    pub fn send_signal(&self, id: &str, signal: &str) -> Result<SessionSignal, SessionError> {
        let signal = SessionSignal::parse(signal)?;
        let session = self.get_alive(id)?;

        session.signal(signal)?;
        tracing::debug!(session_id = %id, %signal, "Signal delivered");

        self.inner.emit(SessionEvent::Signal {
            session_id: id.to_string(),
            payload: SignalPayload {
                signal: signal.name().to_string(),
                timestamp: current_time_millis(),
            },
        });
        Ok(signal)
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::Io(format!(
                "invalid terminal size {}x{}",
                cols, rows
            )));
        }
        self.get_alive(id)?.resize(cols, rows)
    }

    /// Terminate a session and remove it from the registry.
    ///
    /// Graceful kills interrupt the shell first, escalating to a forced kill
    /// once the grace period runs out.
    pub async fn kill_session(&self, id: &str, graceful: bool) -> Result<KillResult, SessionError> {
        let session = self.get(id)?;
        let config = &self.inner.config;
        let mut forced = false;

        if session.is_alive() {
            if graceful {
                tracing::info!(session_id = %id, "Stopping session gracefully");
                if let Err(e) = session.signal(SessionSignal::Interrupt) {
                    tracing::debug!(session_id = %id, "Interrupt failed: {}", e);
                }

                let deadline = Instant::now() + config.kill_grace_period;
                while session.is_alive() {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    tokio::time::sleep(config.kill_poll_interval.min(deadline - now)).await;
                }
            }

            if session.is_alive() {
                forced = true;
                tracing::info!(session_id = %id, "Force killing session");
                if let Err(e) = session.force_kill() {
                    tracing::warn!(session_id = %id, "Force kill failed: {}", e);
                }
                if !session.wait_exited(EXIT_CONFIRM_TIMEOUT).await {
                    tracing::warn!(session_id = %id, "Exit not observed after kill, finalizing");
                    self.inner.finalize(&session, None);
                }
            }
        }

        self.inner.registry.remove(&session);
        tracing::info!(session_id = %id, forced, "Session killed");

        Ok(KillResult {
            session_id: id.to_string(),
            forced,
        })
    }

    /// Kill every registered session concurrently
    pub async fn kill_all(&self, graceful: bool) -> KillAllResult {
        let ids = self.inner.registry.ids();
        let results =
            futures::future::join_all(ids.iter().map(|id| self.kill_session(id, graceful))).await;

        let killed = results
            .into_iter()
            .filter_map(|result| match result {
                Ok(result) => Some(result.session_id),
                Err(e) => {
                    tracing::debug!("Skipping session during kill-all: {}", e);
                    None
                }
            })
            .collect();

        KillAllResult { killed }
    }

    /// The most recent `lines` log lines, or all of them
    pub fn get_output(&self, id: &str, lines: Option<usize>) -> Result<OutputResult, SessionError> {
        let (lines, total_lines) = self.get(id)?.tail(lines);
        Ok(OutputResult {
            session_id: id.to_string(),
            lines,
            total_lines,
        })
    }

    /// Case-insensitive regex search over the log buffer
    pub fn search_logs(
        &self,
        id: &str,
        pattern: &str,
        context_lines: usize,
    ) -> Result<SearchResult, SessionError> {
        let session = self.get(id)?;
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| SessionError::InvalidPattern(e.to_string()))?;

        let (matches, truncated) =
            session.search(&regex, context_lines, self.inner.config.max_search_matches);

        Ok(SearchResult {
            session_id: id.to_string(),
            pattern: pattern.to_string(),
            matches,
            truncated,
        })
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.list().iter().map(|s| s.info()).collect()
    }

    /// Environment overrides the session was created with
    pub fn session_env(&self, id: &str) -> Result<EnvResult, SessionError> {
        let session = self.get(id)?;
        Ok(EnvResult {
            session_id: id.to_string(),
            env: session.env().clone(),
        })
    }

    /// Working directory the session was started in
    pub fn session_pwd(&self, id: &str) -> Result<PwdResult, SessionError> {
        let session = self.get(id)?;
        Ok(PwdResult {
            session_id: id.to_string(),
            cwd: session.cwd().display().to_string(),
        })
    }

    /// Create a session, run the service command in it and classify the output
    pub async fn start_service(&self, params: ServiceParams) -> Result<ServiceResult, SessionError> {
        let ServiceParams {
            name,
            command,
            cwd,
            env,
            ready_patterns,
            error_patterns,
        } = params;

        let created = self
            .create_session(
                &name,
                SessionOptions {
                    cwd: cwd.map(PathBuf::from),
                    env: env.unwrap_or_default(),
                    shell: None,
                },
            )
            .await?;

        let result = self.exec_command(&name, &command, None).await?;
        let status = classify_output(&result.output, &ready_patterns, &error_patterns);
        tracing::info!(service = %name, %status, "Service started");

        let (logs, session) = match self.inner.registry.get(&name) {
            Some(session) => (
                session.tail(Some(self.inner.config.service_tail_lines)).0,
                session.info(),
            ),
            None => (
                Vec::new(),
                SessionInfo {
                    alive: false,
                    ..created
                },
            ),
        };

        Ok(ServiceResult {
            name,
            status,
            logs,
            session,
        })
    }

    /// Kill every session
    pub async fn shutdown(&self) {
        let count = self.session_count();
        if count > 0 {
            tracing::info!("Shutting down {} session(s)", count);
        }
        self.kill_all(true).await;
    }
}

impl ManagerInner {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No event listener, dropping event");
        }
    }

    fn ingest(&self, session: &Session, decoder: &mut Utf8Stream, data: &[u8]) {
        let chunk = decoder.decode(data);
        let lines = session.ingest(data, &chunk);
        tracing::trace!(session_id = %session.id(), bytes = data.len(), "PTY output");

        self.emit(SessionEvent::Output {
            session_id: session.id().to_string(),
            payload: OutputPayload {
                chunk,
                lines,
                timestamp: current_time_millis(),
            },
        });
    }

    /// Emit bytes the decoder held back for an incomplete sequence
    fn flush_decoder(&self, session: &Session, decoder: &mut Utf8Stream) {
        let rest = decoder.finish();
        if rest.is_empty() {
            return;
        }

        session.ingest(&[], &rest);
        self.emit(SessionEvent::Output {
            session_id: session.id().to_string(),
            payload: OutputPayload {
                chunk: rest,
                lines: Vec::new(),
                timestamp: current_time_millis(),
            },
        });
    }

    /// Perform the exit transition once, whichever path observes it first
    fn finalize(&self, session: &Arc<Session>, exit_code: Option<i32>) {
        if !session.mark_exited(exit_code) {
            return;
        }

        tracing::info!(session_id = %session.id(), ?exit_code, "Session exited");
        self.emit(SessionEvent::Exit {
            session_id: session.id().to_string(),
            payload: ExitPayload {
                exit_code,
                timestamp: current_time_millis(),
            },
        });
        self.registry.remove(session);
    }

    async fn run_command(
        &self,
        session: &Session,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, SessionError> {
        let started = Instant::now();
        let started_at = current_time_millis();
        let mut exited = session.exited_watch();

        session.begin_command(command);
        if let Err(e) = session.write(format!("{}{}", command, LINE_TERMINATOR).as_bytes()) {
            session.end_command();
            return Err(e);
        }

        self.emit(SessionEvent::CommandStart {
            session_id: session.id().to_string(),
            payload: CommandStartPayload {
                command: command.to_string(),
                started_at,
            },
        });

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {}
            _ = exited.wait_for(|done| *done) => {
                tracing::debug!(session_id = %session.id(), "Session exited during command");
            }
        }

        let output = session.end_command();
        let finished_at = current_time_millis();
        let duration_ms = started.elapsed().as_millis() as u64;

        self.emit(SessionEvent::CommandFinished {
            session_id: session.id().to_string(),
            payload: CommandFinishedPayload {
                command: command.to_string(),
                duration: duration_ms,
                exit_code: 0,
                output: output.clone(),
                finished_at,
            },
        });

        Ok(CommandResult {
            command: command.to_string(),
            output,
            exit_code: 0,
            duration_ms,
            started_at,
            finished_at,
        })
    }
}

/// Move PTY output into the session log and watch for process exit
async fn pump_output(
    inner: Arc<ManagerInner>,
    session: Arc<Session>,
    mut chunks: mpsc::Receiver<Vec<u8>>,
) {
    let mut decoder = Utf8Stream::new();
    let mut exited = session.exited_watch();
    let mut exit_poll = tokio::time::interval(EXIT_POLL_INTERVAL);
    exit_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reader_done = false;

    // Arms only record the outcome; awaiting happens after the select
    let exit_code = loop {
        tokio::select! {
            chunk = chunks.recv(), if !reader_done => match chunk {
                Some(data) => inner.ingest(&session, &mut decoder, &data),
                None => {
                    tracing::debug!(session_id = %session.id(), "PTY output closed");
                    reader_done = true;
                }
            },
            _ = exit_poll.tick() => match session.try_wait() {
                Ok(Some(code)) => break Some(code),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(session_id = %session.id(), "Failed to poll process: {}", e);
                    break Some(None);
                }
            },
            result = exited.changed() => {
                if result.is_err() || *exited.borrow() {
                    break None;
                }
            }
        }
    };

    // Finalized elsewhere (forced kill without an observed exit)
    let Some(exit_code) = exit_code else {
        tracing::debug!(session_id = %session.id(), "Output pump exiting");
        return;
    };

    if !reader_done {
        drain_output(&inner, &session, &mut decoder, &mut chunks).await;
    }
    inner.flush_decoder(&session, &mut decoder);
    inner.finalize(&session, exit_code);

    tracing::debug!(session_id = %session.id(), "Output pump exiting");
}

/// Collect output still in flight after exit, bounded in time
async fn drain_output(
    inner: &ManagerInner,
    session: &Session,
    decoder: &mut Utf8Stream,
    chunks: &mut mpsc::Receiver<Vec<u8>>,
) {
    let deadline = tokio::time::sleep(EXIT_DRAIN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            chunk = chunks.recv() => match chunk {
                Some(data) => inner.ingest(session, decoder, &data),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
}

/// Run queued commands one at a time until the session exits
async fn run_command_queue(
    inner: Arc<ManagerInner>,
    session: Arc<Session>,
    mut commands: mpsc::UnboundedReceiver<CommandRequest>,
) {
    let mut exited = session.exited_watch();

    loop {
        let request = tokio::select! {
            request = commands.recv() => match request {
                Some(request) => request,
                None => break,
            },
            _ = exited.wait_for(|done| *done) => break,
        };
        session.dequeued();

        tracing::debug!(
            session_id = %session.id(),
            command = %request.command,
            waited_ms = request.submitted_at.elapsed().as_millis() as u64,
            "Running command"
        );
        let result = if session.is_alive() {
            inner
                .run_command(&session, &request.command, request.timeout)
                .await
        } else {
            Err(SessionError::NotAlive(session.id().to_string()))
        };
        // Caller may have gone away
        let _ = request.respond.send(result);
    }

    commands.close();
    while let Ok(request) = commands.try_recv() {
        session.dequeued();
        let _ = request
            .respond
            .send(Err(SessionError::NotAlive(session.id().to_string())));
    }

    tracing::debug!(session_id = %session.id(), "Command worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeBackend;

    fn test_config() -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_millis(200),
            kill_grace_period: Duration::from_millis(400),
            kill_poll_interval: Duration::from_millis(20),
            startup_settle: Duration::from_millis(50),
            log_capacity: 100,
            ..SessionConfig::default()
        }
    }

    fn manager(
        config: SessionConfig,
        stubborn: bool,
    ) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = SessionManager::with_backend(config, Arc::new(FakeBackend::new(stubborn)), tx);
        (manager, rx)
    }

    fn tmp_options() -> SessionOptions {
        SessionOptions {
            cwd: Some(std::env::temp_dir()),
            ..SessionOptions::default()
        }
    }

    #[tokio::test]
    async fn test_create_clears_startup_noise() {
        let (manager, mut events) = manager(test_config(), false);
        let info = manager.create_session("s1", tmp_options()).await.unwrap();

        assert_eq!(info.id, "s1");
        assert!(info.alive);
        assert_eq!(info.log_lines, 0);
        assert!(matches!(events.recv().await, Some(SessionEvent::Created(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_leaves_existing_session() {
        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();
        manager.send_input("s1", "marker", true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = manager.create_session("s1", tmp_options()).await.unwrap_err();
        assert!(matches!(err, SessionError::AlreadyExists(_)));

        assert_eq!(manager.session_count(), 1);
        let output = manager.get_output("s1", None).unwrap();
        assert_eq!(output.lines, vec!["marker"]);
    }

    #[tokio::test]
    async fn test_exec_returns_within_timeout() {
        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();

        let started = Instant::now();
        let result = manager.exec_command("s1", "echo hi", None).await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.output.contains("echo hi"));
        assert_eq!(result.exit_code, 0);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(600));

        let logs = manager.get_output("s1", None).unwrap().lines;
        assert_eq!(logs.first().map(String::as_str), Some("$ echo hi"));
    }

    #[tokio::test]
    async fn test_commands_run_in_submission_order() {
        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();

        let (first, second) = tokio::join!(
            manager.exec_command("s1", "one", None),
            manager.exec_command("s1", "two", None)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert!(first.output.contains("one"));
        assert!(!first.output.contains("two"));
        assert!(second.output.contains("two"));
        assert!(second.started_at >= first.finished_at);
    }

    #[tokio::test]
    async fn test_unknown_session_errors() {
        let (manager, _events) = manager(test_config(), false);
        assert!(matches!(
            manager.exec_command("nope", "ls", None).await,
            Err(SessionError::NotFound(_))
        ));
        assert!(matches!(manager.get_output("nope", None), Err(SessionError::NotFound(_))));
        assert!(matches!(
            manager.kill_session("nope", true).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_search_uses_case_insensitive_regex() {
        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();
        manager.send_input("s1", "Fatal ERROR here", true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = manager.search_logs("s1", "error", 0).unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].line, "Fatal ERROR here");

        assert!(matches!(
            manager.search_logs("s1", "(", 0),
            Err(SessionError::InvalidPattern(_))
        ));
    }

    #[tokio::test]
    async fn test_spontaneous_exit_finalizes_once() {
        let (manager, mut events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();
        manager.send_input("s1", "exit", true).unwrap();

        let mut exits = 0;
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Exit { payload, .. }) => {
                        assert_eq!(payload.exit_code, Some(0));
                        exits += 1;
                    }
                    Some(_) => {}
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        assert_eq!(exits, 1);
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(
            manager.exec_command("s1", "ls", None).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_graceful_kill_of_cooperative_shell() {
        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();

        let result = manager.kill_session("s1", true).await.unwrap();
        assert!(!result.forced);
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_graceful_kill_escalates_when_interrupt_is_ignored() {
        let config = test_config();
        let grace = config.kill_grace_period;
        let (manager, _events) = manager(config, true);
        manager.create_session("s1", tmp_options()).await.unwrap();

        let started = Instant::now();
        let result = manager.kill_session("s1", true).await.unwrap();
        let elapsed = started.elapsed();

        assert!(result.forced);
        assert!(elapsed >= grace);
        assert!(elapsed < grace + Duration::from_millis(500));
        assert!(manager.list_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_kill_all_settles_every_session() {
        let (manager, _events) = manager(test_config(), true);
        manager.create_session("a", tmp_options()).await.unwrap();
        manager.create_session("b", tmp_options()).await.unwrap();

        let mut result = manager.kill_all(false).await;
        result.killed.sort();
        assert_eq!(result.killed, vec!["a", "b"]);
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_queued_commands_rejected_on_exit() {
        let config = SessionConfig {
            command_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let (manager, _events) = manager(config, false);
        manager.create_session("s1", tmp_options()).await.unwrap();

        let (first, second) = tokio::join!(manager.exec_command("s1", "exit", None), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.exec_command("s1", "echo late", None).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SessionError::NotAlive(_)) | Err(SessionError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let config = SessionConfig {
            max_sessions: Some(1),
            ..test_config()
        };
        let (manager, _events) = manager(config, false);
        manager.create_session("a", tmp_options()).await.unwrap();
        assert!(matches!(
            manager.create_session("b", tmp_options()).await,
            Err(SessionError::LimitExceeded(1))
        ));
    }

    #[tokio::test]
    async fn test_service_ready_and_env_snapshot() {
        let (manager, _events) = manager(test_config(), false);
        let mut env = BTreeMap::new();
        env.insert("PORT".to_string(), "3000".to_string());

        let result = manager
            .start_service(ServiceParams {
                name: "svc".to_string(),
                command: "printf READY".to_string(),
                cwd: Some(std::env::temp_dir().display().to_string()),
                env: Some(env.clone()),
                ready_patterns: vec!["READY".to_string()],
                error_patterns: vec![],
            })
            .await
            .unwrap();

        assert_eq!(result.status, sm_core::rpc::ServiceStatus::Ready);
        assert!(result.session.alive);
        assert_eq!(manager.session_env("svc").unwrap().env, env);
        assert_eq!(
            manager.session_pwd("svc").unwrap().cwd,
            std::env::temp_dir().display().to_string()
        );
    }

    #[tokio::test]
    async fn test_input_and_signal_emit_events() {
        let (manager, mut events) = manager(test_config(), true);
        manager.create_session("s1", tmp_options()).await.unwrap();

        manager.send_input("s1", "ls", false).unwrap();
        assert_eq!(manager.send_signal("s1", "int").unwrap(), SessionSignal::Interrupt);
        assert!(matches!(
            manager.send_signal("s1", "SIGBOGUS"),
            Err(SessionError::InvalidSignal(_))
        ));

        let mut saw_input = false;
        let mut saw_signal = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(100), events.recv()).await
        {
            match event {
                SessionEvent::Input { payload, .. } => {
                    assert_eq!(payload.input, "ls");
                    assert!(!payload.append_newline);
                    saw_input = true;
                }
                SessionEvent::Signal { payload, .. } => {
                    assert_eq!(payload.signal, "SIGINT");
                    saw_signal = true;
                }
                _ => {}
            }
        }
        assert!(saw_input && saw_signal);
    }

    #[tokio::test]
    async fn test_output_pump_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let (manager, _events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();
        let session = manager.inner.registry.get("s1").unwrap();

        let (_tx, rx) = mpsc::channel(1);
        let pump = pump_output(Arc::clone(&manager.inner), session, rx);
        assert_send(&pump);
    }

    #[tokio::test]
    async fn test_exec_during_startup_keeps_its_log() {
        let config = SessionConfig {
            startup_settle: Duration::from_millis(400),
            ..test_config()
        };
        let (manager, _events) = manager(config, false);

        let (created, executed) = tokio::join!(manager.create_session("s1", tmp_options()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            manager.exec_command("s1", "echo early", None).await
        });
        created.unwrap();
        assert!(executed.unwrap().output.contains("echo early"));

        let logs = manager.get_output("s1", None).unwrap().lines;
        assert!(logs.contains(&"$ echo early".to_string()), "log was {:?}", logs);
    }

    #[tokio::test]
    async fn test_held_back_bytes_are_flushed() {
        let (manager, mut events) = manager(test_config(), false);
        manager.create_session("s1", tmp_options()).await.unwrap();
        let session = manager.inner.registry.get("s1").unwrap();
        while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(50), events.recv()).await {}

        let mut decoder = Utf8Stream::new();
        assert_eq!(decoder.decode(&"→".as_bytes()[..1]), "");
        manager.inner.flush_decoder(&session, &mut decoder);

        match events.recv().await {
            Some(SessionEvent::Output { payload, .. }) => {
                assert_eq!(payload.chunk, "\u{FFFD}");
                assert!(payload.lines.is_empty());
            }
            other => panic!("expected output, got {:?}", other),
        }
    }
}
