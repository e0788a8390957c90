//! A single PTY-backed shell session

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::{mpsc, oneshot, watch};

use sm_core::error::SessionError;
use sm_core::rpc::{CommandResult, SearchMatch, SessionInfo};
use sm_core::time::current_time_millis;

use super::log_buffer::LogBuffer;
use super::pty::{PtyHandle, SessionSignal};

/// A command waiting in a session's queue
pub struct CommandRequest {
    pub command: String,
    pub submitted_at: Instant,
    /// Completion window for this command
    pub timeout: Duration,
    pub respond: oneshot::Sender<Result<CommandResult, SessionError>>,
}

/// One live shell process with its history and command queue
pub struct Session {
    id: String,
    shell: String,
    cwd: PathBuf,
    /// Environment overrides as given at creation
    env: BTreeMap<String, String>,
    pid: Option<u32>,
    created_at: u64,
    last_activity_at: AtomicU64,
    alive: AtomicBool,
    /// Set once input or a command has been written
    interacted: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    pty: Mutex<Box<dyn PtyHandle>>,
    logs: Mutex<LogBuffer>,
    /// Output collected while a command is in flight
    capture: Mutex<Option<String>>,
    current_command: Mutex<Option<String>>,
    queued: AtomicUsize,
    commands: mpsc::UnboundedSender<CommandRequest>,
    exited: watch::Sender<bool>,
}

impl Session {
    /// Create a session around a spawned PTY.
    ///
    /// Returns the receiving end of the command queue for the session's
    /// command worker.
    pub fn new(
        id: String,
        shell: String,
        cwd: PathBuf,
        env: BTreeMap<String, String>,
        pty: Box<dyn PtyHandle>,
        log_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<CommandRequest>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (exited, _) = watch::channel(false);
        let now = current_time_millis();

        let session = Self {
            id,
            shell,
            cwd,
            env,
            pid: pty.pid(),
            created_at: now,
            last_activity_at: AtomicU64::new(now),
            alive: AtomicBool::new(true),
            interacted: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            pty: Mutex::new(pty),
            logs: Mutex::new(LogBuffer::new(log_capacity)),
            capture: Mutex::new(None),
            current_command: Mutex::new(None),
            queued: AtomicUsize::new(0),
            commands,
            exited,
        };

        (session, command_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Record activity now
    pub fn touch(&self) {
        self.last_activity_at
            .store(current_time_millis(), Ordering::Relaxed);
    }

    /// Public snapshot
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            shell: self.shell.clone(),
            cwd: self.cwd.display().to_string(),
            pid: self.pid,
            alive: self.is_alive(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at.load(Ordering::Relaxed),
            log_lines: self.logs.lock().len(),
            queued_commands: self.queued.load(Ordering::SeqCst),
            current_command: self.current_command.lock().clone(),
        }
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(SessionError::NotAlive(self.id.clone()))
        }
    }

    /// Write raw bytes to the terminal
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.interacted.store(true, Ordering::SeqCst);
        self.pty
            .lock()
            .write(data)
            .map_err(|e| SessionError::Io(format!("write to {} failed: {}", self.id, e)))?;
        self.touch();
        Ok(())
    }

    /// Deliver a signal, regardless of the recorded liveness
    pub fn signal(&self, signal: SessionSignal) -> Result<(), SessionError> {
        self.pty
            .lock()
            .signal(signal)
            .map_err(|e| SessionError::Io(format!("{} to {} failed: {}", signal, self.id, e)))?;
        self.touch();
        Ok(())
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.pty
            .lock()
            .resize(cols, rows)
            .map_err(|e| SessionError::Io(format!("resize of {} failed: {}", self.id, e)))
    }

    /// Unconditionally terminate the process
    pub fn force_kill(&self) -> Result<(), SessionError> {
        self.pty
            .lock()
            .kill()
            .map_err(|e| SessionError::Io(format!("kill of {} failed: {}", self.id, e)))
    }

    /// Poll the process for termination
    pub fn try_wait(&self) -> std::io::Result<Option<Option<i32>>> {
        self.pty.lock().try_wait()
    }

    /// Log a chunk of output; returns the lines it completed.
    pub fn ingest(&self, data: &[u8], text: &str) -> Vec<String> {
        let lines = self.logs.lock().push_chunk(data);
        if let Some(capture) = self.capture.lock().as_mut() {
            capture.push_str(text);
        }
        self.touch();
        lines
    }

    pub fn tail(&self, count: Option<usize>) -> (Vec<String>, usize) {
        let logs = self.logs.lock();
        (logs.tail(count), logs.len())
    }

    pub fn search(&self, pattern: &Regex, context: usize, max: usize) -> (Vec<SearchMatch>, bool) {
        self.logs.lock().search(pattern, context, max)
    }

    /// Discard startup banners and the first prompt.
    ///
    /// Skipped once a client has written to the session, so early commands
    /// keep their log lines. Returns whether the log was cleared.
    pub fn clear_startup_noise(&self) -> bool {
        let mut logs = self.logs.lock();
        if self.interacted.load(Ordering::SeqCst) {
            return false;
        }
        logs.clear();
        true
    }

    /// Queue a command for the session's worker
    pub fn enqueue(&self, request: CommandRequest) -> Result<(), SessionError> {
        self.ensure_alive()?;
        self.queued.fetch_add(1, Ordering::SeqCst);
        self.commands.send(request).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            SessionError::NotAlive(self.id.clone())
        })
    }

    /// A queued command has been taken by the worker
    pub fn dequeued(&self) {
        // Saturating: a failed enqueue may already have rolled back
        let _ = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Mark `command` as in flight: log it and start capturing output
    pub fn begin_command(&self, command: &str) {
        *self.current_command.lock() = Some(command.to_string());
        *self.capture.lock() = Some(String::new());
        self.interacted.store(true, Ordering::SeqCst);
        self.logs.lock().push_line(format!("$ {}", command));
    }

    /// Stop capturing; returns the output seen since `begin_command`
    pub fn end_command(&self) -> String {
        *self.current_command.lock() = None;
        self.capture.lock().take().unwrap_or_default()
    }

    /// Transition to exited. Only the first caller wins and gets `true`.
    pub fn mark_exited(&self, exit_code: Option<i32>) -> bool {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return false;
        }

        *self.exit_code.lock() = exit_code;
        {
            let mut logs = self.logs.lock();
            logs.flush_partial();
            match exit_code {
                Some(code) => logs.push_line(format!("[process exited with code {}]", code)),
                None => logs.push_line("[process exited]"),
            }
        }
        self.touch();
        self.exited.send_replace(true);
        true
    }

    /// Receiver that flips to `true` once the session has exited
    pub fn exited_watch(&self) -> watch::Receiver<bool> {
        self.exited.subscribe()
    }

    /// Wait up to `timeout` for the exit transition
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited_watch();
        let result = tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await;
        matches!(result, Ok(Ok(_)))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .finish()
    }
}
