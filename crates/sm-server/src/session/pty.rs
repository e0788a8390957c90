//! Pseudo-terminal backend
//!
//! The session manager talks to the OS pseudo-terminal through the
//! [`PtyBackend`] / [`PtyHandle`] pair. [`NativePtyBackend`] implements them
//! with the portable-pty crate.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};

use sm_core::error::SessionError;

/// Interrupt control byte (Ctrl+C)
const INTERRUPT_BYTE: u8 = 0x03;

/// Signals a caller may deliver to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSignal {
    /// Written as the interrupt control byte so the foreground job receives it
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    Kill,
}

impl SessionSignal {
    /// Parse a signal name (`SIGINT`, `INT`, `sigterm`, ...)
    pub fn parse(name: &str) -> Result<Self, SessionError> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "INT" => Ok(SessionSignal::Interrupt),
            "TERM" => Ok(SessionSignal::Terminate),
            "HUP" => Ok(SessionSignal::Hangup),
            "QUIT" => Ok(SessionSignal::Quit),
            "KILL" => Ok(SessionSignal::Kill),
            _ => Err(SessionError::InvalidSignal(name.to_string())),
        }
    }

    /// Canonical signal name
    pub fn name(&self) -> &'static str {
        match self {
            SessionSignal::Interrupt => "SIGINT",
            SessionSignal::Terminate => "SIGTERM",
            SessionSignal::Hangup => "SIGHUP",
            SessionSignal::Quit => "SIGQUIT",
            SessionSignal::Kill => "SIGKILL",
        }
    }
}

impl std::fmt::Display for SessionSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to start a shell in a new PTY
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub shell: String,
    pub cwd: PathBuf,
    /// Fully merged environment (defaults overlaid with overrides)
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// A freshly spawned PTY process
pub struct SpawnedPty {
    pub handle: Box<dyn PtyHandle>,
    /// Blocking reader over the PTY master; reaches EOF once the process is gone
    pub reader: Box<dyn Read + Send>,
}

/// Control surface of a running PTY process
pub trait PtyHandle: Send {
    /// OS process id, when the platform reports one
    fn pid(&self) -> Option<u32>;

    /// Write raw bytes to the terminal
    fn write(&mut self, data: &[u8]) -> std::io::Result<()>;

    /// Change the terminal dimensions
    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()>;

    /// Deliver a signal
    fn signal(&mut self, signal: SessionSignal) -> std::io::Result<()>;

    /// Unconditionally terminate the process
    fn kill(&mut self) -> std::io::Result<()>;

    /// Exit code if the process has terminated (`Some(None)` when unknown)
    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>>;
}

/// Spawns PTY processes
pub trait PtyBackend: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, SessionError>;
}

/// Pick the shell for a new session
///
/// Order: requested → configured default → `$SHELL` → platform default.
pub fn resolve_shell(requested: Option<&str>, default_shell: Option<&str>) -> String {
    requested
        .or(default_shell)
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| {
            if cfg!(windows) {
                "cmd.exe".to_string()
            } else {
                "/bin/sh".to_string()
            }
        })
}

/// PTY backend built on the host's native pseudo-terminal
#[derive(Debug, Default)]
pub struct NativePtyBackend;

impl NativePtyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl PtyBackend for NativePtyBackend {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedPty, SessionError> {
        tracing::debug!(
            shell = %request.shell,
            cwd = %request.cwd.display(),
            "Opening PTY {}x{}",
            request.cols,
            request.rows
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Spawn(format!("Failed to open PTY: {}", e)))?;

        let mut cmd = CommandBuilder::new(&request.shell);
        cmd.cwd(&request.cwd);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("Failed to spawn {}: {}", request.shell, e)))?;

        // Only the child may hold the slave side, otherwise the reader never sees EOF
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Spawn(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(format!("Failed to take PTY writer: {}", e)))?;

        let pid = child.process_id();
        tracing::info!("Spawned {} with PID {:?}", request.shell, pid);

        Ok(SpawnedPty {
            handle: Box::new(NativePty {
                master: pair.master,
                writer,
                child,
                pid,
            }),
            reader,
        })
    }
}

/// A process running on a native PTY
struct NativePty {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

impl NativePty {
    #[cfg(unix)]
    fn deliver(&mut self, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        match self.pid {
            Some(pid) => kill(Pid::from_raw(pid as i32), signal)
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32)),
            None => self.child.kill(),
        }
    }
}

impl PtyHandle for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data)?;
        self.writer.flush()
    }

    fn resize(&mut self, cols: u16, rows: u16) -> std::io::Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    #[cfg(unix)]
    fn signal(&mut self, signal: SessionSignal) -> std::io::Result<()> {
        use nix::sys::signal::Signal;

        match signal {
            SessionSignal::Interrupt => self.write(&[INTERRUPT_BYTE]),
            SessionSignal::Terminate => self.deliver(Signal::SIGTERM),
            SessionSignal::Hangup => self.deliver(Signal::SIGHUP),
            SessionSignal::Quit => self.deliver(Signal::SIGQUIT),
            SessionSignal::Kill => self.kill(),
        }
    }

    #[cfg(not(unix))]
    fn signal(&mut self, signal: SessionSignal) -> std::io::Result<()> {
        match signal {
            SessionSignal::Interrupt => self.write(&[INTERRUPT_BYTE]),
            _ => self.kill(),
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        #[cfg(unix)]
        if self.pid.is_some() {
            return self.deliver(nix::sys::signal::Signal::SIGKILL);
        }
        self.child.kill()
    }

    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| Some(status.exit_code() as i32)))
    }
}
