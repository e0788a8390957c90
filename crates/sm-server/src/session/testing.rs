//! In-memory PTY backend for unit tests

use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;

use sm_core::error::SessionError;

use super::pty::{PtyBackend, PtyHandle, SessionSignal, SpawnRequest, SpawnedPty};

/// Fake shell: echoes input, exits on `exit`.
///
/// A stubborn shell ignores interrupts but still dies on hangup or
/// termination, like `sh` after `trap '' INT`.
pub struct FakeBackend {
    stubborn: bool,
}

impl FakeBackend {
    pub fn new(stubborn: bool) -> Self {
        Self { stubborn }
    }
}

struct FakeReader {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.rx.recv() {
            Ok(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            Err(_) => Ok(0),
        }
    }
}

struct FakeHandle {
    tx: Option<std::sync::mpsc::Sender<Vec<u8>>>,
    status: Arc<Mutex<Option<Option<i32>>>>,
    stubborn: bool,
}

impl FakeHandle {
    fn exit(&mut self, code: Option<i32>) {
        *self.status.lock() = Some(code);
        self.tx = None;
    }
}

impl PtyHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(data).to_string();
        if text.trim() == "exit" {
            self.exit(Some(0));
            return Ok(());
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.replace('\n', "\r\n").into_bytes());
        }
        Ok(())
    }

    fn resize(&mut self, _cols: u16, _rows: u16) -> std::io::Result<()> {
        Ok(())
    }

    fn signal(&mut self, signal: SessionSignal) -> std::io::Result<()> {
        match signal {
            SessionSignal::Kill => self.kill(),
            SessionSignal::Interrupt if self.stubborn => Ok(()),
            _ => {
                self.exit(Some(130));
                Ok(())
            }
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.exit(None);
        Ok(())
    }

    fn try_wait(&mut self) -> std::io::Result<Option<Option<i32>>> {
        Ok(*self.status.lock())
    }
}

impl PtyBackend for FakeBackend {
    fn spawn(&self, _request: &SpawnRequest) -> Result<SpawnedPty, SessionError> {
        let (tx, rx) = std::sync::mpsc::channel();
        let _ = tx.send(b"welcome banner\r\nfake$ ".to_vec());
        Ok(SpawnedPty {
            handle: Box::new(FakeHandle {
                tx: Some(tx),
                status: Arc::new(Mutex::new(None)),
                stubborn: self.stubborn,
            }),
            reader: Box::new(FakeReader { rx }),
        })
    }
}
