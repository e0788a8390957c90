//! Blocking PTY reader

use std::io::Read;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Bytes per read from the PTY master
const READ_BUFFER_SIZE: usize = 4096;

/// Spawn a blocking task that forwards PTY output to `tx` until EOF.
///
/// The task also ends once the receiving pump is gone.
pub fn spawn_pty_reader(
    session_id: String,
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(session_id = %session_id, "PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        tracing::debug!(session_id = %session_id, "PTY output channel closed");
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO on the master once the child side is gone
                    if e.kind() == std::io::ErrorKind::Other
                        || e.kind() == std::io::ErrorKind::BrokenPipe
                        || e.raw_os_error() == Some(5)
                    {
                        tracing::debug!(session_id = %session_id, "PTY reader closed: {}", e);
                    } else {
                        tracing::error!(session_id = %session_id, "PTY read error: {}", e);
                    }
                    break;
                }
            }
        }

        tracing::debug!(session_id = %session_id, "PTY reader task exiting");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_chunks_until_eof() {
        let (tx, mut rx) = mpsc::channel(4);
        let reader: Box<dyn Read + Send> = Box::new(std::io::Cursor::new(b"hello\n".to_vec()));

        let handle = spawn_pty_reader("s1".to_string(), reader, tx);
        assert_eq!(rx.recv().await.unwrap(), b"hello\n".to_vec());
        handle.await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
