//! Shell sessions: PTY processes, their logs and command queues

mod decode;
mod handle;
mod log_buffer;
mod manager;
pub mod pty;
mod reader;
mod registry;
mod service;
#[cfg(test)]
pub(crate) mod testing;

pub use handle::Session;
pub use log_buffer::LogBuffer;
pub use manager::{SessionManager, SessionOptions};
pub use pty::{NativePtyBackend, PtyBackend, PtyHandle, SessionSignal, SpawnRequest, SpawnedPty};
pub use service::classify_output;
