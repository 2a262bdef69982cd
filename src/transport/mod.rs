//! Transport layer for orchestrator ↔ worker communication.
//!
//! Provides the `ControlChannel` trait and length-prefixed JSON framing
//! functions. The production channel is `StdioChannel` (stdin/stdout
//! pipes to the worker subprocess); tests substitute in-memory
//! channels behind the same trait.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{Frame, Message, Operator};
pub use stdio_pipe::StdioChannel;

use async_trait::async_trait;

use crate::error::RuntimeError;

/// Maximum message size (64 MB). Safety valve against malformed frames.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Abstraction over the orchestrator ↔ worker control channel.
///
/// One channel per worker subprocess; the busy gate in `Runnable`
/// guarantees at most one request is in flight on it at a time.
#[async_trait]
pub trait ControlChannel: Send {
    /// Send one frame to the worker.
    async fn send(&mut self, frame: &Frame) -> Result<(), RuntimeError>;

    /// Receive the next inbound frame.
    ///
    /// A closed channel (worker gone) yields `ProcessCrash`, never a
    /// bare I/O error, so callers can fail outstanding calls
    /// deterministically.
    async fn recv(&mut self) -> Result<Frame, RuntimeError>;

    /// Resolve once the worker process has exited, returning its exit
    /// code when one is available.
    async fn wait_exit(&mut self) -> Result<Option<i32>, RuntimeError>;

    /// Forcibly terminate the worker if it is still alive.
    async fn shutdown(&mut self);

    /// Independent observation of worker exit, when the channel has
    /// one. The receiver flips to `true` once the process is gone.
    /// In-memory channels without a real process return `None`.
    fn exit_signal(&self) -> Option<tokio::sync::watch::Receiver<bool>> {
        None
    }
}

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]. A broken pipe
/// maps to `ProcessCrash` the same way EOF on the read side does.
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), RuntimeError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| RuntimeError::Protocol(format!("message too large: {} bytes", payload.len())))?;
    if len > MAX_MESSAGE_SIZE {
        return Err(RuntimeError::Protocol(format!(
            "message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(RuntimeError::channel_io)?;
    writer
        .write_all(payload)
        .await
        .map_err(RuntimeError::channel_io)?;
    writer.flush().await.map_err(RuntimeError::channel_io)?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`. EOF at a
/// message boundary or mid-message maps to `ProcessCrash` — the peer
/// process is gone.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>, RuntimeError> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(RuntimeError::channel_io)?;
    let len = u32::from_be_bytes(len_buf);

    if len > MAX_MESSAGE_SIZE {
        return Err(RuntimeError::Protocol(format!(
            "message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
        )));
    }

    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(RuntimeError::channel_io)?;
    Ok(buf)
}
