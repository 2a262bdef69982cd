//! Error taxonomy for the plugin runtime.
//!
//! Protocol-level failures are local to the call that hit them; crash
//! and timeout are fatal to the whole runnable and fail every
//! outstanding and future call on it.

use thiserror::Error;

/// Errors surfaced by the orchestrator-side API and the worker endpoint.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The worker handshake did not complete. The runnable is unusable
    /// and must be discarded; retry with a fresh runnable if wanted.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// A call was attempted while another call was in flight. Contract
    /// violation on the caller's side; nothing was sent.
    #[error("runnable is busy with another call")]
    Busy,

    /// A frame was malformed, carried an unexpected event, or was
    /// missing required params.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The loaded plugin failed; carries the plugin's error message.
    #[error("plugin execution failed: {0}")]
    Plugin(String),

    /// The worker process exited (or its channel closed) while a call
    /// was outstanding or before one could be issued.
    #[error("worker process exited unexpectedly")]
    ProcessCrash,

    /// A suspend point exceeded its deadline. Fatal to the runnable:
    /// the worker is killed and the working directory reclaimed.
    #[error("timed out waiting for worker after {0:?}")]
    Timeout(std::time::Duration),

    /// Filesystem or channel I/O outside of frame en/decoding.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Build a `Protocol` error from a frame serialization failure.
    pub fn codec(err: &serde_json::Error) -> Self {
        Self::Protocol(format!("frame codec: {err}"))
    }

    /// Classify an I/O failure on the control channel: pipe-class
    /// errors mean the peer process is gone and become `ProcessCrash`.
    pub fn channel_io(err: std::io::Error) -> Self {
        if is_disconnect_kind(err.kind()) {
            Self::ProcessCrash
        } else {
            Self::Io(err)
        }
    }
}

/// I/O error kinds produced by reading from or writing to a channel
/// whose far end has died.
pub(crate) fn is_disconnect_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind;
    matches!(
        kind,
        ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::WriteZero
    )
}
