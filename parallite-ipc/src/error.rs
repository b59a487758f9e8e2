//! IPC error types

use thiserror::Error;

/// Errors produced while framing or decoding wire messages.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Frame length prefix exceeded the configured ceiling.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("stream closed mid-frame: {0}")]
    Truncated(String),

    /// I/O failure on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The payload was not a well-formed envelope.
    #[error("invalid envelope: {reason}")]
    InvalidEnvelope {
        reason: String,
        /// Task id, when decoding got far enough to recover one.
        task_id: Option<String>,
    },

    /// MessagePack-level decode failure.
    #[error("decode error: {0}")]
    Decode(String),
}

impl IpcError {
    /// Task id recovered from a partially-decoded envelope, if any.
    ///
    /// The listener uses this to send a best-effort error response before
    /// closing a connection that sent a malformed submission.
    pub fn recovered_task_id(&self) -> Option<&str> {
        match self {
            IpcError::InvalidEnvelope { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>, task_id: Option<String>) -> Self {
        IpcError::InvalidEnvelope {
            reason: reason.into(),
            task_id,
        }
    }
}

impl From<rmpv::decode::Error> for IpcError {
    fn from(err: rmpv::decode::Error) -> Self {
        IpcError::Decode(err.to_string())
    }
}
