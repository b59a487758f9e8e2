//! Execution error types

use thiserror::Error;

use parallite_ipc::IpcError;

/// Errors raised while running tasks on worker processes.
///
/// The `Display` strings double as the `error` field of synthesized
/// response envelopes, so their wording is part of the protocol surface.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The worker program could not be started.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// I/O on a leased worker's stdio failed; the worker is unusable.
    #[error("worker execute failed: {0}")]
    WorkerIo(String),

    /// The worker exited before producing a response.
    #[error("worker execute failed: worker exited before responding")]
    WorkerExited,

    /// The per-task deadline fired before the worker responded.
    #[error("task timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The daemon is shutting down; no new work is accepted.
    #[error("daemon shutting down")]
    ShuttingDown,

    /// A cancellable wait (worker lease) was cancelled by its caller.
    #[error("lease cancelled")]
    Cancelled,

    /// A task with the same id is already in flight.
    #[error("duplicate task id {0:?}")]
    DuplicateTask(String),
}

impl From<IpcError> for ExecutionError {
    fn from(err: IpcError) -> Self {
        ExecutionError::WorkerIo(err.to_string())
    }
}
