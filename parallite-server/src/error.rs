//! Server error types

use thiserror::Error;

use parallite_execution::ExecutionError;

/// Errors from binding and running the daemon.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid endpoint address {addr:?}: {reason}")]
    InvalidEndpoint { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("endpoint {0} is already served by a live daemon")]
    EndpointBusy(String),

    #[error("worker program not found: {0}")]
    WorkerProgramMissing(String),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
