//! Executor seam and daemon-wide failure policy

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use parallite_ipc::Submission;

/// What the daemon does after a worker failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailMode {
    /// A worker failure affects only its current task.
    #[default]
    Continue,
    /// The supervisor initiates shutdown after the first worker failure.
    Stop,
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "continue" => Ok(FailMode::Continue),
            "stop" => Ok(FailMode::Stop),
            other => Err(format!("unknown fail mode {other:?} (expected \"continue\" or \"stop\")")),
        }
    }
}

impl std::fmt::Display for FailMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailMode::Continue => f.write_str("continue"),
            FailMode::Stop => f.write_str("stop"),
        }
    }
}

/// Anything that can run one submission to a single response frame.
///
/// The listener only knows this seam; [`crate::Dispatcher`] is the real
/// implementation and tests substitute their own.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run one submission to completion. Never fails: every error becomes
    /// a response envelope.
    async fn dispatch(&self, submission: Submission) -> Bytes;
}
