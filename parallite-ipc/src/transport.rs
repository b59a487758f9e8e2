//! Worker-side stdio endpoint
//!
//! A worker process receives request frames on stdin and answers each with
//! exactly one response frame on stdout. Stdout carries nothing else;
//! diagnostics belong on stderr, which the daemon forwards into its own log.

use bytes::Bytes;
use tokio::io::{Stdin, Stdout};

use crate::error::IpcError;
use crate::framing::{read_frame, write_frame, DEFAULT_MAX_PAYLOAD_BYTES};

/// The worker-process end of the daemon↔worker dispatch protocol.
pub struct StdioEndpoint {
    stdin: Stdin,
    stdout: Stdout,
    max_payload: usize,
}

impl StdioEndpoint {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            stdin: tokio::io::stdin(),
            stdout: tokio::io::stdout(),
            max_payload,
        }
    }

    /// Receive the next request frame. `Ok(None)` means the daemon closed
    /// stdin and the worker should exit.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, IpcError> {
        read_frame(&mut self.stdin, self.max_payload).await
    }

    /// Send one response frame.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), IpcError> {
        write_frame(&mut self.stdout, payload).await
    }
}

impl Default for StdioEndpoint {
    fn default() -> Self {
        Self::new()
    }
}
