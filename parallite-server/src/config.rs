//! Daemon configuration

use std::path::PathBuf;
use std::time::Duration;

use parallite_execution::FailMode;
use parallite_ipc::DEFAULT_MAX_PAYLOAD_BYTES;

/// Default per-task deadline in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default prefix for worker ids and process names.
pub const DEFAULT_PREFIX_NAME: &str = "parallite_worker";

/// Default bound on the shutdown drain window in milliseconds.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Resolved daemon configuration; flag parsing happens in the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Endpoint address: a `*.sock` path or a loopback `host:port`.
    pub socket: String,
    /// Opaque configuration path, exported to workers as `CONFIG_PATH`.
    pub config_path: Option<PathBuf>,
    /// Per-task deadline in milliseconds.
    pub timeout_ms: u64,
    /// Fixed pool size; 0 selects one worker per CPU.
    pub fixed_workers: usize,
    /// Prefix for worker ids and process names.
    pub prefix_name: String,
    /// Policy after a worker failure.
    pub fail_mode: FailMode,
    /// Frame payload ceiling in bytes, on every stream.
    pub max_payload_bytes: usize,
    /// Executor program spawned for each worker.
    pub worker_program: PathBuf,
    /// Arguments passed to every worker.
    pub worker_args: Vec<String>,
    /// Bound on the shutdown drain window in milliseconds.
    pub drain_timeout_ms: u64,
}

impl ServerConfig {
    /// Configuration with spec defaults for everything optional.
    pub fn new(socket: impl Into<String>, worker_program: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            config_path: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            fixed_workers: 0,
            prefix_name: DEFAULT_PREFIX_NAME.to_string(),
            fail_mode: FailMode::default(),
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            worker_program: worker_program.into(),
            worker_args: Vec::new(),
            drain_timeout_ms: DEFAULT_DRAIN_TIMEOUT_MS,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
