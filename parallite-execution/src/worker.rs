//! Worker process lifecycle and single-task execution

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use parallite_ipc::framing::{read_frame, write_frame};

use crate::error::ExecutionError;

/// Grace period between worker shutdown escalation steps.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How to launch executor processes.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Executor program path.
    pub program: PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
    /// Extra environment for workers (e.g. `CONFIG_PATH`).
    pub env: Vec<(String, String)>,
    /// Prefix for worker ids and, where the OS allows, process names.
    pub prefix: String,
    /// Frame payload ceiling on the worker's stdout.
    pub max_payload: usize,
    /// Grace period between shutdown escalation steps.
    pub shutdown_grace: Duration,
}

/// One spawned executor process and its captured stdio.
///
/// Whoever holds a `WorkerProcess` has exclusive use of its pipes; the pool
/// hands each instance to at most one dispatcher at a time. A worker that
/// fails any I/O is `broken` and must be recycled, never released.
#[derive(Debug)]
pub struct WorkerProcess {
    id: String,
    generation: u64,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    broken: bool,
    max_payload: usize,
    shutdown_grace: Duration,
    started_at: DateTime<Utc>,
    tasks_executed: u64,
}

impl WorkerProcess {
    /// Spawn one executor process with piped stdio.
    ///
    /// Stderr is forwarded line-by-line into the daemon log by a detached
    /// task that runs until the process closes it.
    pub async fn spawn(spec: &WorkerSpec, generation: u64) -> Result<Self, ExecutionError> {
        let id = format!("{}-{}", spec.prefix, generation);

        let mut std_command = std::process::Command::new(&spec.program);
        std_command.args(&spec.args);
        for (key, value) in &spec.env {
            std_command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_command.arg0(&id);
        }

        let mut command = Command::from(std_command);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| ExecutionError::SpawnFailed(format!("{}: {e}", spec.program.display())))?;
        let pid = child.id().unwrap_or_default();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::SpawnFailed("failed to capture worker stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::SpawnFailed("failed to capture worker stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::SpawnFailed("failed to capture worker stderr".into()))?;
        tokio::spawn(forward_stderr(id.clone(), stderr));

        debug!(worker = %id, pid, "worker spawned");
        Ok(Self {
            id,
            generation,
            pid,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout),
            broken: false,
            max_payload: spec.max_payload,
            shutdown_grace: spec.shutdown_grace,
            started_at: Utc::now(),
            tasks_executed: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed
    }

    /// Send one request frame and read the single response frame.
    ///
    /// Requests and responses are strictly paired on the worker's stdio; the
    /// caller must not pipeline. Any failure (write error, read error, EOF,
    /// oversized or malformed length) leaves the worker broken.
    pub async fn execute(&mut self, request: &[u8]) -> Result<Bytes, ExecutionError> {
        match self.execute_inner(request).await {
            Ok(frame) => {
                self.tasks_executed += 1;
                Ok(frame)
            }
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    async fn execute_inner(&mut self, request: &[u8]) -> Result<Bytes, ExecutionError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ExecutionError::WorkerIo("worker stdin already closed".into()))?;
        write_frame(stdin, request).await?;
        match read_frame(&mut self.stdout, self.max_payload).await? {
            Some(frame) => Ok(frame),
            None => Err(ExecutionError::WorkerExited),
        }
    }

    /// Ask the worker to exit, escalating: close stdin, wait one grace
    /// period, SIGTERM, wait another, then SIGKILL.
    pub async fn shutdown(mut self) {
        let uptime_ms = (Utc::now() - self.started_at).num_milliseconds();
        debug!(
            worker = %self.id,
            tasks = self.tasks_executed,
            uptime_ms,
            "stopping worker"
        );

        // Closing stdin is the exit request.
        drop(self.stdin.take());
        if self.wait_with_grace().await {
            debug!(worker = %self.id, "worker exited on stdin close");
            return;
        }

        #[cfg(unix)]
        {
            info!(worker = %self.id, "worker ignored stdin close, sending SIGTERM");
            send_signal(self.pid, nix::sys::signal::Signal::SIGTERM);
            if self.wait_with_grace().await {
                return;
            }
        }

        warn!(worker = %self.id, "worker unresponsive, killing");
        if let Err(e) = self.child.kill().await {
            warn!(worker = %self.id, error = %e, "failed to kill worker");
        }
    }

    /// Terminate immediately. Used when recycling: a worker with a pending
    /// or torn exchange cannot be shut down politely, because its response
    /// stream is in an unknown state.
    pub async fn kill(mut self) {
        debug!(worker = %self.id, "killing worker");
        if let Err(e) = self.child.kill().await {
            warn!(worker = %self.id, error = %e, "failed to kill worker");
        }
    }

    async fn wait_with_grace(&mut self) -> bool {
        matches!(
            tokio::time::timeout(self.shutdown_grace, self.child.wait()).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, error = %e, "signal delivery failed");
    }
}

/// Forward a worker's stderr into the daemon log, one line at a time.
async fn forward_stderr(id: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "parallite::worker_stderr", worker = %id, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(worker = %id, error = %e, "stderr read failed");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    fn spec(program: &str, args: &[&str]) -> WorkerSpec {
        WorkerSpec {
            program: PathBuf::from(program),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
            prefix: "test_worker".to_string(),
            max_payload: 64 * 1024,
            shutdown_grace: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn cat_echoes_one_frame_per_request() {
        // `cat` copies stdin to stdout, which at the frame level makes it a
        // perfect echo worker.
        let mut worker = WorkerProcess::spawn(&spec("cat", &[]), 0).await.unwrap();
        assert_eq!(worker.id(), "test_worker-0");
        assert!(worker.pid() > 0);

        let reply = worker.execute(b"first request").await.unwrap();
        assert_eq!(&reply[..], b"first request");
        let reply = worker.execute(b"second request").await.unwrap();
        assert_eq!(&reply[..], b"second request");

        assert!(!worker.is_broken());
        assert_eq!(worker.tasks_executed(), 2);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn early_exit_breaks_the_worker() {
        let mut worker = WorkerProcess::spawn(&spec("true", &[]), 0).await.unwrap();

        let err = worker.execute(b"anyone home?").await.unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::WorkerExited | ExecutionError::WorkerIo(_)
        ));
        assert!(worker.is_broken());
        worker.kill().await;
    }

    #[tokio::test]
    async fn spawn_of_missing_program_fails() {
        let err = WorkerProcess::spawn(&spec("/nonexistent/worker/binary", &[]), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::SpawnFailed(_)));
    }

    #[tokio::test]
    async fn shutdown_via_stdin_close_is_prompt() {
        let worker = WorkerProcess::spawn(&spec("cat", &[]), 0).await.unwrap();

        let started = Instant::now();
        worker.shutdown().await;
        // cat exits as soon as stdin closes, well inside one grace period.
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn shutdown_escalates_to_sigterm_for_stubborn_workers() {
        // `sleep` never reads stdin, so the stdin-close step is ignored and
        // shutdown has to escalate.
        let worker = WorkerProcess::spawn(&spec("sleep", &["30"]), 0).await.unwrap();
        let pid = worker.pid();

        let started = Instant::now();
        worker.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        assert!(!alive, "worker {pid} survived shutdown");
    }

    #[tokio::test]
    async fn kill_is_immediate() {
        let worker = WorkerProcess::spawn(&spec("sleep", &["30"]), 0).await.unwrap();
        let pid = worker.pid();

        let started = Instant::now();
        worker.kill().await;
        assert!(started.elapsed() < Duration::from_millis(400));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
        assert!(!alive, "worker {pid} survived kill");
    }

    #[tokio::test]
    async fn oversized_worker_response_breaks_the_worker() {
        let mut worker = WorkerProcess::spawn(&spec("cat", &[]), 0).await.unwrap();
        worker.max_payload = 8;

        let err = worker.execute(b"this frame is longer than eight").await.unwrap_err();
        assert!(matches!(err, ExecutionError::WorkerIo(_)));
        assert!(worker.is_broken());
        worker.kill().await;
    }
}
