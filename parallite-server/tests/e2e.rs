//! End-to-end scenarios against an in-process daemon
//!
//! Each test binds a real `Server` on a tempdir unix socket (or loopback
//! TCP), with `parallite-test-worker` as the executor program, and drives
//! it through the client wire protocol: one frame in, one frame out.

#![cfg(unix)]

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rmpv::Value;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use parallite_ipc::{
    encode_submission, read_frame, write_frame, Response, DEFAULT_MAX_PAYLOAD_BYTES,
};
use parallite_server::{Server, ServerConfig};

fn worker_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_parallite-test-worker"))
}

struct TestDaemon {
    socket: PathBuf,
    _dir: tempfile::TempDir,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<Result<(), parallite_server::ServerError>>,
}

async fn start_daemon(configure: impl FnOnce(&mut ServerConfig)) -> TestDaemon {
    let dir = tempfile::tempdir().expect("tempdir");
    let socket = dir.path().join("parallite.sock");
    let mut config = ServerConfig::new(socket.display().to_string(), worker_bin());
    config.fixed_workers = 1;
    config.timeout_ms = 5_000;
    configure(&mut config);

    let server = Server::bind(config).await.expect("daemon should bind");
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(server.run_with_shutdown(async move { signal.cancelled().await }));

    TestDaemon {
        socket,
        _dir: dir,
        shutdown,
        handle,
    }
}

impl TestDaemon {
    /// One full client exchange: connect, one frame out, one frame in.
    async fn submit_frame(&self, frame: &[u8]) -> Option<Bytes> {
        let mut stream = UnixStream::connect(&self.socket).await.expect("connect");
        write_frame(&mut stream, frame).await.expect("write frame");
        read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
            .await
            .expect("read frame")
    }

    async fn submit(&self, task_id: &str, command: &str) -> Response {
        let frame = encode_submission(task_id, command.as_bytes(), false);
        let raw = self
            .submit_frame(&frame)
            .await
            .expect("daemon should answer");
        Response::decode(&raw).expect("response should decode")
    }

    async fn worker_pid(&self, task_id: &str) -> u32 {
        let response = self.submit(task_id, "pid").await;
        assert!(response.ok, "pid probe failed: {:?}", response.error);
        response
            .result
            .as_ref()
            .and_then(Value::as_u64)
            .expect("pid result") as u32
    }

    async fn stop(self) -> PathBuf {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("daemon task")
            .expect("clean shutdown");
        self.socket
    }
}

fn assert_process_dead(pid: u32) {
    let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok();
    assert!(!alive, "worker process {pid} leaked");
}

// ── Scenario 1: echo single task ─────────────────────────────────────────

#[tokio::test]
async fn echo_single_task() {
    let daemon = start_daemon(|_| {}).await;

    let started = Instant::now();
    let response = daemon.submit("T1", "echo hello").await;
    assert!(started.elapsed() < Duration::from_millis(500));

    assert!(response.ok);
    assert_eq!(response.task_id, "T1");
    assert_eq!(response.result, Some(Value::from("hello")));
    assert!(response.error.is_none());

    daemon.stop().await;
}

// ── Scenario 2: parallelism across workers ───────────────────────────────

#[tokio::test]
async fn three_workers_run_in_parallel() {
    let daemon = start_daemon(|c| c.fixed_workers = 3).await;

    let started = Instant::now();
    let (r1, r2, r3) = tokio::join!(
        daemon.submit("T1", "sleep 500 T1"),
        daemon.submit("T2", "sleep 500 T2"),
        daemon.submit("T3", "sleep 500 T3"),
    );
    assert!(
        started.elapsed() < Duration::from_millis(1200),
        "tasks did not run in parallel"
    );

    for (response, expected) in [(&r1, "T1"), (&r2, "T2"), (&r3, "T3")] {
        assert!(response.ok);
        assert_eq!(response.task_id, expected);
        assert_eq!(response.result, Some(Value::from(expected)));
    }

    daemon.stop().await;
}

// ── Scenario 3: timeout recycles the worker ──────────────────────────────

#[tokio::test]
async fn timeout_recycles_the_worker() {
    let daemon = start_daemon(|c| {
        c.fixed_workers = 1;
        c.timeout_ms = 200;
    }).await;

    let pid_before = daemon.worker_pid("P1").await;

    let started = Instant::now();
    let response = daemon.submit("T1", "sleep 2000 late").await;
    assert!(started.elapsed() < Duration::from_millis(400));
    assert!(!response.ok);
    assert_eq!(response.task_id, "T1");
    assert_eq!(
        response.error.as_deref(),
        Some("task timed out after 200 ms")
    );

    // The next task runs on a fresh process.
    let started = Instant::now();
    let pid_after = daemon.worker_pid("T2").await;
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_ne!(pid_after, pid_before, "timed-out worker was reused");

    daemon.stop().await;
    assert_process_dead(pid_before);
    assert_process_dead(pid_after);
}

// ── Scenario 4: crash recycles the worker ────────────────────────────────

#[tokio::test]
async fn crash_recycles_the_worker() {
    let daemon = start_daemon(|c| c.fixed_workers = 2).await;

    let response = daemon.submit("T1", "exit 3").await;
    assert!(!response.ok);
    assert_eq!(response.task_id, "T1");
    assert!(response.error.unwrap().contains("worker"));

    let response = daemon.submit("T2", "echo ok").await;
    assert!(response.ok);
    assert_eq!(response.result, Some(Value::from("ok")));

    daemon.stop().await;
}

#[tokio::test]
async fn malformed_worker_response_fails_the_task_only() {
    let daemon = start_daemon(|_| {}).await;

    let response = daemon.submit("T1", "garbage").await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("worker execute failed"));

    let response = daemon.submit("T2", "echo fine").await;
    assert!(response.ok);

    daemon.stop().await;
}

// ── Scenario 5: oversized frames ─────────────────────────────────────────

#[tokio::test]
async fn oversized_frame_closes_without_response() {
    let daemon = start_daemon(|c| c.max_payload_bytes = 1024).await;

    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let mut oversized = Vec::with_capacity(4 + 2048);
    oversized.extend_from_slice(&2048u32.to_be_bytes());
    oversized.extend_from_slice(&[0u8; 2048]);
    // The daemon may close mid-write; that is part of the contract.
    let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, &oversized).await;

    let reply = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES).await;
    assert!(matches!(reply, Ok(None) | Err(_)), "expected a silent close");
    drop(stream);

    // The daemon is unharmed and no worker was consumed.
    let response = daemon.submit("T1", "echo alive").await;
    assert!(response.ok);

    daemon.stop().await;
}

#[tokio::test]
async fn frame_at_exactly_the_limit_is_accepted() {
    const LIMIT: usize = 1024;
    let daemon = start_daemon(|c| c.max_payload_bytes = LIMIT).await;

    // Grow the echo text until the encoded envelope hits the limit on the
    // nose; the size classes stabilize after a couple of rounds.
    let mut text_len = 900usize;
    let mut frame = Bytes::new();
    for _ in 0..8 {
        let command = format!("echo {}", "x".repeat(text_len));
        frame = encode_submission("T1", command.as_bytes(), false);
        match frame.len().cmp(&LIMIT) {
            std::cmp::Ordering::Equal => break,
            _ => {
                text_len = text_len + LIMIT - frame.len();
            }
        }
    }
    assert_eq!(frame.len(), LIMIT, "could not pad the envelope to the limit");

    let raw = daemon.submit_frame(&frame).await.expect("should answer");
    let response = Response::decode(&raw).unwrap();
    assert!(response.ok);
    assert_eq!(
        response.result.and_then(|v| v.as_str().map(str::len)),
        Some(text_len)
    );

    daemon.stop().await;
}

// ── Scenario 6: graceful shutdown under load ─────────────────────────────

#[tokio::test]
async fn graceful_shutdown_under_load() {
    let daemon = start_daemon(|c| c.fixed_workers = 2).await;

    let pid_a = daemon.worker_pid("P1").await;
    let pid_b = daemon.worker_pid("P2").await;
    assert_ne!(pid_a, pid_b);

    let mut submissions = Vec::new();
    for i in 0..10 {
        let socket = daemon.socket.clone();
        submissions.push(tokio::spawn(async move {
            let task_id = format!("T{i}");
            let frame = encode_submission(&task_id, format!("sleep 100 T{i}").as_bytes(), false);
            let mut stream = UnixStream::connect(&socket).await.expect("connect");
            write_frame(&mut stream, &frame).await.expect("write");
            let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
                .await
                .expect("read")
                .expect("one response per accepted submission");
            (task_id, Response::decode(&raw).expect("decode"))
        }));
    }

    // Let every connection get accepted and a few tasks finish, then pull
    // the plug mid-flight.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let socket = daemon.stop().await;

    let mut completed = 0;
    let mut refused = 0;
    for submission in submissions {
        let (task_id, response) = submission.await.expect("client task");
        assert_eq!(response.task_id, task_id);
        if response.ok {
            assert_eq!(response.result, Some(Value::from(task_id.as_str())));
            completed += 1;
        } else {
            assert_eq!(response.error.as_deref(), Some("daemon shutting down"));
            refused += 1;
        }
    }
    assert_eq!(completed + refused, 10);
    assert!(completed > 0, "nothing finished before shutdown");

    assert!(!socket.exists(), "socket file was not unlinked");
    assert_process_dead(pid_a);
    assert_process_dead(pid_b);
}

// ── Boundary behaviors ───────────────────────────────────────────────────

#[tokio::test]
async fn single_worker_serializes_concurrent_clients() {
    let daemon = start_daemon(|c| c.fixed_workers = 1).await;

    let started = Instant::now();
    let mut clients = Vec::new();
    for _ in 0..5 {
        let socket = daemon.socket.clone();
        let task_id = format!("T-{}", Uuid::new_v4());
        clients.push(tokio::spawn(async move {
            let frame = encode_submission(&task_id, b"sleep 50 done", false);
            let mut stream = UnixStream::connect(&socket).await.expect("connect");
            write_frame(&mut stream, &frame).await.expect("write");
            let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
                .await
                .expect("read")
                .expect("response");
            (task_id, Response::decode(&raw).expect("decode"))
        }));
    }

    for client in clients {
        let (task_id, response) = client.await.expect("client task");
        assert!(response.ok, "task {task_id} failed: {:?}", response.error);
        assert_eq!(response.task_id, task_id);
    }
    // One worker, five 50 ms tasks: strictly serial.
    assert!(started.elapsed() >= Duration::from_millis(250));

    daemon.stop().await;
}

#[tokio::test]
async fn waiting_task_gets_shutdown_error_when_drain_begins() {
    let daemon = start_daemon(|c| c.fixed_workers = 1).await;

    let busy = {
        let socket = daemon.socket.clone();
        tokio::spawn(async move {
            let frame = encode_submission("T1", b"sleep 600 done", false);
            let mut stream = UnixStream::connect(&socket).await.expect("connect");
            write_frame(&mut stream, &frame).await.expect("write");
            let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
                .await
                .expect("read")
                .expect("response");
            Response::decode(&raw).expect("decode")
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // T2 queues behind the only worker, then shutdown begins.
    let waiting = {
        let socket = daemon.socket.clone();
        tokio::spawn(async move {
            let frame = encode_submission("T2", b"echo never", false);
            let mut stream = UnixStream::connect(&socket).await.expect("connect");
            write_frame(&mut stream, &frame).await.expect("write");
            let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
                .await
                .expect("read")
                .expect("response");
            Response::decode(&raw).expect("decode")
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stop = tokio::spawn(daemon.stop());

    let busy = busy.await.expect("busy client");
    assert!(busy.ok, "in-flight task should finish inside the drain window");
    assert_eq!(busy.result, Some(Value::from("done")));

    let waiting = waiting.await.expect("waiting client");
    assert!(!waiting.ok);
    assert_eq!(waiting.error.as_deref(), Some("daemon shutting down"));

    stop.await.expect("stop");
}

#[tokio::test]
async fn benchmark_map_is_forwarded_verbatim() {
    let daemon = start_daemon(|_| {}).await;

    let frame = encode_submission("T1", b"sleep 30 timed", true);
    let raw = daemon.submit_frame(&frame).await.expect("response");
    let response = Response::decode(&raw).unwrap();

    assert!(response.ok);
    let benchmark = response.benchmark.expect("benchmark map");
    let duration = benchmark
        .as_map()
        .and_then(|entries| {
            entries
                .iter()
                .find(|(k, _)| k.as_str() == Some("duration_ms"))
                .and_then(|(_, v)| v.as_u64())
        })
        .expect("duration_ms");
    assert!(duration >= 30);

    daemon.stop().await;
}

#[tokio::test]
async fn unknown_worker_command_is_a_task_level_failure() {
    let daemon = start_daemon(|_| {}).await;

    // The worker answers ok=false itself; the daemon passes it through and
    // keeps the worker.
    let response = daemon.submit("T1", "frobnicate").await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("unknown command"));

    let pid_1 = daemon.worker_pid("P1").await;
    let response = daemon.submit("T2", "frobnicate again").await;
    assert!(!response.ok);
    let pid_2 = daemon.worker_pid("P2").await;
    assert_eq!(pid_1, pid_2, "task-level failure must not recycle the worker");

    daemon.stop().await;
}

#[tokio::test]
async fn tcp_endpoint_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::new("127.0.0.1:0", worker_bin());
    config.fixed_workers = 1;
    config.config_path = Some(dir.path().join("app.conf"));

    let server = Server::bind(config).await.expect("bind tcp");
    let addr = server.bound_addr();
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(server.run_with_shutdown(async move { signal.cancelled().await }));

    let mut stream = tokio::net::TcpStream::connect(&addr).await.expect("connect");
    write_frame(&mut stream, &encode_submission("T1", b"echo over-tcp", false))
        .await
        .unwrap();
    let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
        .await
        .unwrap()
        .expect("response");
    let response = Response::decode(&raw).unwrap();
    assert!(response.ok);
    assert_eq!(response.result, Some(Value::from("over-tcp")));

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn stale_socket_is_replaced_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("parallite.sock");

    // A previous daemon died without cleanup.
    drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
    assert!(socket.exists());

    let mut config = ServerConfig::new(socket.display().to_string(), worker_bin());
    config.fixed_workers = 1;
    let server = Server::bind(config).await.expect("stale socket should be unlinked");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let handle = tokio::spawn(server.run_with_shutdown(async move { signal.cancelled().await }));

    let mut stream = UnixStream::connect(&socket).await.expect("connect");
    write_frame(&mut stream, &encode_submission("T1", b"echo revived", false))
        .await
        .unwrap();
    let raw = read_frame(&mut stream, DEFAULT_MAX_PAYLOAD_BYTES)
        .await
        .unwrap()
        .expect("response");
    assert!(Response::decode(&raw).unwrap().ok);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn missing_worker_program_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("parallite.sock");
    let config = ServerConfig::new(
        socket.display().to_string(),
        "/definitely/not/a/worker/binary",
    );

    let err = Server::bind(config).await.unwrap_err();
    assert!(err.to_string().contains("worker program not found"));
}

#[test]
fn version_flag_prints_a_semver_string() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_parallited"))
        .arg("--version")
        .output()
        .expect("run parallited --version");
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    let version = text.trim().trim_start_matches('v');
    let parts: Vec<&str> = version.split('.').collect();
    assert_eq!(parts.len(), 3, "expected MAJOR.MINOR.PATCH, got {text:?}");
    for part in parts {
        part.parse::<u64>().expect("numeric version component");
    }
}
