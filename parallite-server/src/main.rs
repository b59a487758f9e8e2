//! parallited: the parallite execution daemon

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use parallite_execution::FailMode;
use parallite_ipc::DEFAULT_MAX_PAYLOAD_BYTES;
use parallite_server::config::{
    ServerConfig, DEFAULT_DRAIN_TIMEOUT_MS, DEFAULT_PREFIX_NAME, DEFAULT_TIMEOUT_MS,
};
use parallite_server::{shutdown_signal, Server};

#[derive(Parser)]
#[command(name = "parallited", about = "Broker local task submissions onto a pool of executor processes", disable_version_flag = true)]
struct Cli {
    /// Opaque configuration path, exported to workers as CONFIG_PATH
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Endpoint address: a *.sock path or a loopback host:port
    #[arg(long, value_name = "ADDR")]
    socket: Option<String>,

    /// Per-task deadline in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Fixed worker count; 0 sizes the pool to the CPU count
    #[arg(long, default_value_t = 0)]
    fixed_workers: usize,

    /// Prefix for worker ids and process names
    #[arg(long, default_value = DEFAULT_PREFIX_NAME)]
    prefix_name: String,

    /// Worker-failure policy: continue serving, or stop the daemon
    #[arg(long, default_value_t = FailMode::Continue)]
    fail_mode: FailMode,

    /// Frame payload ceiling in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD_BYTES)]
    max_payload_bytes: usize,

    /// Executor program spawned for each worker
    #[arg(long, value_name = "PATH")]
    worker_program: Option<PathBuf>,

    /// Argument passed to every worker (repeatable)
    #[arg(long = "worker-arg", value_name = "ARG")]
    worker_args: Vec<String>,

    /// Bound on the shutdown drain window in milliseconds
    #[arg(long, default_value_t = DEFAULT_DRAIN_TIMEOUT_MS)]
    drain_timeout_ms: u64,

    /// Print the daemon version and exit
    #[arg(long)]
    version: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (socket, worker_program) = match (cli.socket, cli.worker_program) {
        (Some(socket), Some(worker_program)) => (socket, worker_program),
        _ => {
            eprintln!("error: --socket and --worker-program are required");
            return ExitCode::FAILURE;
        }
    };

    let mut config = ServerConfig::new(socket, worker_program);
    config.config_path = cli.config;
    config.timeout_ms = cli.timeout_ms;
    config.fixed_workers = cli.fixed_workers;
    config.prefix_name = cli.prefix_name;
    config.fail_mode = cli.fail_mode;
    config.max_payload_bytes = cli.max_payload_bytes;
    config.worker_args = cli.worker_args;
    config.drain_timeout_ms = cli.drain_timeout_ms;

    let server = match Server::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            return ExitCode::FAILURE;
        }
    };

    match server.run_with_shutdown(shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}
