//! Daemon lifecycle: startup, signals, drain, shutdown

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use parallite_execution::{
    resolve_capacity, Dispatcher, Executor, TaskRegistry, WorkerPool, WorkerSpec,
    DEFAULT_SHUTDOWN_GRACE,
};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::listener::{handle_connection, BoundListener, Endpoint};

/// Environment variable carrying the opaque config path into workers.
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

/// The assembled daemon.
///
/// [`Server::bind`] performs the whole startup sequence short of accepting:
/// capacity resolution, worker pre-spawn, endpoint bind. Once it returns,
/// the endpoint is connectable, which is how clients observe readiness.
pub struct Server {
    config: ServerConfig,
    pool: WorkerPool,
    registry: Arc<TaskRegistry>,
    executor: Arc<dyn Executor>,
    listener: BoundListener,
    /// Cancelled by signals or by the dispatcher under `fail_mode = stop`.
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        // A mistyped worker program should fail startup, not every task.
        let program = &config.worker_program;
        let pathlike = program
            .to_string_lossy()
            .contains(std::path::MAIN_SEPARATOR);
        if pathlike && !program.exists() {
            return Err(ServerError::WorkerProgramMissing(
                program.display().to_string(),
            ));
        }

        let capacity = resolve_capacity(config.fixed_workers);
        let mut env = Vec::new();
        if let Some(path) = &config.config_path {
            env.push((CONFIG_PATH_ENV.to_string(), path.display().to_string()));
        }
        let spec = WorkerSpec {
            program: config.worker_program.clone(),
            args: config.worker_args.clone(),
            env,
            prefix: config.prefix_name.clone(),
            max_payload: config.max_payload_bytes,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        };

        let pool = WorkerPool::new(spec, capacity);
        if config.fixed_workers > 0 {
            pool.prespawn(config.fixed_workers).await?;
        }

        let registry = TaskRegistry::new(config.timeout());
        let shutdown = CancellationToken::new();
        let executor: Arc<dyn Executor> = Arc::new(Dispatcher::new(
            pool.clone(),
            Arc::clone(&registry),
            config.fail_mode,
            shutdown.clone(),
        ));

        let listener = BoundListener::bind(&Endpoint::parse(&config.socket)?).await?;
        info!(
            endpoint = %listener.bound_addr(),
            capacity,
            timeout_ms = config.timeout_ms,
            fail_mode = %config.fail_mode,
            "daemon ready"
        );

        Ok(Self {
            config,
            pool,
            registry,
            executor,
            listener,
            shutdown,
        })
    }

    /// The address actually bound, in the same form `--socket` accepts.
    pub fn bound_addr(&self) -> String {
        self.listener.bound_addr()
    }

    /// Accept connections until `signal` completes (or a `fail_mode = stop`
    /// worker failure), then run the shutdown sequence. Returns after a
    /// clean shutdown.
    pub async fn run_with_shutdown<F>(self, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            config,
            pool,
            registry,
            executor,
            listener,
            shutdown,
        } = self;

        // Periodic occupancy snapshot for operators reading the log.
        let snapshot = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let counts = pool.counts();
                    debug!(
                        idle = counts.idle,
                        leased = counts.leased,
                        live = counts.live,
                        "pool snapshot"
                    );
                }
            })
        };

        let connections = TaskTracker::new();
        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    shutdown.cancel();
                    break;
                }
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => {
                        connections.spawn(handle_connection(
                            stream,
                            Arc::clone(&executor),
                            config.max_payload_bytes,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        info!("shutdown initiated");
        snapshot.abort();

        // Accepting stops first; the socket path stays on disk until the
        // drain completes.
        let cleanup = listener.into_cleanup();

        // New work is refused from here on; tasks already registered keep
        // running until they resolve or their deadlines fire. Dispatchers
        // still waiting for a worker fail over to shutdown responses now.
        registry.close();
        pool.close();

        // Connections drain within a bounded window; each one ends as soon
        // as its task resolves and the response frame is written.
        connections.close();
        if tokio::time::timeout(config.drain_timeout(), connections.wait())
            .await
            .is_err()
        {
            warn!(
                pending_tasks = registry.pending_count(),
                "drain window elapsed with connections outstanding"
            );
        }

        pool.shutdown(config.drain_timeout()).await;
        cleanup.run();
        info!("shutdown complete");
        Ok(())
    }
}

/// Resolves when TERM or INT arrives.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
