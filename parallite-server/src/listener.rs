//! Local endpoint binding and per-connection handling
//!
//! Each accepted connection carries exactly one submission frame and gets
//! exactly one response frame back, after which the daemon closes it.
//! Connections are handled on independent tasks so a slow client never
//! blocks another client or the dispatcher.

use std::net::IpAddr;
#[cfg(unix)]
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use parallite_ipc::{encode_failure, read_frame, write_frame, Submission};

use parallite_execution::Executor;

use crate::error::ServerError;

/// Consecutive ports tried when a TCP endpoint is already in use. Clients
/// probe the same sequence, so the bound port stays discoverable.
pub const TCP_BIND_ATTEMPTS: u16 = 128;

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path (any path ending in `.sock`).
    #[cfg(unix)]
    Unix(PathBuf),
    /// Loopback TCP address.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an endpoint address: a path ending in `.sock` is a Unix
    /// socket; anything else must be a loopback `host:port`.
    pub fn parse(addr: &str) -> Result<Self, ServerError> {
        let invalid = |reason: &str| ServerError::InvalidEndpoint {
            addr: addr.to_string(),
            reason: reason.to_string(),
        };

        if addr.ends_with(".sock") {
            #[cfg(unix)]
            return Ok(Endpoint::Unix(PathBuf::from(addr)));
            #[cfg(not(unix))]
            return Err(invalid("unix socket paths are not supported on this host"));
        }

        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected a *.sock path or host:port"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| invalid("port is not a number"))?;
        let is_loopback = host == "localhost"
            || host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false);
        if !is_loopback {
            return Err(invalid("TCP endpoints must be loopback addresses"));
        }
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

/// A bound local endpoint accepting one-shot connections.
#[derive(Debug)]
pub enum BoundListener {
    #[cfg(unix)]
    Unix {
        listener: UnixListener,
        path: PathBuf,
    },
    Tcp {
        listener: TcpListener,
    },
}

/// One accepted client connection, unix or TCP.
pub trait ClientStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> ClientStream for T {}

impl BoundListener {
    /// Bind the endpoint. A stale unix socket (no daemon answering) is
    /// unlinked first; a busy TCP port is scanned forward up to
    /// [`TCP_BIND_ATTEMPTS`].
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, ServerError> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let listener = bind_unix(path).await?;
                info!(path = %path.display(), "listening on unix socket");
                Ok(BoundListener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp { host, port } => {
                let listener = bind_tcp(host, *port).await?;
                info!(addr = %listener.local_addr()?, "listening on tcp");
                Ok(BoundListener::Tcp { listener })
            }
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> std::io::Result<Box<dyn ClientStream>> {
        match self {
            #[cfg(unix)]
            BoundListener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            BoundListener::Tcp { listener } => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }

    /// The address actually bound, in the same form `Endpoint::parse`
    /// accepts. TCP callers need this because of port scanning.
    pub fn bound_addr(&self) -> String {
        match self {
            #[cfg(unix)]
            BoundListener::Unix { path, .. } => path.display().to_string(),
            BoundListener::Tcp { listener } => listener
                .local_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_default(),
        }
    }

    /// Stop accepting: drops the listening socket (freeing the TCP port)
    /// and hands back the deferred unlink step for the unix socket path.
    pub fn into_cleanup(self) -> EndpointCleanup {
        match self {
            #[cfg(unix)]
            BoundListener::Unix { listener, path } => {
                drop(listener);
                EndpointCleanup {
                    unix_path: Some(path),
                }
            }
            BoundListener::Tcp { listener } => {
                drop(listener);
                EndpointCleanup { unix_path: None }
            }
        }
    }
}

/// Deferred endpoint release: the unix socket path is unlinked only after
/// the drain completes, as the last step of shutdown.
pub struct EndpointCleanup {
    unix_path: Option<PathBuf>,
}

impl EndpointCleanup {
    pub fn run(self) {
        if let Some(path) = self.unix_path {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to unlink socket");
            } else {
                debug!(path = %path.display(), "socket unlinked");
            }
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &Path) -> Result<UnixListener, ServerError> {
    if path.exists() {
        // A live daemon answers connects; a stale path from a dead one
        // refuses them and is safe to unlink.
        match UnixStream::connect(path).await {
            Ok(_) => return Err(ServerError::EndpointBusy(path.display().to_string())),
            Err(_) => {
                info!(path = %path.display(), "unlinking stale socket");
                std::fs::remove_file(path)?;
            }
        }
    }
    UnixListener::bind(path).map_err(|source| ServerError::Bind {
        addr: path.display().to_string(),
        source,
    })
}

async fn bind_tcp(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..TCP_BIND_ATTEMPTS {
        let Some(candidate) = port.checked_add(attempt) else {
            break;
        };
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                if attempt > 0 {
                    info!(requested = port, bound = candidate, "port busy, scanned forward");
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                last_err = Some(e);
            }
            Err(e) => {
                return Err(ServerError::Bind {
                    addr: format!("{host}:{candidate}"),
                    source: e,
                })
            }
        }
    }
    Err(ServerError::Bind {
        addr: format!("{host}:{port}"),
        source: last_err
            .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::AddrInUse, "no free port")),
    })
}

/// Serve one connection: one submission frame in, one response frame out.
///
/// Framing errors, oversized frames, and undecodable envelopes close the
/// connection; when the submission got far enough to recover a task id, a
/// best-effort error response goes out first.
pub async fn handle_connection(
    mut stream: Box<dyn ClientStream>,
    executor: Arc<dyn Executor>,
    max_payload: usize,
) {
    let frame = match read_frame(&mut stream, max_payload).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return, // connected and left without a frame
        Err(e) => {
            debug!(error = %e, "closing connection on framing error");
            return;
        }
    };

    let submission = match Submission::decode(frame) {
        Ok(submission) => submission,
        Err(e) => {
            debug!(error = %e, "rejecting malformed submission");
            if let Some(task_id) = e.recovered_task_id() {
                let response = encode_failure(task_id, &format!("invalid submission: {e}"));
                let _ = write_frame(&mut stream, &response).await;
            }
            return;
        }
    };

    let task_id = submission.task_id().to_owned();
    let response = executor.dispatch(submission).await;
    if let Err(e) = write_frame(&mut stream, &response).await {
        // The client went away; the task was not cancelled and its result
        // is discarded.
        debug!(task_id = %task_id, error = %e, "client disconnected before response");
    }
}
