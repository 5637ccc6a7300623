//! TCP file server.
//!
//! The accept loop hands each connection to a bounded pool and is the only
//! writer of [`ServerStats`]:
//!
//! - [`ExecutorKind::Thread`]: connections run as tasks on this runtime,
//!   gated by a [`WorkerPool`] (size 0 serves connections inline).
//! - [`ExecutorKind::Process`]: `workers` child processes share the port via
//!   `SO_REUSEPORT` and report one outcome line per connection; see
//!   [`prefork`].
//!
//! Shutdown is an explicit future. After it resolves no new connections are
//! accepted and in-flight work gets `shutdown_grace` to finish.

pub mod connection;
pub mod prefork;

use crate::pool::{ExecutorKind, PoolError, ProcessError, WorkerPool, WorkerProcess};
use crate::protocol::{Dispatcher, Status};
use crate::storage::{Storage, StorageError};
use connection::{serve_connection, ConnectionOptions, ConnectionOutcome};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub use connection::{ConnState, Connection};
pub use prefork::{ServeWorkerArgs, Supervisor};

/// Server settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen: String,
    pub workers: usize,
    pub executor: ExecutorKind,
    pub storage_dir: PathBuf,
    pub connection: ConnectionOptions,
    /// Connections allowed to wait beyond `workers` (None = unbounded)
    pub queue_limit: Option<usize>,
    pub shutdown_grace: Duration,
    pub backlog: i32,
    /// Program run for process workers (defaults to the current executable)
    pub worker_program: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:6677".to_string(),
            workers: 1,
            executor: ExecutorKind::Thread,
            storage_dir: PathBuf::from("server_files"),
            connection: ConnectionOptions::default(),
            queue_limit: None,
            shutdown_grace: Duration::from_secs(10),
            backlog: 50,
            worker_program: None,
        }
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Resolve(String),
    Bind(io::Error),
    Storage(StorageError),
    Worker(ProcessError),
    /// A worker process did not report readiness
    WorkerNotReady(String),
    Output(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(addr) => write!(f, "Cannot resolve listen address '{}'", addr),
            ServerError::Bind(e) => write!(f, "Failed to bind listener: {}", e),
            ServerError::Storage(e) => write!(f, "Storage error: {}", e),
            ServerError::Worker(e) => write!(f, "{}", e),
            ServerError::WorkerNotReady(msg) => write!(f, "Worker process not ready: {}", msg),
            ServerError::Output(e) => write!(f, "Failed to report outcome: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<StorageError> for ServerError {
    fn from(e: StorageError) -> Self {
        ServerError::Storage(e)
    }
}

/// Connection tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Connections that received a response
    pub succeeded: usize,
    /// Connections that failed in transport
    pub failed: usize,
    /// Served connections whose response was ERROR
    pub error_responses: usize,
    /// Connections abandoned at shutdown
    pub interrupted: usize,
}

impl ServerStats {
    pub fn record(&mut self, outcome: &ConnectionOutcome) {
        match outcome {
            ConnectionOutcome::Served { status } => {
                self.succeeded += 1;
                if *status == Status::Error {
                    self.error_responses += 1;
                }
            }
            ConnectionOutcome::Failed { .. } => self.failed += 1,
        }
    }

    fn record_joined(&mut self, result: Result<ConnectionOutcome, PoolError>) {
        match result {
            Ok(outcome) => self.record(&outcome),
            Err(PoolError::Cancelled) => self.interrupted += 1,
            Err(e) => {
                error!(error = %e, "Connection task lost");
                self.failed += 1;
            }
        }
    }
}

/// Resolve a listen address to its first socket address.
pub async fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|_| ServerError::Resolve(addr.to_string()))?
        .next()
        .ok_or_else(|| ServerError::Resolve(addr.to_string()))
}

fn new_socket(addr: SocketAddr, reuse_port: bool) -> io::Result<socket2::Socket> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    set_reuse_port(&socket, reuse_port)?;
    socket.set_reuse_address(true)?;
    Ok(socket)
}

#[cfg(unix)]
fn set_reuse_port(socket: &socket2::Socket, enabled: bool) -> io::Result<()> {
    if enabled {
        socket.set_reuse_port(true)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_reuse_port(_socket: &socket2::Socket, _enabled: bool) -> io::Result<()> {
    Ok(())
}

/// Non-blocking listener with the given backlog.
pub(crate) fn create_listener(
    addr: SocketAddr,
    backlog: i32,
    reuse_port: bool,
) -> io::Result<std::net::TcpListener> {
    let socket = new_socket(addr, reuse_port)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Bound but not listening socket holding a port for process workers.
fn reserve_port(addr: SocketAddr) -> io::Result<(socket2::Socket, SocketAddr)> {
    let socket = new_socket(addr, true)?;
    socket.bind(&addr.into())?;
    let local = socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet address"))?;
    Ok((socket, local))
}

enum Backend {
    Pool(TcpListener),
    Prefork {
        supervisor: Supervisor,
        _reservation: socket2::Socket,
    },
}

/// A bound server, ready to run.
pub struct Server {
    options: ServerOptions,
    dispatcher: Dispatcher,
    local_addr: SocketAddr,
    backend: Backend,
}

impl Server {
    /// Open storage and bind the listen address.
    ///
    /// With the process executor this also starts the worker processes and
    /// waits until each one is accepting.
    pub async fn bind(options: ServerOptions) -> Result<Self, ServerError> {
        let storage = Storage::new(&options.storage_dir)?;
        let dispatcher = Dispatcher::new(storage);
        let addr = resolve(&options.listen).await?;

        let (local_addr, backend) = match options.executor {
            ExecutorKind::Thread => {
                let listener = create_listener(addr, options.backlog, false)
                    .and_then(TcpListener::from_std)
                    .map_err(ServerError::Bind)?;
                let local = listener.local_addr().map_err(ServerError::Bind)?;
                (local, Backend::Pool(listener))
            }
            ExecutorKind::Process => {
                let (reservation, local) = reserve_port(addr).map_err(ServerError::Bind)?;
                let worker = match &options.worker_program {
                    Some(program) => WorkerProcess::new(program),
                    None => WorkerProcess::current_exe()
                        .map_err(|e| ServerError::Worker(ProcessError::Spawn(e)))?,
                };
                let args = ServeWorkerArgs::new(local, &options);
                let supervisor = Supervisor::spawn(options.workers.max(1), &worker, &args).await?;
                (
                    local,
                    Backend::Prefork {
                        supervisor,
                        _reservation: reservation,
                    },
                )
            }
        };

        info!(
            address = %local_addr,
            workers = options.workers,
            executor = %options.executor,
            "Server active"
        );
        Ok(Self {
            options,
            dispatcher,
            local_addr,
            backend,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` resolves, then drain.
    pub async fn run<F>(self, shutdown: F) -> ServerStats
    where
        F: Future<Output = ()>,
    {
        let stats = match self.backend {
            Backend::Pool(listener) => {
                accept_loop(listener, self.dispatcher, &self.options, shutdown).await
            }
            Backend::Prefork { supervisor, .. } => {
                supervisor.run(shutdown, self.options.shutdown_grace).await
            }
        };

        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            error_responses = stats.error_responses,
            interrupted = stats.interrupted,
            "Final stats"
        );
        stats
    }
}

async fn accept_loop<F>(
    listener: TcpListener,
    dispatcher: Dispatcher,
    options: &ServerOptions,
    shutdown: F,
) -> ServerStats
where
    F: Future<Output = ()>,
{
    let mut stats = ServerStats::default();
    let mut pool: WorkerPool<ConnectionOutcome> = WorkerPool::new(options.workers);
    let connection_options = Arc::new(options.connection.clone());
    let queue_bound = options.queue_limit.map(|limit| options.workers + limit);

    tokio::pin!(shutdown);

    loop {
        while let Some(outcome) = pool.take_ready() {
            stats.record(&outcome);
        }

        let saturated = !pool.is_sequential()
            && queue_bound.map_or(false, |bound| pool.in_flight() >= bound);
        if saturated {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(result) = pool.join_next() => stats.record_joined(result),
            }
            continue;
        }

        tokio::select! {
            _ = &mut shutdown => break,
            Some(result) = pool.join_next(), if pool.in_flight() > 0 => {
                stats.record_joined(result);
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "New connection");
                    let dispatcher = dispatcher.clone();
                    let connection_options = Arc::clone(&connection_options);
                    let serve = async move {
                        serve_connection(stream, peer, &dispatcher, &connection_options).await
                    };
                    if !pool.is_sequential() {
                        pool.submit(serve).await;
                    } else if serve_inline(
                        serve,
                        &mut shutdown,
                        options.shutdown_grace,
                        &mut stats,
                    )
                    .await
                    {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            },
        }
    }

    info!(in_flight = pool.in_flight(), "Shutting down server");
    drop(listener);

    let drain = async {
        while let Some(result) = pool.join_next().await {
            stats.record_joined(result);
        }
    };
    if tokio::time::timeout(options.shutdown_grace, drain).await.is_err() {
        warn!(
            remaining = pool.in_flight(),
            "Shutdown grace expired, abandoning connections"
        );
        pool.abort_all();
        while let Some(result) = pool.join_next().await {
            stats.record_joined(result);
        }
    }
    stats
}

/// Serve one connection on the accept loop while watching for shutdown.
///
/// Returns true when shutdown resolved; the connection then gets `grace` to
/// finish and is counted as interrupted otherwise.
async fn serve_inline<S, F>(
    serve: S,
    shutdown: F,
    grace: Duration,
    stats: &mut ServerStats,
) -> bool
where
    S: Future<Output = ConnectionOutcome>,
    F: Future<Output = ()> + Unpin,
{
    tokio::pin!(serve);
    tokio::select! {
        outcome = &mut serve => {
            stats.record(&outcome);
            false
        }
        _ = shutdown => {
            info!(in_flight = 1, "Shutting down server");
            match tokio::time::timeout(grace, serve).await {
                Ok(outcome) => stats.record(&outcome),
                Err(_) => {
                    warn!(remaining = 1, "Shutdown grace expired, abandoning connections");
                    stats.record_joined(Err(PoolError::Cancelled));
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_record() {
        let mut stats = ServerStats::default();
        stats.record(&ConnectionOutcome::Served { status: Status::Ok });
        stats.record(&ConnectionOutcome::Served {
            status: Status::Error,
        });
        stats.record(&ConnectionOutcome::Failed {
            stage: ConnState::Receiving,
            error: "Incomplete message".to_string(),
        });
        stats.record_joined(Err(PoolError::Cancelled));
        stats.record_joined(Err(PoolError::Panicked("boom".to_string())));

        assert_eq!(
            stats,
            ServerStats {
                succeeded: 2,
                failed: 2,
                error_responses: 1,
                interrupted: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_resolve() {
        assert!(resolve("127.0.0.1:0").await.is_ok());
        assert!(matches!(
            resolve("not an address").await,
            Err(ServerError::Resolve(_))
        ));
    }

    #[tokio::test]
    async fn test_create_listener_ephemeral_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = create_listener(addr, 50, false).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_reserved_port_is_shareable() {
        let (_reservation, local) = reserve_port("127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(local.port(), 0);
        let first = create_listener(local, 50, true).unwrap();
        let second = create_listener(local, 50, true).unwrap();
        assert_eq!(first.local_addr().unwrap(), local);
        assert_eq!(second.local_addr().unwrap(), local);
    }
}
