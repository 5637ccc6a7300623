//! Process-per-worker serving.
//!
//! The parent reserves the port and starts `workers` children running the
//! hidden `serve-worker` subcommand. Each child binds the same address with
//! `SO_REUSEPORT`, serves connections one at a time and writes one
//! [`WorkerEvent`] JSON line per connection to stdout. The parent reads those
//! lines and is the only place counters are kept.
//!
//! Closing a child's stdin tells it to stop accepting and exit. Children
//! ignore interrupts so a terminal ctrl-c reaches only the parent's shutdown
//! path.

use super::connection::{serve_connection, ConnectionOptions, ConnectionOutcome};
use super::{create_listener, ServerError, ServerOptions, ServerStats};
use crate::pool::{ProcessError, WorkerProcess};
use crate::protocol::Dispatcher;
use crate::storage::Storage;
use clap::Args;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// How long a child may take to start accepting.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of child output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Listener bound, accepting
    Ready { pid: u32 },
    /// One connection finished
    Connection { result: ConnectionOutcome },
}

/// Arguments of the hidden `serve-worker` subcommand.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ServeWorkerArgs {
    /// Concrete address shared with sibling workers
    #[arg(long)]
    pub listen: SocketAddr,
    #[arg(long)]
    pub storage_dir: PathBuf,
    #[arg(long)]
    pub receive_timeout_ms: u64,
    #[arg(long)]
    pub write_timeout_ms: u64,
    #[arg(long)]
    pub max_frame_size: usize,
    #[arg(long)]
    pub backlog: i32,
}

impl ServeWorkerArgs {
    pub fn new(listen: SocketAddr, options: &ServerOptions) -> Self {
        Self {
            listen,
            storage_dir: options.storage_dir.clone(),
            receive_timeout_ms: options.connection.receive_timeout.as_millis() as u64,
            write_timeout_ms: options.connection.write_timeout.as_millis() as u64,
            max_frame_size: options.connection.max_frame_size,
            backlog: options.backlog,
        }
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            receive_timeout: Duration::from_millis(self.receive_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            max_frame_size: self.max_frame_size,
        }
    }

    fn to_args(&self) -> Vec<OsString> {
        vec![
            "serve-worker".into(),
            "--listen".into(),
            self.listen.to_string().into(),
            "--storage-dir".into(),
            self.storage_dir.clone().into(),
            "--receive-timeout-ms".into(),
            self.receive_timeout_ms.to_string().into(),
            "--write-timeout-ms".into(),
            self.write_timeout_ms.to_string().into(),
            "--max-frame-size".into(),
            self.max_frame_size.to_string().into(),
            "--backlog".into(),
            self.backlog.to_string().into(),
        ]
    }
}

struct WorkerChild {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Parent side of the process executor.
pub struct Supervisor {
    children: Vec<WorkerChild>,
}

impl Supervisor {
    /// Start `count` children and wait until each reports ready.
    pub async fn spawn(
        count: usize,
        worker: &WorkerProcess,
        args: &ServeWorkerArgs,
    ) -> Result<Self, ServerError> {
        let mut children = Vec::with_capacity(count);
        for _ in 0..count {
            let mut command = worker.command(args.to_args());
            command.stdin(Stdio::piped());
            let mut child = command
                .spawn()
                .map_err(|e| ServerError::Worker(ProcessError::Spawn(e)))?;

            let stdin = child.stdin.take();
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| ServerError::WorkerNotReady("stdout not captured".to_string()))?;
            let mut lines = BufReader::new(stdout).lines();

            let pid = match tokio::time::timeout(READY_TIMEOUT, lines.next_line()).await {
                Ok(Ok(Some(line))) => match serde_json::from_str::<WorkerEvent>(&line) {
                    Ok(WorkerEvent::Ready { pid }) => pid,
                    _ => return Err(ServerError::WorkerNotReady(line)),
                },
                Ok(Ok(None)) => {
                    return Err(ServerError::WorkerNotReady("exited during startup".to_string()))
                }
                Ok(Err(e)) => return Err(ServerError::WorkerNotReady(e.to_string())),
                Err(_) => {
                    return Err(ServerError::WorkerNotReady(format!(
                        "no response within {:?}",
                        READY_TIMEOUT
                    )))
                }
            };
            debug!(pid, "Worker process ready");

            children.push(WorkerChild {
                child,
                stdin,
                lines,
            });
        }
        info!(workers = children.len(), "Worker processes started");
        Ok(Self { children })
    }

    /// Aggregate child outcomes until `shutdown`, then stop the children.
    pub async fn run<F>(self, shutdown: F, grace: Duration) -> ServerStats
    where
        F: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut processes = Vec::with_capacity(self.children.len());
        let mut stdins = Vec::with_capacity(self.children.len());

        for worker in self.children {
            let tx = tx.clone();
            let mut lines = worker.lines;
            tokio::spawn(async move {
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => match serde_json::from_str::<WorkerEvent>(&line) {
                            Ok(WorkerEvent::Connection { result }) => {
                                let _ = tx.send(result);
                            }
                            Ok(WorkerEvent::Ready { .. }) => {}
                            Err(e) => warn!(error = %e, "Unreadable worker output"),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "Worker output closed");
                            break;
                        }
                    }
                }
            });
            processes.push(worker.child);
            stdins.push(worker.stdin);
        }
        drop(tx);

        let mut stats = ServerStats::default();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                event = rx.recv() => match event {
                    Some(outcome) => stats.record(&outcome),
                    None => {
                        error!("All worker processes exited");
                        break;
                    }
                },
            }
        }

        info!(workers = processes.len(), "Stopping worker processes");
        drop(stdins);

        let drain = async {
            while let Some(outcome) = rx.recv().await {
                stats.record(&outcome);
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            for child in &mut processes {
                if let Ok(None) = child.try_wait() {
                    warn!(pid = ?child.id(), "Worker process did not stop, killing");
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "Failed to kill worker process");
                    }
                    stats.interrupted += 1;
                }
            }
            while let Ok(outcome) = rx.try_recv() {
                stats.record(&outcome);
            }
        }

        for mut child in processes {
            match child.wait().await {
                Ok(status) => debug!(%status, "Worker process exited"),
                Err(e) => warn!(error = %e, "Failed to reap worker process"),
            }
        }
        stats
    }
}

/// Body of the `serve-worker` subcommand.
///
/// Serves connections sequentially until stdin reaches end of file.
pub async fn serve_worker(args: ServeWorkerArgs) -> Result<(), ServerError> {
    let storage = Storage::new(&args.storage_dir)?;
    let dispatcher = Dispatcher::new(storage);
    let options = args.connection_options();
    let listener = create_listener(args.listen, args.backlog, true)
        .and_then(TcpListener::from_std)
        .map_err(ServerError::Bind)?;

    tokio::spawn(ignore_interrupts());

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 64];
        while let Ok(n) = stdin.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
        let _ = stop_tx.send(());
    });

    let pid = std::process::id();
    let mut stdout = tokio::io::stdout();
    emit(&mut stdout, &WorkerEvent::Ready { pid }).await?;
    info!(pid, address = %args.listen, "Worker process accepting");

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!(peer = %peer, pid, "New connection");
                    let result = serve_connection(stream, peer, &dispatcher, &options).await;
                    emit(&mut stdout, &WorkerEvent::Connection { result }).await?;
                }
                Err(e) => error!(error = %e, "Failed to accept connection"),
            },
        }
    }

    info!(pid, "Worker process stopping");
    Ok(())
}

async fn emit(stdout: &mut tokio::io::Stdout, event: &WorkerEvent) -> Result<(), ServerError> {
    let mut line = serde_json::to_vec(event)
        .map_err(|e| ServerError::Output(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    line.push(b'\n');
    stdout.write_all(&line).await.map_err(ServerError::Output)?;
    stdout.flush().await.map_err(ServerError::Output)
}

async fn ignore_interrupts() {
    while tokio::signal::ctrl_c().await.is_ok() {
        debug!("Interrupt ignored, waiting for the supervisor");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Status;

    #[test]
    fn test_event_lines() {
        let ready = serde_json::to_string(&WorkerEvent::Ready { pid: 42 }).unwrap();
        assert_eq!(ready, r#"{"event":"ready","pid":42}"#);

        let event = WorkerEvent::Connection {
            result: ConnectionOutcome::Served { status: Status::Ok },
        };
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(
            line,
            r#"{"event":"connection","result":{"outcome":"served","status":"OK"}}"#
        );
        assert_eq!(serde_json::from_str::<WorkerEvent>(&line).unwrap(), event);
    }

    #[test]
    fn test_args_parse_back() {
        #[derive(clap::Parser)]
        struct Cli {
            #[command(subcommand)]
            command: Sub,
        }
        #[derive(clap::Subcommand)]
        enum Sub {
            ServeWorker(ServeWorkerArgs),
        }

        let options = ServerOptions {
            storage_dir: PathBuf::from("files"),
            ..ServerOptions::default()
        };
        let args = ServeWorkerArgs::new("127.0.0.1:7000".parse().unwrap(), &options);
        assert_eq!(args.receive_timeout_ms, 60_000);

        let mut argv: Vec<OsString> = vec!["filexfer".into()];
        argv.extend(args.to_args());
        let cli = <Cli as clap::Parser>::try_parse_from(argv).unwrap();
        let Sub::ServeWorker(parsed) = cli.command;
        assert_eq!(parsed, args);
        assert_eq!(parsed.connection_options().max_frame_size, 1024 * 1024 * 1024);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_that_never_reports_ready() {
        let worker = WorkerProcess::new("/bin/sh").arg("-c").arg("echo nonsense");
        let options = ServerOptions::default();
        let args = ServeWorkerArgs::new("127.0.0.1:0".parse().unwrap(), &options);
        let result = Supervisor::spawn(1, &worker, &args).await;
        assert!(matches!(result, Err(ServerError::WorkerNotReady(_))));
    }
}
