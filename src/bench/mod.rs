//! Benchmark harness.
//!
//! Builds a batch of identical transfers, runs it through a [`WorkerPool`]
//! and folds every outcome into one [`BenchmarkStats`]. Outcomes only travel
//! back through the pool's result path; the stats are never shared.

pub mod report;
pub mod stats;

use crate::client::{Client, ClientError, TransferContext, TransferOutcome, TransferTask};
use crate::pool::{ExecutorKind, WorkerPool, WorkerProcess};
use clap::Args;
use rand::RngCore;
use std::ffi::OsString;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use report::Ledger;
pub use stats::BenchmarkStats;

/// Benchmark operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    List,
    Download,
    Upload,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::List => write!(f, "list"),
            Operation::Download => write!(f, "download"),
            Operation::Upload => write!(f, "upload"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Harness errors that prevent a run from starting.
#[derive(Debug)]
pub enum HarnessError {
    Client(ClientError),
    /// Server has nothing to download
    NoFiles,
    InvalidSelection(String),
    InvalidSize(u64),
    Payload(io::Error),
    Worker(io::Error),
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HarnessError::Client(e) => write!(f, "{}", e),
            HarnessError::NoFiles => write!(f, "No files on server"),
            HarnessError::InvalidSelection(choice) => write!(f, "Invalid selection: {}", choice),
            HarnessError::InvalidSize(size) => write!(f, "Invalid file size: {} MB", size),
            HarnessError::Payload(e) => write!(f, "Failed to create upload payload: {}", e),
            HarnessError::Worker(e) => write!(f, "Failed to locate worker program: {}", e),
        }
    }
}

impl std::error::Error for HarnessError {}

impl From<ClientError> for HarnessError {
    fn from(e: ClientError) -> Self {
        HarnessError::Client(e)
    }
}

/// Which listed files to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    /// 1-based positions in the listing
    Indices(Vec<usize>),
}

impl Selection {
    /// Selected names. Out of range positions are skipped.
    pub fn pick(&self, files: &[String]) -> Vec<String> {
        match self {
            Selection::All => files.to_vec(),
            Selection::Indices(indices) => indices
                .iter()
                .filter(|&&i| i >= 1 && i <= files.len())
                .map(|&i| files[i - 1].clone())
                .collect(),
        }
    }
}

impl FromStr for Selection {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let choice = s.trim().to_lowercase();
        if choice == "all" {
            return Ok(Selection::All);
        }
        choice
            .split(',')
            .map(|part| part.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map(Selection::Indices)
            .map_err(|_| HarnessError::InvalidSelection(s.to_string()))
    }
}

/// Settings for one harness.
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub client_workers: usize,
    /// Reported only; the server's pool size is not observable
    pub server_workers: usize,
    pub executor: ExecutorKind,
    pub download_dir: PathBuf,
    pub upload_dir: PathBuf,
    /// Program run for process workers (defaults to the current executable)
    pub worker_program: Option<PathBuf>,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            client_workers: 1,
            server_workers: 0,
            executor: ExecutorKind::Thread,
            download_dir: PathBuf::from("downloaded_files"),
            upload_dir: PathBuf::from("upload_files"),
            worker_program: None,
        }
    }
}

/// Arguments of the hidden `worker` subcommand run by process workers.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    /// Server address
    #[arg(long)]
    pub server: String,
    /// Round trip timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: u64,
    /// Largest response body accepted, in bytes
    #[arg(long)]
    pub max_frame_size: usize,
    /// Directory for downloaded files
    #[arg(long)]
    pub download_dir: PathBuf,
    /// JSON encoded transfer task
    #[arg(long)]
    pub task: String,
}

impl WorkerArgs {
    fn to_args(&self) -> Vec<OsString> {
        vec![
            "worker".into(),
            "--server".into(),
            self.server.clone().into(),
            "--timeout-ms".into(),
            self.timeout_ms.to_string().into(),
            "--max-frame-size".into(),
            self.max_frame_size.to_string().into(),
            "--download-dir".into(),
            self.download_dir.clone().into(),
            "--task".into(),
            self.task.clone().into(),
        ]
    }
}

/// Body of the `worker` subcommand: run one task in this process.
pub async fn run_worker(args: &WorkerArgs) -> TransferOutcome {
    let task: TransferTask = match serde_json::from_str(&args.task) {
        Ok(task) => task,
        Err(e) => return TransferOutcome::failed(0, format!("Invalid task: {}", e)),
    };
    let client = Client::new(args.server.clone(), Duration::from_millis(args.timeout_ms))
        .with_max_frame_size(args.max_frame_size);
    TransferContext::new(client, &args.download_dir)
        .execute(&task)
        .await
}

/// Runs tasks either in this process or in child processes.
#[derive(Clone)]
enum TaskRunner {
    InProcess(Arc<TransferContext>),
    Child {
        worker: Arc<WorkerProcess>,
        context: Arc<TransferContext>,
    },
}

impl TaskRunner {
    async fn run(self, task: TransferTask) -> TransferOutcome {
        match self {
            TaskRunner::InProcess(context) => context.execute(&task).await,
            TaskRunner::Child { worker, context } => {
                let task_id = task.task_id();
                let task = match serde_json::to_string(&task) {
                    Ok(task) => task,
                    Err(e) => return TransferOutcome::failed(task_id, e.to_string()),
                };
                let args = WorkerArgs {
                    server: context.client.addr().to_string(),
                    timeout_ms: context.client.timeout().as_millis() as u64,
                    max_frame_size: context.client.max_frame_size(),
                    download_dir: context.download_dir.clone(),
                    task,
                };
                match worker.run::<TransferOutcome, _, _>(args.to_args()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(task_id, error = %e, "Worker process failed");
                        TransferOutcome::failed(task_id, e.to_string())
                    }
                }
            }
        }
    }
}

/// Client side benchmark orchestrator.
pub struct Harness {
    client: Client,
    options: HarnessOptions,
}

impl Harness {
    pub fn new(client: Client, options: HarnessOptions) -> Self {
        Self { client, options }
    }

    /// Copies of the selection per run.
    pub fn multiplier(&self) -> usize {
        self.options.client_workers.max(1)
    }

    /// One listing, outside the pool.
    pub async fn list(&self) -> Result<Vec<String>, HarnessError> {
        Ok(self.client.list().await?)
    }

    /// One delete, outside the pool.
    pub async fn delete(&self, filename: &str) -> Result<String, HarnessError> {
        Ok(self.client.delete(filename).await?)
    }

    /// Download the selected files `multiplier` times each.
    pub async fn download<F>(
        &self,
        selection: &Selection,
        shutdown: F,
    ) -> Result<BenchmarkStats, HarnessError>
    where
        F: Future<Output = ()>,
    {
        let files = self.list().await?;
        if files.is_empty() {
            return Err(HarnessError::NoFiles);
        }
        let selected = selection.pick(&files);
        if selected.is_empty() {
            return Err(HarnessError::InvalidSelection(format!("{:?}", selection)));
        }

        let tasks = self
            .replicate(&selected)
            .into_iter()
            .enumerate()
            .map(|(task_id, filename)| TransferTask::Download { task_id, filename })
            .collect();
        let mut stats = self.run_batch(Operation::Download, tasks, shutdown).await?;
        if let Some(size) = stats.mean_file_size_mb() {
            stats.file_size_mb = size;
        }
        Ok(stats)
    }

    /// Upload a random payload of `size_mb` MiB `multiplier` times.
    pub async fn upload<F>(&self, size_mb: u64, shutdown: F) -> Result<BenchmarkStats, HarnessError>
    where
        F: Future<Output = ()>,
    {
        if size_mb == 0 {
            return Err(HarnessError::InvalidSize(size_mb));
        }
        let path = generate_payload(&self.options.upload_dir, size_mb)
            .await
            .map_err(HarnessError::Payload)?;

        let tasks = self
            .replicate(&[path])
            .into_iter()
            .enumerate()
            .map(|(task_id, path)| TransferTask::Upload { task_id, path })
            .collect();
        let mut stats = self.run_batch(Operation::Upload, tasks, shutdown).await?;
        stats.file_size_mb = size_mb as f64;
        Ok(stats)
    }

    fn replicate<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let mut batch = Vec::with_capacity(items.len() * self.multiplier());
        for _ in 0..self.multiplier() {
            batch.extend_from_slice(items);
        }
        batch
    }

    fn runner(&self) -> Result<TaskRunner, HarnessError> {
        let context = Arc::new(TransferContext::new(
            self.client.clone(),
            &self.options.download_dir,
        ));
        match self.options.executor {
            ExecutorKind::Thread => Ok(TaskRunner::InProcess(context)),
            ExecutorKind::Process => {
                let worker = match &self.options.worker_program {
                    Some(program) => WorkerProcess::new(program),
                    None => WorkerProcess::current_exe().map_err(HarnessError::Worker)?,
                };
                Ok(TaskRunner::Child {
                    worker: Arc::new(worker),
                    context,
                })
            }
        }
    }

    /// Run a batch to completion or until `shutdown` resolves.
    async fn run_batch<F>(
        &self,
        operation: Operation,
        tasks: Vec<TransferTask>,
        shutdown: F,
    ) -> Result<BenchmarkStats, HarnessError>
    where
        F: Future<Output = ()>,
    {
        let runner = self.runner()?;
        let total = tasks.len();
        let mut stats = BenchmarkStats::new(
            operation,
            self.options.client_workers,
            self.options.server_workers,
            self.options.executor,
        );
        let mut pool: WorkerPool<TransferOutcome> = WorkerPool::new(self.options.client_workers);
        info!(
            %operation,
            tasks = total,
            workers = pool.size(),
            executor = %self.options.executor,
            "Starting benchmark run"
        );

        tokio::pin!(shutdown);
        let mut interrupted = false;
        let mut submitted: usize = 0;

        for task in tasks {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    // An inline task cut short was already running
                    if pool.is_sequential() {
                        submitted += 1;
                    }
                    interrupted = true;
                    break;
                }
                _ = pool.submit(runner.clone().run(task)) => submitted += 1,
            }
            while let Some(outcome) = pool.take_ready() {
                stats.record(outcome);
            }
        }

        while !interrupted {
            tokio::select! {
                biased;
                _ = &mut shutdown => interrupted = true,
                next = pool.join_next() => match next {
                    Some(result) => stats.record_joined(result),
                    None => break,
                },
            }
        }

        if interrupted {
            while let Some(result) = pool.try_join_next() {
                stats.record_joined(result);
            }
            pool.abort_all();
            stats.interrupted = submitted - stats.completed();
            stats.not_started = total - submitted;
            warn!(
                in_flight = stats.interrupted,
                not_started = stats.not_started,
                "Benchmark interrupted"
            );
        }

        debug!(
            succeeded = stats.success_count,
            failed = stats.fail_count,
            "Benchmark run finished"
        );
        Ok(stats)
    }
}

/// Path of the random payload of `size_mb` MiB, creating it if needed.
///
/// An existing file of exactly the requested size is reused.
pub async fn generate_payload(dir: &Path, size_mb: u64) -> io::Result<PathBuf> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("dummy_{}MB.bin", size_mb));
        let size = size_mb * 1024 * 1024;

        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.len() == size {
                debug!(path = %path.display(), "Reusing upload payload");
                return Ok(path);
            }
        }

        let mut file = io::BufWriter::new(std::fs::File::create(&path)?);
        let mut rng = rand::thread_rng();
        let mut chunk = vec![0u8; 1024 * 1024];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(chunk.len() as u64) as usize;
            rng.fill_bytes(&mut chunk[..n]);
            file.write_all(&chunk[..n])?;
            remaining -= n as u64;
        }
        file.flush()?;
        info!(path = %path.display(), size_mb, "Generated upload payload");
        Ok(path)
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}
