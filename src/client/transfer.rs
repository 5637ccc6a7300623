//! A single timed transfer.
//!
//! [`TransferTask`] and [`TransferOutcome`] are plain serde types so a task
//! can be handed to a child process on its command line and the outcome read
//! back from its stdout.

use super::{Client, ClientError};
use crate::protocol::Status;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// One unit of benchmark work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransferTask {
    /// Fetch `filename` and save it locally
    Download { task_id: usize, filename: String },
    /// Send the local file at `path`
    Upload { task_id: usize, path: PathBuf },
}

impl TransferTask {
    pub fn task_id(&self) -> usize {
        match self {
            TransferTask::Download { task_id, .. } => *task_id,
            TransferTask::Upload { task_id, .. } => *task_id,
        }
    }
}

/// Result of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub task_id: usize,
    pub status: Status,
    pub duration_seconds: f64,
    pub throughput_bytes_per_second: f64,
    pub file_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn ok(task_id: usize, duration_seconds: f64, file_size_bytes: u64) -> Self {
        let throughput_bytes_per_second = if duration_seconds > 0.0 {
            file_size_bytes as f64 / duration_seconds
        } else {
            0.0
        };
        Self {
            task_id,
            status: Status::Ok,
            duration_seconds,
            throughput_bytes_per_second,
            file_size_bytes,
            error: None,
        }
    }

    pub fn failed(task_id: usize, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: Status::Error,
            duration_seconds: 0.0,
            throughput_bytes_per_second: 0.0,
            file_size_bytes: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Everything a task needs besides its own description.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub client: Client,
    pub download_dir: PathBuf,
}

impl TransferContext {
    pub fn new(client: Client, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            download_dir: download_dir.into(),
        }
    }

    /// Run a task, timing the transfer. Never fails; errors become outcomes.
    pub async fn execute(&self, task: &TransferTask) -> TransferOutcome {
        let task_id = task.task_id();
        let result = match task {
            TransferTask::Download { task_id, filename } => {
                self.download(*task_id, filename).await
            }
            TransferTask::Upload { path, .. } => self.upload(path).await,
        };

        match result {
            Ok((size, elapsed)) => {
                let elapsed = elapsed.as_secs_f64();
                debug!(task_id, size, elapsed, "Transfer complete");
                TransferOutcome::ok(task_id, elapsed, size)
            }
            Err(e) => {
                warn!(task_id, error = %e, "Transfer failed");
                TransferOutcome::failed(task_id, e.to_string())
            }
        }
    }

    /// The clock stops once the content is decoded; saving it is not timed.
    async fn download(
        &self,
        task_id: usize,
        filename: &str,
    ) -> Result<(u64, Duration), TransferError> {
        let start = Instant::now();
        let content = self.client.get(filename).await?;
        let elapsed = start.elapsed();

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let target = self
            .download_dir
            .join(format!("{}_{}", task_id, local_name(filename)));
        tokio::fs::write(&target, &content).await?;
        Ok((content.len() as u64, elapsed))
    }

    /// Timed from reading the source file to the server's confirmation.
    async fn upload(&self, path: &Path) -> Result<(u64, Duration), TransferError> {
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TransferError::BadPath(path.to_path_buf()))?;
        let start = Instant::now();
        let content = tokio::fs::read(path).await?;
        self.client.upload(filename, &content).await?;
        Ok((content.len() as u64, start.elapsed()))
    }
}

/// Last path component of a server supplied name.
fn local_name(filename: &str) -> &str {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download")
}

#[derive(Debug)]
enum TransferError {
    Client(ClientError),
    Io(std::io::Error),
    BadPath(PathBuf),
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::Client(e) => write!(f, "{}", e),
            TransferError::Io(e) => write!(f, "I/O error: {}", e),
            TransferError::BadPath(path) => write!(f, "Invalid upload path: {}", path.display()),
        }
    }
}

impl From<ClientError> for TransferError {
    fn from(e: ClientError) -> Self {
        TransferError::Client(e)
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        TransferError::Io(e)
    }
}
