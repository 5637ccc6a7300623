//! Bounded worker pool.
//!
//! Runs independent tasks with at most `size` of them active at once:
//!
//! - `size > 0`: each task is spawned on the runtime and waits for one of
//!   `size` semaphore permits; tasks beyond that queue on the semaphore.
//! - `size == 0`: tasks run inline, one after another, as they are submitted.
//!
//! Results come back in completion order. A task that panics is reported as
//! a [`PoolError`] for that task only; siblings keep running.
//!
//! With [`ExecutorKind::Process`] the submitted futures drive child
//! processes (see [`process`]); the pool then bounds live children.

pub mod process;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::trace;

pub use process::{ProcessError, WorkerProcess};

/// Kind of execution unit running each task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    /// Tasks share the process (runtime worker threads)
    Thread,
    /// Each task runs in an isolated child process
    Process,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorKind::Thread => write!(f, "thread"),
            ExecutorKind::Process => write!(f, "process"),
        }
    }
}

/// A task that did not produce a value.
#[derive(Debug)]
pub enum PoolError {
    Panicked(String),
    Cancelled,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Panicked(msg) => write!(f, "Task panicked: {}", msg),
            PoolError::Cancelled => write!(f, "Task cancelled"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<JoinError> for PoolError {
    fn from(e: JoinError) -> Self {
        if e.is_cancelled() {
            return PoolError::Cancelled;
        }
        let payload = e.into_panic();
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        PoolError::Panicked(msg)
    }
}

/// Bounded set of concurrently running tasks.
pub struct WorkerPool<T> {
    size: usize,
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    /// Results of inline tasks not yet collected
    ready: VecDeque<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool running at most `size` tasks at once (0 = inline).
    pub fn new(size: usize) -> Self {
        Self {
            size,
            permits: Arc::new(Semaphore::new(size.max(1))),
            tasks: JoinSet::new(),
            ready: VecDeque::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// True when tasks run inline.
    pub fn is_sequential(&self) -> bool {
        self.size == 0
    }

    /// Submit a task.
    ///
    /// In sequential mode this runs the task to completion before returning.
    pub async fn submit<F>(&mut self, task: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.is_sequential() {
            let output = task.await;
            self.ready.push_back(output);
            return;
        }

        let permits = Arc::clone(&self.permits);
        self.tasks.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await;
            task.await
        });
        trace!(in_flight = self.tasks.len(), "Task submitted");
    }

    /// Number of spawned tasks not yet collected.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Pop a result that is already available without waiting.
    pub fn take_ready(&mut self) -> Option<T> {
        self.ready.pop_front()
    }

    /// Wait for the next task to finish. `None` once everything is collected.
    pub async fn join_next(&mut self) -> Option<Result<T, PoolError>> {
        if let Some(output) = self.ready.pop_front() {
            return Some(Ok(output));
        }
        match self.tasks.join_next().await? {
            Ok(output) => Some(Ok(output)),
            Err(e) => Some(Err(PoolError::from(e))),
        }
    }

    /// Collect a finished task without waiting. `None` if nothing is done yet.
    pub fn try_join_next(&mut self) -> Option<Result<T, PoolError>> {
        if let Some(output) = self.ready.pop_front() {
            return Some(Ok(output));
        }
        self.tasks.try_join_next().map(|r| r.map_err(PoolError::from))
    }

    /// Abort every spawned task, returning how many were still running.
    pub fn abort_all(&mut self) -> usize {
        let running = self.tasks.len();
        self.tasks.abort_all();
        running
    }
}
