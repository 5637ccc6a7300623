//! Per-run benchmark tally.

use super::Operation;
use crate::client::TransferOutcome;
use crate::pool::{ExecutorKind, PoolError};
use tracing::warn;

const MIB: f64 = 1024.0 * 1024.0;

/// Aggregated results of one benchmark run. Owned by the harness loop only.
#[derive(Debug, Clone)]
pub struct BenchmarkStats {
    pub operation: Operation,
    pub file_size_mb: f64,
    pub client_workers: usize,
    pub server_workers: usize,
    pub executor: ExecutorKind,
    pub success_count: usize,
    pub fail_count: usize,
    /// Durations of successful tasks, in completion order
    pub durations: Vec<f64>,
    /// Throughputs of successful tasks, in completion order
    pub throughputs: Vec<f64>,
    pub outcomes: Vec<TransferOutcome>,
    /// Tasks still in flight when the run was interrupted
    pub interrupted: usize,
    /// Tasks never handed to a worker before the interrupt
    pub not_started: usize,
}

impl BenchmarkStats {
    pub fn new(
        operation: Operation,
        client_workers: usize,
        server_workers: usize,
        executor: ExecutorKind,
    ) -> Self {
        Self {
            operation,
            file_size_mb: 0.0,
            client_workers,
            server_workers,
            executor,
            success_count: 0,
            fail_count: 0,
            durations: Vec::new(),
            throughputs: Vec::new(),
            outcomes: Vec::new(),
            interrupted: 0,
            not_started: 0,
        }
    }

    pub fn record(&mut self, outcome: TransferOutcome) {
        if outcome.is_ok() {
            self.success_count += 1;
            self.durations.push(outcome.duration_seconds);
            self.throughputs.push(outcome.throughput_bytes_per_second);
        } else {
            self.fail_count += 1;
        }
        self.outcomes.push(outcome);
    }

    /// Record a result collected from the pool.
    pub fn record_joined(&mut self, result: Result<TransferOutcome, PoolError>) {
        match result {
            Ok(outcome) => self.record(outcome),
            Err(e) => {
                warn!(error = %e, "Task lost");
                self.record_lost(&e);
            }
        }
    }

    /// A task that produced no outcome at all.
    pub fn record_lost(&mut self, _error: &PoolError) {
        self.fail_count += 1;
    }

    /// Tasks that finished, successfully or not.
    pub fn completed(&self) -> usize {
        self.success_count + self.fail_count
    }

    /// Sum of successful durations.
    pub fn total_time(&self) -> f64 {
        self.durations.iter().sum()
    }

    pub fn mean_throughput(&self) -> Option<f64> {
        mean(&self.throughputs)
    }

    /// Mean size of successfully transferred files, in MiB.
    pub fn mean_file_size_mb(&self) -> Option<f64> {
        let sizes: Vec<f64> = self
            .outcomes
            .iter()
            .filter(|o| o.is_ok())
            .map(|o| o.file_size_bytes as f64 / MIB)
            .collect();
        mean(&sizes)
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
