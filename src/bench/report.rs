//! Run summaries and the CSV results ledger.

use super::{BenchmarkStats, Operation};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const HEADER: &str = "Timestamp,Operation,File Size (MB),Client Workers,Server Workers,\
Executor Type,Success Count,Fail Count,Total Time (s),Avg Throughput (bytes/s)";

/// Human readable summary of one run.
pub fn summary(stats: &BenchmarkStats) -> String {
    let mut out = String::new();
    out.push_str("\n=== STRESS TEST RESULTS ===\n");
    out.push_str(&format!("1. Operation: {}\n", stats.operation));

    if stats.operation == Operation::Download {
        match stats.mean_file_size_mb() {
            Some(size) => out.push_str(&format!("2. Average file size: {:.2} MB\n", size)),
            None => out.push_str("2. File size: not available\n"),
        }
    } else {
        out.push_str(&format!("2. File size: {:.2} MB\n", stats.file_size_mb));
    }

    out.push_str(&format!("3. Client worker pool: {}\n", stats.client_workers));
    out.push_str(&format!("4. Server worker pool: {}\n", stats.server_workers));
    out.push_str(&format!("   Executor: {}\n", stats.executor));

    match stats.mean_throughput() {
        Some(throughput) => {
            out.push_str(&format!("5. Total time: {:.4} s\n", stats.total_time()));
            out.push_str(&format!("6. Throughput per task: {:.2} bytes/s\n", throughput));
        }
        None => {
            out.push_str("5. Total time: N/A\n");
            out.push_str("6. Throughput per task: N/A\n");
        }
    }

    out.push_str(&format!(
        "7. Succeeded: {}, Failed: {}\n",
        stats.success_count, stats.fail_count
    ));
    if stats.interrupted > 0 {
        out.push_str(&format!("   Interrupted: {}\n", stats.interrupted));
    }
    if stats.not_started > 0 {
        out.push_str(&format!("   Not started: {}\n", stats.not_started));
    }
    out.push_str(&"=".repeat(30));
    out.push('\n');
    out
}

/// Append-only CSV file with one row per run.
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a row, writing the header first when the file is new.
    pub fn append(&self, stats: &BenchmarkStats) -> io::Result<()> {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.append_row(&row(&timestamp, stats))
    }

    fn append_row(&self, row: &str) -> io::Result<()> {
        let fresh = std::fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            writeln!(file, "{}", HEADER)?;
        }
        writeln!(file, "{}", row)?;
        debug!(path = %self.path.display(), "Ledger row appended");
        Ok(())
    }
}

fn row(timestamp: &str, stats: &BenchmarkStats) -> String {
    let file_size_mb = match stats.operation {
        Operation::Download => stats.mean_file_size_mb().unwrap_or(stats.file_size_mb),
        _ => stats.file_size_mb,
    };
    format!(
        "{},{},{},{},{},{},{},{},{},{}",
        timestamp,
        stats.operation,
        number(file_size_mb),
        stats.client_workers,
        stats.server_workers,
        stats.executor,
        stats.success_count,
        stats.fail_count,
        number(stats.total_time()),
        number(stats.mean_throughput().unwrap_or(0.0)),
    )
}

/// Whole numbers without a fractional part.
fn number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}
