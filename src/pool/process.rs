//! Child process execution units.
//!
//! A child runs one task and hands its result back as a single JSON line on
//! stdout. Nothing is shared in memory with the parent, so the parent is the
//! only place where results are aggregated. Children inherit stderr, which
//! carries their logs.

use serde::de::DeserializeOwned;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::debug;

/// Child process failures
#[derive(Debug)]
pub enum ProcessError {
    /// Could not start the child
    Spawn(io::Error),
    /// Child exited unsuccessfully
    Exit(ExitStatus),
    /// Child printed no result line
    NoOutput,
    /// Result line is not valid JSON for the expected type
    Malformed(serde_json::Error),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn(e) => write!(f, "Failed to start worker process: {}", e),
            ProcessError::Exit(status) => write!(f, "Worker process exited with {}", status),
            ProcessError::NoOutput => write!(f, "Worker process produced no result"),
            ProcessError::Malformed(e) => write!(f, "Worker process result is malformed: {}", e),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Launches a worker program with fixed leading arguments.
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Worker running the current executable.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Append a leading argument passed to every child.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build the command for one child.
    pub fn command<I, S>(&self, extra: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let extra: Vec<OsString> = extra.into_iter().map(Into::into).collect();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(extra)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        command
    }

    /// Run one child to completion and decode its result line.
    pub async fn run<T, I, S>(&self, extra: I) -> Result<T, ProcessError>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let child = self.command(extra).spawn().map_err(ProcessError::Spawn)?;
        let output = child
            .wait_with_output()
            .await
            .map_err(ProcessError::Spawn)?;
        debug!(status = %output.status, bytes = output.stdout.len(), "Worker process finished");

        if !output.status.success() {
            return Err(ProcessError::Exit(output.status));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or(ProcessError::NoOutput)?;
        serde_json::from_str(line).map_err(ProcessError::Malformed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Reply {
        value: u32,
    }

    fn shell() -> WorkerProcess {
        WorkerProcess::new("/bin/sh").arg("-c")
    }

    #[tokio::test]
    async fn test_last_line_is_the_result() {
        let reply: Reply = shell()
            .run(["echo noise; echo '{\"value\":7}'; echo"])
            .await
            .unwrap();
        assert_eq!(reply, Reply { value: 7 });
    }

    #[tokio::test]
    async fn test_failed_exit() {
        let result = shell().run::<Reply, _, _>(["exit 3"]).await;
        assert!(matches!(result, Err(ProcessError::Exit(_))));
    }

    #[tokio::test]
    async fn test_no_output() {
        let result = shell().run::<Reply, _, _>(["true"]).await;
        assert!(matches!(result, Err(ProcessError::NoOutput)));
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let result = shell().run::<Reply, _, _>(["echo not-json"]).await;
        assert!(matches!(result, Err(ProcessError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let result = WorkerProcess::new("/nonexistent/worker")
            .run::<Reply, _, _>(["x"])
            .await;
        assert!(matches!(result, Err(ProcessError::Spawn(_))));
    }
}
