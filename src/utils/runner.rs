// src/utils/runner.rs: the process boundary between the orchestrator and external binaries

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::defs::STDERR_CAPTURE_LIMIT;

/// One fully resolved external command.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Label used in logs and diagnostics, e.g. "samtools sort".
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// When set, the child's stdout is written to this file instead of captured.
    pub stdout_path: Option<PathBuf>,
    /// File the tool is expected to produce.
    pub output: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// None when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error while running {tool}: {source}")]
    Io {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Cancelled")]
    Cancelled,
}

/// Receiving side of a job cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Sending side; cancelling is idempotent.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Capability to run an external command to completion. Substituted by fakes in tests.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, RunnerError>;
}

/// Runs commands as child processes via tokio.
#[derive(Debug, Default, Clone)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        ProcessRunner
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Reads a child stream to the end, keeping only the last `limit` bytes.
async fn read_tail<R>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut buf = vec![0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&buf[..n]);
        if kept.len() > limit * 2 {
            let excess = kept.len() - limit;
            kept.drain(..excess);
        }
    }
    if kept.len() > limit {
        let excess = kept.len() - limit;
        kept.drain(..excess);
    }
    Ok(kept)
}

async fn collect(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    match handle {
        Some(h) => match h.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("Failed to read child output: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Child output reader panicked: {}", e);
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

/// Kills the child and waits for it to be reaped.
async fn terminate(child: &mut Child, tool: &str) {
    if let Err(e) = child.kill().await {
        warn!("Failed to kill {}: {}", tool, e);
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, RunnerError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match &invocation.stdout_path {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(|e| RunnerError::Io {
                    tool: invocation.tool.clone(),
                    source: e,
                })?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        debug!(
            "Spawning {}: {} {}",
            invocation.tool,
            invocation.program.display(),
            invocation.args.join(" ")
        );

        let mut child = cmd.spawn().map_err(|e| RunnerError::Spawn {
            program: invocation.program.display().to_string(),
            source: e,
        })?;

        let stderr_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(read_tail(s, STDERR_CAPTURE_LIMIT)));
        let stdout_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(read_tail(s, STDERR_CAPTURE_LIMIT)));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = sleep(invocation.timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        match outcome {
            Outcome::Exited(status) => {
                let status = status.map_err(|e| RunnerError::Io {
                    tool: invocation.tool.clone(),
                    source: e,
                })?;
                let stdout = collect(stdout_task).await;
                let stderr = collect(stderr_task).await;
                Ok(ToolOutput {
                    code: status.code(),
                    stdout,
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            }
            Outcome::TimedOut => {
                warn!("{} exceeded {:?}; killing", invocation.tool, invocation.timeout);
                terminate(&mut child, &invocation.tool).await;
                abort_readers(stdout_task, stderr_task);
                Err(RunnerError::Timeout(invocation.timeout))
            }
            Outcome::Cancelled => {
                warn!("{} cancelled; killing", invocation.tool);
                terminate(&mut child, &invocation.tool).await;
                abort_readers(stdout_task, stderr_task);
                Err(RunnerError::Cancelled)
            }
        }
    }
}

fn abort_readers(
    stdout_task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    stderr_task: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) {
    for task in [stdout_task, stderr_task].into_iter().flatten() {
        task.abort();
    }
}
