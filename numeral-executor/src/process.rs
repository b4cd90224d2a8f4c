//! Local subprocess backend.
//!
//! Starts the worker directly (no shell) with a cleared environment, captures
//! a bounded prefix of stdout and stderr, and kills the child if the
//! wall-clock ceiling passes or the invocation is cancelled.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::backend::{WorkerBackend, WorkerCommand, WorkerOutput};
use crate::invoker::{MAX_DIAGNOSTIC_BYTES, MAX_STDOUT_BYTES};
use crate::{CancelSignal, ExecutorError, SandboxedPath};

/// `PATH` handed to the worker. The interpreter itself is always invoked by
/// absolute path; this only lets it find helper binaries.
const WORKER_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Runs the worker as a local child process, one per request.
#[derive(Debug, Clone, Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    /// Create a new backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WorkerBackend for ProcessBackend {
    async fn run(
        &self,
        command: &WorkerCommand,
        timeout: Duration,
        mut cancel: CancelSignal,
    ) -> Result<WorkerOutput, ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let child = Command::new(command.program.as_path())
            .arg(&command.script)
            .arg(command.input.as_path())
            .env_clear()
            .env("PATH", WORKER_PATH)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(format!("exec worker: {e}")))?;

        let pid = child.id();
        let started = Instant::now();
        tracing::debug!(?pid, "worker spawned");

        // Losing either race drops `collect`, which drops the child;
        // `kill_on_drop` then delivers SIGKILL.
        tokio::select! {
            waited = tokio::time::timeout(timeout, collect(child)) => match waited {
                Ok(Ok(output)) => {
                    tracing::debug!(
                        ?pid,
                        exit_code = ?output.exit_code,
                        elapsed_ms = started.elapsed().as_millis(),
                        "worker exited"
                    );
                    Ok(output)
                }
                Ok(Err(e)) => Err(ExecutorError::Io(e)),
                Err(_) => {
                    let timeout_ms = timeout.as_millis();
                    tracing::warn!(?pid, timeout_ms, "worker timed out; killed");
                    Err(ExecutorError::Timeout { after: timeout })
                }
            },
            () = cancel.cancelled() => {
                tracing::warn!(?pid, "worker cancelled; killed");
                Err(ExecutorError::Cancelled)
            }
        }
    }

    async fn health_check(&self, program: &SandboxedPath) -> Result<(), ExecutorError> {
        let meta = tokio::fs::metadata(program.as_path()).await.map_err(|_| {
            ExecutorError::BinaryNotFound { path: program.as_path().to_owned() }
        })?;
        if meta.is_file() {
            Ok(())
        } else {
            Err(ExecutorError::BinaryNotFound { path: program.as_path().to_owned() })
        }
    }
}

/// Read the child's pipes and wait for it to exit.
///
/// Stdout is cut one byte past [`MAX_STDOUT_BYTES`] and its pipe closed, so an
/// oversized reply fails parsing instead of filling memory. Stderr keeps
/// [`MAX_DIAGNOSTIC_BYTES`] and the rest is drained so a chatty worker never
/// blocks on a full pipe.
async fn collect(mut child: Child) -> std::io::Result<WorkerOutput> {
    let stdout = read_bounded(child.stdout.take(), MAX_STDOUT_BYTES + 1, false);
    let stderr = read_bounded(child.stderr.take(), MAX_DIAGNOSTIC_BYTES, true);
    let (stdout, stderr) = tokio::try_join!(stdout, stderr)?;
    let status = child.wait().await?;
    Ok(WorkerOutput { stdout, stderr, exit_code: status.code() })
}

async fn read_bounded<R>(pipe: Option<R>, cap: usize, drain: bool) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut buf = Vec::new();
    (&mut pipe).take(u64::try_from(cap).unwrap_or(u64::MAX)).read_to_end(&mut buf).await?;
    if drain {
        tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    }
    Ok(buf)
}
