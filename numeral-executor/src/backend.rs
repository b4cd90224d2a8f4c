//! Worker backend abstraction trait.
//!
//! Separates how a worker process is started from how its output is
//! interpreted, so the invoker can be exercised without spawning anything.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::{CancelSignal, ExecutorError, SandboxedPath};

/// Fully resolved worker invocation: `<program> <script> <input>`.
///
/// Both the program and the input have passed a sandbox; the script is fixed
/// configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct WorkerCommand {
    /// Whitelisted interpreter.
    pub program: SandboxedPath,
    /// Fixed worker script path.
    pub script: PathBuf,
    /// Stored upload, confined to the upload root.
    pub input: SandboxedPath,
}

impl WorkerCommand {
    /// Bundle the three invocation arguments.
    #[must_use]
    pub fn new(program: SandboxedPath, script: PathBuf, input: SandboxedPath) -> Self {
        Self { program, script, input }
    }
}

/// Raw captured output of a finished worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerOutput {
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Exit code, `None` if the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// Something that can run a [`WorkerCommand`] to completion.
///
/// Implementations must be `Send + Sync` to allow use across async tasks.
///
/// # Cancel Safety
/// Dropping the future returned by [`WorkerBackend::run`] must stop the
/// worker.
#[async_trait]
pub trait WorkerBackend: Send + Sync {
    /// Run one worker to completion, bounded by `timeout` and `cancel`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::SpawnFailed`] if the process cannot start,
    /// [`ExecutorError::Timeout`] if it outlives `timeout`, and
    /// [`ExecutorError::Cancelled`] if `cancel` fires first.
    async fn run(
        &self,
        command: &WorkerCommand,
        timeout: Duration,
        cancel: CancelSignal,
    ) -> Result<WorkerOutput, ExecutorError>;

    /// Check that `program` can be executed at all.
    ///
    /// # Errors
    /// Returns [`ExecutorError::BinaryNotFound`] if it is missing.
    async fn health_check(&self, program: &SandboxedPath) -> Result<(), ExecutorError>;
}
