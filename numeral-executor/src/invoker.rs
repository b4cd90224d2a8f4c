//! Inference invoker: runs the worker for one stored upload.
//!
//! The invoker:
//! 1. Confines the configured interpreter to the whitelist
//! 2. Runs `<interpreter> <script> <input>` through a [`WorkerBackend`]
//! 3. Parses the single JSON object on stdout
//! 4. Range-checks the digit and confidence into an [`InferenceResult`]

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use numeral_core::{Confidence, Digit, InferenceResult};
use serde::Deserialize;

use crate::backend::{WorkerBackend, WorkerCommand, WorkerOutput};
use crate::{CancelSignal, ExecutorError, PathSandbox, SandboxedPath, WorkerConfig};

/// Stdout beyond this size is not a single-line result.
pub const MAX_STDOUT_BYTES: usize = 64 * 1024;

/// Diagnostics are truncated to this many bytes before being kept.
pub const MAX_DIAGNOSTIC_BYTES: usize = 4 * 1024;

/// Shape of the worker's stdout object. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct WorkerReply {
    digit: Option<i64>,
    confidence: Option<f64>,
    error: Option<String>,
}

/// Runs the external worker for sandboxed inputs.
///
/// One process per call; nothing is pooled or reused.
///
/// # Cancel Safety
/// Cancel safe. Dropping the future kills the worker via the backend.
pub struct InferenceInvoker {
    backend: Arc<dyn WorkerBackend>,
    interpreters: PathSandbox,
    config: WorkerConfig,
}

impl std::fmt::Debug for InferenceInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceInvoker")
            .field("interpreters", &self.interpreters)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl InferenceInvoker {
    /// Create an invoker over `backend`.
    ///
    /// # Errors
    /// Returns [`ExecutorError::InvalidSandbox`] if the whitelist is empty or
    /// the base directory is relative, and the same error if the script path
    /// is relative.
    pub fn new(
        backend: Arc<dyn WorkerBackend>,
        config: WorkerConfig,
    ) -> Result<Self, ExecutorError> {
        if !config.script_path.is_absolute() {
            return Err(ExecutorError::InvalidSandbox {
                reason: format!("worker script {} is not absolute", config.script_path.display()),
            });
        }
        let interpreters =
            PathSandbox::executables(&config.allowed_interpreters, &config.base_dir)?;
        tracing::debug!(
            allowed = ?interpreters.allowed().collect::<Vec<_>>(),
            script = %config.script_path.display(),
            "interpreter whitelist loaded"
        );
        Ok(Self { backend, interpreters, config })
    }

    /// Resolve the configured interpreter through the whitelist.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Security`] with
    /// `ExecutableNotWhitelisted` if it is not an exact whitelist entry.
    pub fn interpreter(&self) -> Result<SandboxedPath, ExecutorError> {
        Ok(self.interpreters.confine(&self.config.interpreter)?)
    }

    /// Fixed worker script path.
    #[must_use]
    pub fn script_path(&self) -> &Path {
        &self.config.script_path
    }

    /// Run the worker on `input` with no external cancellation.
    ///
    /// # Errors
    /// See [`InferenceInvoker::invoke_cancellable`].
    pub async fn invoke(&self, input: &SandboxedPath) -> Result<InferenceResult, ExecutorError> {
        self.invoke_cancellable(input, CancelSignal::never()).await
    }

    /// Run the worker on `input`, stopping early if `cancel` fires.
    ///
    /// # Errors
    /// - [`ExecutorError::Security`] if the interpreter is not whitelisted;
    ///   nothing is spawned.
    /// - [`ExecutorError::Timeout`] / [`ExecutorError::Cancelled`] if the
    ///   worker was killed.
    /// - [`ExecutorError::WorkerFailed`], [`ExecutorError::MalformedOutput`]
    ///   or [`ExecutorError::OutOfRange`] if its output breaks the contract.
    pub async fn invoke_cancellable(
        &self,
        input: &SandboxedPath,
        cancel: CancelSignal,
    ) -> Result<InferenceResult, ExecutorError> {
        let program = self.interpreter()?;
        let command = WorkerCommand::new(program, self.config.script_path.clone(), input.clone());

        tracing::info!(
            interpreter = %command.program.as_path().display(),
            script = %command.script.display(),
            input = %command.input.as_path().display(),
            "starting inference worker"
        );
        let started = Instant::now();

        let output = self.backend.run(&command, self.config.timeout, cancel).await?;
        let result = parse_worker_output(&output)?;

        tracing::info!(
            digit = %result.digit,
            confidence = %result.confidence,
            elapsed_ms = started.elapsed().as_millis(),
            "inference complete"
        );
        Ok(result)
    }

    /// Check that the whitelisted interpreter and the script both exist.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Security`] if the interpreter is not
    /// whitelisted, or [`ExecutorError::BinaryNotFound`] if either file is
    /// missing.
    pub async fn health_check(&self) -> Result<(), ExecutorError> {
        let program = self.interpreter()?;
        self.backend.health_check(&program).await?;
        if tokio::fs::metadata(&self.config.script_path).await.is_err() {
            return Err(ExecutorError::BinaryNotFound { path: self.config.script_path.clone() });
        }
        Ok(())
    }
}

/// Interpret a finished worker's output according to the worker contract.
///
/// Exit code 0 with exactly one line holding one JSON object `{"digit":
/// <int>, "confidence": <float>}` on stdout is the only success shape. A nonzero exit, or an
/// `"error"` field, is a worker failure carrying the diagnostic text.
///
/// # Errors
/// Returns [`ExecutorError::WorkerFailed`], [`ExecutorError::MalformedOutput`]
/// or [`ExecutorError::OutOfRange`].
///
/// # Complexity
/// O(n) in the size of stdout + stderr.
pub fn parse_worker_output(output: &WorkerOutput) -> Result<InferenceResult, ExecutorError> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let diagnostics = truncate_diagnostics(&output.stderr);

    if output.exit_code != Some(0) {
        let reported = parse_reply(&stdout).ok().and_then(|reply| reply.error);
        return Err(ExecutorError::WorkerFailed {
            exit_code: output.exit_code,
            diagnostics: reported.unwrap_or(diagnostics),
        });
    }

    if output.stdout.len() > MAX_STDOUT_BYTES {
        return Err(ExecutorError::MalformedOutput(format!(
            "stdout is {} bytes; limit is {MAX_STDOUT_BYTES}",
            output.stdout.len()
        )));
    }

    let reply = parse_reply(&stdout)?;
    if let Some(error) = reply.error {
        return Err(ExecutorError::WorkerFailed { exit_code: Some(0), diagnostics: error });
    }
    let digit = reply
        .digit
        .ok_or_else(|| ExecutorError::MalformedOutput("reply is missing 'digit'".to_owned()))?;
    let confidence = reply
        .confidence
        .ok_or_else(|| ExecutorError::MalformedOutput("reply is missing 'confidence'".to_owned()))?;

    Ok(InferenceResult::new(Digit::new(digit)?, Confidence::new(confidence)?, diagnostics))
}

fn parse_reply(stdout: &str) -> Result<WorkerReply, ExecutorError> {
    let line = stdout.trim();
    if line.contains('\n') {
        return Err(ExecutorError::MalformedOutput("stdout spans more than one line".to_owned()));
    }
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ExecutorError::MalformedOutput(format!("stdout is not JSON: {e}")))?;
    if !value.is_object() {
        return Err(ExecutorError::MalformedOutput("stdout is not a JSON object".to_owned()));
    }
    serde_json::from_value(value)
        .map_err(|e| ExecutorError::MalformedOutput(format!("unexpected field types: {e}")))
}

fn truncate_diagnostics(stderr: &[u8]) -> String {
    let end = stderr.len().min(MAX_DIAGNOSTIC_BYTES);
    String::from_utf8_lossy(&stderr[..end]).trim_end().to_owned()
}
