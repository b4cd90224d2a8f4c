//! Error types for the executor crate.

use std::path::PathBuf;
use std::time::Duration;

use numeral_core::{CoreError, SecurityViolation};

/// Errors that can occur while confining paths or running the worker.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// A path failed sandbox confinement. Always fatal to the request.
    #[error("security violation: {0}")]
    Security(#[from] SecurityViolation),

    /// A sandbox could not be built from its configuration.
    #[error("invalid sandbox configuration: {reason}")]
    InvalidSandbox { reason: String },

    /// The interpreter binary does not exist at its whitelisted path.
    #[error("interpreter not found at {path}")]
    BinaryNotFound { path: PathBuf },

    /// The worker process could not be started.
    #[error("worker spawn failed: {0}")]
    SpawnFailed(String),

    /// The worker exited unsuccessfully or reported an error.
    #[error("worker failed with exit code {exit_code:?}")]
    WorkerFailed {
        /// Process exit code, `None` if killed by a signal.
        exit_code: Option<i32>,
        /// Captured diagnostic text. Server-side only.
        diagnostics: String,
    },

    /// Standard output did not follow the worker contract.
    #[error("malformed worker output: {0}")]
    MalformedOutput(String),

    /// The worker returned a digit or confidence outside its range.
    #[error("worker result out of range: {0}")]
    OutOfRange(#[from] CoreError),

    /// The worker exceeded its wall-clock ceiling and was killed.
    #[error("worker did not finish within {after:?}")]
    Timeout { after: Duration },

    /// The invocation was cancelled before the worker finished.
    #[error("worker invocation cancelled")]
    Cancelled,

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
