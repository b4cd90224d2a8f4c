//! Guaranteed, at-most-once deletion of a stored upload.
//!
//! Ownership of the stored file is taken with [`CleanupGuard::acquire`] at the
//! moment it is created. The normal path calls [`CleanupGuard::release`]
//! once the response is determined; any other exit (early return, `?`, panic
//! or the request future being dropped on client disconnect) deletes the file
//! from `Drop`.

use std::io::ErrorKind;

use crate::{ExecutorError, SandboxedPath};

/// What a release actually did on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The file existed and was deleted.
    Removed,
    /// Nothing was on disk; treated as success.
    AlreadyAbsent,
}

/// Scoped owner of one stored upload.
#[derive(Debug)]
#[must_use = "dropping the guard deletes the file immediately"]
pub struct CleanupGuard {
    path: SandboxedPath,
    released: bool,
}

impl CleanupGuard {
    /// Take ownership of `path`. Call this before the first byte is written.
    pub fn acquire(path: SandboxedPath) -> Self {
        Self { path, released: false }
    }

    /// The confined path this guard will delete.
    #[must_use]
    pub fn path(&self) -> &SandboxedPath {
        &self.path
    }

    /// Delete the file now. Consumes the guard, so a second attempt cannot be
    /// expressed.
    ///
    /// # Errors
    /// Returns [`ExecutorError::Io`] for failures other than the file already
    /// being absent. The caller logs it; it does not change the response.
    pub async fn release(mut self) -> Result<CleanupOutcome, ExecutorError> {
        self.released = true;
        let outcome = match tokio::fs::remove_file(self.path.as_path()).await {
            Ok(()) => CleanupOutcome::Removed,
            Err(e) if e.kind() == ErrorKind::NotFound => CleanupOutcome::AlreadyAbsent,
            Err(e) => return Err(ExecutorError::Io(e)),
        };
        tracing::debug!(path = %self.path.as_path().display(), ?outcome, "upload released");
        Ok(outcome)
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(self.path.as_path()) {
            Ok(()) => {
                tracing::info!(path = %self.path.as_path().display(), "upload removed on unwind");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(
                    path = %self.path.as_path().display(),
                    error = %e,
                    "failed to remove upload on unwind"
                );
            }
        }
    }
}
