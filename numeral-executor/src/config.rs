//! Worker invocation configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wall-clock ceiling for one worker run.
pub const DEFAULT_WORKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Interpreter used when no override is configured.
pub const DEFAULT_INTERPRETER: &str = "/usr/bin/python3";

/// Configuration for invoking the external inference worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WorkerConfig {
    /// Interpreter candidate. Still checked against `allowed_interpreters`
    /// on every invocation; an override is never a bypass.
    pub interpreter: PathBuf,

    /// Exact interpreter paths that may be executed.
    pub allowed_interpreters: Vec<PathBuf>,

    /// Absolute path of the worker script, passed as the first argument.
    pub script_path: PathBuf,

    /// Base directory for resolving relative interpreter paths.
    pub base_dir: PathBuf,

    /// Kill the worker and fail the request after this long.
    pub timeout: Duration,
}

impl WorkerConfig {
    /// Create a config with the default interpreter, whitelist and timeout.
    ///
    /// # Arguments
    /// - `base_dir`: absolute project directory
    /// - `script_path`: worker script; relative paths are joined to `base_dir`
    #[must_use]
    pub fn new(base_dir: PathBuf, script_path: PathBuf) -> Self {
        let script_path = if script_path.is_absolute() {
            script_path
        } else {
            base_dir.join(script_path)
        };
        Self {
            interpreter: PathBuf::from(DEFAULT_INTERPRETER),
            allowed_interpreters: default_interpreters(&base_dir),
            script_path,
            base_dir,
            timeout: DEFAULT_WORKER_TIMEOUT,
        }
    }

    /// Replace the interpreter candidate.
    #[must_use]
    pub fn with_interpreter(mut self, interpreter: impl Into<PathBuf>) -> Self {
        self.interpreter = interpreter.into();
        self
    }

    /// Replace the interpreter whitelist.
    #[must_use]
    pub fn with_allowed_interpreters<I, P>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.allowed_interpreters = allowed.into_iter().map(Into::into).collect();
        self
    }

    /// Replace the wall-clock ceiling.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// System Python locations plus the project virtualenv.
#[must_use]
pub fn default_interpreters(base_dir: &Path) -> Vec<PathBuf> {
    vec![
        PathBuf::from("/usr/bin/python3"),
        PathBuf::from("/usr/bin/python"),
        PathBuf::from("/usr/local/bin/python3"),
        PathBuf::from("/usr/local/bin/python"),
        base_dir.join("venv/bin/python"),
        base_dir.join("venv/bin/python3"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_joins_relative_script_to_base() {
        let cfg = WorkerConfig::new(PathBuf::from("/srv/numeral"), PathBuf::from("ml/predict.py"));
        assert_eq!(cfg.script_path, PathBuf::from("/srv/numeral/ml/predict.py"));
        assert_eq!(cfg.interpreter, PathBuf::from(DEFAULT_INTERPRETER));
        assert_eq!(cfg.timeout, DEFAULT_WORKER_TIMEOUT);
        assert!(cfg.allowed_interpreters.contains(&PathBuf::from("/srv/numeral/venv/bin/python")));
    }

    #[test]
    fn builders_replace_fields() {
        let cfg = WorkerConfig::new(PathBuf::from("/srv"), PathBuf::from("/opt/w.py"))
            .with_interpreter("/bin/sh")
            .with_allowed_interpreters(["/bin/sh"])
            .with_timeout(Duration::from_millis(250));
        assert_eq!(cfg.script_path, PathBuf::from("/opt/w.py"));
        assert_eq!(cfg.interpreter, PathBuf::from("/bin/sh"));
        assert_eq!(cfg.allowed_interpreters, vec![PathBuf::from("/bin/sh")]);
        assert_eq!(cfg.timeout, Duration::from_millis(250));
    }
}
