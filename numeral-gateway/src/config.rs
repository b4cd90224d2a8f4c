//! Gateway configuration, read once from the environment at start-up.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use numeral_executor::{default_interpreters, ExecutorError, WorkerConfig};

/// Credential used when none is configured in the development posture.
pub const DEV_API_KEY: &str = "dev-api-key-12345";

/// Errors raised while loading configuration or preparing start-up state.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A variable was present but could not be parsed.
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    /// The upload root could not be created or resolved.
    #[error("upload root {path}: {source}")]
    UploadRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sandbox could not be built from the configured paths.
    #[error(transparent)]
    Sandbox(#[from] ExecutorError),

    /// The working directory could not be determined.
    #[error("cannot determine working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
}

/// Whether verbose diagnostics may be shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Posture {
    /// Client bodies carry generic messages only.
    Production,
    /// Client bodies also carry a `detail` field.
    Development,
}

impl FromStr for Posture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            other => Err(format!("expected 'production' or 'development', got '{other}'")),
        }
    }
}

/// Whether a credential must be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    /// Requests without a valid credential are rejected.
    Required,
    /// Requests without a credential pass as anonymous; a presented
    /// credential must still be valid.
    Optional,
}

impl FromStr for AuthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(Self::Required),
            "optional" => Ok(Self::Optional),
            other => Err(format!("expected 'required' or 'optional', got '{other}'")),
        }
    }
}

/// Size bounds for the uploaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Streaming ceiling; exceeding it aborts the upload mid-body.
    pub max_bytes: u64,
    /// Smallest stored file that can plausibly be an image.
    pub min_bytes: u64,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self { max_bytes: 2 * 1024 * 1024, min_bytes: 100 }
    }
}

/// Sliding-window limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Trailing window length.
    pub window: Duration,
    /// Accepted requests allowed per client within the window.
    pub max_requests: usize,
    /// Allow traffic (and log) when the limiter itself fails.
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { window: Duration::from_secs(15 * 60), max_requests: 100, fail_open: false }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct GatewayConfig {
    /// Socket address to bind.
    pub listen_addr: String,
    /// Diagnostic posture.
    pub posture: Posture,
    /// Credential allow-set.
    pub api_keys: Vec<String>,
    /// Credential policy for `/predict`.
    pub auth_policy: AuthPolicy,
    /// Development-only gate bypass.
    pub auth_bypass: bool,
    /// Sandbox root for stored uploads.
    pub upload_dir: PathBuf,
    /// Upload size bounds.
    pub limits: UploadLimits,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
    /// Worker invocation settings.
    pub worker: WorkerConfig,
}

impl GatewayConfig {
    /// Defaults rooted at `base_dir`, with an empty credential allow-set.
    #[must_use]
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            listen_addr: "127.0.0.1:5000".to_owned(),
            posture: Posture::Production,
            api_keys: Vec::new(),
            auth_policy: AuthPolicy::Required,
            auth_bypass: false,
            upload_dir: base_dir.join("uploads"),
            limits: UploadLimits::default(),
            rate_limit: RateLimitConfig::default(),
            worker: WorkerConfig::new(base_dir.clone(), base_dir.join("ml/predict.py")),
        }
    }

    /// Load from process environment variables.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unparsable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary variable source.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] for unparsable values, or
    /// [`ConfigError::WorkingDir`] if a relative base needs the working
    /// directory and it cannot be read.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
        let base_dir =
            absolutize(&cwd, get("NUMERAL_BASE_DIR").map_or_else(|| cwd.clone(), PathBuf::from));
        let mut config = Self::new(base_dir.clone());

        if let Some(addr) = get("NUMERAL_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        config.posture = parse_or(&get, "NUMERAL_ENV", Posture::Production)?;
        config.auth_policy = parse_or(&get, "NUMERAL_AUTH", AuthPolicy::Required)?;

        config.api_keys = get("NUMERAL_API_KEYS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|k| !k.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        if config.api_keys.is_empty() && config.posture == Posture::Development {
            config.api_keys.push(DEV_API_KEY.to_owned());
        }

        let bypass: bool = parse_or(&get, "NUMERAL_DISABLE_AUTH", false)?;
        if bypass && config.posture == Posture::Production {
            tracing::warn!("NUMERAL_DISABLE_AUTH is ignored outside the development posture");
        }
        config.auth_bypass = bypass && config.posture == Posture::Development;

        if let Some(dir) = get("NUMERAL_UPLOAD_DIR") {
            config.upload_dir = absolutize(&base_dir, PathBuf::from(dir));
        }

        let max_bytes = parse_or(&get, "NUMERAL_MAX_UPLOAD_BYTES", config.limits.max_bytes)?;
        let max_bytes = nonzero("NUMERAL_MAX_UPLOAD_BYTES", max_bytes)?;
        let min_bytes = parse_or(&get, "NUMERAL_MIN_UPLOAD_BYTES", config.limits.min_bytes)?;
        if min_bytes > max_bytes {
            return Err(ConfigError::Invalid {
                key: "NUMERAL_MIN_UPLOAD_BYTES",
                value: min_bytes.to_string(),
                reason: format!("must not exceed NUMERAL_MAX_UPLOAD_BYTES ({max_bytes})"),
            });
        }
        config.limits = UploadLimits { max_bytes, min_bytes };

        let window_secs =
            parse_or(&get, "NUMERAL_RATE_WINDOW_SECS", config.rate_limit.window.as_secs())?;
        config.rate_limit = RateLimitConfig {
            window: Duration::from_secs(nonzero("NUMERAL_RATE_WINDOW_SECS", window_secs)?),
            max_requests: parse_or(
                &get,
                "NUMERAL_RATE_MAX_REQUESTS",
                config.rate_limit.max_requests,
            )?,
            fail_open: parse_or(&get, "NUMERAL_RATE_FAIL_OPEN", config.rate_limit.fail_open)?,
        };

        let script = get("NUMERAL_WORKER_SCRIPT")
            .map_or_else(|| base_dir.join("ml/predict.py"), PathBuf::from);
        let mut worker = WorkerConfig::new(base_dir.clone(), script);
        if let Some(override_path) = get("NUMERAL_PYTHON_PATH") {
            worker = worker.with_interpreter(override_path);
        }
        let allowed = get("NUMERAL_INTERPRETERS").map_or_else(
            || default_interpreters(&base_dir),
            |raw| raw.split(':').filter(|p| !p.is_empty()).map(PathBuf::from).collect(),
        );
        let timeout_secs =
            parse_or(&get, "NUMERAL_WORKER_TIMEOUT_SECS", worker.timeout.as_secs())?;
        let timeout_secs = nonzero("NUMERAL_WORKER_TIMEOUT_SECS", timeout_secs)?;
        config.worker = worker
            .with_allowed_interpreters(allowed)
            .with_timeout(Duration::from_secs(timeout_secs));

        Ok(config)
    }

    /// Create the upload root if needed and resolve it to a canonical path.
    ///
    /// Symlinks in the root are resolved here, once, so every later
    /// confinement check compares against the real directory.
    ///
    /// # Errors
    /// Returns [`ConfigError::UploadRoot`] on I/O failure.
    pub fn prepare_upload_root(&self) -> Result<PathBuf, ConfigError> {
        let wrap = |source| ConfigError::UploadRoot { path: self.upload_dir.clone(), source };
        std::fs::create_dir_all(&self.upload_dir).map_err(wrap)?;
        std::fs::canonicalize(&self.upload_dir).map_err(wrap)
    }
}

fn absolutize(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn nonzero(key: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        Err(ConfigError::Invalid {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        })
    } else {
        Ok(value)
    }
}
