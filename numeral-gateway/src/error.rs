//! Error taxonomy for the gateway and its single response formatter.
//!
//! Every failure on the request path becomes a [`GatewayError`]. Clients see
//! a category tag and a fixed message per variant; internal detail (paths,
//! worker output, OS errors) is logged here and only echoed to the client in
//! the development posture.

use axum::{
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use numeral_core::SecurityViolation;
use numeral_executor::ExecutorError;
use serde_json::{json, Map, Value};

use crate::auth::AuthError;
use crate::config::Posture;
use crate::rate_limit::RateLimited;

pub(crate) const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub(crate) const X_RATELIMIT_REMAINING: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");
pub(crate) const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The upload itself was unacceptable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// No `image` field was sent.
    #[error("no image file provided")]
    MissingFile,
    /// More than one `image` field was sent.
    #[error("only one image file may be uploaded")]
    MultipleFiles,
    /// The declared content type is not on the whitelist.
    #[error("unsupported media type '{declared}'")]
    UnsupportedMediaType { declared: String },
    /// The body exceeded the streaming ceiling.
    #[error("file exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    /// The stored file is too small to be an image.
    #[error("file is {actual} bytes; minimum is {min}")]
    TooSmall { min: u64, actual: u64 },
    /// The stored bytes do not start with the declared type's signature.
    #[error("contents do not match declared type {declared}")]
    SignatureMismatch { declared: String },
    /// The `fileKey` field is longer than allowed.
    #[error("fileKey is too long")]
    FileKeyTooLong,
    /// The multipart body could not be parsed.
    #[error("malformed multipart body: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// The security violation this failure also represents, if any.
    #[must_use]
    pub fn violation(&self) -> Option<SecurityViolation> {
        match self {
            Self::TooLarge { .. } | Self::TooSmall { .. } => {
                Some(SecurityViolation::SizeOutOfRange)
            }
            Self::SignatureMismatch { .. } => Some(SecurityViolation::SignatureMismatch),
            _ => None,
        }
    }

    fn client_message(&self) -> &'static str {
        match self {
            Self::MissingFile => "No image file provided",
            Self::MultipleFiles => "Only one image file may be uploaded",
            Self::UnsupportedMediaType { .. } => "Only JPEG and PNG images are allowed",
            Self::TooLarge { .. } => "File too large",
            Self::TooSmall { .. } => "File too small to be a valid image",
            Self::SignatureMismatch { .. } => "File content does not match its declared type",
            Self::FileKeyTooLong => "fileKey is too long",
            Self::Malformed(_) => "Malformed upload request",
        }
    }
}

/// Any failure on the request path.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Missing or invalid credential.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Too many requests in the current window.
    #[error("rate limit exceeded; retry after {}s", .0.retry_after_secs)]
    RateLimited(RateLimited),

    /// The upload was rejected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A sandbox boundary was crossed.
    #[error(transparent)]
    Security(SecurityViolation),

    /// The inference worker failed.
    #[error("inference failed: {0}")]
    Inference(ExecutorError),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),

    /// Local filesystem failure while storing the upload.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ExecutorError> for GatewayError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Security(v) => Self::Security(v),
            ExecutorError::Io(e) => Self::Io(e),
            other => Self::Inference(other),
        }
    }
}

impl From<SecurityViolation> for GatewayError {
    fn from(v: SecurityViolation) -> Self {
        Self::Security(v)
    }
}

impl GatewayError {
    /// Category tag returned to the client in the `error` field.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::RateLimited(_) => "rate_limit",
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::Inference(_) => "inference",
            Self::Internal(_) | Self::Io(_) => "internal",
        }
    }

    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Auth(AuthError::Missing) => StatusCode::UNAUTHORIZED,
            Self::Auth(AuthError::Invalid) => StatusCode::FORBIDDEN,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Security(_) | Self::Inference(_) | Self::Internal(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Fixed client-facing message. Never contains paths or worker output.
    #[must_use]
    pub fn client_message(&self) -> &'static str {
        match self {
            Self::Auth(AuthError::Missing) => "API key required",
            Self::Auth(AuthError::Invalid) => "Invalid API key",
            Self::RateLimited(_) => "Too many requests, please try again later",
            Self::Validation(v) => v.client_message(),
            Self::Security(_) => "Request rejected",
            Self::Inference(ExecutorError::Timeout { .. }) => "Prediction timed out",
            Self::Inference(_) => "Prediction failed",
            Self::Internal(_) | Self::Io(_) => "Internal server error",
        }
    }

    /// Security violation attached to this rejection, if any.
    #[must_use]
    pub fn violation(&self) -> Option<SecurityViolation> {
        match self {
            Self::Security(v) => Some(*v),
            Self::Validation(v) => v.violation(),
            _ => None,
        }
    }

    fn log(&self) {
        let category = self.category();
        match self {
            Self::Validation(v) => match v.violation() {
                Some(violation) => {
                    let violation = violation.tag();
                    tracing::warn!(category, violation, error = %self, "upload rejected");
                }
                None => tracing::info!(category, error = %self, "request rejected"),
            },
            Self::Auth(_) | Self::RateLimited(_) => {
                tracing::info!(category, error = %self, "request rejected");
            }
            Self::Security(v) => {
                tracing::warn!(category, violation = v.tag(), "security violation");
            }
            Self::Inference(ExecutorError::WorkerFailed { exit_code, diagnostics }) => {
                tracing::error!(category, ?exit_code, %diagnostics, "inference worker failed");
            }
            Self::Inference(_) | Self::Internal(_) | Self::Io(_) => {
                tracing::error!(category, error = %self, "request failed");
            }
        }
    }

    /// Build the client response for `posture`.
    ///
    /// The body is `{"error": <category>, "message": <text>}`, plus
    /// `retryAfter` for rate limiting and `detail` in the development
    /// posture only.
    #[must_use]
    pub fn render(&self, posture: Posture) -> Response {
        self.log();

        let mut body = Map::new();
        body.insert("error".to_owned(), Value::from(self.category()));
        body.insert("message".to_owned(), Value::from(self.client_message()));
        if let Self::RateLimited(limited) = self {
            body.insert("retryAfter".to_owned(), json!(limited.retry_after_secs));
        }
        if posture == Posture::Development {
            body.insert("detail".to_owned(), Value::from(self.detail()));
        }

        let mut response = (self.status(), Json(Value::Object(body))).into_response();
        if let Self::RateLimited(limited) = self {
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(limited.retry_after_secs));
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limited.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(limited.retry_after_secs));
        }
        response
    }

    fn detail(&self) -> String {
        match self {
            Self::Inference(ExecutorError::WorkerFailed { exit_code, diagnostics }) => {
                format!("worker exited with {exit_code:?}: {diagnostics}")
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.render(Posture::Production)
    }
}
