//! The `/predict` request pipeline.
//!
//! Stages run strictly in order: credential gate, rate limiter, upload
//! validation and storage, worker invocation, cleanup. A request rejected at
//! one stage never reaches the next, and the stored file is released before
//! the response is built.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        multipart::MultipartRejection, ConnectInfo, FromRequestParts, Multipart, Query, State,
    },
    http::{request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use numeral_core::ClientKey;
use numeral_executor::{InferenceInvoker, PathSandbox, WorkerBackend};
use serde::Serialize;

use crate::auth::CredentialGate;
use crate::config::{ConfigError, GatewayConfig, Posture};
use crate::error::{
    GatewayError, ValidationError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
use crate::rate_limit::{Decision, Quota, RateLimiter};
use crate::upload::{AcceptedUpload, UploadValidator};

/// Header carrying the client credential.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Query parameter accepted when the header is absent.
pub const API_KEY_QUERY: &str = "api_key";

/// Shared, immutable request-handling state.
#[derive(Clone)]
pub struct AppState {
    /// Credential gate.
    pub gate: Arc<CredentialGate>,
    /// Per-client sliding-window limiter.
    pub limiter: Arc<RateLimiter>,
    /// Upload validator bound to the upload root.
    pub uploads: Arc<UploadValidator>,
    /// Worker invoker.
    pub invoker: Arc<InferenceInvoker>,
    /// Diagnostic posture for error bodies.
    pub posture: Posture,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("gate", &self.gate)
            .field("uploads", &self.uploads)
            .field("invoker", &self.invoker)
            .field("posture", &self.posture)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Build all pipeline components from `config`, running workers on
    /// `backend`.
    ///
    /// Creates and canonicalizes the upload root.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the upload root cannot be prepared or a
    /// sandbox cannot be built.
    pub fn from_config(
        config: &GatewayConfig,
        backend: Arc<dyn WorkerBackend>,
    ) -> Result<Self, ConfigError> {
        let root = config.prepare_upload_root()?;
        let sandbox = PathSandbox::upload_root(&root)?;
        let invoker = InferenceInvoker::new(backend, config.worker.clone())?;
        let gate = CredentialGate::new(&config.api_keys, config.auth_policy)
            .with_bypass(config.auth_bypass);

        tracing::info!(
            upload_root = %root.display(),
            keys = gate.key_count(),
            policy = ?config.auth_policy,
            posture = ?config.posture,
            "pipeline configured"
        );
        if config.auth_bypass {
            tracing::warn!("credential gate bypassed (development posture)");
        }

        Ok(Self {
            gate: Arc::new(gate),
            limiter: Arc::new(RateLimiter::in_memory(config.rate_limit)),
            uploads: Arc::new(UploadValidator::new(sandbox, config.limits)),
            invoker: Arc::new(invoker),
            posture: config.posture,
        })
    }
}

/// Remote address of the connection, when the server recorded one.
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<ConnectInfo<SocketAddr>>().map(|ConnectInfo(addr)| *addr)))
    }
}

/// Credential from `x-api-key`, else from the `api_key` query parameter.
#[derive(Clone)]
pub struct PresentedCredential(pub Option<String>);

impl std::fmt::Debug for PresentedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PresentedCredential")
            .field(&self.0.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for PresentedCredential {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let from_header = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);
        if from_header.is_some() {
            return Ok(Self(from_header));
        }
        let from_query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(mut params)| params.remove(API_KEY_QUERY))
            .filter(|v| !v.is_empty());
        Ok(Self(from_query))
    }
}

/// Successful `/predict` body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictResponse {
    /// Always `true`.
    pub success: bool,
    /// Predicted digit, 0 through 9.
    pub prediction: u8,
    /// Model confidence, 0 through 1.
    pub confidence: f64,
    /// Sanitised client filename.
    pub filename: String,
    /// Client correlation token, when one was sent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_key: Option<String>,
}

/// `POST /predict`: authenticate, rate-limit, validate, infer, clean up.
pub async fn predict(
    State(state): State<AppState>,
    ClientAddr(addr): ClientAddr,
    PresentedCredential(credential): PresentedCredential,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let posture = state.posture;

    let identity = match state.gate.authorize(credential.as_deref()) {
        Ok(identity) => identity,
        Err(e) => return GatewayError::from(e).render(posture),
    };

    let address = addr.map_or_else(|| "unknown".to_owned(), |a| a.ip().to_string());
    let client = ClientKey::new(address, identity.principal());
    let quota = match state.limiter.check(&client, Instant::now()) {
        Ok(Decision::Allow(quota)) => quota,
        Ok(Decision::Reject(limited)) => return GatewayError::RateLimited(limited).render(posture),
        Err(e) => return GatewayError::Internal(e.to_string()).render(posture),
    };

    let mut response = match process(&state, &client, multipart).await {
        Ok(body) => (StatusCode::OK, Json(body)).into_response(),
        Err(e) => e.render(posture),
    };
    apply_quota(response.headers_mut(), quota);
    response
}

async fn process(
    state: &AppState,
    client: &ClientKey,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<PredictResponse, GatewayError> {
    let mut multipart = multipart.map_err(|e| ValidationError::Malformed(e.body_text()))?;
    let AcceptedUpload { asset, guard, file_key } = state.uploads.accept(&mut multipart).await?;

    tracing::info!(asset_id = %asset.id, client = %client, size = asset.size, "running inference");
    let outcome = state.invoker.invoke(guard.path()).await;

    // The response is already decided; a cleanup failure is only logged.
    if let Err(e) = guard.release().await {
        tracing::error!(asset_id = %asset.id, error = %e, "failed to remove stored upload");
    }

    let result = outcome?;
    Ok(PredictResponse {
        success: true,
        prediction: result.digit.value(),
        confidence: result.confidence.value(),
        filename: asset.original_name,
        file_key,
    })
}

fn apply_quota(headers: &mut HeaderMap, quota: Quota) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(quota.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(quota.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(quota.reset_after_secs()));
}
