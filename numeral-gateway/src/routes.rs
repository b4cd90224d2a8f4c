//! Router assembly and the small endpoints around `/predict`.

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::map_response_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Posture;
use crate::pipeline::{predict, AppState};

/// Multipart framing allowance on top of the image ceiling.
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const X_XSS_PROTECTION: HeaderName = HeaderName::from_static("x-xss-protection");

// ── Router ────────────────────────────────────────────────────────────────────

/// Build the application router over `state`.
pub fn create_router(state: AppState) -> Router {
    let max_bytes = usize::try_from(state.uploads.limits().max_bytes).unwrap_or(usize::MAX);
    let body_limit = max_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES);
    let posture = state.posture;

    Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(map_response_with_state(posture, security_headers))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// `GET /health`: liveness plus worker readiness.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let worker = match state.invoker.health_check().await {
        Ok(()) => "ready",
        Err(e) => {
            tracing::warn!(error = %e, "worker health check failed");
            "unavailable"
        }
    };
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "timestamp": Utc::now().to_rfc3339(),
            "worker": worker,
        })),
    )
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": "Endpoint not found"})),
    )
}

async fn security_headers(State(posture): State<Posture>, mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(X_XSS_PROTECTION, HeaderValue::from_static("1; mode=block"));
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    if posture == Posture::Production {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        );
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(
                "default-src 'self'; img-src 'self' data: blob:; frame-ancestors 'none'",
            ),
        );
    }
    response
}
