//! End-to-end tests of `POST /predict` through the full router.
//!
//! Multipart bodies are built by hand; the worker is either a recording mock
//! backend or a real `/bin/sh` script run through `ProcessBackend`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::Response,
    Router,
};
use numeral_executor::{
    CancelSignal, ExecutorError, ProcessBackend, SandboxedPath, WorkerBackend, WorkerCommand,
    WorkerConfig, WorkerOutput,
};
use numeral_gateway::{
    config::{GatewayConfig, Posture, RateLimitConfig},
    pipeline::AppState,
    routes::create_router,
};
use tower::ServiceExt;

const API_KEY: &str = "test-key-0123456789";
const BOUNDARY: &str = "numeral-test-boundary";
const REPLY: &str = "{\"digit\":1,\"confidence\":0.9}";

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend(std::iter::repeat(0x42).take(392));
    bytes
}

fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend(std::iter::repeat(0x11).take(4092));
    bytes
}

enum Part<'a> {
    File { name: &'a str, filename: &'a str, content_type: &'a str, bytes: Vec<u8> },
    Text { name: &'a str, value: &'a str },
}

fn multipart(parts: Vec<Part<'_>>) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::File { name, filename, content_type, bytes } => {
                let head = format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: {content_type}\r\n\r\n"
                );
                body.extend_from_slice(head.as_bytes());
                body.extend_from_slice(&bytes);
            }
            Part::Text { name, value } => {
                let head = format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n");
                body.extend_from_slice(head.as_bytes());
                body.extend_from_slice(value.as_bytes());
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn image<'a>(filename: &'a str, content_type: &'a str, bytes: Vec<u8>) -> Part<'a> {
    Part::File { name: "image", filename, content_type, bytes }
}

fn predict_request(api_key: Option<&str>, body: Vec<u8>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/predict")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"));
    if let Some(key) = api_key {
        builder = builder.header("x-api-key", key);
    }
    match builder.body(Body::from(body)) {
        Ok(r) => r,
        Err(e) => panic!("failed to build request: {e}"),
    }
}

/// An authenticated request carrying a single part.
fn upload_request(part: Part<'_>) -> Request<Body> {
    predict_request(Some(API_KEY), multipart(vec![part]))
}

/// An authenticated request carrying one valid PNG.
fn png_request() -> Request<Body> {
    upload_request(image("a.png", "image/png", png_bytes()))
}

async fn send(app: &Router, req: Request<Body>) -> Response {
    match app.clone().oneshot(req).await {
        Ok(r) => r,
        Err(e) => panic!("handler error: {e}"),
    }
}

async fn json_body(resp: Response) -> serde_json::Value {
    let bytes = match axum::body::to_bytes(resp.into_body(), 64 * 1024).await {
        Ok(b) => b,
        Err(e) => panic!("failed to read body: {e}"),
    };
    match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(e) => panic!("invalid JSON: {e}"),
    }
}

fn limit(max_requests: usize) -> RateLimitConfig {
    RateLimitConfig { window: Duration::from_secs(60), max_requests, fail_open: false }
}

/// Worker stand-in that records every input it is handed.
struct RecordingBackend {
    output: WorkerOutput,
    delay: Duration,
    seen: Mutex<Vec<(PathBuf, bool)>>,
}

impl RecordingBackend {
    fn replying(stdout: &str, exit_code: i32) -> Arc<Self> {
        Self::slow(stdout, exit_code, Duration::ZERO)
    }

    fn slow(stdout: &str, exit_code: i32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            output: WorkerOutput {
                stdout: stdout.as_bytes().to_vec(),
                stderr: Vec::new(),
                exit_code: Some(exit_code),
            },
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(PathBuf, bool)> {
        match self.seen.lock() {
            Ok(seen) => seen.clone(),
            Err(e) => panic!("lock poisoned: {e}"),
        }
    }
}

#[async_trait]
impl WorkerBackend for RecordingBackend {
    async fn run(
        &self,
        command: &WorkerCommand,
        _: Duration,
        _: CancelSignal,
    ) -> Result<WorkerOutput, ExecutorError> {
        let path = command.input.as_path().to_owned();
        let existed = path.is_file();
        match self.seen.lock() {
            Ok(mut seen) => seen.push((path, existed)),
            Err(e) => panic!("lock poisoned: {e}"),
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.output.clone())
    }

    async fn health_check(&self, _: &SandboxedPath) -> Result<(), ExecutorError> {
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    app: Router,
}

impl Harness {
    fn with(
        backend: Arc<dyn WorkerBackend>,
        tweak: impl FnOnce(&mut GatewayConfig, &Path),
    ) -> Self {
        let dir = match tempfile::tempdir() {
            Ok(d) => d,
            Err(e) => panic!("failed to create temp dir: {e}"),
        };
        let script = dir.path().join("predict.sh");
        if let Err(e) = std::fs::write(&script, "printf '{\"digit\":7,\"confidence\":0.94}'\n") {
            panic!("failed to write script: {e}");
        }

        let mut config = GatewayConfig::new(dir.path().to_path_buf());
        config.api_keys = vec![API_KEY.to_owned()];
        config.worker = WorkerConfig::new(dir.path().to_path_buf(), script)
            .with_interpreter("/bin/sh")
            .with_allowed_interpreters(["/bin/sh"])
            .with_timeout(Duration::from_secs(10));
        tweak(&mut config, dir.path());

        let state = match AppState::from_config(&config, backend) {
            Ok(s) => s,
            Err(e) => panic!("failed to build state: {e}"),
        };
        Self { app: create_router(state), dir }
    }

    fn new(backend: Arc<dyn WorkerBackend>) -> Self {
        Self::with(backend, |_, _| {})
    }

    fn upload_root(&self) -> PathBuf {
        match std::fs::canonicalize(self.dir.path().join("uploads")) {
            Ok(p) => p,
            Err(e) => panic!("upload root missing: {e}"),
        }
    }

    fn stored_files(&self) -> usize {
        std::fs::read_dir(self.dir.path().join("uploads")).map(Iterator::count).unwrap_or(0)
    }
}

// ── Success path ──────────────────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn png_upload_is_predicted_and_removed() {
    let h = Harness::new(Arc::new(ProcessBackend::new()));
    let body = multipart(vec![
        image("digit.png", "image/png", png_bytes()),
        Part::Text { name: "fileKey", value: "canvas-42" },
    ]);
    let resp = send(&h.app, predict_request(Some(API_KEY), body)).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-ratelimit-limit"], "100");
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "99");
    assert_eq!(resp.headers()["x-ratelimit-reset"], "900");
    let body = json_body(resp).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["prediction"], 7);
    assert!((body["confidence"].as_f64().unwrap_or_default() - 0.94).abs() < 1e-9);
    assert_eq!(body["filename"], "digit.png");
    assert_eq!(body["fileKey"], "canvas-42");
    assert_eq!(h.stored_files(), 0, "upload must be deleted before responding");
}

#[tokio::test]
async fn worker_sees_stored_file_and_file_key_is_optional() {
    let backend = RecordingBackend::replying("{\"digit\":3,\"confidence\":0.5}\n", 0);
    let h = Harness::new(backend.clone());
    let resp = send(&h.app, upload_request(image("x.jpg", "image/jpeg", jpeg_bytes()))).await;

    assert_eq!(resp.status(), StatusCode::OK);
    let body = json_body(resp).await;
    assert_eq!(body["prediction"], 3);
    assert!(body.get("fileKey").is_none());

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    let (path, existed) = &calls[0];
    assert!(*existed, "worker must see the stored file");
    assert!(path.starts_with(h.upload_root()));
    assert_eq!(path.extension().and_then(|e| e.to_str()), Some("jpg"));
    assert!(!path.exists());
}

#[tokio::test]
async fn client_filename_is_only_a_label() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::new(backend.clone());
    let part = image("../../etc/passwd.png", "image/png", png_bytes());
    let resp = send(&h.app, upload_request(part)).await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(json_body(resp).await["filename"], "passwd.png");
    let (path, _) = &backend.calls()[0];
    let name = path.file_name().and_then(|n| n.to_str());
    assert!(name.is_some_and(|n| n.starts_with("upload-")));
}

// ── Validation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn jpeg_bytes_labelled_png_are_rejected_before_the_worker() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::new(backend.clone());
    let resp = send(&h.app, upload_request(image("digit.png", "image/png", jpeg_bytes()))).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["error"], "validation");
    assert!(backend.calls().is_empty(), "worker must never be invoked");
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn non_whitelisted_type_is_rejected() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::new(backend.clone());
    let resp = send(&h.app, upload_request(image("a.gif", "image/gif", png_bytes()))).await;

    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(backend.calls().is_empty());
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn tiny_and_oversized_files_are_rejected() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::with(backend.clone(), |c, _| c.limits.max_bytes = 1024);

    let tiny = png_bytes()[..40].to_vec();
    let resp = send(&h.app, upload_request(image("t.png", "image/png", tiny))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = send(&h.app, upload_request(image("big.jpg", "image/jpeg", jpeg_bytes()))).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(resp).await["message"], "File too large");

    assert!(backend.calls().is_empty());
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn missing_and_duplicate_images_are_rejected() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::new(backend.clone());

    let resp = send(&h.app, upload_request(Part::Text { name: "fileKey", value: "k" })).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let two = multipart(vec![
        image("a.png", "image/png", png_bytes()),
        image("b.png", "image/png", png_bytes()),
    ]);
    let resp = send(&h.app, predict_request(Some(API_KEY), two)).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    assert!(backend.calls().is_empty());
    assert_eq!(h.stored_files(), 0);
}

// ── Credentials ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_credential_is_401_and_wrong_one_is_403() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::new(backend.clone());
    let body = || multipart(vec![image("a.png", "image/png", png_bytes())]);

    let resp = send(&h.app, predict_request(None, body())).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(resp).await["error"], "auth");

    let resp = send(&h.app, predict_request(Some("wrong"), body())).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    assert!(backend.calls().is_empty());
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn credential_may_come_from_query_string() {
    let backend = RecordingBackend::replying("{\"digit\":4,\"confidence\":0.8}", 0);
    let h = Harness::new(backend);
    let req = match Request::builder()
        .method("POST")
        .uri(format!("/predict?api_key={API_KEY}"))
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(multipart(vec![image("a.png", "image/png", png_bytes())])))
    {
        Ok(r) => r,
        Err(e) => panic!("failed to build request: {e}"),
    };
    assert_eq!(send(&h.app, req).await.status(), StatusCode::OK);
}

// ── Rate limiting ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn request_over_the_limit_gets_429_with_retry_after() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::with(backend.clone(), |c, _| c.rate_limit = limit(2));

    for _ in 0..2 {
        let resp = send(&h.app, png_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_ne!(resp.headers()["x-ratelimit-reset"], "0");
    }
    let resp = send(&h.app, png_request()).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(resp.headers().contains_key("retry-after"));
    assert_eq!(resp.headers()["x-ratelimit-remaining"], "0");
    let body = json_body(resp).await;
    assert_eq!(body["error"], "rate_limit");
    assert!(body["retryAfter"].as_u64().is_some_and(|s| (1..=60).contains(&s)));
    assert_eq!(backend.calls().len(), 2);
}

#[tokio::test]
async fn clients_are_limited_by_address() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::with(backend, |c, _| c.rate_limit = limit(1));
    let from = |ip: [u8; 4]| {
        let mut req = png_request();
        req.extensions_mut().insert(ConnectInfo(std::net::SocketAddr::from((ip, 4000))));
        req
    };
    assert_eq!(send(&h.app, from([10, 0, 0, 1])).await.status(), StatusCode::OK);
    assert_eq!(send(&h.app, from([10, 0, 0, 2])).await.status(), StatusCode::OK);
    let again = send(&h.app, from([10, 0, 0, 1])).await;
    assert_eq!(again.status(), StatusCode::TOO_MANY_REQUESTS);
}

// ── Worker failures ───────────────────────────────────────────────────────────

#[tokio::test]
async fn worker_failure_is_500_without_detail_in_production() {
    let backend =
        RecordingBackend::replying("{\"error\":\"model file /srv/ml/model.pkl missing\"}", 1);
    let h = Harness::new(backend.clone());
    let resp = send(&h.app, png_request()).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "inference");
    assert!(body.get("detail").is_none());
    assert!(!body.to_string().contains("model.pkl"));
    assert_eq!(backend.calls().len(), 1);
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn worker_failure_carries_detail_in_development() {
    let backend = RecordingBackend::replying("{\"error\":\"model missing\"}", 1);
    let h = Harness::with(backend, |c, _| c.posture = Posture::Development);
    let resp = send(&h.app, png_request()).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(resp).await;
    assert!(body["detail"].as_str().is_some_and(|d| d.contains("model missing")));
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn unparsable_worker_output_is_500() {
    let backend = RecordingBackend::replying("Loading model...\n{\"digit\":1}", 0);
    let h = Harness::new(backend);
    let resp = send(&h.app, png_request()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn multi_line_worker_reply_is_500() {
    let backend =
        RecordingBackend::replying("{\n  \"digit\": 7,\n  \"confidence\": 0.9\n}\n", 0);
    let h = Harness::new(backend);
    let resp = send(&h.app, png_request()).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(resp).await["error"], "inference");
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn interpreter_outside_whitelist_is_a_security_error() {
    let backend = RecordingBackend::replying(REPLY, 0);
    let h = Harness::with(backend.clone(), |c, base| {
        c.worker = WorkerConfig::new(base.to_path_buf(), base.join("predict.sh"))
            .with_interpreter("/tmp/evil-python")
            .with_allowed_interpreters(["/bin/sh"]);
    });
    let resp = send(&h.app, png_request()).await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(resp).await;
    assert_eq!(body["error"], "security");
    assert!(!body.to_string().contains("evil"));
    assert!(backend.calls().is_empty());
    assert_eq!(h.stored_files(), 0);
}

// ── Concurrency and cancellation ──────────────────────────────────────────────

#[tokio::test]
async fn concurrent_uploads_get_unique_paths() {
    let reply = "{\"digit\":8,\"confidence\":0.7}";
    let backend = RecordingBackend::slow(reply, 0, Duration::from_millis(50));
    let h = Harness::new(backend.clone());

    let requests = (0..8).map(|_| {
        let app = h.app.clone();
        tokio::spawn(async move { send(&app, png_request()).await.status() })
    });
    for task in requests.collect::<Vec<_>>() {
        match task.await {
            Ok(status) => assert_eq!(status, StatusCode::OK),
            Err(e) => panic!("request task failed: {e}"),
        }
    }

    let mut paths: Vec<PathBuf> = backend.calls().into_iter().map(|(p, _)| p).collect();
    assert_eq!(paths.len(), 8);
    paths.sort();
    paths.dedup();
    assert_eq!(paths.len(), 8, "stored names must never collide");
    assert_eq!(h.stored_files(), 0);
}

#[tokio::test]
async fn abandoned_request_still_removes_its_upload() {
    let backend = RecordingBackend::slow(REPLY, 0, Duration::from_secs(30));
    let h = Harness::new(backend.clone());

    let task = {
        let app = h.app.clone();
        tokio::spawn(async move { send(&app, png_request()).await })
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while backend.calls().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "worker never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.stored_files(), 1, "upload must exist while inference runs");

    // A client disconnect drops the in-flight request future.
    task.abort();
    match task.await {
        Err(e) if e.is_cancelled() => {}
        Err(e) => panic!("request task failed: {e}"),
        Ok(resp) => panic!("request finished despite abort: {}", resp.status()),
    }
    assert_eq!(h.stored_files(), 0, "abandoned upload must be deleted");
}
