//! Prometheus metrics for ChunkStore.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides a Tower-compatible middleware for
//! HTTP RED metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "chunkstore_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "chunkstore_http_request_duration_seconds";

/// Errors returned to callers (counter). Labels: code.
pub const TRANSFER_ERRORS_TOTAL: &str = "chunkstore_transfer_errors_total";

/// Blocks staged against the backend (counter).
pub const CHUNKS_STAGED_TOTAL: &str = "chunkstore_chunks_staged_total";

/// Total bytes received in chunk bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "chunkstore_bytes_received_total";

/// Total bytes streamed to downloaders (counter).
pub const BYTES_SENT_TOTAL: &str = "chunkstore_bytes_sent_total";

/// Uploads committed and registered (counter).
pub const UPLOADS_COMMITTED_TOTAL: &str = "chunkstore_uploads_committed_total";

/// Uploads cancelled (counter).
pub const UPLOADS_CANCELLED_TOTAL: &str = "chunkstore_uploads_cancelled_total";

/// Committed objects whose metadata write failed (counter).
pub const ORPHANED_OBJECTS_TOTAL: &str = "chunkstore_orphaned_objects_total";

/// Upload sessions currently open (gauge).
pub const ACTIVE_UPLOAD_SESSIONS: &str = "chunkstore_active_upload_sessions";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(TRANSFER_ERRORS_TOTAL, "Errors returned to callers by code");
    describe_counter!(CHUNKS_STAGED_TOTAL, "Blocks staged against the backend");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (chunk bodies)");
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (download bodies)");
    describe_counter!(UPLOADS_COMMITTED_TOTAL, "Uploads committed and registered");
    describe_counter!(UPLOADS_CANCELLED_TOTAL, "Uploads cancelled by the caller");
    describe_counter!(
        ORPHANED_OBJECTS_TOTAL,
        "Committed objects left without a metadata record"
    );
    describe_gauge!(ACTIVE_UPLOAD_SESSIONS, "Upload sessions currently open");
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation.
/// Must be the outermost layer so it captures the full request lifecycle.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize an actual request path to a route template for metric labels,
/// so upload and object ids do not become labels.
///
/// Examples:
/// - `/health` -> `/health`
/// - `/uploads` -> `/uploads`
/// - `/uploads/abc` -> `/uploads/{id}`
/// - `/objects/abc` -> `/objects/{id}`
/// - `/anything/else` -> `/{other}`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/openapi.json" | "/metrics" | "/uploads" | "/objects" | "/quota" => {
            path.to_string()
        }
        _ => {
            let trimmed = path.trim_start_matches('/');
            match trimmed.split_once('/') {
                Some(("uploads", _)) => "/uploads/{id}".to_string(),
                Some(("objects", _)) => "/objects/{id}".to_string(),
                _ => "/{other}".to_string(),
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_fixed_routes() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/openapi.json"), "/openapi.json");
        assert_eq!(normalize_path("/uploads"), "/uploads");
        assert_eq!(normalize_path("/quota"), "/quota");
    }

    #[test]
    fn test_normalize_path_upload() {
        assert_eq!(normalize_path("/uploads/3f2a"), "/uploads/{id}");
    }

    #[test]
    fn test_normalize_path_object() {
        assert_eq!(normalize_path("/objects/deadbeef"), "/objects/{id}");
        assert_eq!(normalize_path("/objects/a/b"), "/objects/{id}");
    }

    #[test]
    fn test_normalize_path_unknown() {
        assert_eq!(normalize_path("/nope"), "/{other}");
        assert_eq!(normalize_path("/nope/deeper"), "/{other}");
    }
}
