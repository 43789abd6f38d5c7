//! Axum router construction and route mapping.
//!
//! The [`app`] function wires every endpoint to its handler and returns a
//! ready-to-serve [`axum::Router`].  Extraction happens here; the
//! functions in [`crate::handlers`] take plain arguments.

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, DefaultBodyLimit, Path, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

use crate::errors::{generate_request_id, TransferError};
use crate::handlers::upload::ChunkQuery;
use crate::handlers::{self, OwnerId};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the ChunkStore API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "ChunkStore API",
        version = "0.1.0",
        description = "Chunked uploads and resumable downloads with per-owner quotas"
    ),
    paths(
        health_check,
        crate::handlers::upload::receive_chunk,
        crate::handlers::upload::get_upload_status,
        crate::handlers::upload::cancel_upload,
        crate::handlers::object::list_objects,
        crate::handlers::object::get_object,
        crate::handlers::object::delete_object,
        crate::handlers::object::get_quota,
    ),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Upload", description = "Chunked upload sessions"),
        (name = "Object", description = "Committed objects and downloads"),
        (name = "Quota", description = "Per-owner storage quota"),
    )
)]
struct ApiDoc;

/// Build the axum [`Router`] with all routes.
///
/// The returned router is ready to be passed to `axum::serve`.
pub fn app(state: Arc<AppState>) -> Router {
    let observability = state.config.observability.clone();
    let body_limit = state.config.server.max_chunk_bytes;

    let mut router = Router::new()
        .route("/openapi.json", get(openapi_json))
        .route("/uploads", axum::routing::post(handle_post_upload))
        .route(
            "/uploads/:upload_id",
            get(handle_get_upload).delete(handle_delete_upload),
        )
        .route("/objects", get(handle_list_objects))
        .route(
            "/objects/:object_id",
            get(handle_get_object).delete(handle_delete_object),
        )
        .route("/quota", get(handle_get_quota));

    if observability.health_check {
        router = router.route("/health", get(health_check));
    }
    if observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .with_state(state)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(TraceLayer::new_for_http())
        // metrics_middleware is outer (captures full request lifecycle).
        .layer(middleware::from_fn(metrics_middleware))
        // One request carries at most one chunk.
        .layer(DefaultBodyLimit::max(body_limit))
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-request-id` (unless the error path already set one), `Date`
/// and `Server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-request-id") {
        if let Ok(v) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", v);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(v) = HeaderValue::from_str(&date) {
        headers.insert("date", v);
    }
    headers.insert("server", HeaderValue::from_static("ChunkStore"));

    response
}

// -- Health check ------------------------------------------------------------

/// `GET /health` -- Returns `{"status": "ok"}` with 200 OK.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses(
        (status = 200, description = "Health check OK")
    )
)]
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "active_uploads": state.uploads.active_sessions(),
        })),
    )
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}

// -- Route handlers -----------------------------------------------------------

async fn handle_post_upload(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
    query: Result<Query<ChunkQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, TransferError> {
    let Query(query) = query.map_err(|e| TransferError::InvalidChunk {
        reason: e.body_text(),
    })?;
    handlers::upload::receive_chunk(state, &owner, query, &headers, body).await
}

async fn handle_get_upload(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
    Path(upload_id): Path<String>,
) -> Result<Response, TransferError> {
    handlers::upload::get_upload_status(state, &owner, &upload_id).await
}

async fn handle_delete_upload(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
    Path(upload_id): Path<String>,
) -> Result<Response, TransferError> {
    handlers::upload::cancel_upload(state, &owner, &upload_id).await
}

async fn handle_list_objects(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
) -> Result<Response, TransferError> {
    handlers::object::list_objects(state, &owner).await
}

async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
    Path(object_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, TransferError> {
    handlers::object::get_object(state, &owner, &object_id, &headers).await
}

async fn handle_delete_object(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
    Path(object_id): Path<String>,
) -> Result<Response, TransferError> {
    handlers::object::delete_object(state, &owner, &object_id).await
}

async fn handle_get_quota(
    State(state): State<Arc<AppState>>,
    OwnerId(owner): OwnerId,
) -> Result<Response, TransferError> {
    handlers::object::get_quota(state, &owner).await
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::storage::memory::MemoryBackend;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    fn test_app(quota_bytes: u64) -> Router {
        let mut config = Config::default();
        config.quota.default_quota_bytes = quota_bytes;
        config.storage.memory.read_chunk_bytes = 7;
        let state = AppState::assemble(
            config,
            Arc::new(MemoryMetadataStore::new()),
            Arc::new(MemoryBackend::new(0, 7)),
        );
        app(Arc::new(state))
    }

    fn upload_request(
        owner: &str,
        upload_id: &str,
        index: u32,
        total: u32,
        size: u64,
        name: &str,
        data: Vec<u8>,
    ) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!(
                "/uploads?upload_id={upload_id}&sequence_index={index}&total_chunks={total}&file_name={name}&total_size={size}"
            ))
            .header("x-owner-id", owner)
            .body(Body::from(data))
            .unwrap()
    }

    fn get(uri: &str, owner: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("x-owner-id", owner)
            .body(Body::empty())
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    /// Upload `data` in `chunk`-sized pieces and return the object id.
    async fn upload(app: &Router, owner: &str, upload_id: &str, name: &str, data: &[u8], chunk: usize) -> String {
        let pieces: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk).collect()
        };
        let total = pieces.len() as u32;
        let mut last = serde_json::Value::Null;
        for (i, piece) in pieces.iter().enumerate() {
            let resp = app
                .clone()
                .oneshot(upload_request(owner, upload_id, i as u32, total, data.len() as u64, name, piece.to_vec()))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            last = json(resp).await;
        }
        assert_eq!(last["completed"], true);
        last["object_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app(1000);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("server").unwrap(), "ChunkStore");
        assert!(resp.headers().contains_key("x-request-id"));
        assert_eq!(json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_openapi_lists_routes() {
        let app = test_app(1000);
        let resp = app
            .oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let doc = json(resp).await;
        assert!(doc["paths"]["/uploads"].is_object());
        assert!(doc["paths"]["/objects/{object_id}"].is_object());
    }

    #[tokio::test]
    async fn test_missing_owner_is_unauthenticated() {
        let app = test_app(1000);
        let resp = app
            .oneshot(Request::builder().uri("/objects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json(resp).await["error"], "Unauthenticated");
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let app = test_app(10_000);
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        let object_id = upload(&app, "alice", "rt-1", "blob.bin", &data, 97).await;

        let resp = app
            .clone()
            .oneshot(get(&format!("/objects/{object_id}"), "alice"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
        assert_eq!(resp.headers().get("content-length").unwrap(), "1000");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), data.as_slice());

        let resp = app.oneshot(get("/quota", "alice")).await.unwrap();
        let quota = json(resp).await;
        assert_eq!(quota["used_bytes"], 1000);
        assert_eq!(quota["remaining_bytes"], 9000);
    }

    #[tokio::test]
    async fn test_range_download() {
        let app = test_app(10_000);
        let data: Vec<u8> = (0..100u8).collect();
        let object_id = upload(&app, "alice", "rng-1", "hundred.bin", &data, 30).await;

        let req = Request::builder()
            .uri(format!("/objects/{object_id}"))
            .header("x-owner-id", "alice")
            .header("range", "bytes=10-19")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 10-19/100");
        assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), &data[10..20]);

        let req = Request::builder()
            .uri(format!("/objects/{object_id}"))
            .header("x-owner-id", "alice")
            .header("range", "bytes=90-100")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_quota_boundary_over_http() {
        let app = test_app(100);
        upload(&app, "alice", "q-1", "fill.bin", &[1u8; 100], 50).await;

        let resp = app
            .oneshot(upload_request("alice", "q-2", 0, 1, 1, "extra.bin", vec![1]))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json(resp).await;
        assert_eq!(body["error"], "QuotaExceeded");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_name_collision_over_http() {
        let app = test_app(1000);
        upload(&app, "alice", "n-1", "same.txt", b"abc", 10).await;
        let resp = app
            .oneshot(upload_request("alice", "n-2", 0, 1, 3, "same.txt", b"xyz".to_vec()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(json(resp).await["error"], "NameCollision");
    }

    #[tokio::test]
    async fn test_status_and_cancel() {
        let app = test_app(1000);
        for i in [0u32, 1, 2] {
            let resp = app
                .clone()
                .oneshot(upload_request("alice", "s-1", i, 5, 50, "part.bin", vec![9u8; 10]))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app.clone().oneshot(get("/uploads/s-1", "alice")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let status = json(resp).await;
        assert_eq!(status["received_sequence_indices"], serde_json::json!([0, 1, 2]));
        assert_eq!(status["uploaded_bytes"], 30);

        let resp = app.clone().oneshot(get("/uploads/s-1", "bob")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let cancel = Request::builder()
            .method("DELETE")
            .uri("/uploads/s-1")
            .header("x-owner-id", "alice")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(cancel).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app.clone().oneshot(get("/quota", "alice")).await.unwrap();
        assert_eq!(json(resp).await["used_bytes"], 0);
        let resp = app.oneshot(get("/uploads/s-1", "alice")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_and_delete_objects() {
        let app = test_app(1000);
        let id = upload(&app, "alice", "d-1", "doc.txt", b"hello", 2).await;

        let resp = app.clone().oneshot(get("/objects", "alice")).await.unwrap();
        let listing = json(resp).await;
        assert_eq!(listing["objects"][0]["object_key"], "doc.txt");
        assert_eq!(listing["objects"][0]["kind"], "text/plain");

        let delete = |owner: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/objects/{id}"))
                .header("x-owner-id", owner)
                .body(Body::empty())
                .unwrap()
        };
        let resp = app.clone().oneshot(delete("bob")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app.clone().oneshot(delete("alice")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = app.oneshot(get("/quota", "alice")).await.unwrap();
        assert_eq!(json(resp).await["used_bytes"], 0);
    }

    #[tokio::test]
    async fn test_bad_query_is_invalid_chunk() {
        let app = test_app(1000);
        let req = Request::builder()
            .method("POST")
            .uri("/uploads?upload_id=x&sequence_index=nope")
            .header("x-owner-id", "alice")
            .body(Body::from("abc"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(resp).await["error"], "InvalidChunk");
    }

    #[tokio::test]
    async fn test_zero_byte_object() {
        let app = test_app(1000);
        let id = upload(&app, "alice", "z-1", "empty.dat", b"", 1).await;
        let resp = app.oneshot(get(&format!("/objects/{id}"), "alice")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-length").unwrap(), "0");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }
}
