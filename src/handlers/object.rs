//! Object and quota API handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::errors::TransferError;
use crate::metadata::store::ObjectRecord;
use crate::AppState;

#[derive(Serialize)]
struct ObjectList {
    owner_id: String,
    objects: Vec<ObjectRecord>,
}

#[derive(Serialize)]
struct QuotaReport {
    owner_id: String,
    quota_bytes: u64,
    used_bytes: u64,
    remaining_bytes: u64,
}

/// `GET /objects` -- List the caller's objects ordered by key.
#[utoipa::path(
    get,
    path = "/objects",
    tag = "Object",
    operation_id = "ListObjects",
    params(("x-owner-id" = String, Header, description = "Owner identity")),
    responses(
        (status = 200, description = "The owner's object records"),
        (status = 401, description = "Missing owner identity")
    )
)]
pub async fn list_objects(state: Arc<AppState>, owner_id: &str) -> Result<Response, TransferError> {
    let objects = state.catalog.list(owner_id).await?;
    Ok(Json(ObjectList {
        owner_id: owner_id.to_string(),
        objects,
    })
    .into_response())
}

/// `GET /objects/{object_id}` -- Download an object, whole or by range.
#[utoipa::path(
    get,
    path = "/objects/{object_id}",
    tag = "Object",
    operation_id = "GetObject",
    params(
        ("x-owner-id" = String, Header, description = "Owner identity"),
        ("object_id" = String, Path, description = "Object id"),
        ("range" = Option<String>, Header, description = "Single byte range, `bytes=start-end`"),
    ),
    responses(
        (status = 200, description = "Object data"),
        (status = 206, description = "Partial content (range request)"),
        (status = 404, description = "Object not found"),
        (status = 416, description = "Range not satisfiable"),
        (status = 503, description = "Storage or metadata temporarily unavailable")
    )
)]
pub async fn get_object(
    state: Arc<AppState>,
    owner_id: &str,
    object_id: &str,
    headers: &HeaderMap,
) -> Result<Response, TransferError> {
    let record = state.catalog.get(owner_id, object_id).await?;
    let range = headers.get("range").and_then(|v| v.to_str().ok());
    let stream = state.downloads.open_record(record, range).await?;

    let status = if stream.is_partial() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let content_type = HeaderValue::from_str(&stream.record().kind)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    let last_modified = httpdate::fmt_http_date(stream.record().modified_at.into());
    let content_length = stream.content_length();
    let content_range = stream.content_range();

    let mut response = (status, Body::from_stream(stream)).into_response();
    let hdrs = response.headers_mut();
    hdrs.insert("content-type", content_type);
    hdrs.insert("content-length", HeaderValue::from(content_length));
    hdrs.insert("accept-ranges", HeaderValue::from_static("bytes"));
    if let Some(cr) = content_range.and_then(|cr| HeaderValue::from_str(&cr).ok()) {
        hdrs.insert("content-range", cr);
    }
    if let Ok(lm) = HeaderValue::from_str(&last_modified) {
        hdrs.insert("last-modified", lm);
    }
    Ok(response)
}

/// `DELETE /objects/{object_id}` -- Delete an object and release its quota.
#[utoipa::path(
    delete,
    path = "/objects/{object_id}",
    tag = "Object",
    operation_id = "DeleteObject",
    params(
        ("x-owner-id" = String, Header, description = "Owner identity"),
        ("object_id" = String, Path, description = "Object id"),
    ),
    responses(
        (status = 204, description = "Object deleted"),
        (status = 404, description = "Object not found")
    )
)]
pub async fn delete_object(
    state: Arc<AppState>,
    owner_id: &str,
    object_id: &str,
) -> Result<Response, TransferError> {
    state.catalog.delete(owner_id, object_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// `GET /quota` -- The caller's quota and usage.
#[utoipa::path(
    get,
    path = "/quota",
    tag = "Quota",
    operation_id = "GetQuota",
    params(("x-owner-id" = String, Header, description = "Owner identity")),
    responses((status = 200, description = "Quota, usage and remaining bytes"))
)]
pub async fn get_quota(state: Arc<AppState>, owner_id: &str) -> Result<Response, TransferError> {
    let quota = state.quota.quota(owner_id).await?;
    Ok(Json(QuotaReport {
        remaining_bytes: quota.remaining_bytes(),
        owner_id: quota.owner_id,
        quota_bytes: quota.quota_bytes,
        used_bytes: quota.used_bytes,
    })
    .into_response())
}
