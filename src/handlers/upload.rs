//! Chunked upload API handlers.

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;

use crate::errors::TransferError;
use crate::upload::manager::ChunkRequest;
use crate::AppState;

/// Query string of `POST /uploads`.
#[derive(Debug, Clone, Deserialize, garde::Validate)]
pub struct ChunkQuery {
    #[garde(length(min = 1, max = 128), pattern(r"^[A-Za-z0-9_-]+$"))]
    pub upload_id: String,
    #[garde(skip)]
    pub sequence_index: u32,
    #[garde(range(min = 1))]
    pub total_chunks: u32,
    #[garde(length(min = 1))]
    pub file_name: String,
    #[garde(skip)]
    pub total_size: u64,
}

impl ChunkQuery {
    fn check(&self) -> Result<(), TransferError> {
        garde::Validate::validate(self).map_err(|report| TransferError::InvalidChunk {
            reason: report.to_string(),
        })?;
        if self.sequence_index >= self.total_chunks {
            return Err(TransferError::InvalidChunk {
                reason: format!(
                    "sequence_index {} is outside 0..{}",
                    self.sequence_index, self.total_chunks
                ),
            });
        }
        Ok(())
    }
}

/// Validate the Content-MD5 header against the chunk body if present.
///
/// - Base64-decode the header value; the result must be 16 bytes.
/// - Compute MD5 of the body and compare.
/// - If the header is absent, this is a no-op.
fn validate_content_md5(headers: &HeaderMap, body: &[u8]) -> Result<(), TransferError> {
    let md5_header = match headers.get("content-md5").and_then(|v| v.to_str().ok()) {
        Some(v) => v,
        None => return Ok(()),
    };

    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, md5_header)
        .ok()
        .filter(|d| d.len() == 16)
        .ok_or_else(|| TransferError::InvalidChunk {
            reason: "Content-MD5 is not a base64 MD5 digest".to_string(),
        })?;

    use md5::{Digest, Md5};
    let computed = Md5::digest(body);
    if computed.as_slice() != decoded.as_slice() {
        return Err(TransferError::InvalidChunk {
            reason: "Content-MD5 does not match the chunk body".to_string(),
        });
    }
    Ok(())
}

/// `POST /uploads` -- Receive one chunk of an upload.
#[utoipa::path(
    post,
    path = "/uploads",
    tag = "Upload",
    operation_id = "ReceiveChunk",
    params(
        ("x-owner-id" = String, Header, description = "Owner identity"),
        ("upload_id" = String, Query, description = "Client-chosen upload id"),
        ("sequence_index" = u32, Query, description = "Zero-based chunk index"),
        ("total_chunks" = u32, Query, description = "Number of chunks in the upload"),
        ("file_name" = String, Query, description = "Object name"),
        ("total_size" = u64, Query, description = "Size of the whole object in bytes"),
    ),
    request_body(content = String, content_type = "application/octet-stream", description = "Chunk bytes"),
    responses(
        (status = 200, description = "Chunk accepted; `completed` is set once the object is registered"),
        (status = 400, description = "Invalid name, owner or chunk"),
        (status = 404, description = "Unknown upload"),
        (status = 409, description = "Name collision or upload finalizing"),
        (status = 413, description = "Quota exceeded"),
        (status = 503, description = "Storage or metadata temporarily unavailable, retry the chunk")
    )
)]
pub async fn receive_chunk(
    state: Arc<AppState>,
    owner_id: &str,
    query: ChunkQuery,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, TransferError> {
    query.check()?;
    validate_content_md5(headers, &body)?;

    let request = ChunkRequest {
        upload_id: query.upload_id,
        sequence_index: query.sequence_index,
        total_chunks: query.total_chunks,
        file_name: query.file_name,
        total_size: query.total_size,
        data: body,
    };
    let progress = state.uploads.receive_chunk(owner_id, request).await?;
    Ok(Json(progress).into_response())
}

/// `GET /uploads/{upload_id}` -- Progress of an upload, for resuming.
#[utoipa::path(
    get,
    path = "/uploads/{upload_id}",
    tag = "Upload",
    operation_id = "GetUploadStatus",
    params(
        ("x-owner-id" = String, Header, description = "Owner identity"),
        ("upload_id" = String, Path, description = "Upload id"),
    ),
    responses(
        (status = 200, description = "Received chunk indices and byte count"),
        (status = 404, description = "Unknown upload")
    )
)]
pub async fn get_upload_status(
    state: Arc<AppState>,
    owner_id: &str,
    upload_id: &str,
) -> Result<Response, TransferError> {
    let status = state.uploads.status_for(owner_id, upload_id).await?;
    Ok(Json(status).into_response())
}

/// `DELETE /uploads/{upload_id}` -- Cancel an upload.
#[utoipa::path(
    delete,
    path = "/uploads/{upload_id}",
    tag = "Upload",
    operation_id = "CancelUpload",
    params(
        ("x-owner-id" = String, Header, description = "Owner identity"),
        ("upload_id" = String, Path, description = "Upload id"),
    ),
    responses(
        (status = 204, description = "Upload cancelled"),
        (status = 404, description = "Unknown upload")
    )
)]
pub async fn cancel_upload(
    state: Arc<AppState>,
    owner_id: &str,
    upload_id: &str,
) -> Result<Response, TransferError> {
    state.uploads.cancel_for(owner_id, upload_id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
