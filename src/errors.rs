//! Transfer error types.
//!
//! Every variant maps to a stable error code and an HTTP status.  The enum
//! implements [`axum::response::IntoResponse`] so handlers can simply
//! return `Err(TransferError::SessionNotFound { .. })`.
//!
//! Quota and naming errors carry a human-readable reason.  Backend and
//! metadata failures keep their underlying cause as `source` for logging
//! but render only a generic "try again" message to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the upload, download, and catalog paths.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The object name is empty after sanitization.
    #[error("Invalid file name: {reason}")]
    InvalidName { reason: String },

    /// The owner identifier is unusable as a namespace.
    #[error("Invalid owner id: {reason}")]
    InvalidOwner { reason: String },

    /// No owner identity was presented.
    #[error("Missing owner identity")]
    Unauthenticated,

    /// Adding the object would push the owner past their quota.
    #[error("Storage quota exceeded: {requested} bytes requested, {used} of {quota} bytes used")]
    QuotaExceeded {
        owner_id: String,
        requested: u64,
        used: u64,
        quota: u64,
    },

    /// The owner already has an object (or an active upload) with this name.
    #[error("A file named '{object_key}' already exists")]
    NameCollision { object_key: String },

    /// Unknown or already-terminal upload session.
    #[error("The specified upload does not exist. It may have been cancelled or completed.")]
    SessionNotFound { upload_id: String },

    /// A chunk arrived while the session is finalizing.
    #[error("The upload is being finalized")]
    SessionFinalizing { upload_id: String },

    /// A chunk request is inconsistent with its session.
    #[error("{reason}")]
    InvalidChunk { reason: String },

    /// Finalize was requested before every chunk was staged.
    #[error("Upload is incomplete: {} chunk(s) missing, {uploaded_bytes} of {total_size} bytes received", .missing.len())]
    IncompleteUpload {
        upload_id: String,
        missing: Vec<u32>,
        uploaded_bytes: u64,
        total_size: u64,
    },

    /// Staging a block failed or timed out. Re-send the same chunk.
    #[error("Failed to store chunk, please try again")]
    StageFailed {
        upload_id: String,
        sequence_index: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Committing the block list failed or timed out. Query the upload
    /// status before retrying.
    #[error("Failed to assemble upload, check upload status and try again")]
    CommitFailed {
        upload_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// The object was committed to storage but could not be registered.
    #[error("Upload stored but could not be registered, retry to complete registration")]
    MetadataWriteFailed {
        upload_id: String,
        object_key: String,
        storage_key: String,
        #[source]
        source: anyhow::Error,
    },

    /// No object with this id is visible to the caller.
    #[error("The requested object does not exist")]
    ObjectNotFound { object_id: String },

    /// A Range header that cannot be satisfied against the object size.
    #[error("The requested range is not satisfiable")]
    InvalidRange { range: String, size: u64 },

    /// A backend read started past the end of the object.
    #[error("The requested range is not satisfiable")]
    RangeOutOfBounds { offset: u64, size: u64 },

    /// The object store could not be reached or failed a read.
    #[error("Storage is temporarily unavailable, please try again")]
    BackendUnavailable(#[source] anyhow::Error),

    /// The metadata store failed a lookup or update.
    #[error("Metadata is temporarily unavailable, please try again")]
    MetadataUnavailable(#[from] anyhow::Error),

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[source] anyhow::Error),
}

impl TransferError {
    /// Return the stable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidName { .. } => "InvalidName",
            TransferError::InvalidOwner { .. } => "InvalidOwner",
            TransferError::Unauthenticated => "Unauthenticated",
            TransferError::QuotaExceeded { .. } => "QuotaExceeded",
            TransferError::NameCollision { .. } => "NameCollision",
            TransferError::SessionNotFound { .. } => "SessionNotFound",
            TransferError::SessionFinalizing { .. } => "SessionFinalizing",
            TransferError::InvalidChunk { .. } => "InvalidChunk",
            TransferError::IncompleteUpload { .. } => "IncompleteUpload",
            TransferError::StageFailed { .. } => "StageFailed",
            TransferError::CommitFailed { .. } => "CommitFailed",
            TransferError::MetadataWriteFailed { .. } => "MetadataWriteFailed",
            TransferError::ObjectNotFound { .. } => "ObjectNotFound",
            TransferError::InvalidRange { .. } => "InvalidRange",
            TransferError::RangeOutOfBounds { .. } => "RangeOutOfBounds",
            TransferError::BackendUnavailable(_) => "BackendUnavailable",
            TransferError::MetadataUnavailable(_) => "MetadataUnavailable",
            TransferError::Internal(_) => "InternalError",
        }
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            TransferError::InvalidName { .. } => StatusCode::BAD_REQUEST,
            TransferError::InvalidOwner { .. } => StatusCode::BAD_REQUEST,
            TransferError::Unauthenticated => StatusCode::UNAUTHORIZED,
            TransferError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::NameCollision { .. } => StatusCode::CONFLICT,
            TransferError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
            TransferError::SessionFinalizing { .. } => StatusCode::CONFLICT,
            TransferError::InvalidChunk { .. } => StatusCode::BAD_REQUEST,
            TransferError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            TransferError::StageFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::CommitFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::MetadataWriteFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            TransferError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            TransferError::InvalidRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            TransferError::RangeOutOfBounds { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            TransferError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::MetadataUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            TransferError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether re-issuing the same request may succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            TransferError::StageFailed { .. }
                | TransferError::CommitFailed { .. }
                | TransferError::MetadataWriteFailed { .. }
                | TransferError::BackendUnavailable(_)
                | TransferError::MetadataUnavailable(_)
                | TransferError::SessionFinalizing { .. }
        )
    }

    /// Validation errors end the session they occur in.
    pub fn is_terminal_for_session(&self) -> bool {
        matches!(
            self,
            TransferError::InvalidName { .. }
                | TransferError::QuotaExceeded { .. }
                | TransferError::NameCollision { .. }
        )
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    retryable: bool,
    request_id: String,
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        if status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                code = self.code(),
                error = ?self,
                "request failed"
            );
        } else {
            tracing::debug!(request_id = %request_id, code = self.code(), "request rejected");
        }
        metrics::counter!(crate::metrics::TRANSFER_ERRORS_TOTAL, "code" => self.code())
            .increment(1);

        let body = ErrorBody {
            error: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
            request_id: request_id.clone(),
        };

        (
            status,
            [
                ("x-request-id", request_id),
                ("date", date),
                ("server", "ChunkStore".to_string()),
            ],
            Json(body),
        )
            .into_response()
    }
}
