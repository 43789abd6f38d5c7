//! HTTP handlers for the upload and object APIs.
//!
//! Handlers take already-extracted arguments; [`crate::server`] owns the
//! axum routing and extraction.

pub mod object;
pub mod upload;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::errors::TransferError;
use crate::naming::validate_owner_id;

/// Header carrying the caller's identity, set by the authenticating proxy.
pub const OWNER_HEADER: &str = "x-owner-id";

/// The authenticated owner of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerId(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for OwnerId {
    type Rejection = TransferError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .ok_or(TransferError::Unauthenticated)?
            .to_str()
            .map_err(|_| TransferError::InvalidOwner {
                reason: "owner id must be visible ASCII".to_string(),
            })?
            .trim();
        validate_owner_id(owner)?;
        Ok(OwnerId(owner.to_string()))
    }
}
