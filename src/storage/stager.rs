//! Block staging on top of a [`StorageBackend`].
//!
//! The stager owns block-id generation, per-call deadlines, and the mapping
//! from backend failures onto [`TransferError`].  Backend error text is
//! logged here and kept as the error source; callers only see the generic
//! retry message.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::backend::StorageBackend;
use crate::config::TimeoutConfig;
use crate::errors::TransferError;
use crate::upload::session::UploadSession;

/// Stream of object bytes as seen by callers of the stager.
pub type ChunkStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// A block staged for one sequence index of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedBlock {
    pub block_id: String,
    pub sequence_index: u32,
    pub size: u64,
}

/// A committed, readable object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    pub storage_key: String,
    pub size: u64,
}

/// Block id for `(upload_id, sequence_index)`.
///
/// Block blobs require every id of a blob to have the same length, so the
/// upload id is reduced to a fixed-length digest prefix.  The id is a pure
/// function of its inputs, which makes re-staging an index overwrite the
/// earlier block instead of adding a second one.
pub fn block_id(upload_id: &str, sequence_index: u32) -> String {
    let digest = hex::encode(Sha256::digest(upload_id.as_bytes()));
    let raw = format!("{}:{:010}", &digest[..16], sequence_index);
    BASE64_STANDARD.encode(raw.as_bytes())
}

async fn with_deadline<T, F>(deadline: Duration, op: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("{op} timed out after {}s", deadline.as_secs_f64())),
    }
}

pub struct BlockStager {
    backend: Arc<dyn StorageBackend>,
    timeouts: TimeoutConfig,
}

impl BlockStager {
    pub fn new(backend: Arc<dyn StorageBackend>, timeouts: TimeoutConfig) -> Self {
        Self { backend, timeouts }
    }

    /// Push one block for `session`.
    ///
    /// Empty blocks are recorded but never sent to the backend.
    pub async fn stage(
        &self,
        session: &UploadSession,
        sequence_index: u32,
        data: Bytes,
    ) -> Result<StagedBlock, TransferError> {
        let block = StagedBlock {
            block_id: block_id(&session.upload_id, sequence_index),
            sequence_index,
            size: data.len() as u64,
        };
        if data.is_empty() {
            return Ok(block);
        }

        let staged = with_deadline(
            self.timeouts.stage(),
            "stage_block",
            self.backend
                .stage_block(&session.storage_key, &block.block_id, data),
        )
        .await;

        match staged {
            Ok(()) => {
                debug!(
                    upload_id = %session.upload_id,
                    sequence_index,
                    size = block.size,
                    "block staged"
                );
                Ok(block)
            }
            Err(e) => {
                warn!(
                    upload_id = %session.upload_id,
                    sequence_index,
                    error = %e,
                    "stage failed"
                );
                Err(TransferError::StageFailed {
                    upload_id: session.upload_id.clone(),
                    sequence_index,
                    source: e,
                })
            }
        }
    }

    /// Commit `blocks`, which must be in ascending `sequence_index` order
    /// and belong to `session`.
    ///
    /// When the session's previous commit ended in an unknown state, the
    /// backend is checked first and a commit that already landed is not
    /// repeated.  Storage keys are unique per session, so an object found
    /// at the key can only come from this session's own commit.
    pub async fn commit(
        &self,
        session: &UploadSession,
        blocks: &[StagedBlock],
    ) -> Result<ObjectHandle, TransferError> {
        let commit_failed = |source: anyhow::Error| TransferError::CommitFailed {
            upload_id: session.upload_id.clone(),
            source,
        };

        for (pos, block) in blocks.iter().enumerate() {
            if block.block_id != block_id(&session.upload_id, block.sequence_index) {
                return Err(commit_failed(anyhow::anyhow!(
                    "block {} does not belong to upload {}",
                    block.sequence_index,
                    session.upload_id
                )));
            }
            if pos > 0 && blocks[pos - 1].sequence_index >= block.sequence_index {
                return Err(commit_failed(anyhow::anyhow!(
                    "block list not in ascending sequence order at index {}",
                    block.sequence_index
                )));
            }
        }

        let handle = ObjectHandle {
            storage_key: session.storage_key.clone(),
            size: blocks.iter().map(|b| b.size).sum(),
        };

        if session.commit_uncertain() {
            let existing = with_deadline(
                self.timeouts.read(),
                "commit status check",
                self.backend.size(&session.storage_key),
            )
            .await
            .map_err(&commit_failed)?;
            if existing == Some(handle.size) {
                info!(
                    upload_id = %session.upload_id,
                    storage_key = %session.storage_key,
                    "previous commit already applied, skipping"
                );
                return Ok(handle);
            }
        }

        let ids: Vec<String> = blocks
            .iter()
            .filter(|b| b.size > 0)
            .map(|b| b.block_id.clone())
            .collect();

        with_deadline(
            self.timeouts.commit(),
            "commit_block_list",
            self.backend.commit_block_list(&session.storage_key, &ids),
        )
        .await
        .map_err(|e| {
            warn!(
                upload_id = %session.upload_id,
                storage_key = %session.storage_key,
                error = %e,
                "commit failed"
            );
            commit_failed(e)
        })?;

        info!(
            upload_id = %session.upload_id,
            storage_key = %session.storage_key,
            blocks = ids.len(),
            size = handle.size,
            "block list committed"
        );
        Ok(handle)
    }

    /// Read `length` bytes of `handle` starting at `offset`.
    ///
    /// The returned stream is lazy; every pull is bounded by the read
    /// deadline.
    pub async fn read(
        &self,
        handle: &ObjectHandle,
        offset: u64,
        length: u64,
    ) -> Result<ChunkStream, TransferError> {
        if offset >= handle.size {
            return Err(TransferError::RangeOutOfBounds {
                offset,
                size: handle.size,
            });
        }
        let length = length.min(handle.size - offset);
        if length == 0 {
            return Ok(futures::stream::empty().boxed());
        }

        let deadline = self.timeouts.read();
        let mut inner = with_deadline(
            deadline,
            "read",
            self.backend.read(&handle.storage_key, offset, length),
        )
        .await
        .map_err(|e| {
            warn!(storage_key = %handle.storage_key, error = %e, "read failed");
            TransferError::BackendUnavailable(e)
        })?;

        let storage_key = handle.storage_key.clone();
        let stream = async_stream::stream! {
            loop {
                match tokio::time::timeout(deadline, inner.next()).await {
                    Ok(Some(Ok(chunk))) => yield Ok(chunk),
                    Ok(Some(Err(e))) => {
                        warn!(storage_key = %storage_key, error = %e, "read interrupted");
                        yield Err(TransferError::BackendUnavailable(e));
                        break;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!(storage_key = %storage_key, "read stalled");
                        yield Err(TransferError::BackendUnavailable(anyhow::anyhow!(
                            "read stalled for {}s",
                            deadline.as_secs_f64()
                        )));
                        break;
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    /// Delete a committed object.
    pub async fn delete(&self, storage_key: &str) -> Result<(), TransferError> {
        with_deadline(
            self.timeouts.commit(),
            "delete",
            self.backend.delete(storage_key),
        )
        .await
        .map_err(TransferError::BackendUnavailable)
    }
}
