//! Upload session lifecycle.
//!
//! The manager owns the registry of live sessions.  Each session sits
//! behind its own async mutex, so chunks for one upload are applied one at
//! a time while different uploads proceed in parallel.  Finalize also takes
//! the owner's quota lock, which keeps the quota check, the commit, and the
//! registration of one owner's uploads from interleaving.
//!
//! Finalize runs on a spawned task that owns the session lock.  A caller
//! that stops waiting does not stop the commit or the registration, and the
//! next caller for the session waits until both are settled.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use super::session::{SessionState, UploadSession, UploadStatus};
use crate::errors::TransferError;
use crate::metadata::store::{MetadataStore, ObjectRecord, OrphanRecord};
use crate::naming::{validate_owner_id, NameValidator};
use crate::quota::QuotaGuard;
use crate::storage::stager::BlockStager;

const MAX_UPLOAD_ID_LEN: usize = 128;

/// One call of the chunked upload wire contract.
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub sequence_index: u32,
    pub total_chunks: u32,
    pub file_name: String,
    pub total_size: u64,
    pub data: Bytes,
}

/// Per-chunk response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkProgress {
    pub upload_id: String,
    pub accepted: bool,
    pub completed: bool,
    pub uploaded_bytes: u64,
    pub object_id: Option<String>,
}

type SessionRef = Arc<tokio::sync::Mutex<UploadSession>>;

#[derive(Clone)]
struct SessionEntry {
    owner_id: String,
    session: SessionRef,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, SessionEntry>,
    /// `(owner_id, object_key)` pairs claimed by live sessions.
    reserved: HashSet<(String, String)>,
}

/// Collaborators shared with finalize tasks.
struct Shared {
    quota: Arc<QuotaGuard>,
    stager: Arc<BlockStager>,
    metadata: Arc<dyn MetadataStore>,
    registry: Mutex<Registry>,
}

pub struct UploadSessionManager {
    names: NameValidator,
    shared: Arc<Shared>,
}

fn validate_upload_id(upload_id: &str) -> Result<(), TransferError> {
    let ok = !upload_id.is_empty()
        && upload_id.len() <= MAX_UPLOAD_ID_LEN
        && upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(TransferError::InvalidChunk {
            reason: format!(
                "upload_id must be 1-{MAX_UPLOAD_ID_LEN} characters of [A-Za-z0-9_-]"
            ),
        })
    }
}

fn progress(session: &UploadSession) -> ChunkProgress {
    ChunkProgress {
        upload_id: session.upload_id.clone(),
        accepted: true,
        completed: false,
        uploaded_bytes: session.uploaded_bytes,
        object_id: None,
    }
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a finished session from the registry and free its name.
    fn release(&self, session: &UploadSession) {
        let mut registry = self.registry();
        if registry.sessions.remove(&session.upload_id).is_some() {
            metrics::gauge!(crate::metrics::ACTIVE_UPLOAD_SESSIONS).decrement(1.0);
        }
        registry
            .reserved
            .remove(&(session.owner_id.clone(), session.object_key.clone()));
    }

    /// Quota check, commit and registration for a session whose lock the
    /// caller holds.
    async fn finalize(
        &self,
        session: &mut UploadSession,
    ) -> Result<ObjectRecord, TransferError> {
        if session.state.is_terminal() {
            return Err(TransferError::SessionNotFound {
                upload_id: session.upload_id.clone(),
            });
        }
        if session.committed().is_none() && !session.is_complete() {
            return Err(TransferError::IncompleteUpload {
                upload_id: session.upload_id.clone(),
                missing: session.missing_indices(),
                uploaded_bytes: session.uploaded_bytes,
                total_size: session.total_size,
            });
        }

        session.state = SessionState::Finalizing;
        let owner_guard = self.quota.lock_owner(&session.owner_id).await;

        let retrying_registration = session.committed().is_some();
        if !retrying_registration {
            if let Err(e) = self
                .quota
                .validate_addition(&session.owner_id, session.uploaded_bytes, &session.object_key)
                .await
            {
                drop(owner_guard);
                if e.is_terminal_for_session() {
                    warn!(
                        upload_id = %session.upload_id,
                        code = e.code(),
                        "upload rejected at finalize, session closed"
                    );
                    session.state = SessionState::Cancelled;
                    self.release(session);
                } else {
                    session.state = SessionState::Receiving;
                }
                return Err(e);
            }

            let blocks = session.ordered_blocks();
            match self.stager.commit(session, &blocks).await {
                Ok(handle) => {
                    let record = ObjectRecord::new(
                        &session.owner_id,
                        &session.object_key,
                        handle.size,
                        &handle.storage_key,
                    );
                    session.set_committed(handle, record);
                }
                Err(e) => {
                    session.mark_commit_uncertain();
                    session.state = SessionState::Receiving;
                    return Err(e);
                }
            }
        }

        let record = session
            .pending_record()
            .cloned()
            .ok_or_else(|| {
                TransferError::Internal(anyhow::anyhow!(
                    "committed session {} has no record",
                    session.upload_id
                ))
            })?;

        let already_registered = retrying_registration
            && self.metadata.get_object(&record.object_id).await?.is_some();
        if !already_registered {
            if let Err(e) = self.metadata.insert_object(record.clone()).await {
                return Err(self
                    .orphaned(session, &record, e, !retrying_registration)
                    .await);
            }
        }
        drop(owner_guard);

        session.state = SessionState::Committed;
        self.release(session);
        metrics::counter!(crate::metrics::UPLOADS_COMMITTED_TOTAL).increment(1);
        info!(
            upload_id = %session.upload_id,
            owner_id = %record.owner_id,
            object_key = %record.object_key,
            object_id = %record.object_id,
            size = record.size_bytes,
            "upload committed"
        );
        Ok(record)
    }

    /// Report a committed object whose metadata write failed.
    async fn orphaned(
        &self,
        session: &UploadSession,
        record: &ObjectRecord,
        source: anyhow::Error,
        first_failure: bool,
    ) -> TransferError {
        error!(
            upload_id = %session.upload_id,
            owner_id = %record.owner_id,
            object_key = %record.object_key,
            storage_key = %record.storage_key,
            object_id = %record.object_id,
            size = record.size_bytes,
            error = %source,
            "metadata write failed after commit, object is orphaned"
        );
        if first_failure {
            metrics::counter!(crate::metrics::ORPHANED_OBJECTS_TOTAL).increment(1);
            let orphan = OrphanRecord {
                upload_id: Some(session.upload_id.clone()),
                owner_id: record.owner_id.clone(),
                object_key: record.object_key.clone(),
                storage_key: record.storage_key.clone(),
                size_bytes: record.size_bytes,
                detected_at: Utc::now(),
                reason: source.to_string(),
            };
            if let Err(e) = self.metadata.record_orphan(orphan).await {
                error!(
                    upload_id = %session.upload_id,
                    storage_key = %record.storage_key,
                    error = %e,
                    "failed to record orphan"
                );
            }
        }
        TransferError::MetadataWriteFailed {
            upload_id: session.upload_id.clone(),
            object_key: record.object_key.clone(),
            storage_key: record.storage_key.clone(),
            source,
        }
    }
}

impl UploadSessionManager {
    pub fn new(
        names: NameValidator,
        quota: Arc<QuotaGuard>,
        stager: Arc<BlockStager>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        Self {
            names,
            shared: Arc::new(Shared {
                quota,
                stager,
                metadata,
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.shared.registry()
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.registry().sessions.len()
    }

    fn lookup(&self, upload_id: &str, owner_id: Option<&str>) -> Result<SessionRef, TransferError> {
        let not_found = || TransferError::SessionNotFound {
            upload_id: upload_id.to_string(),
        };
        let entry = self
            .registry()
            .sessions
            .get(upload_id)
            .cloned()
            .ok_or_else(not_found)?;
        match owner_id {
            Some(owner) if owner != entry.owner_id => Err(not_found()),
            _ => Ok(entry.session),
        }
    }

    // ── Initialize ──────────────────────────────────────────────────

    /// Open a session under a generated upload id.
    pub async fn initialize(
        &self,
        owner_id: &str,
        file_name: &str,
        total_size: u64,
        total_chunks: u32,
    ) -> Result<String, TransferError> {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        self.initialize_with_id(&upload_id, owner_id, file_name, total_size, total_chunks)
            .await?;
        Ok(upload_id)
    }

    /// Open a session under a caller-chosen upload id.
    ///
    /// Runs name sanitization and the quota check; nothing is created when
    /// either fails.
    pub async fn initialize_with_id(
        &self,
        upload_id: &str,
        owner_id: &str,
        file_name: &str,
        total_size: u64,
        total_chunks: u32,
    ) -> Result<(), TransferError> {
        validate_owner_id(owner_id)?;
        validate_upload_id(upload_id)?;
        let object_key = self.names.require(file_name)?;
        if total_chunks == 0 {
            return Err(TransferError::InvalidChunk {
                reason: "total_chunks must be at least 1".to_string(),
            });
        }

        self.shared
            .quota
            .validate_addition(owner_id, total_size, &object_key)
            .await?;

        let session = UploadSession::new(upload_id, owner_id, &object_key, total_size, total_chunks);

        {
            let mut registry = self.registry();
            if registry.sessions.contains_key(upload_id) {
                return Err(TransferError::InvalidChunk {
                    reason: format!("upload_id {upload_id} is already in use"),
                });
            }
            let name = (owner_id.to_string(), object_key.clone());
            if registry.reserved.contains(&name) {
                return Err(TransferError::NameCollision { object_key });
            }
            registry.reserved.insert(name);
            registry.sessions.insert(
                upload_id.to_string(),
                SessionEntry {
                    owner_id: owner_id.to_string(),
                    session: Arc::new(tokio::sync::Mutex::new(session)),
                },
            );
        }
        metrics::gauge!(crate::metrics::ACTIVE_UPLOAD_SESSIONS).increment(1.0);

        info!(
            upload_id,
            owner_id,
            object_key = %object_key,
            total_size,
            total_chunks,
            "upload session opened"
        );
        Ok(())
    }

    // ── Append ──────────────────────────────────────────────────────

    /// Stage one chunk.  Chunks may arrive in any order; re-sending an
    /// index replaces the earlier block.
    pub async fn append_chunk(
        &self,
        upload_id: &str,
        sequence_index: u32,
        data: Bytes,
    ) -> Result<ChunkProgress, TransferError> {
        let session_ref = self.lookup(upload_id, None)?;
        let mut session = session_ref.lock().await;
        self.append_locked(&mut session, sequence_index, data).await?;
        Ok(progress(&session))
    }

    async fn append_locked(
        &self,
        session: &mut UploadSession,
        sequence_index: u32,
        data: Bytes,
    ) -> Result<(), TransferError> {
        match session.state {
            SessionState::Receiving => {}
            SessionState::Finalizing => {
                return Err(TransferError::SessionFinalizing {
                    upload_id: session.upload_id.clone(),
                })
            }
            SessionState::Committed | SessionState::Cancelled => {
                return Err(TransferError::SessionNotFound {
                    upload_id: session.upload_id.clone(),
                })
            }
        }
        if sequence_index >= session.total_chunks {
            return Err(TransferError::InvalidChunk {
                reason: format!(
                    "sequence_index {sequence_index} is outside 0..{}",
                    session.total_chunks
                ),
            });
        }
        let len = data.len() as u64;
        if session.projected_bytes(sequence_index, len) > session.total_size {
            return Err(TransferError::InvalidChunk {
                reason: format!(
                    "chunk {sequence_index} would exceed the declared total_size of {}",
                    session.total_size
                ),
            });
        }

        let block = self.shared.stager.stage(session, sequence_index, data).await?;
        session.record_block(block);
        metrics::counter!(crate::metrics::CHUNKS_STAGED_TOTAL).increment(1);
        metrics::counter!(crate::metrics::BYTES_RECEIVED_TOTAL).increment(len);
        debug!(
            upload_id = %session.upload_id,
            sequence_index,
            uploaded_bytes = session.uploaded_bytes,
            "chunk accepted"
        );
        Ok(())
    }

    // ── Finalize ────────────────────────────────────────────────────

    /// Commit the staged blocks in sequence order and register the object.
    ///
    /// A failed commit leaves the session receiving chunks, and the next
    /// finalize checks whether the failed commit landed anyway.  A failed
    /// registration keeps the committed object on the session and the next
    /// finalize only retries the registration.
    pub async fn finalize(&self, upload_id: &str) -> Result<ObjectRecord, TransferError> {
        let session = self.lookup(upload_id, None)?.lock_owned().await;
        self.finalize_detached(session).await
    }

    /// Run finalize on its own task, which keeps the session lock until the
    /// commit and the registration are settled.
    async fn finalize_detached(
        &self,
        mut session: OwnedMutexGuard<UploadSession>,
    ) -> Result<ObjectRecord, TransferError> {
        let shared = self.shared.clone();
        let upload_id = session.upload_id.clone();
        tokio::spawn(async move { shared.finalize(&mut session).await })
            .await
            .map_err(|e| {
                TransferError::Internal(anyhow::anyhow!(
                    "finalize task for upload {upload_id} failed: {e}"
                ))
            })?
    }

    // ── Cancel / status ─────────────────────────────────────────────

    /// Abandon a session.  Staged blocks are left to the backend's
    /// garbage collection and quota is untouched.
    pub async fn cancel(&self, upload_id: &str) -> Result<(), TransferError> {
        self.cancel_scoped(upload_id, None).await
    }

    /// [`cancel`](Self::cancel) restricted to the session's owner.
    pub async fn cancel_for(&self, owner_id: &str, upload_id: &str) -> Result<(), TransferError> {
        self.cancel_scoped(upload_id, Some(owner_id)).await
    }

    async fn cancel_scoped(&self, upload_id: &str, owner_id: Option<&str>) -> Result<(), TransferError> {
        let session_ref = self.lookup(upload_id, owner_id)?;
        let mut session = session_ref.lock().await;
        if session.state.is_terminal() {
            return Err(TransferError::SessionNotFound {
                upload_id: upload_id.to_string(),
            });
        }
        if let Some(handle) = session.committed() {
            warn!(
                upload_id,
                storage_key = %handle.storage_key,
                size = handle.size,
                "cancelling a committed but unregistered upload, object stays orphaned"
            );
        }
        session.state = SessionState::Cancelled;
        self.shared.release(&session);
        metrics::counter!(crate::metrics::UPLOADS_CANCELLED_TOTAL).increment(1);
        info!(
            upload_id,
            staged_blocks = session.staged_blocks.len(),
            "upload cancelled"
        );
        Ok(())
    }

    /// Progress of a live session, for clients resuming an upload.
    pub async fn status(&self, upload_id: &str) -> Result<UploadStatus, TransferError> {
        self.status_scoped(upload_id, None).await
    }

    /// [`status`](Self::status) restricted to the session's owner.
    pub async fn status_for(&self, owner_id: &str, upload_id: &str) -> Result<UploadStatus, TransferError> {
        self.status_scoped(upload_id, Some(owner_id)).await
    }

    async fn status_scoped(
        &self,
        upload_id: &str,
        owner_id: Option<&str>,
    ) -> Result<UploadStatus, TransferError> {
        let session_ref = self.lookup(upload_id, owner_id)?;
        let session = session_ref.lock().await;
        if session.state.is_terminal() {
            return Err(TransferError::SessionNotFound {
                upload_id: upload_id.to_string(),
            });
        }
        Ok(session.status())
    }

    // ── Wire contract ───────────────────────────────────────────────

    /// Apply one call of the chunked upload protocol.
    ///
    /// Index 0 of an unknown upload id opens the session.  The upload is
    /// finalized as soon as every chunk is staged; re-sending a chunk of an
    /// upload whose registration failed retries the registration.
    pub async fn receive_chunk(
        &self,
        owner_id: &str,
        request: ChunkRequest,
    ) -> Result<ChunkProgress, TransferError> {
        let session_ref = match self.lookup(&request.upload_id, Some(owner_id)) {
            Ok(session_ref) => session_ref,
            Err(TransferError::SessionNotFound { .. }) if request.sequence_index == 0 => {
                self.initialize_with_id(
                    &request.upload_id,
                    owner_id,
                    &request.file_name,
                    request.total_size,
                    request.total_chunks,
                )
                .await?;
                self.lookup(&request.upload_id, Some(owner_id))?
            }
            Err(e) => return Err(e),
        };

        let mut session = session_ref.lock_owned().await;
        if session.total_chunks != request.total_chunks || session.total_size != request.total_size {
            return Err(TransferError::InvalidChunk {
                reason: format!(
                    "declared totals differ from the session ({} chunks, {} bytes)",
                    session.total_chunks, session.total_size
                ),
            });
        }

        if session.state == SessionState::Finalizing && session.committed().is_some() {
            return self.complete(session).await;
        }

        self.append_locked(&mut session, request.sequence_index, request.data)
            .await?;
        if !session.is_complete() {
            return Ok(progress(&session));
        }
        self.complete(session).await
    }

    async fn complete(
        &self,
        session: OwnedMutexGuard<UploadSession>,
    ) -> Result<ChunkProgress, TransferError> {
        let upload_id = session.upload_id.clone();
        let uploaded_bytes = session.uploaded_bytes;
        let record = self.finalize_detached(session).await?;
        Ok(ChunkProgress {
            upload_id,
            accepted: true,
            completed: true,
            uploaded_bytes,
            object_id: Some(record.object_id),
        })
    }
}
