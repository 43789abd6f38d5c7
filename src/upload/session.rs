//! In-progress upload state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metadata::store::ObjectRecord;
use crate::storage::stager::{ObjectHandle, StagedBlock};

/// Lifecycle of an upload session.
///
/// A session is opened in `Receiving` once its name and quota checks pass.
/// `Receiving -> Finalizing -> Committed`, with `Cancelled` reachable from
/// every non-terminal state.  A failed commit drops a
/// session from `Finalizing` back to `Receiving`; a failed metadata write
/// keeps it in `Finalizing` until registration is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Receiving,
    Finalizing,
    Committed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Cancelled)
    }
}

/// A fresh storage key for one upload of an owner's object.
///
/// No two sessions share a key, even for the same name.
pub fn storage_key_for(owner_id: &str, object_key: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple();
    format!("{owner_id}/{nonce}/{object_key}")
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub upload_id: String,
    pub owner_id: String,
    pub object_key: String,
    pub storage_key: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// Staged blocks keyed (and therefore ordered) by sequence index.
    pub staged_blocks: BTreeMap<u32, StagedBlock>,
    pub uploaded_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: SessionState,
    commit_uncertain: bool,
    committed: Option<ObjectHandle>,
    pending_record: Option<ObjectRecord>,
}

impl UploadSession {
    pub fn new(
        upload_id: &str,
        owner_id: &str,
        object_key: &str,
        total_size: u64,
        total_chunks: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.to_string(),
            owner_id: owner_id.to_string(),
            object_key: object_key.to_string(),
            storage_key: storage_key_for(owner_id, object_key),
            total_size,
            total_chunks,
            staged_blocks: BTreeMap::new(),
            uploaded_bytes: 0,
            created_at: now,
            updated_at: now,
            state: SessionState::Receiving,
            commit_uncertain: false,
            committed: None,
            pending_record: None,
        }
    }

    /// Record a staged block, replacing any earlier block for its index.
    pub fn record_block(&mut self, block: StagedBlock) {
        self.staged_blocks.insert(block.sequence_index, block);
        self.uploaded_bytes = self.staged_blocks.values().map(|b| b.size).sum();
        self.updated_at = Utc::now();
    }

    /// `uploaded_bytes` after staging `len` bytes at `sequence_index`.
    pub fn projected_bytes(&self, sequence_index: u32, len: u64) -> u64 {
        let replaced = self
            .staged_blocks
            .get(&sequence_index)
            .map_or(0, |b| b.size);
        self.uploaded_bytes - replaced + len
    }

    pub fn received_indices(&self) -> Vec<u32> {
        self.staged_blocks.keys().copied().collect()
    }

    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.staged_blocks.contains_key(i))
            .collect()
    }

    /// Every declared chunk is staged and the byte count matches.
    pub fn is_complete(&self) -> bool {
        self.staged_blocks.len() as u64 == u64::from(self.total_chunks)
            && self.uploaded_bytes == self.total_size
            && self.missing_indices().is_empty()
    }

    /// Blocks in ascending sequence order.
    pub fn ordered_blocks(&self) -> Vec<StagedBlock> {
        self.staged_blocks.values().cloned().collect()
    }

    pub fn commit_uncertain(&self) -> bool {
        self.commit_uncertain
    }

    /// The last commit attempt may or may not have been applied.
    pub fn mark_commit_uncertain(&mut self) {
        self.commit_uncertain = true;
    }

    pub fn committed(&self) -> Option<&ObjectHandle> {
        self.committed.as_ref()
    }

    pub fn pending_record(&self) -> Option<&ObjectRecord> {
        self.pending_record.as_ref()
    }

    /// Remember a committed object and the record that will register it,
    /// so a retried finalize registers the same object id.
    pub fn set_committed(&mut self, handle: ObjectHandle, record: ObjectRecord) {
        self.committed = Some(handle);
        self.pending_record = Some(record);
        self.commit_uncertain = false;
        self.updated_at = Utc::now();
    }

    pub fn status(&self) -> UploadStatus {
        UploadStatus {
            upload_id: self.upload_id.clone(),
            owner_id: self.owner_id.clone(),
            object_key: self.object_key.clone(),
            state: self.state,
            total_size: self.total_size,
            total_chunks: self.total_chunks,
            uploaded_bytes: self.uploaded_bytes,
            received_sequence_indices: self.received_indices(),
            committed: self.committed.is_some(),
            object_id: self.pending_record.as_ref().map(|r| r.object_id.clone()),
        }
    }
}

/// Snapshot returned to clients resuming an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadStatus {
    pub upload_id: String,
    pub owner_id: String,
    pub object_key: String,
    pub state: SessionState,
    pub total_size: u64,
    pub total_chunks: u32,
    pub uploaded_bytes: u64,
    pub received_sequence_indices: Vec<u32>,
    /// The object is in storage, whether or not it is registered yet.
    pub committed: bool,
    pub object_id: Option<String>,
}
