//! Committed objects as seen by their owner.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::errors::TransferError;
use crate::metadata::store::{MetadataStore, ObjectRecord, OrphanRecord};
use crate::quota::QuotaGuard;
use crate::storage::stager::BlockStager;

pub struct ObjectCatalog {
    metadata: Arc<dyn MetadataStore>,
    stager: Arc<BlockStager>,
    quota: Arc<QuotaGuard>,
}

impl ObjectCatalog {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        stager: Arc<BlockStager>,
        quota: Arc<QuotaGuard>,
    ) -> Self {
        Self {
            metadata,
            stager,
            quota,
        }
    }

    /// The owner's objects ordered by key.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<ObjectRecord>, TransferError> {
        Ok(self.metadata.list_objects(owner_id).await?)
    }

    /// One of the owner's objects.  Objects of other owners are reported
    /// as missing.
    pub async fn get(&self, owner_id: &str, object_id: &str) -> Result<ObjectRecord, TransferError> {
        match self.metadata.get_object(object_id).await? {
            Some(record) if record.owner_id == owner_id => Ok(record),
            _ => Err(TransferError::ObjectNotFound {
                object_id: object_id.to_string(),
            }),
        }
    }

    /// Delete an object and release its bytes from the owner's quota.
    ///
    /// The record goes first.  If the backend delete then fails, the
    /// leftover bytes are written to the orphan ledger for cleanup.
    pub async fn delete(&self, owner_id: &str, object_id: &str) -> Result<ObjectRecord, TransferError> {
        let _guard = self.quota.lock_owner(owner_id).await;
        self.get(owner_id, object_id).await?;

        let record = self
            .metadata
            .delete_object(object_id)
            .await?
            .ok_or_else(|| TransferError::ObjectNotFound {
                object_id: object_id.to_string(),
            })?;

        if let Err(e) = self.stager.delete(&record.storage_key).await {
            warn!(
                object_id,
                storage_key = %record.storage_key,
                error = ?e,
                "backend delete failed, object recorded as orphan"
            );
            metrics::counter!(crate::metrics::ORPHANED_OBJECTS_TOTAL).increment(1);
            let orphan = OrphanRecord {
                upload_id: None,
                owner_id: record.owner_id.clone(),
                object_key: record.object_key.clone(),
                storage_key: record.storage_key.clone(),
                size_bytes: record.size_bytes,
                detected_at: Utc::now(),
                reason: format!("backend delete failed: {e}"),
            };
            if let Err(e) = self.metadata.record_orphan(orphan).await {
                error!(
                    object_id,
                    storage_key = %record.storage_key,
                    error = %e,
                    "failed to record orphan"
                );
            }
        }
        info!(
            object_id,
            owner_id,
            object_key = %record.object_key,
            size = record.size_bytes,
            "object deleted"
        );
        Ok(record)
    }
}
