//! Per-owner quota enforcement.
//!
//! [`QuotaGuard`] answers "may this owner add N bytes under this name" and
//! hands out per-owner locks.  Callers hold the owner lock across the whole
//! check-commit-register sequence, so two finalizes for one owner cannot
//! both pass the check before either is charged.  The charge itself is
//! applied by the metadata store when the object is registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::config::QuotaConfig;
use crate::errors::TransferError;
use crate::metadata::store::{MetadataStore, UserQuota};

/// Prune idle owner locks once the table grows past this size.
const OWNER_LOCK_PRUNE_THRESHOLD: usize = 1024;

pub struct QuotaGuard {
    metadata: Arc<dyn MetadataStore>,
    default_quota_bytes: u64,
    overrides: HashMap<String, u64>,
    owner_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuotaGuard {
    pub fn new(metadata: Arc<dyn MetadataStore>, config: &QuotaConfig) -> Self {
        Self {
            metadata,
            default_quota_bytes: config.default_quota_bytes,
            overrides: config.owners.clone(),
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    fn initial_quota_for(&self, owner_id: &str) -> u64 {
        self.overrides
            .get(owner_id)
            .copied()
            .unwrap_or(self.default_quota_bytes)
    }

    /// The owner's quota row, created on first use.
    pub async fn quota(&self, owner_id: &str) -> Result<UserQuota, TransferError> {
        Ok(self
            .metadata
            .ensure_quota(owner_id, self.initial_quota_for(owner_id))
            .await?)
    }

    /// Check that `owner_id` can add `new_size` bytes as `proposed_key`.
    ///
    /// A write that exactly fills the quota is allowed.
    pub async fn validate_addition(
        &self,
        owner_id: &str,
        new_size: u64,
        proposed_key: &str,
    ) -> Result<(), TransferError> {
        if self
            .metadata
            .find_object(owner_id, proposed_key)
            .await?
            .is_some()
        {
            return Err(TransferError::NameCollision {
                object_key: proposed_key.to_string(),
            });
        }

        let quota = self.quota(owner_id).await?;
        let fits = quota
            .used_bytes
            .checked_add(new_size)
            .is_some_and(|total| total <= quota.quota_bytes);
        if !fits {
            return Err(TransferError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                requested: new_size,
                used: quota.used_bytes,
                quota: quota.quota_bytes,
            });
        }
        Ok(())
    }

    /// Acquire the owner's mutation lock.
    pub async fn lock_owner(&self, owner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .owner_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if locks.len() > OWNER_LOCK_PRUNE_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            locks
                .entry(owner_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Rebuild `used_bytes` from the owner's object records.
    pub async fn recompute_usage(&self, owner_id: &str) -> Result<UserQuota, TransferError> {
        let _guard = self.lock_owner(owner_id).await;
        let mut quota = self.quota(owner_id).await?;
        let actual = self.metadata.sum_sizes_by_owner(owner_id).await?;
        if actual != quota.used_bytes {
            warn!(
                owner_id,
                recorded = quota.used_bytes,
                actual,
                "used_bytes drifted from object sizes, correcting"
            );
            self.metadata.set_used_bytes(owner_id, actual).await?;
            quota.used_bytes = actual;
        }
        Ok(quota)
    }

    /// Recompute every known owner.  Returns the corrected quotas.
    pub async fn recompute_all(&self) -> Result<Vec<UserQuota>, TransferError> {
        let owners = self.metadata.list_owners().await?;
        let mut quotas = Vec::with_capacity(owners.len());
        for owner_id in owners {
            quotas.push(self.recompute_usage(&owner_id).await?);
        }
        info!(owners = quotas.len(), "quota usage recomputed");
        Ok(quotas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::metadata::store::ObjectRecord;
    use std::time::Duration;

    fn guard_with(quota: u64) -> (Arc<MemoryMetadataStore>, QuotaGuard) {
        let store = Arc::new(MemoryMetadataStore::new());
        let config = QuotaConfig {
            default_quota_bytes: quota,
            owners: HashMap::from([("vip".to_string(), 10 * quota)]),
            recompute_on_startup: false,
        };
        let guard = QuotaGuard::new(store.clone(), &config);
        (store, guard)
    }

    #[tokio::test]
    async fn test_exact_fill_allowed_one_more_byte_rejected() {
        let (store, guard) = guard_with(100);
        guard.quota("alice").await.unwrap();
        store
            .insert_object(ObjectRecord::new("alice", "a", 60, "alice/a"))
            .await
            .unwrap();

        guard.validate_addition("alice", 40, "b").await.unwrap();
        let err = guard.validate_addition("alice", 41, "b").await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::QuotaExceeded {
                requested: 41,
                used: 60,
                quota: 100,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_overflowing_size_rejected() {
        let (_store, guard) = guard_with(100);
        let err = guard
            .validate_addition("alice", u64::MAX, "a")
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_name_collision() {
        let (store, guard) = guard_with(100);
        guard.quota("alice").await.unwrap();
        store
            .insert_object(ObjectRecord::new("alice", "a.txt", 1, "alice/a.txt"))
            .await
            .unwrap();
        let err = guard.validate_addition("alice", 1, "a.txt").await.unwrap_err();
        assert!(matches!(err, TransferError::NameCollision { .. }));
        // Other owners are unaffected.
        guard.validate_addition("bob", 1, "a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_metadata_outage_is_retryable() {
        let (store, guard) = guard_with(100);
        store.set_offline(true);
        let err = guard.validate_addition("alice", 1, "a").await.unwrap_err();
        assert!(matches!(err, TransferError::MetadataUnavailable(_)));
        assert!(err.retryable());
        assert!(guard.quota("alice").await.unwrap_err().retryable());

        store.set_offline(false);
        guard.validate_addition("alice", 1, "a").await.unwrap();
    }

    #[tokio::test]
    async fn test_owner_override() {
        let (_store, guard) = guard_with(100);
        assert_eq!(guard.quota("vip").await.unwrap().quota_bytes, 1000);
        assert_eq!(guard.quota("alice").await.unwrap().quota_bytes, 100);
    }

    #[tokio::test]
    async fn test_recompute_usage_fixes_drift() {
        let (store, guard) = guard_with(100);
        guard.quota("alice").await.unwrap();
        store
            .insert_object(ObjectRecord::new("alice", "a", 7, "alice/a"))
            .await
            .unwrap();
        store.set_used_bytes("alice", 99).await.unwrap();

        let quota = guard.recompute_usage("alice").await.unwrap();
        assert_eq!(quota.used_bytes, 7);
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 7);

        store.set_used_bytes("alice", 0).await.unwrap();
        let all = guard.recompute_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].used_bytes, 7);
    }

    #[tokio::test]
    async fn test_owner_lock_serializes_same_owner() {
        let (_store, guard) = guard_with(100);
        let guard = Arc::new(guard);
        let held = guard.lock_owner("alice").await;

        let g = guard.clone();
        let waiter = tokio::spawn(async move {
            let _l = g.lock_owner("alice").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different owner is not blocked.
        let _bob = guard.lock_owner("bob").await;

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
