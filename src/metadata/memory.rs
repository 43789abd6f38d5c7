//! In-memory metadata store.
//!
//! Stores all metadata in memory with no persistence. Useful for testing
//! and ephemeral deployments. Uses `RwLock<HashMap>` for thread-safe access.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::store::{MetadataStore, ObjectRecord, OrphanRecord, UserQuota};

type ObjectId = String;
type OwnerKey = (String, String);

#[derive(Debug, Default)]
struct Inner {
    objects: HashMap<ObjectId, ObjectRecord>,
    by_key: HashMap<OwnerKey, ObjectId>,
    quotas: HashMap<String, UserQuota>,
    orphans: Vec<OrphanRecord>,
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    inner: RwLock<Inner>,
    insert_failures: AtomicUsize,
    offline: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` object inserts without applying them.
    pub fn fail_next_inserts(&self, n: usize) {
        self.insert_failures.store(n, Ordering::SeqCst);
    }

    /// While offline every operation fails as an unreachable database would.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> anyhow::Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("metadata store unreachable");
        }
        Ok(())
    }

    fn read(&self) -> anyhow::Result<RwLockReadGuard<'_, Inner>> {
        self.check_online()?;
        self.inner
            .read()
            .map_err(|_| anyhow::anyhow!("metadata lock poisoned"))
    }

    fn write(&self) -> anyhow::Result<RwLockWriteGuard<'_, Inner>> {
        self.check_online()?;
        self.inner
            .write()
            .map_err(|_| anyhow::anyhow!("metadata lock poisoned"))
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn insert_object(
        &self,
        record: ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self
                .insert_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("injected insert failure");
            }
            let mut inner = self.write()?;
            let owner_key = (record.owner_id.clone(), record.object_key.clone());
            if inner.by_key.contains_key(&owner_key) {
                anyhow::bail!(
                    "object already exists: {}/{}",
                    record.owner_id,
                    record.object_key
                );
            }
            if inner.objects.contains_key(&record.object_id) {
                anyhow::bail!("object id already exists: {}", record.object_id);
            }
            let quota = inner
                .quotas
                .get_mut(&record.owner_id)
                .ok_or_else(|| anyhow::anyhow!("no quota row for owner {}", record.owner_id))?;
            quota.used_bytes += record.size_bytes;
            inner.by_key.insert(owner_key, record.object_id.clone());
            inner.objects.insert(record.object_id.clone(), record);
            Ok(())
        })
    }

    fn get_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let inner = self.read()?;
            Ok(inner.objects.get(&object_id).cloned())
        })
    }

    fn find_object(
        &self,
        owner_id: &str,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let owner_key = (owner_id.to_string(), object_key.to_string());
        Box::pin(async move {
            let inner = self.read()?;
            Ok(inner
                .by_key
                .get(&owner_key)
                .and_then(|id| inner.objects.get(id))
                .cloned())
        })
    }

    fn list_objects(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let inner = self.read()?;
            let mut records: Vec<ObjectRecord> = inner
                .objects
                .values()
                .filter(|r| r.owner_id == owner_id)
                .cloned()
                .collect();
            records.sort_by(|a, b| a.object_key.cmp(&b.object_key));
            Ok(records)
        })
    }

    fn delete_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let Some(record) = inner.objects.remove(&object_id) else {
                return Ok(None);
            };
            inner
                .by_key
                .remove(&(record.owner_id.clone(), record.object_key.clone()));
            if let Some(quota) = inner.quotas.get_mut(&record.owner_id) {
                quota.used_bytes = quota.used_bytes.saturating_sub(record.size_bytes);
            }
            Ok(Some(record))
        })
    }

    fn sum_sizes_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let inner = self.read()?;
            Ok(inner
                .objects
                .values()
                .filter(|r| r.owner_id == owner_id)
                .map(|r| r.size_bytes)
                .sum())
        })
    }

    fn get_quota(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserQuota>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let inner = self.read()?;
            Ok(inner.quotas.get(&owner_id).cloned())
        })
    }

    fn ensure_quota(
        &self,
        owner_id: &str,
        default_quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let quota = inner
                .quotas
                .entry(owner_id.clone())
                .or_insert_with(|| UserQuota {
                    owner_id,
                    quota_bytes: default_quota_bytes,
                    used_bytes: 0,
                });
            Ok(quota.clone())
        })
    }

    fn set_quota_limit(
        &self,
        owner_id: &str,
        quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let quota = inner
                .quotas
                .entry(owner_id.clone())
                .or_insert_with(|| UserQuota {
                    owner_id,
                    quota_bytes,
                    used_bytes: 0,
                });
            quota.quota_bytes = quota_bytes;
            Ok(quota.clone())
        })
    }

    fn set_used_bytes(
        &self,
        owner_id: &str,
        used_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let mut inner = self.write()?;
            let quota = inner
                .quotas
                .get_mut(&owner_id)
                .ok_or_else(|| anyhow::anyhow!("no quota row for owner {owner_id}"))?;
            quota.used_bytes = used_bytes;
            Ok(())
        })
    }

    fn list_owners(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.read()?;
            let owners: BTreeSet<String> = inner
                .quotas
                .keys()
                .cloned()
                .chain(inner.objects.values().map(|r| r.owner_id.clone()))
                .collect();
            Ok(owners.into_iter().collect())
        })
    }

    fn record_orphan(
        &self,
        orphan: OrphanRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut inner = self.write()?;
            inner.orphans.push(orphan);
            Ok(())
        })
    }

    fn list_orphans(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<OrphanRecord>>> + Send + '_>> {
        Box::pin(async move {
            let inner = self.read()?;
            Ok(inner.orphans.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_object(owner: &str, key: &str, size: u64) -> ObjectRecord {
        ObjectRecord::new(owner, key, size, &format!("{owner}/{key}"))
    }

    #[tokio::test]
    async fn test_insert_requires_quota_row() {
        let store = MemoryMetadataStore::new();
        assert!(store.insert_object(make_object("alice", "a", 1)).await.is_err());
        assert!(store.get_quota("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_charges_and_delete_releases() {
        let store = MemoryMetadataStore::new();
        store.ensure_quota("alice", 100).await.unwrap();
        let rec = make_object("alice", "a.txt", 40);
        store.insert_object(rec.clone()).await.unwrap();
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 40);
        assert_eq!(store.get_object(&rec.object_id).await.unwrap(), Some(rec.clone()));
        assert_eq!(
            store.find_object("alice", "a.txt").await.unwrap(),
            Some(rec.clone())
        );

        let deleted = store.delete_object(&rec.object_id).await.unwrap();
        assert_eq!(deleted, Some(rec.clone()));
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 0);
        assert!(store.find_object("alice", "a.txt").await.unwrap().is_none());
        assert!(store.delete_object(&rec.object_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unique_owner_key() {
        let store = MemoryMetadataStore::new();
        store.ensure_quota("alice", 100).await.unwrap();
        store.ensure_quota("bob", 100).await.unwrap();
        store.insert_object(make_object("alice", "same", 1)).await.unwrap();
        assert!(store.insert_object(make_object("alice", "same", 2)).await.is_err());
        store.insert_object(make_object("bob", "same", 3)).await.unwrap();
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 1);
    }

    #[tokio::test]
    async fn test_sum_and_list_by_owner() {
        let store = MemoryMetadataStore::new();
        store.ensure_quota("alice", 100).await.unwrap();
        store.ensure_quota("bob", 100).await.unwrap();
        store.insert_object(make_object("alice", "b", 5)).await.unwrap();
        store.insert_object(make_object("alice", "a", 7)).await.unwrap();
        store.insert_object(make_object("bob", "c", 11)).await.unwrap();

        assert_eq!(store.sum_sizes_by_owner("alice").await.unwrap(), 12);
        let keys: Vec<String> = store
            .list_objects("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.object_key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.list_owners().await.unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_quota_rows() {
        let store = MemoryMetadataStore::new();
        let q = store.ensure_quota("alice", 100).await.unwrap();
        assert_eq!(q.quota_bytes, 100);
        // Existing rows keep their limit.
        let q = store.ensure_quota("alice", 999).await.unwrap();
        assert_eq!(q.quota_bytes, 100);
        let q = store.set_quota_limit("alice", 500).await.unwrap();
        assert_eq!(q.quota_bytes, 500);
        store.set_used_bytes("alice", 42).await.unwrap();
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 42);
        assert!(store.set_used_bytes("nobody", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_orphan_ledger() {
        let store = MemoryMetadataStore::new();
        let orphan = OrphanRecord {
            upload_id: Some("u1".into()),
            owner_id: "alice".into(),
            object_key: "a".into(),
            storage_key: "alice/a".into(),
            size_bytes: 3,
            detected_at: chrono::Utc::now(),
            reason: "disk full".into(),
        };
        store.record_orphan(orphan.clone()).await.unwrap();
        assert_eq!(store.list_orphans().await.unwrap(), vec![orphan]);
    }
}
