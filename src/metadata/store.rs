//! Abstract metadata store trait.
//!
//! Any metadata backend must implement [`MetadataStore`].  The trait
//! uses `async_trait`-style methods (manual desugaring with pinned
//! futures) so it can be used with both SQLite and remote stores.
//!
//! The store is the single source of truth for which objects exist and
//! how much each owner has stored.  Registering and deleting an object
//! adjust the owner's `used_bytes` in the same transaction, so the counter
//! always equals the sum of the owner's object sizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

// ── Record types ───────────────────────────────────────────────────

/// Metadata record for a committed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Generated identifier, unique across all owners.
    pub object_id: String,
    /// Owner of the object.
    pub owner_id: String,
    /// Sanitized object name, unique per owner.
    pub object_key: String,
    /// Size in bytes.
    pub size_bytes: u64,
    /// MIME type guessed from the key's extension.
    pub kind: String,
    /// Key of the object in the storage backend.
    pub storage_key: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Build a record for a freshly committed object.
    pub fn new(owner_id: &str, object_key: &str, size_bytes: u64, storage_key: &str) -> Self {
        let now = Utc::now();
        Self {
            object_id: derive_object_id(owner_id, object_key, &now),
            owner_id: owner_id.to_string(),
            object_key: object_key.to_string(),
            size_bytes,
            kind: guess_kind(object_key),
            storage_key: storage_key.to_string(),
            created_at: now,
            modified_at: now,
        }
    }
}

/// Derive an object id from the owner, the key, and the commit timestamp.
///
/// The owner is part of the digest so identical names committed in the
/// same nanosecond by different owners still get distinct ids.
pub fn derive_object_id(owner_id: &str, object_key: &str, at: &DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(object_key.as_bytes());
    hasher.update([0u8]);
    hasher.update(at.timestamp_nanos_opt().unwrap_or_default().to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

fn guess_kind(object_key: &str) -> String {
    mime_guess::from_path(object_key)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Storage quota and usage for one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub owner_id: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
}

impl UserQuota {
    pub fn remaining_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }
}

/// A backend object that no record points to: either committed but never
/// registered, or left behind when deleting its record's bytes failed.
///
/// Orphans are reported for out-of-band reconciliation and never deleted
/// automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanRecord {
    /// The upload that committed the object, if it was never registered.
    pub upload_id: Option<String>,
    pub owner_id: String,
    pub object_key: String,
    pub storage_key: String,
    pub size_bytes: u64,
    pub detected_at: DateTime<Utc>,
    pub reason: String,
}

// ── Trait ───────────────────────────────────────────────────────────

/// Async metadata store contract.
pub trait MetadataStore: Send + Sync + 'static {
    // ── Objects ─────────────────────────────────────────────────────

    /// Insert a new object record and add its size to the owner's
    /// `used_bytes` in one transaction.
    ///
    /// Fails if `(owner_id, object_key)` is already taken or the owner has
    /// no quota row.
    fn insert_object(
        &self,
        record: ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Get an object by id.
    fn get_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// Look an object up by owner and name.
    fn find_object(
        &self,
        owner_id: &str,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// List an owner's objects ordered by key.
    fn list_objects(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>>;

    /// Delete an object record and release its size from the owner's
    /// `used_bytes` in one transaction.  Returns the deleted record.
    fn delete_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>>;

    /// Sum of `size_bytes` over the owner's objects.
    fn sum_sizes_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>>;

    // ── Quotas ──────────────────────────────────────────────────────

    /// Get an owner's quota row.
    fn get_quota(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserQuota>>> + Send + '_>>;

    /// Return the owner's quota row, creating it with `default_quota_bytes`
    /// and zero usage if absent.
    fn ensure_quota(
        &self,
        owner_id: &str,
        default_quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>>;

    /// Set an owner's quota limit, creating the row if absent.
    fn set_quota_limit(
        &self,
        owner_id: &str,
        quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>>;

    /// Overwrite an owner's `used_bytes` (recomputation only).
    fn set_used_bytes(
        &self,
        owner_id: &str,
        used_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Every owner with a quota row or at least one object.
    fn list_owners(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>>;

    // ── Orphans ─────────────────────────────────────────────────────

    /// Append an orphaned object to the reconciliation ledger.
    fn record_orphan(
        &self,
        orphan: OrphanRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// List the reconciliation ledger, oldest first.
    fn list_orphans(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<OrphanRecord>>> + Send + '_>>;
}
