//! SQLite-backed metadata store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Object registration and deletion run in one transaction together with
//! the owner's `used_bytes` adjustment.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::store::{MetadataStore, ObjectRecord, OrphanRecord, UserQuota};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

const OBJECT_COLUMNS: &str =
    "object_id, owner_id, object_key, size_bytes, kind, storage_key, created_at, modified_at";

/// Metadata store backed by a single SQLite database file.
pub struct SqliteMetadataStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn conn(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))
    }

    /// Apply recommended SQLite pragmas for performance and safety.
    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create the required tables and indexes if they do not already exist.
    /// This is idempotent -- safe to call on every startup (crash-only design).
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "
            -- Schema version tracking
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            -- Per-owner quota and usage
            CREATE TABLE IF NOT EXISTS quotas (
                owner_id     TEXT PRIMARY KEY,
                quota_bytes  INTEGER NOT NULL,
                used_bytes   INTEGER NOT NULL DEFAULT 0
            );

            -- Committed objects
            CREATE TABLE IF NOT EXISTS objects (
                object_id    TEXT PRIMARY KEY,
                owner_id     TEXT NOT NULL,
                object_key   TEXT NOT NULL,
                size_bytes   INTEGER NOT NULL,
                kind         TEXT NOT NULL DEFAULT 'application/octet-stream',
                storage_key  TEXT NOT NULL,
                created_at   TEXT NOT NULL,
                modified_at  TEXT NOT NULL,

                UNIQUE (owner_id, object_key)
            );

            CREATE INDEX IF NOT EXISTS idx_objects_owner
                ON objects(owner_id);

            -- Backend objects no record points to
            CREATE TABLE IF NOT EXISTS orphans (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                upload_id    TEXT,
                owner_id     TEXT NOT NULL,
                object_key   TEXT NOT NULL,
                storage_key  TEXT NOT NULL,
                size_bytes   INTEGER NOT NULL,
                detected_at  TEXT NOT NULL,
                reason       TEXT NOT NULL DEFAULT ''
            );
            ",
        )?;

        let existing: Option<i64> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .optional()?
            .flatten();

        if existing.map_or(true, |v| v < SCHEMA_VERSION) {
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, Utc::now()],
            )?;
        }

        Ok(())
    }
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    Ok(ObjectRecord {
        object_id: row.get(0)?,
        owner_id: row.get(1)?,
        object_key: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        kind: row.get(4)?,
        storage_key: row.get(5)?,
        created_at: row.get(6)?,
        modified_at: row.get(7)?,
    })
}

fn row_to_quota(row: &Row<'_>) -> rusqlite::Result<UserQuota> {
    Ok(UserQuota {
        owner_id: row.get(0)?,
        quota_bytes: row.get::<_, i64>(1)? as u64,
        used_bytes: row.get::<_, i64>(2)? as u64,
    })
}

fn query_quota(conn: &Connection, owner_id: &str) -> rusqlite::Result<Option<UserQuota>> {
    conn.query_row(
        "SELECT owner_id, quota_bytes, used_bytes FROM quotas WHERE owner_id = ?1",
        params![owner_id],
        row_to_quota,
    )
    .optional()
}

impl MetadataStore for SqliteMetadataStore {
    fn insert_object(
        &self,
        record: ObjectRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let charged = tx.execute(
                "UPDATE quotas SET used_bytes = used_bytes + ?2 WHERE owner_id = ?1",
                params![record.owner_id, record.size_bytes as i64],
            )?;
            if charged == 0 {
                anyhow::bail!("no quota row for owner {}", record.owner_id);
            }

            tx.execute(
                &format!("INSERT INTO objects ({OBJECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
                params![
                    record.object_id,
                    record.owner_id,
                    record.object_key,
                    record.size_bytes as i64,
                    record.kind,
                    record.storage_key,
                    record.created_at,
                    record.modified_at,
                ],
            )?;

            tx.commit()?;
            Ok(())
        })
    }

    fn get_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let record = conn
                .query_row(
                    &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE object_id = ?1"),
                    params![object_id],
                    row_to_object,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn find_object(
        &self,
        owner_id: &str,
        object_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        let object_key = object_key.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let record = conn
                .query_row(
                    &format!(
                        "SELECT {OBJECT_COLUMNS} FROM objects WHERE owner_id = ?1 AND object_key = ?2"
                    ),
                    params![owner_id, object_key],
                    row_to_object,
                )
                .optional()?;
            Ok(record)
        })
    }

    fn list_objects(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<ObjectRecord>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {OBJECT_COLUMNS} FROM objects WHERE owner_id = ?1 ORDER BY object_key"
            ))?;
            let records = stmt
                .query_map(params![owner_id], row_to_object)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
    }

    fn delete_object(
        &self,
        object_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<ObjectRecord>>> + Send + '_>> {
        let object_id = object_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let tx = conn.unchecked_transaction()?;

            let record = tx
                .query_row(
                    &format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE object_id = ?1"),
                    params![object_id],
                    row_to_object,
                )
                .optional()?;
            let Some(record) = record else {
                return Ok(None);
            };

            tx.execute(
                "DELETE FROM objects WHERE object_id = ?1",
                params![record.object_id],
            )?;
            tx.execute(
                "UPDATE quotas SET used_bytes = MAX(used_bytes - ?2, 0) WHERE owner_id = ?1",
                params![record.owner_id, record.size_bytes as i64],
            )?;

            tx.commit()?;
            Ok(Some(record))
        })
    }

    fn sum_sizes_by_owner(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<u64>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let total: i64 = conn.query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM objects WHERE owner_id = ?1",
                params![owner_id],
                |row| row.get(0),
            )?;
            Ok(total as u64)
        })
    }

    fn get_quota(
        &self,
        owner_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<UserQuota>>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            Ok(query_quota(&conn, &owner_id)?)
        })
    }

    fn ensure_quota(
        &self,
        owner_id: &str,
        default_quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT OR IGNORE INTO quotas (owner_id, quota_bytes, used_bytes) VALUES (?1, ?2, 0)",
                params![owner_id, default_quota_bytes as i64],
            )?;
            query_quota(&conn, &owner_id)?
                .ok_or_else(|| anyhow::anyhow!("quota row for {owner_id} vanished"))
        })
    }

    fn set_quota_limit(
        &self,
        owner_id: &str,
        quota_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<UserQuota>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO quotas (owner_id, quota_bytes, used_bytes) VALUES (?1, ?2, 0)
                 ON CONFLICT(owner_id) DO UPDATE SET quota_bytes = excluded.quota_bytes",
                params![owner_id, quota_bytes as i64],
            )?;
            query_quota(&conn, &owner_id)?
                .ok_or_else(|| anyhow::anyhow!("quota row for {owner_id} vanished"))
        })
    }

    fn set_used_bytes(
        &self,
        owner_id: &str,
        used_bytes: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let owner_id = owner_id.to_string();
        Box::pin(async move {
            let conn = self.conn()?;
            let updated = conn.execute(
                "UPDATE quotas SET used_bytes = ?2 WHERE owner_id = ?1",
                params![owner_id, used_bytes as i64],
            )?;
            if updated == 0 {
                anyhow::bail!("no quota row for owner {owner_id}");
            }
            Ok(())
        })
    }

    fn list_owners(&self) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<String>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT owner_id FROM quotas
                 UNION
                 SELECT DISTINCT owner_id FROM objects
                 ORDER BY owner_id",
            )?;
            let owners = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(owners)
        })
    }

    fn record_orphan(
        &self,
        orphan: OrphanRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            conn.execute(
                "INSERT INTO orphans
                    (upload_id, owner_id, object_key, storage_key, size_bytes, detected_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    orphan.upload_id,
                    orphan.owner_id,
                    orphan.object_key,
                    orphan.storage_key,
                    orphan.size_bytes as i64,
                    orphan.detected_at,
                    orphan.reason,
                ],
            )?;
            Ok(())
        })
    }

    fn list_orphans(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<OrphanRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT upload_id, owner_id, object_key, storage_key, size_bytes, detected_at, reason
                 FROM orphans ORDER BY id",
            )?;
            let orphans = stmt
                .query_map([], |row| {
                    Ok(OrphanRecord {
                        upload_id: row.get(0)?,
                        owner_id: row.get(1)?,
                        object_key: row.get(2)?,
                        storage_key: row.get(3)?,
                        size_bytes: row.get::<_, i64>(4)? as u64,
                        detected_at: row.get(5)?,
                        reason: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(orphans)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(":memory:").expect("failed to create in-memory store")
    }

    fn make_object(owner: &str, key: &str, size: u64) -> ObjectRecord {
        ObjectRecord::new(owner, key, size, &format!("{owner}/{key}"))
    }

    #[tokio::test]
    async fn test_init_db_idempotent() {
        let store = test_store();
        store.init_db().unwrap();
        store.init_db().unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = test_store();
        store.ensure_quota("alice", 1000).await.unwrap();
        let rec = make_object("alice", "docs/report.pdf", 123);
        store.insert_object(rec.clone()).await.unwrap();

        let got = store.get_object(&rec.object_id).await.unwrap().unwrap();
        assert_eq!(got.object_key, "docs/report.pdf");
        assert_eq!(got.size_bytes, 123);
        assert_eq!(got.kind, "application/pdf");
        assert_eq!(got.created_at, rec.created_at);
        assert_eq!(
            store.find_object("alice", "docs/report.pdf").await.unwrap(),
            Some(got)
        );
    }

    #[tokio::test]
    async fn test_insert_charges_used_bytes() {
        let store = test_store();
        store.ensure_quota("alice", 1000).await.unwrap();
        store.insert_object(make_object("alice", "a", 10)).await.unwrap();
        store.insert_object(make_object("alice", "b", 15)).await.unwrap();
        let quota = store.get_quota("alice").await.unwrap().unwrap();
        assert_eq!(quota.used_bytes, 25);
        assert_eq!(store.sum_sizes_by_owner("alice").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_duplicate_key_rolls_back_charge() {
        let store = test_store();
        store.ensure_quota("alice", 1000).await.unwrap();
        store.insert_object(make_object("alice", "a", 10)).await.unwrap();
        assert!(store.insert_object(make_object("alice", "a", 99)).await.is_err());
        let quota = store.get_quota("alice").await.unwrap().unwrap();
        assert_eq!(quota.used_bytes, 10);
    }

    #[tokio::test]
    async fn test_insert_without_quota_row_fails() {
        let store = test_store();
        assert!(store.insert_object(make_object("ghost", "a", 1)).await.is_err());
        assert!(store.find_object("ghost", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_releases_used_bytes() {
        let store = test_store();
        store.ensure_quota("alice", 1000).await.unwrap();
        let rec = make_object("alice", "a", 10);
        store.insert_object(rec.clone()).await.unwrap();
        let deleted = store.delete_object(&rec.object_id).await.unwrap().unwrap();
        assert_eq!(deleted.object_id, rec.object_id);
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 0);
        assert!(store.delete_object(&rec.object_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_objects_sorted_and_scoped() {
        let store = test_store();
        store.ensure_quota("alice", 1000).await.unwrap();
        store.ensure_quota("bob", 1000).await.unwrap();
        store.insert_object(make_object("alice", "zeta", 1)).await.unwrap();
        store.insert_object(make_object("alice", "alpha", 1)).await.unwrap();
        store.insert_object(make_object("bob", "beta", 1)).await.unwrap();
        let keys: Vec<String> = store
            .list_objects("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.object_key)
            .collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
        assert_eq!(store.list_owners().await.unwrap(), vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn test_quota_limit_and_usage_overwrite() {
        let store = test_store();
        let q = store.ensure_quota("alice", 100).await.unwrap();
        assert_eq!((q.quota_bytes, q.used_bytes), (100, 0));
        let q = store.ensure_quota("alice", 5).await.unwrap();
        assert_eq!(q.quota_bytes, 100);
        let q = store.set_quota_limit("alice", 300).await.unwrap();
        assert_eq!(q.quota_bytes, 300);
        let q = store.set_quota_limit("carol", 7).await.unwrap();
        assert_eq!((q.quota_bytes, q.used_bytes), (7, 0));
        store.set_used_bytes("alice", 77).await.unwrap();
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 77);
        assert!(store.set_used_bytes("nobody", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_orphans_in_insertion_order() {
        let store = test_store();
        for i in 0..3 {
            store
                .record_orphan(OrphanRecord {
                    upload_id: Some(format!("u{i}")),
                    owner_id: "alice".into(),
                    object_key: format!("k{i}"),
                    storage_key: format!("alice/k{i}"),
                    size_bytes: i,
                    detected_at: Utc::now(),
                    reason: "metadata unavailable".into(),
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_orphans()
            .await
            .unwrap()
            .into_iter()
            .filter_map(|o| o.upload_id)
            .collect();
        assert_eq!(ids, vec!["u0", "u1", "u2"]);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let path = path.to_str().unwrap();
        let rec = make_object("alice", "a", 10);
        {
            let store = SqliteMetadataStore::new(path).unwrap();
            store.ensure_quota("alice", 100).await.unwrap();
            store.insert_object(rec.clone()).await.unwrap();
        }
        let store = SqliteMetadataStore::new(path).unwrap();
        assert!(store.get_object(&rec.object_id).await.unwrap().is_some());
        assert_eq!(store.get_quota("alice").await.unwrap().unwrap().used_bytes, 10);
    }
}
