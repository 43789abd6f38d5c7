//! In-memory storage backend.
//!
//! Committed objects and uncommitted blocks are held in
//! `tokio::sync::RwLock<HashMap<...>>` maps.  Block semantics follow block
//! blob storage: staging a block id twice keeps the latest bytes, a commit
//! assembles the listed blocks in order and discards the remaining
//! uncommitted blocks for that key.
//!
//! A configurable memory limit (`max_size_bytes`) caps total stored bytes.
//! Failures can be injected for exercising retry paths.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::backend::{ByteStream, StorageBackend};

/// Failures the backend will produce on upcoming calls.
#[derive(Debug, Default)]
struct Faults {
    stage_failures: AtomicUsize,
    commit_failures: AtomicUsize,
    /// Commits that are applied and then reported as failed, like a
    /// response lost after the server acted.
    lost_commit_acks: AtomicUsize,
    read_failures: AtomicUsize,
    delete_failures: AtomicUsize,
    /// Milliseconds every commit waits before it is applied.
    commit_delay_ms: AtomicU64,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory storage backend.
pub struct MemoryBackend {
    /// Committed objects: storage_key -> data.
    objects: tokio::sync::RwLock<HashMap<String, Bytes>>,
    /// Uncommitted blocks: storage_key -> block_id -> data.
    blocks: tokio::sync::RwLock<HashMap<String, HashMap<String, Bytes>>>,
    /// Current total bytes stored (objects + blocks).
    current_size: tokio::sync::RwLock<u64>,
    /// Maximum bytes allowed.  0 means unlimited.
    max_size_bytes: u64,
    /// Size of each chunk yielded by reads.
    read_chunk_bytes: usize,
    faults: Faults,
    stage_calls: AtomicU64,
    commit_calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new(max_size_bytes: u64, read_chunk_bytes: usize) -> Self {
        Self {
            objects: tokio::sync::RwLock::new(HashMap::new()),
            blocks: tokio::sync::RwLock::new(HashMap::new()),
            current_size: tokio::sync::RwLock::new(0),
            max_size_bytes,
            read_chunk_bytes: read_chunk_bytes.max(1),
            faults: Faults::default(),
            stage_calls: AtomicU64::new(0),
            commit_calls: AtomicU64::new(0),
        }
    }

    // ── Fault injection ────────────────────────────────────────────

    /// Fail the next `n` stage calls.
    pub fn fail_next_stages(&self, n: usize) {
        self.faults.stage_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` commit calls without applying them.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.commit_failures.store(n, Ordering::SeqCst);
    }

    /// Apply the next `n` commits but report them as failed.
    pub fn lose_next_commit_acks(&self, n: usize) {
        self.faults.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` read calls.
    pub fn fail_next_reads(&self, n: usize) {
        self.faults.read_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` delete calls, leaving the object in place.
    pub fn fail_next_deletes(&self, n: usize) {
        self.faults.delete_failures.store(n, Ordering::SeqCst);
    }

    /// Hold every commit for `delay` before applying it.
    pub fn delay_commits(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.faults.commit_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of stage calls that reached the backend.
    pub fn stage_calls(&self) -> u64 {
        self.stage_calls.load(Ordering::SeqCst)
    }

    /// Number of commits that were applied.
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// Number of uncommitted blocks held for `storage_key`.
    pub async fn uncommitted_blocks(&self, storage_key: &str) -> usize {
        self.blocks
            .read()
            .await
            .get(storage_key)
            .map_or(0, HashMap::len)
    }

    // ── Memory accounting ──────────────────────────────────────────

    /// Check whether adding `additional` bytes would exceed the memory limit.
    /// If the limit is 0 (unlimited), always returns Ok.
    async fn check_capacity(&self, additional: u64) -> anyhow::Result<()> {
        if self.max_size_bytes == 0 {
            return Ok(());
        }
        let current = *self.current_size.read().await;
        if current + additional > self.max_size_bytes {
            anyhow::bail!(
                "Memory limit exceeded: current={current}, additional={additional}, max={}",
                self.max_size_bytes
            );
        }
        Ok(())
    }

    /// Adjust the tracked size by a signed delta.
    async fn adjust_size(&self, delta: i64) {
        let mut size = self.current_size.write().await;
        if delta >= 0 {
            *size = size.saturating_add(delta as u64);
        } else {
            *size = size.saturating_sub(delta.unsigned_abs());
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn stage_block(
        &self,
        storage_key: &str,
        block_id: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        let block_id = block_id.to_string();
        Box::pin(async move {
            if take_one(&self.faults.stage_failures) {
                anyhow::bail!("injected stage failure for block {block_id}");
            }
            self.check_capacity(data.len() as u64).await?;
            self.stage_calls.fetch_add(1, Ordering::SeqCst);

            let added = data.len() as i64;
            let previous = {
                let mut blocks = self.blocks.write().await;
                blocks
                    .entry(storage_key)
                    .or_default()
                    .insert(block_id, data)
            };
            let removed = previous.map_or(0, |b| b.len() as i64);
            self.adjust_size(added - removed).await;
            Ok(())
        })
    }

    fn commit_block_list(
        &self,
        storage_key: &str,
        block_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        let block_ids = block_ids.to_vec();
        Box::pin(async move {
            if take_one(&self.faults.commit_failures) {
                anyhow::bail!("injected commit failure for {storage_key}");
            }
            let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let mut blocks = self.blocks.write().await;
            let staged = blocks.get(&storage_key);
            let mut assembled = BytesMut::new();
            for id in &block_ids {
                let block = staged
                    .and_then(|m| m.get(id))
                    .ok_or_else(|| anyhow::anyhow!("InvalidBlockList: block {id} is not staged"))?;
                assembled.extend_from_slice(block);
            }

            // Uncommitted blocks not in the list are discarded on commit.
            let freed: i64 = blocks
                .remove(&storage_key)
                .map_or(0, |m| m.values().map(|b| b.len() as i64).sum());
            drop(blocks);

            let data = assembled.freeze();
            let added = data.len() as i64;
            let replaced = self
                .objects
                .write()
                .await
                .insert(storage_key.clone(), data)
                .map_or(0, |b| b.len() as i64);
            self.adjust_size(added - replaced - freed).await;
            self.commit_calls.fetch_add(1, Ordering::SeqCst);

            if take_one(&self.faults.lost_commit_acks) {
                anyhow::bail!("injected lost acknowledgement for {storage_key}");
            }
            Ok(())
        })
    }

    fn read(
        &self,
        storage_key: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ByteStream>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            if take_one(&self.faults.read_failures) {
                anyhow::bail!("injected read failure for {storage_key}");
            }
            let data = self
                .objects
                .read()
                .await
                .get(&storage_key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("object not found: {storage_key}"))?;

            let size = data.len() as u64;
            if offset > size {
                anyhow::bail!("offset {offset} past end of {storage_key} ({size} bytes)");
            }
            let end = offset.saturating_add(length).min(size) as usize;
            let range = data.slice(offset as usize..end);

            let chunk = self.read_chunk_bytes;
            let chunks: Vec<anyhow::Result<Bytes>> = (0..range.len())
                .step_by(chunk)
                .map(|start| Ok(range.slice(start..(start + chunk).min(range.len()))))
                .collect();
            Ok(stream::iter(chunks).boxed())
        })
    }

    fn delete(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            if take_one(&self.faults.delete_failures) {
                anyhow::bail!("injected delete failure for {storage_key}");
            }
            let removed = self.objects.write().await.remove(&storage_key);
            if let Some(data) = removed {
                self.adjust_size(-(data.len() as i64)).await;
            }
            Ok(())
        })
    }

    fn size(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>> {
        let storage_key = storage_key.to_string();
        Box::pin(async move {
            let objects = self.objects.read().await;
            Ok(objects.get(&storage_key).map(|b| b.len() as u64))
        })
    }
}
