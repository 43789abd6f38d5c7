//! Abstract storage backend trait.
//!
//! Every object-storage backend must implement [`StorageBackend`].  Writes
//! go through staged blocks: each block is pushed independently under a
//! caller-chosen block id, and a later commit assembles an ordered list of
//! staged blocks into one object.  Until the commit the object is not
//! visible to reads.  Uncommitted blocks are left for the backend to
//! garbage-collect.

use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;

/// Lazy stream of object bytes.
pub type ByteStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Async object storage contract.
pub trait StorageBackend: Send + Sync + 'static {
    /// Stage one block for `storage_key`.  Staging the same `block_id`
    /// again replaces the earlier bytes.
    fn stage_block(
        &self,
        storage_key: &str,
        block_id: &str,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Assemble the listed staged blocks, in order, into the object at
    /// `storage_key`, replacing any previous object.  Fails if any block id
    /// is not staged.
    fn commit_block_list(
        &self,
        storage_key: &str,
        block_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read `length` bytes starting at `offset`.
    fn read(
        &self,
        storage_key: &str,
        offset: u64,
        length: u64,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ByteStream>> + Send + '_>>;

    /// Delete the committed object at `storage_key`.  Deleting a missing
    /// object succeeds.
    fn delete(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Size of the committed object, or `None` if it does not exist.
    fn size(
        &self,
        storage_key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<u64>>> + Send + '_>>;
}
