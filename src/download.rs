//! Ranged, resumable downloads.
//!
//! A download is a lazy stream of chunks pulled from the backend.  Streams
//! are not restartable: a client resumes by opening a new stream with a
//! `bytes=` range starting where the previous one stopped.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::TransferError;
use crate::metadata::store::{MetadataStore, ObjectRecord};
use crate::storage::stager::{BlockStager, ChunkStream, ObjectHandle};

// -- Range parsing ------------------------------------------------------------

/// Parsed byte range from a Range header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// bytes=start-end (inclusive both ends)
    StartEnd(u64, u64),
    /// bytes=start-  (from start to end of file)
    StartOpen(u64),
    /// bytes=-N  (last N bytes)
    Suffix(u64),
}

impl ByteRange {
    /// Parse a Range header value like "bytes=0-4", "bytes=5-", "bytes=-3".
    /// Returns None if the header is not a single valid bytes range.
    pub fn parse(range_str: &str) -> Option<ByteRange> {
        let ranges = range_str.trim().strip_prefix("bytes=")?;

        // Only a single range is supported.
        if ranges.contains(',') {
            return None;
        }

        if let Some(suffix) = ranges.strip_prefix('-') {
            let n: u64 = suffix.parse().ok()?;
            if n == 0 {
                return None;
            }
            Some(ByteRange::Suffix(n))
        } else if let Some(stripped) = ranges.strip_suffix('-') {
            let start: u64 = stripped.parse().ok()?;
            Some(ByteRange::StartOpen(start))
        } else if let Some((start_s, end_s)) = ranges.split_once('-') {
            let start: u64 = start_s.parse().ok()?;
            let end: u64 = end_s.parse().ok()?;
            Some(ByteRange::StartEnd(start, end))
        } else {
            None
        }
    }

    /// Resolve against an object of `total` bytes.
    ///
    /// Returns inclusive `(start, end)` with `start <= end < total`, or None.
    /// An explicit end past the last byte is not clamped.
    pub fn resolve(self, total: u64) -> Option<(u64, u64)> {
        if total == 0 {
            return None;
        }
        let (start, end) = match self {
            ByteRange::StartEnd(start, end) => (start, end),
            ByteRange::StartOpen(start) => (start, total - 1),
            ByteRange::Suffix(n) => (total.saturating_sub(n), total - 1),
        };
        (start <= end && end < total).then_some((start, end))
    }
}

// -- Streams ------------------------------------------------------------------

/// An open download.
///
/// Cancellation is cooperative: it stops further pulls from the backend
/// but cannot recall chunks already handed out.
pub struct DownloadStream {
    record: ObjectRecord,
    start: u64,
    end: u64,
    partial: bool,
    token: CancellationToken,
    inner: ChunkStream,
}

impl DownloadStream {
    pub fn record(&self) -> &ObjectRecord {
        &self.record
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    /// Bytes this stream yields when read to the end.
    pub fn content_length(&self) -> u64 {
        if self.record.size_bytes == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// `Content-Range` value for a ranged download.
    pub fn content_range(&self) -> Option<String> {
        self.partial.then(|| {
            format!(
                "bytes {}-{}/{}",
                self.start, self.end, self.record.size_bytes
            )
        })
    }

    /// A token that cancels this stream from elsewhere.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for DownloadStream {
    type Item = Result<Bytes, TransferError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                metrics::counter!(crate::metrics::BYTES_SENT_TOTAL).increment(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

pub struct DownloadStreamer {
    metadata: Arc<dyn MetadataStore>,
    stager: Arc<BlockStager>,
}

impl DownloadStreamer {
    pub fn new(metadata: Arc<dyn MetadataStore>, stager: Arc<BlockStager>) -> Self {
        Self { metadata, stager }
    }

    /// Open a download of `object_id`, optionally restricted to a
    /// `bytes=` range.
    pub async fn open(
        &self,
        object_id: &str,
        range: Option<&str>,
    ) -> Result<DownloadStream, TransferError> {
        let record = self
            .metadata
            .get_object(object_id)
            .await?
            .ok_or_else(|| TransferError::ObjectNotFound {
                object_id: object_id.to_string(),
            })?;
        self.open_record(record, range).await
    }

    /// Open a download of an already-resolved record.
    pub async fn open_record(
        &self,
        record: ObjectRecord,
        range: Option<&str>,
    ) -> Result<DownloadStream, TransferError> {
        let size = record.size_bytes;
        let (start, end, partial) = match range {
            Some(raw) => {
                let (start, end) = ByteRange::parse(raw)
                    .and_then(|r| r.resolve(size))
                    .ok_or_else(|| TransferError::InvalidRange {
                        range: raw.to_string(),
                        size,
                    })?;
                (start, end, true)
            }
            None => (0, size.saturating_sub(1), false),
        };

        let inner: ChunkStream = if size == 0 {
            futures::stream::empty().boxed()
        } else {
            let handle = ObjectHandle {
                storage_key: record.storage_key.clone(),
                size,
            };
            self.stager.read(&handle, start, end - start + 1).await?
        };

        debug!(
            object_id = %record.object_id,
            start,
            end,
            partial,
            "download opened"
        );
        Ok(DownloadStream {
            record,
            start,
            end,
            partial,
            token: CancellationToken::new(),
            inner,
        })
    }

    /// Stop further pulls on `stream`.
    pub fn cancel(&self, stream: &DownloadStream) {
        stream.cancel();
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::metadata::memory::MemoryMetadataStore;
    use crate::storage::backend::StorageBackend;
    use crate::storage::memory::MemoryBackend;
    use futures::TryStreamExt;

    async fn setup(data: &[u8]) -> (Arc<MemoryBackend>, DownloadStreamer, String) {
        let backend = Arc::new(MemoryBackend::new(0, 4));
        let metadata = Arc::new(MemoryMetadataStore::new());
        metadata.ensure_quota("alice", 1 << 20).await.unwrap();

        let key = "alice/file.bin";
        if !data.is_empty() {
            backend
                .stage_block(key, "b0", Bytes::copy_from_slice(data))
                .await
                .unwrap();
            backend
                .commit_block_list(key, &["b0".to_string()])
                .await
                .unwrap();
        } else {
            backend.commit_block_list(key, &[]).await.unwrap();
        }
        let record = ObjectRecord::new("alice", "file.bin", data.len() as u64, key);
        let object_id = record.object_id.clone();
        metadata.insert_object(record).await.unwrap();

        let stager = Arc::new(BlockStager::new(backend.clone(), TimeoutConfig::default()));
        (backend, DownloadStreamer::new(metadata, stager), object_id)
    }

    fn hundred() -> Vec<u8> {
        (0..100u8).collect()
    }

    // -- Range parsing tests --------------------------------------------------

    #[test]
    fn test_parse_range() {
        assert_eq!(ByteRange::parse("bytes=0-4"), Some(ByteRange::StartEnd(0, 4)));
        assert_eq!(ByteRange::parse("bytes=5-"), Some(ByteRange::StartOpen(5)));
        assert_eq!(ByteRange::parse("bytes=-3"), Some(ByteRange::Suffix(3)));
    }

    #[test]
    fn test_parse_range_invalid() {
        assert_eq!(ByteRange::parse("bytes=-0"), None);
        assert_eq!(ByteRange::parse(""), None);
        assert_eq!(ByteRange::parse("chars=0-4"), None);
        assert_eq!(ByteRange::parse("bytes=0-4,6-8"), None);
        assert_eq!(ByteRange::parse("bytes=a-b"), None);
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(ByteRange::StartEnd(10, 19).resolve(100), Some((10, 19)));
        assert_eq!(ByteRange::StartEnd(99, 99).resolve(100), Some((99, 99)));
        assert_eq!(ByteRange::StartEnd(5, 3).resolve(100), None);
        assert_eq!(ByteRange::StartEnd(0, 100).resolve(100), None);
        assert_eq!(ByteRange::StartOpen(95).resolve(100), Some((95, 99)));
        assert_eq!(ByteRange::StartOpen(100).resolve(100), None);
        assert_eq!(ByteRange::Suffix(5).resolve(100), Some((95, 99)));
        assert_eq!(ByteRange::Suffix(500).resolve(100), Some((0, 99)));
    }

    #[test]
    fn test_resolve_range_empty_object() {
        assert_eq!(ByteRange::StartEnd(0, 0).resolve(0), None);
        assert_eq!(ByteRange::Suffix(5).resolve(0), None);
        assert_eq!(ByteRange::StartOpen(0).resolve(0), None);
    }

    // -- Streaming tests ------------------------------------------------------

    #[tokio::test]
    async fn test_full_download() {
        let (_backend, streamer, id) = setup(&hundred()).await;
        let stream = streamer.open(&id, None).await.unwrap();
        assert!(!stream.is_partial());
        assert_eq!(stream.content_length(), 100);
        assert_eq!(stream.content_range(), None);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), hundred());
    }

    #[tokio::test]
    async fn test_range_download() {
        let (_backend, streamer, id) = setup(&hundred()).await;
        let stream = streamer.open(&id, Some("bytes=10-19")).await.unwrap();
        assert!(stream.is_partial());
        assert_eq!(stream.content_length(), 10);
        assert_eq!(stream.content_range().as_deref(), Some("bytes 10-19/100"));
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), (10..20u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_resume_from_offset() {
        let (_backend, streamer, id) = setup(&hundred()).await;
        let mut first = streamer.open(&id, None).await.unwrap();
        let mut received = Vec::new();
        received.extend_from_slice(&first.next().await.unwrap().unwrap());
        streamer.cancel(&first);
        assert!(first.next().await.is_none());

        let rest = streamer
            .open(&id, Some(&format!("bytes={}-", received.len())))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = rest.try_collect().await.unwrap();
        received.extend_from_slice(&chunks.concat());
        assert_eq!(received, hundred());
    }

    #[tokio::test]
    async fn test_invalid_ranges() {
        let (_backend, streamer, id) = setup(&hundred()).await;
        for raw in ["bytes=50-100", "bytes=20-10", "bytes=100-", "items=0-1"] {
            let err = streamer.open(&id, Some(raw)).await.err().unwrap();
            assert!(
                matches!(err, TransferError::InvalidRange { size: 100, .. }),
                "{raw}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_object() {
        let (_backend, streamer, _id) = setup(b"abc").await;
        let err = streamer.open("missing", None).await.err().unwrap();
        assert!(matches!(err, TransferError::ObjectNotFound { .. }));
    }

    #[tokio::test]
    async fn test_empty_object() {
        let (_backend, streamer, id) = setup(b"").await;
        let stream = streamer.open(&id, None).await.unwrap();
        assert_eq!(stream.content_length(), 0);
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert!(chunks.is_empty());

        let err = streamer.open(&id, Some("bytes=0-0")).await.err().unwrap();
        assert!(matches!(err, TransferError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn test_backend_failure_is_unavailable() {
        let (backend, streamer, id) = setup(&hundred()).await;
        backend.fail_next_reads(1);
        let err = streamer.open(&id, None).await.err().unwrap();
        assert!(matches!(err, TransferError::BackendUnavailable(_)));
        assert!(err.retryable());
    }
}
