//! ChunkStore library -- chunked uploads and resumable downloads.
//!
//! This crate provides the core components for running the ChunkStore
//! server: name sanitization, per-owner quotas, upload sessions staged as
//! blocks, ranged download streams, and pluggable metadata and storage
//! backends.

use std::sync::Arc;

pub mod catalog;
pub mod config;
pub mod download;
pub mod errors;
pub mod handlers;
pub mod metadata;
pub mod metrics;
pub mod naming;
pub mod quota;
pub mod server;
pub mod storage;
pub mod upload;

use crate::catalog::ObjectCatalog;
use crate::config::Config;
use crate::download::DownloadStreamer;
use crate::metadata::store::MetadataStore;
use crate::naming::NameValidator;
use crate::quota::QuotaGuard;
use crate::storage::backend::StorageBackend;
use crate::storage::stager::BlockStager;
use crate::upload::manager::UploadSessionManager;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Metadata store (SQLite or in-memory).
    pub metadata: Arc<dyn MetadataStore>,
    /// Quota checks and per-owner locks.
    pub quota: Arc<QuotaGuard>,
    /// Live upload sessions.
    pub uploads: UploadSessionManager,
    /// Download streams.
    pub downloads: DownloadStreamer,
    /// Listing and deletion of committed objects.
    pub catalog: ObjectCatalog,
}

impl AppState {
    /// Wire the components together over the given stores.
    pub fn assemble(
        config: Config,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageBackend>,
    ) -> Self {
        let quota = Arc::new(QuotaGuard::new(metadata.clone(), &config.quota));
        let stager = Arc::new(BlockStager::new(storage, config.storage.timeouts.clone()));
        let uploads = UploadSessionManager::new(
            NameValidator::from_config(&config.naming),
            quota.clone(),
            stager.clone(),
            metadata.clone(),
        );
        let downloads = DownloadStreamer::new(metadata.clone(), stager.clone());
        let catalog = ObjectCatalog::new(metadata.clone(), stager, quota.clone());
        Self {
            config,
            metadata,
            quota,
            uploads,
            downloads,
            catalog,
        }
    }
}
