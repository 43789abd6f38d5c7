//! Object storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations are an in-memory store and a gateway
//! to Azure Blob Storage block blobs.  [`stager::BlockStager`] sits on top
//! and is the only caller of the trait.

pub mod azure;
pub mod backend;
pub mod memory;
pub mod stager;
