//! Metadata storage layer.
//!
//! The metadata store keeps track of committed objects, per-owner quotas,
//! and orphaned backend objects awaiting reconciliation.  The
//! [`store::MetadataStore`] trait defines the interface;
//! [`sqlite::SqliteMetadataStore`] is the default implementation and
//! [`memory::MemoryMetadataStore`] backs tests and ephemeral deployments.

pub mod memory;
pub mod sqlite;
pub mod store;
