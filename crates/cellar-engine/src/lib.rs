//! # cellar-engine
//!
//! The storage-coordination core of cellar: per-table locking, branch
//! resolution with live-view + copy-on-write semantics, the table engine,
//! the import/export pipeline, the snapshot engine, and the workspace engine.
//!
//! Everything hangs off one lifecycle-owned [`Engine`] value constructed at
//! startup; there is no global mutable state.

pub mod export;
pub mod import;
pub mod locks;
pub mod profile;
pub mod resolver;
pub mod snapshot;
pub mod table;
pub mod table_db;
pub mod workspace;

use std::sync::Arc;

use cellar_core::{Error, Layout, Result};
use cellar_registry::Registry;

pub use locks::{LockManager, LockStats, TableKey};
pub use resolver::ResolvedTable;

/// Snapshot artifact codec. A server configuration value, not per-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotCodec {
    Zstd,
    Gzip,
    Snappy,
}

impl SnapshotCodec {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(SnapshotCodec::Zstd),
            "gzip" => Ok(SnapshotCodec::Gzip),
            "snappy" => Ok(SnapshotCodec::Snappy),
            other => Err(Error::InvalidArgument(format!(
                "unknown snapshot codec {other:?}"
            ))),
        }
    }

    /// COPY option spelling.
    pub fn as_sql(&self) -> &'static str {
        match self {
            SnapshotCodec::Zstd => "ZSTD",
            SnapshotCodec::Gzip => "GZIP",
            SnapshotCodec::Snappy => "SNAPPY",
        }
    }
}

/// The storage-coordination core. Constructed once at startup and shared.
#[derive(Clone)]
pub struct Engine {
    pub(crate) registry: Registry,
    pub(crate) layout: Layout,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) codec: SnapshotCodec,
}

impl Engine {
    pub fn new(registry: Registry, layout: Layout, codec: SnapshotCodec) -> Self {
        Self {
            registry,
            layout,
            locks: Arc::new(LockManager::new()),
            codec,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Resolve a table for reading (no lock required).
    pub async fn resolve_read(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
    ) -> Result<ResolvedTable> {
        resolver::resolve_read(&self.registry, &self.layout, project, branch, bucket, table).await
    }
}
