//! # cellar-registry
//!
//! Metadata registry for cellar: one DuckDB file (`metadata.db`) holding all
//! relational state: projects, buckets, tables, branches, snapshots,
//! shares/links, files, workspaces, the idempotency cache, pg-wire sessions,
//! and snapshot settings.
//!
//! This crate provides:
//! - A single writer connection per process behind an async mutex
//! - Repository implementations for every registry entity
//! - Forward-only idempotent startup migrations
//!
//! Registry writes and per-table file writes are never combined in one
//! transaction; the owning component compensates on partial failure.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cellar_registry::Registry;
//!
//! let registry = Registry::open(layout.registry_path().as_path()).await?;
//! let project = registry.projects.require("p1").await?;
//! ```

mod branches;
mod buckets;
mod conn;
mod files;
mod idempotency;
mod keys;
mod migrations;
mod projects;
mod shares;
mod snapshots;
mod tables;
mod workspaces;

use std::path::Path;
use std::sync::Arc;

pub use branches::{BranchRepo, BranchTableRepo};
pub use buckets::BucketRepo;
pub use files::FileRepo;
pub use idempotency::IdempotencyRepo;
pub use keys::ApiKeyRepo;
pub use projects::ProjectRepo;
pub use shares::{LinkRepo, ShareRepo};
pub use snapshots::{SettingsRepo, SnapshotRepo};
pub use tables::TableRepo;
pub use workspaces::WorkspaceRepo;

use cellar_core::Result;
use conn::{RegistryShared, Shared};

/// Combined registry context with all repositories.
#[derive(Clone)]
pub struct Registry {
    shared: Shared,
    /// Project repository.
    pub projects: ProjectRepo,
    /// API key repository.
    pub keys: ApiKeyRepo,
    /// Bucket repository.
    pub buckets: BucketRepo,
    /// Table metadata repository.
    pub tables: TableRepo,
    /// Branch repository.
    pub branches: BranchRepo,
    /// Branch-table divergence repository.
    pub branch_tables: BranchTableRepo,
    /// Bucket share grants.
    pub shares: ShareRepo,
    /// Bucket links.
    pub links: LinkRepo,
    /// Snapshot repository.
    pub snapshots: SnapshotRepo,
    /// Hierarchical snapshot settings.
    pub settings: SettingsRepo,
    /// File store rows.
    pub files: FileRepo,
    /// Workspaces, credentials, and pg-wire sessions.
    pub workspaces: WorkspaceRepo,
    /// Idempotency cache.
    pub idempotency: IdempotencyRepo,
}

impl Registry {
    fn from_shared(shared: Shared) -> Self {
        Self {
            projects: ProjectRepo::new(shared.clone()),
            keys: ApiKeyRepo::new(shared.clone()),
            buckets: BucketRepo::new(shared.clone()),
            tables: TableRepo::new(shared.clone()),
            branches: BranchRepo::new(shared.clone()),
            branch_tables: BranchTableRepo::new(shared.clone()),
            shares: ShareRepo::new(shared.clone()),
            links: LinkRepo::new(shared.clone()),
            snapshots: SnapshotRepo::new(shared.clone()),
            settings: SettingsRepo::new(shared.clone()),
            files: FileRepo::new(shared.clone()),
            workspaces: WorkspaceRepo::new(shared.clone()),
            idempotency: IdempotencyRepo::new(shared.clone()),
            shared,
        }
    }

    /// Open (or create) the registry file and run pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        let shared = Arc::new(RegistryShared::open(path)?);
        shared.write(migrations::run).await?;
        Ok(Self::from_shared(shared))
    }

    /// In-memory registry for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let shared = Arc::new(RegistryShared::open_in_memory()?);
        shared.write(migrations::run).await?;
        Ok(Self::from_shared(shared))
    }

    /// Path of the backing registry file.
    pub fn path(&self) -> &Path {
        self.shared.path()
    }
}
