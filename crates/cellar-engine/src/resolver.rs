//! Branch resolver: translates `(project, branch, bucket, table)` plus an
//! intent into a concrete storage location.
//!
//! Rules, in order:
//! 1. Linked buckets pass reads through to the source project; writes denied.
//! 2. `default` resolves to the main file.
//! 3. A dev branch with a divergence row resolves to the branch file.
//! 4. A dev branch without a row is a *live view* of main: reads resolve to
//!    the main file read-only; the first write materialises a copy-on-write
//!    branch file (caller holds the branch table lock).
//! 5. Creates on a dev branch that never existed on main become branch-only.

use tracing::{debug, info};

use cellar_core::{BranchSource, Error, Layout, Result, DEFAULT_BRANCH};
use cellar_registry::Registry;

use crate::locks::{LockManager, TableKey};

/// Outcome of resolution: where the table lives and how it may be used.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub path: std::path::PathBuf,
    /// `main` for live views, `branch` for CoW copies, `branch_only` for
    /// tables that never existed on main.
    pub source: BranchSource,
    /// True for live-view reads and linked-bucket pass-throughs.
    pub read_only: bool,
}

/// Resolve for reading. Never mutates anything.
pub async fn resolve_read(
    registry: &Registry,
    layout: &Layout,
    project: &str,
    branch: &str,
    bucket: &str,
    table: &str,
) -> Result<ResolvedTable> {
    if let Some(link) = registry.links.get(project, bucket).await? {
        let path = layout.table_file(&link.src_project, DEFAULT_BRANCH, &link.src_bucket, table);
        if !path.exists() {
            return Err(Error::NotFound(format!("table {bucket}.{table}")));
        }
        return Ok(ResolvedTable {
            path,
            source: BranchSource::Main,
            read_only: true,
        });
    }

    if branch == DEFAULT_BRANCH {
        let path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
        if !path.exists() {
            return Err(Error::NotFound(format!("table {bucket}.{table}")));
        }
        return Ok(ResolvedTable {
            path,
            source: BranchSource::Main,
            read_only: false,
        });
    }

    registry.branches.require(project, branch).await?;
    match registry.branch_tables.get(project, branch, bucket, table).await? {
        Some(row) => {
            let path = layout.table_file(project, branch, bucket, table);
            if !path.exists() {
                return Err(Error::Internal(format!(
                    "branch table row exists but file is missing: {}",
                    path.display()
                )));
            }
            Ok(ResolvedTable {
                path,
                source: row.source,
                read_only: false,
            })
        }
        None => {
            // Live view of main.
            let path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
            if !path.exists() {
                return Err(Error::NotFound(format!("table {bucket}.{table}")));
            }
            Ok(ResolvedTable {
                path,
                source: BranchSource::Main,
                read_only: true,
            })
        }
    }
}

/// Resolve for writing. The caller must hold the table lock for
/// `(project, branch, bucket, table)`; a live view is materialised here.
pub async fn resolve_write(
    registry: &Registry,
    layout: &Layout,
    locks: &LockManager,
    project: &str,
    branch: &str,
    bucket: &str,
    table: &str,
) -> Result<ResolvedTable> {
    if registry.links.get(project, bucket).await?.is_some() {
        return Err(Error::PermissionDenied(format!(
            "bucket {bucket} is linked from another project; writes are denied"
        )));
    }

    if branch == DEFAULT_BRANCH {
        let path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
        if !path.exists() {
            return Err(Error::NotFound(format!("table {bucket}.{table}")));
        }
        return Ok(ResolvedTable {
            path,
            source: BranchSource::Main,
            read_only: false,
        });
    }

    registry.branches.require(project, branch).await?;
    if let Some(row) = registry.branch_tables.get(project, branch, bucket, table).await? {
        let path = layout.table_file(project, branch, bucket, table);
        return Ok(ResolvedTable {
            path,
            source: row.source,
            read_only: false,
        });
    }

    let main_path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
    if !main_path.exists() {
        return Err(Error::NotFound(format!("table {bucket}.{table}")));
    }
    materialize_cow(registry, layout, locks, project, branch, bucket, table).await
}

/// Resolve for creating a new table. Returns the path to create at; for a
/// branch-only create the divergence row is inserted here.
pub async fn resolve_create(
    registry: &Registry,
    layout: &Layout,
    project: &str,
    branch: &str,
    bucket: &str,
    table: &str,
) -> Result<ResolvedTable> {
    if registry.links.get(project, bucket).await?.is_some() {
        return Err(Error::PermissionDenied(format!(
            "bucket {bucket} is linked from another project; writes are denied"
        )));
    }

    let path = layout.table_file(project, branch, bucket, table);
    if path.exists() {
        return Err(Error::Conflict(format!("table {bucket}.{table} already exists")));
    }

    if branch == DEFAULT_BRANCH {
        return Ok(ResolvedTable {
            path,
            source: BranchSource::Main,
            read_only: false,
        });
    }

    registry.branches.require(project, branch).await?;
    if registry
        .branch_tables
        .get(project, branch, bucket, table)
        .await?
        .is_some()
    {
        return Err(Error::Conflict(format!("table {bucket}.{table} already exists")));
    }
    // A branch-only table is independent of any later main-side table with
    // the same name; main never sees it.
    registry
        .branch_tables
        .upsert(&cellar_core::BranchTable {
            project_id: project.to_string(),
            branch_id: branch.to_string(),
            bucket: bucket.to_string(),
            table: table.to_string(),
            source: BranchSource::BranchOnly,
        })
        .await?;
    Ok(ResolvedTable {
        path,
        source: BranchSource::BranchOnly,
        read_only: false,
    })
}

/// Resolve for dropping. A live view cannot be dropped from a branch: the
/// branch owns no copy, and materialising one only to delete it would revert
/// the table to a live view on the next read.
pub async fn resolve_drop(
    registry: &Registry,
    layout: &Layout,
    project: &str,
    branch: &str,
    bucket: &str,
    table: &str,
) -> Result<ResolvedTable> {
    if registry.links.get(project, bucket).await?.is_some() {
        return Err(Error::PermissionDenied(format!(
            "bucket {bucket} is linked from another project; writes are denied"
        )));
    }

    if branch == DEFAULT_BRANCH {
        let path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
        if !path.exists() {
            return Err(Error::NotFound(format!("table {bucket}.{table}")));
        }
        return Ok(ResolvedTable {
            path,
            source: BranchSource::Main,
            read_only: false,
        });
    }

    registry.branches.require(project, branch).await?;
    match registry.branch_tables.get(project, branch, bucket, table).await? {
        Some(row) => Ok(ResolvedTable {
            path: layout.table_file(project, branch, bucket, table),
            source: row.source,
            read_only: false,
        }),
        None => {
            let main_path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
            if main_path.exists() {
                Err(Error::FailedPrecondition(format!(
                    "table {bucket}.{table} is a live view of main; drop it on the default branch"
                )))
            } else {
                Err(Error::NotFound(format!("table {bucket}.{table}")))
            }
        }
    }
}

/// Copy-on-write: with the branch table lock held, copy the main file into
/// the branch directory (stage-then-rename), then insert the divergence row.
/// The main table lock is taken for the duration of the copy so a concurrent
/// main-side write cannot tear the file.
async fn materialize_cow(
    registry: &Registry,
    layout: &Layout,
    locks: &LockManager,
    project: &str,
    branch: &str,
    bucket: &str,
    table: &str,
) -> Result<ResolvedTable> {
    let main_path = layout.table_file(project, DEFAULT_BRANCH, bucket, table);
    let branch_path = layout.table_file(project, branch, bucket, table);
    let staged = branch_path.with_extension("db.cow");

    Layout::ensure_parent(&branch_path)?;

    let copy_result: Result<()> = {
        let _main_guard = locks
            .acquire(&TableKey::new(project, DEFAULT_BRANCH, bucket, table))
            .await;
        std::fs::copy(&main_path, &staged).map(|_| ()).map_err(Error::from)
    };
    if let Err(e) = copy_result {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }

    if let Err(e) = std::fs::rename(&staged, &branch_path) {
        let _ = std::fs::remove_file(&staged);
        return Err(e.into());
    }

    let row = cellar_core::BranchTable {
        project_id: project.to_string(),
        branch_id: branch.to_string(),
        bucket: bucket.to_string(),
        table: table.to_string(),
        source: BranchSource::Branch,
    };
    if let Err(e) = registry.branch_tables.upsert(&row).await {
        // Filesystem succeeded but the registry write failed: delete the
        // partial branch file so the live view stays intact.
        let _ = std::fs::remove_file(&branch_path);
        return Err(e);
    }

    info!(
        project_id = project,
        branch_id = branch,
        bucket,
        table,
        "copy-on-write materialised branch table"
    );
    debug!(path = %branch_path.display(), "branch file created");

    Ok(ResolvedTable {
        path: branch_path,
        source: BranchSource::Branch,
        read_only: false,
    })
}
