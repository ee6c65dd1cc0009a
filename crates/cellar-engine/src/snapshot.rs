//! Snapshot engine: compressed columnar export and restore of single tables,
//! hierarchical trigger configuration, and auto-triggering on destructive
//! operations.
//!
//! An artifact is a directory holding `metadata.json` plus `data.<codec>`
//! (a Parquet dump compressed with the configured codec). Artifacts address
//! default-branch tables; the registry row is the only reference to an
//! artifact, and orphan artifacts are tolerated until the janitor sweeps.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use cellar_core::{
    quote_ident, ColumnDef, Error, Layout, Result, ScopeChain, Snapshot, SnapshotConfig,
    SnapshotKind, DEFAULT_BRANCH,
};

use crate::locks::TableKey;
use crate::table_db;
use crate::Engine;

/// Schema and provenance stored beside the data file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub project_id: String,
    pub bucket: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
    pub codec: String,
    pub data_file: String,
    pub sha256: String,
}

/// Trigger names that fire on a match-all delete, in check order.
const TRUNCATE_TRIGGERS: &[&str] = &["truncate", "truncate_table", "delete_all_rows"];

impl Engine {
    /// Take a manual snapshot of a default-branch table.
    pub async fn create_snapshot(
        &self,
        project: &str,
        bucket: &str,
        table: &str,
    ) -> Result<Snapshot> {
        if self.registry.links.get(project, bucket).await?.is_some() {
            return Err(Error::PermissionDenied(format!(
                "bucket {bucket} is linked from another project; snapshot it at the source"
            )));
        }
        let _guard = self
            .locks
            .acquire(&TableKey::new(project, DEFAULT_BRANCH, bucket, table))
            .await;
        let resolved = self
            .resolve_read(project, DEFAULT_BRANCH, bucket, table)
            .await?;
        let config = self.snapshot_config(project, bucket, table).await?;
        self.create_snapshot_locked(
            project,
            bucket,
            table,
            SnapshotKind::Manual,
            "manual",
            config.manual_retention_days,
            &resolved.path,
        )
        .await
    }

    /// Effective snapshot configuration for one table.
    pub async fn snapshot_config(
        &self,
        project: &str,
        bucket: &str,
        table: &str,
    ) -> Result<SnapshotConfig> {
        let chain = ScopeChain::for_table(project, bucket, table);
        let rows = self.registry.settings.rows_for_chain(&chain).await?;
        Ok(SnapshotConfig::resolve(&rows, &chain))
    }

    /// Fire an auto snapshot if `trigger` is configured. Lock must be held.
    pub(crate) async fn auto_snapshot_locked(
        &self,
        project: &str,
        bucket: &str,
        table: &str,
        trigger: &str,
        path: &std::path::Path,
    ) -> Result<()> {
        let config = self.snapshot_config(project, bucket, table).await?;
        if !config.trigger_enabled(trigger) {
            return Ok(());
        }
        self.create_snapshot_locked(
            project,
            bucket,
            table,
            SnapshotKind::Auto,
            trigger,
            config.auto_retention_days,
            path,
        )
        .await?;
        Ok(())
    }

    /// Match-all deletes accept several configured spellings of the trigger.
    pub(crate) async fn auto_snapshot_truncate_locked(
        &self,
        project: &str,
        bucket: &str,
        table: &str,
        path: &std::path::Path,
    ) -> Result<()> {
        let config = self.snapshot_config(project, bucket, table).await?;
        let Some(trigger) = TRUNCATE_TRIGGERS
            .iter()
            .find(|t| config.trigger_enabled(t))
        else {
            return Ok(());
        };
        self.create_snapshot_locked(
            project,
            bucket,
            table,
            SnapshotKind::Auto,
            trigger,
            config.auto_retention_days,
            path,
        )
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_snapshot_locked(
        &self,
        project: &str,
        bucket: &str,
        table: &str,
        kind: SnapshotKind,
        trigger: &str,
        retention_days: i64,
        table_path: &std::path::Path,
    ) -> Result<Snapshot> {
        let now = Utc::now();
        let snapshot_id = Uuid::new_v4().to_string();
        let artifact_dir = self.layout.snapshot_dir(project, table, &now);
        Layout::ensure_dir(&artifact_dir)?;

        let data_file = format!("data.{}", self.codec.as_sql().to_ascii_lowercase());
        let data_path = artifact_dir.join(&data_file);

        let export = || -> Result<(Vec<ColumnDef>, Vec<String>, i64)> {
            let conn = table_db::open_ro(table_path)?;
            let (columns, primary_key) = table_db::read_schema(&conn, table)?;
            let rows = table_db::row_count(&conn, table)?;
            conn.execute_batch(&format!(
                "COPY (SELECT * FROM {}) TO '{}' (FORMAT PARQUET, COMPRESSION {})",
                quote_ident(table),
                data_path.display(),
                self.codec.as_sql()
            ))?;
            Ok((columns, primary_key, rows))
        };
        let (columns, primary_key, row_count) = match export() {
            Ok(v) => v,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&artifact_dir);
                return Err(e);
            }
        };

        let sha256 = hex_digest(&data_path)?;
        let size_bytes = table_db::file_size(&data_path);

        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.clone(),
            project_id: project.to_string(),
            bucket: bucket.to_string(),
            table: table.to_string(),
            columns,
            primary_key,
            row_count,
            created_at: now,
            codec: self.codec.as_sql().to_ascii_lowercase(),
            data_file,
            sha256,
        };
        if let Err(e) = std::fs::write(
            artifact_dir.join("metadata.json"),
            serde_json::to_vec_pretty(&manifest)?,
        ) {
            let _ = std::fs::remove_dir_all(&artifact_dir);
            return Err(e.into());
        }

        let artifact_path = artifact_dir
            .strip_prefix(self.layout.root())
            .unwrap_or(&artifact_dir)
            .to_string_lossy()
            .to_string();
        let snapshot = Snapshot {
            id: snapshot_id,
            project_id: project.to_string(),
            bucket: bucket.to_string(),
            table: table.to_string(),
            kind,
            trigger: trigger.to_string(),
            created_at: now,
            expires_at: now + Duration::days(retention_days),
            row_count,
            size_bytes,
            artifact_path,
        };
        if let Err(e) = self.registry.snapshots.insert(&snapshot).await {
            // Filesystem succeeded, registry failed: best-effort removal.
            let _ = std::fs::remove_dir_all(&artifact_dir);
            return Err(e);
        }

        info!(
            project_id = project,
            bucket,
            table,
            snapshot_id = %snapshot.id,
            kind = kind.as_str(),
            trigger,
            row_count,
            "snapshot created"
        );
        Ok(snapshot)
    }

    /// Restore a snapshot over its table: recreate from the artifact schema,
    /// load the data, atomically swap into place.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot = self.registry.snapshots.require(snapshot_id).await?;
        let manifest = self.read_manifest(&snapshot)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(
                &snapshot.project_id,
                DEFAULT_BRANCH,
                &snapshot.bucket,
                &snapshot.table,
            ))
            .await;

        let artifact_dir = self.layout.root().join(&snapshot.artifact_path);
        let data_path = artifact_dir.join(&manifest.data_file);
        if hex_digest(&data_path)? != manifest.sha256 {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {snapshot_id} artifact is corrupt (checksum mismatch)"
            )));
        }

        let staging = self.layout.staging_file(&Uuid::new_v4().to_string());
        Layout::ensure_parent(&staging)?;
        let rebuild = || -> Result<()> {
            let conn = table_db::open_rw(&staging)?;
            conn.execute_batch(&table_db::create_table_sql(
                &snapshot.table,
                &manifest.columns,
                &manifest.primary_key,
            ))?;
            conn.execute_batch(&format!(
                "INSERT INTO {} SELECT * FROM read_parquet('{}'); CHECKPOINT;",
                quote_ident(&snapshot.table),
                data_path.display()
            ))?;
            Ok(())
        };
        if let Err(e) = rebuild() {
            let _ = std::fs::remove_file(&staging);
            return Err(e);
        }

        let table_path = self.layout.table_file(
            &snapshot.project_id,
            DEFAULT_BRANCH,
            &snapshot.bucket,
            &snapshot.table,
        );
        Layout::ensure_parent(&table_path)?;
        std::fs::rename(&staging, &table_path)?;

        // The table may have been dropped since the snapshot was taken.
        let existing = self
            .registry
            .tables
            .get(&snapshot.project_id, &snapshot.bucket, &snapshot.table)
            .await?;
        match existing {
            Some(_) => {
                self.registry
                    .tables
                    .update_schema(
                        &snapshot.project_id,
                        &snapshot.bucket,
                        &snapshot.table,
                        &manifest.columns,
                        &manifest.primary_key,
                    )
                    .await?;
            }
            None => {
                self.registry
                    .tables
                    .insert(&cellar_core::TableMeta {
                        project_id: snapshot.project_id.clone(),
                        bucket: snapshot.bucket.clone(),
                        name: snapshot.table.clone(),
                        columns: manifest.columns.clone(),
                        primary_key: manifest.primary_key.clone(),
                        row_count_cache: manifest.row_count,
                        size_bytes_cache: table_db::file_size(&table_path),
                        created_at: Utc::now(),
                    })
                    .await?;
            }
        }
        self.registry
            .tables
            .update_cache(
                &snapshot.project_id,
                &snapshot.bucket,
                &snapshot.table,
                manifest.row_count,
                table_db::file_size(&table_path),
            )
            .await?;

        info!(
            project_id = %snapshot.project_id,
            bucket = %snapshot.bucket,
            table = %snapshot.table,
            snapshot_id,
            row_count = manifest.row_count,
            "snapshot restored"
        );
        Ok(snapshot)
    }

    /// Delete one snapshot: artifact first, then the registry row.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let snapshot = self.registry.snapshots.require(snapshot_id).await?;
        let artifact_dir = self.layout.root().join(&snapshot.artifact_path);
        if artifact_dir.exists() {
            std::fs::remove_dir_all(&artifact_dir)?;
        }
        self.registry.snapshots.delete(snapshot_id).await
    }

    /// Janitor entry point: delete snapshots whose retention lapsed.
    /// A failed artifact removal leaves the row for the next cycle.
    pub async fn purge_expired_snapshots(&self, now: &DateTime<Utc>) -> Result<usize> {
        let expired = self.registry.snapshots.expired(now).await?;
        let mut purged = 0;
        for snapshot in expired {
            let artifact_dir = self.layout.root().join(&snapshot.artifact_path);
            if artifact_dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&artifact_dir) {
                    warn!(
                        snapshot_id = %snapshot.id,
                        error = %e,
                        "snapshot artifact removal failed; will retry"
                    );
                    continue;
                }
            }
            self.registry.snapshots.delete(&snapshot.id).await?;
            purged += 1;
        }
        Ok(purged)
    }

    fn read_manifest(&self, snapshot: &Snapshot) -> Result<SnapshotManifest> {
        let path = self
            .layout
            .root()
            .join(&snapshot.artifact_path)
            .join("metadata.json");
        let raw = std::fs::read(&path).map_err(|_| {
            Error::NotFound(format!("snapshot artifact {} is missing", snapshot.artifact_path))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::Internal(format!("corrupt snapshot manifest: {e}")))
    }
}

fn hex_digest(path: &std::path::Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .map_err(|_| Error::NotFound(format!("artifact data file {}", path.display())))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}
