//! File store repository.
//!
//! Quota counters are always derived on demand from these rows; they are
//! never cached as a separate source of truth.

use chrono::{DateTime, Utc};
use duckdb::params;

use cellar_core::{Error, FileEntry, Result};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct FileRepo {
    shared: Shared,
}

impl FileRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, file: &FileEntry) -> Result<()> {
        let f = file.clone();
        let tags = serde_json::to_string(&f.tags)?;
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO files (id, project_id, name, size_bytes, sha256, tags_json, \
                     storage_path, created_at, staged_until) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        f.id,
                        f.project_id,
                        f.name,
                        f.size_bytes,
                        f.sha256,
                        tags,
                        f.storage_path,
                        fmt_ts(&f.created_at),
                        f.staged_until.as_ref().map(fmt_ts)
                    ],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())?;
                Ok(())
            })
            .await
    }

    /// Promote a staged row to registered: clear staged_until and set the
    /// final storage path, size, and digest.
    pub async fn promote(
        &self,
        id: &str,
        storage_path: &str,
        size_bytes: i64,
        sha256: &str,
    ) -> Result<()> {
        let (id, path, sha) = (id.to_string(), storage_path.to_string(), sha256.to_string());
        self.shared
            .write(move |conn| {
                let updated = conn.execute(
                    "UPDATE files SET storage_path = ?, size_bytes = ?, sha256 = ?, \
                     staged_until = NULL WHERE id = ?",
                    params![path, size_bytes, sha, id],
                )?;
                if updated == 0 {
                    return Err(Error::NotFound(format!("file {id}")));
                }
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<FileEntry>> {
        let id = id.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT id, project_id, name, size_bytes, sha256, tags_json, storage_path, \
                     created_at, staged_until FROM files WHERE id = ?",
                    params![id],
                    Self::raw_row,
                ))?;
                row.map(Self::hydrate).transpose()
            })
            .await
    }

    pub async fn require(&self, id: &str) -> Result<FileEntry> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {id}")))
    }

    /// List registered (non-staged) files, optionally filtered by tag.
    pub async fn list(&self, project_id: &str, tag: Option<&str>) -> Result<Vec<FileEntry>> {
        let pid = project_id.to_string();
        let tag = tag.map(str::to_string);
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, size_bytes, sha256, tags_json, storage_path, \
                     created_at, staged_until FROM files \
                     WHERE project_id = ? AND staged_until IS NULL ORDER BY created_at DESC",
                )?;
                let rows = stmt.query_map(params![pid], Self::raw_row)?;
                let mut out = Vec::new();
                for row in rows {
                    let entry = Self::hydrate(row?)?;
                    if let Some(ref wanted) = tag {
                        if !entry.tags.iter().any(|t| t == wanted) {
                            continue;
                        }
                    }
                    out.push(entry);
                }
                Ok(out)
            })
            .await
    }

    /// Registered file count and byte total for quota checks.
    pub async fn usage(&self, project_id: &str) -> Result<(i64, i64)> {
        let pid = project_id.to_string();
        self.shared
            .read(move |conn| {
                let usage = conn.query_row(
                    "SELECT count(*), coalesce(sum(size_bytes), 0) FROM files \
                     WHERE project_id = ? AND staged_until IS NULL",
                    params![pid],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )?;
                Ok(usage)
            })
            .await
    }

    /// Staged rows whose upload window has lapsed.
    pub async fn expired_staged(&self, now: &DateTime<Utc>) -> Result<Vec<FileEntry>> {
        let cutoff = fmt_ts(now);
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, name, size_bytes, sha256, tags_json, storage_path, \
                     created_at, staged_until FROM files \
                     WHERE staged_until IS NOT NULL AND staged_until < ?",
                )?;
                let rows = stmt.query_map(params![cutoff], Self::raw_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(Self::hydrate(row?)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.shared
            .write(move |conn| {
                let removed = conn.execute("DELETE FROM files WHERE id = ?", params![id])?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("file {id}")));
                }
                Ok(())
            })
            .await
    }

    #[allow(clippy::type_complexity)]
    fn raw_row(
        row: &duckdb::Row<'_>,
    ) -> duckdb::Result<(
        String,
        String,
        String,
        i64,
        String,
        String,
        String,
        String,
        Option<String>,
    )> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
            row.get(8)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn hydrate(
        raw: (
            String,
            String,
            String,
            i64,
            String,
            String,
            String,
            String,
            Option<String>,
        ),
    ) -> Result<FileEntry> {
        let (id, project_id, name, size_bytes, sha256, tags_json, storage_path, created_at, staged) =
            raw;
        Ok(FileEntry {
            id,
            project_id,
            name,
            size_bytes,
            sha256,
            tags: serde_json::from_str(&tags_json)?,
            storage_path,
            created_at: parse_ts(&created_at)?,
            staged_until: staged.as_deref().map(parse_ts).transpose()?,
        })
    }
}
