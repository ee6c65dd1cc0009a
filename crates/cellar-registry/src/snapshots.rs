//! Snapshot and snapshot-settings repositories.

use chrono::{DateTime, Utc};
use duckdb::params;

use cellar_core::settings::{SettingRow, SettingScope};
use cellar_core::{Error, Result, ScopeChain, Snapshot, SnapshotKind};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct SnapshotRepo {
    shared: Shared,
}

impl SnapshotRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, snapshot: &Snapshot) -> Result<()> {
        let s = snapshot.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO snapshots (id, project_id, bucket, table_name, kind, \
                     trigger_name, created_at, expires_at, row_count, size_bytes, artifact_path) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        s.id,
                        s.project_id,
                        s.bucket,
                        s.table,
                        s.kind.as_str(),
                        s.trigger,
                        fmt_ts(&s.created_at),
                        fmt_ts(&s.expires_at),
                        s.row_count,
                        s.size_bytes,
                        s.artifact_path
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Snapshot>> {
        let id = id.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT id, project_id, bucket, table_name, kind, trigger_name, \
                     created_at, expires_at, row_count, size_bytes, artifact_path \
                     FROM snapshots WHERE id = ?",
                    params![id],
                    Self::raw_row,
                ))?;
                row.map(Self::hydrate).transpose()
            })
            .await
    }

    pub async fn require(&self, id: &str) -> Result<Snapshot> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("snapshot {id}")))
    }

    /// List project snapshots, optionally filtered by table and kind.
    pub async fn list(
        &self,
        project_id: &str,
        bucket: Option<&str>,
        table: Option<&str>,
        kind: Option<SnapshotKind>,
    ) -> Result<Vec<Snapshot>> {
        let pid = project_id.to_string();
        let bucket = bucket.map(str::to_string);
        let table = table.map(str::to_string);
        self.shared
            .read(move |conn| {
                let mut sql = String::from(
                    "SELECT id, project_id, bucket, table_name, kind, trigger_name, \
                     created_at, expires_at, row_count, size_bytes, artifact_path \
                     FROM snapshots WHERE project_id = ?",
                );
                let mut binds: Vec<String> = vec![pid];
                if let Some(b) = bucket {
                    sql.push_str(" AND bucket = ?");
                    binds.push(b);
                }
                if let Some(t) = table {
                    sql.push_str(" AND table_name = ?");
                    binds.push(t);
                }
                if let Some(k) = kind {
                    sql.push_str(" AND kind = ?");
                    binds.push(k.as_str().to_string());
                }
                sql.push_str(" ORDER BY created_at DESC");

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(duckdb::params_from_iter(binds.iter()), Self::raw_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(Self::hydrate(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Snapshots whose retention has lapsed.
    pub async fn expired(&self, now: &DateTime<Utc>) -> Result<Vec<Snapshot>> {
        let cutoff = fmt_ts(now);
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, bucket, table_name, kind, trigger_name, \
                     created_at, expires_at, row_count, size_bytes, artifact_path \
                     FROM snapshots WHERE expires_at < ? ORDER BY expires_at",
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
                let removed =
                    conn.execute("DELETE FROM snapshots WHERE id = ?", params![id])?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("snapshot {id}")));
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
        String,
        String,
        String,
        String,
        String,
        i64,
        i64,
        String,
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
            row.get(9)?,
            row.get(10)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn hydrate(
        raw: (
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            String,
            i64,
            i64,
            String,
        ),
    ) -> Result<Snapshot> {
        let (id, project_id, bucket, table, kind, trigger, created_at, expires_at, rows, bytes, path) =
            raw;
        Ok(Snapshot {
            id,
            project_id,
            bucket,
            table,
            kind: SnapshotKind::parse(&kind)?,
            trigger,
            created_at: parse_ts(&created_at)?,
            expires_at: parse_ts(&expires_at)?,
            row_count: rows,
            size_bytes: bytes,
            artifact_path: path,
        })
    }
}

#[derive(Clone)]
pub struct SettingsRepo {
    shared: Shared,
}

impl SettingsRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn set(
        &self,
        scope: SettingScope,
        scope_key: &str,
        setting: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let (key, setting) = (scope_key.to_string(), setting.to_string());
        let value = serde_json::to_string(value)?;
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO snapshot_settings (scope, scope_key, setting, value_json) \
                     VALUES (?, ?, ?, ?)",
                    params![scope.as_str(), key, setting, value],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn unset(&self, scope: SettingScope, scope_key: &str, setting: &str) -> Result<()> {
        let (key, setting) = (scope_key.to_string(), setting.to_string());
        self.shared
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM snapshot_settings \
                     WHERE scope = ? AND scope_key = ? AND setting = ?",
                    params![scope.as_str(), key, setting],
                )?;
                Ok(())
            })
            .await
    }

    /// All rows relevant to one table's scope chain.
    pub async fn rows_for_chain(&self, chain: &ScopeChain) -> Result<Vec<SettingRow>> {
        let pairs: Vec<(String, String)> = chain
            .iter()
            .map(|(scope, key)| (scope.as_str().to_string(), key.clone()))
            .collect();
        self.shared
            .read(move |conn| {
                let mut out = Vec::new();
                let mut stmt = conn.prepare(
                    "SELECT scope, scope_key, setting, value_json FROM snapshot_settings \
                     WHERE scope = ? AND scope_key = ?",
                )?;
                for (scope, key) in &pairs {
                    let rows = stmt.query_map(params![scope, key], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?;
                    for row in rows {
                        let (scope, scope_key, setting, value_json) = row?;
                        let scope = SettingScope::parse(&scope).ok_or_else(|| {
                            Error::Internal(format!("unknown settings scope {scope:?}"))
                        })?;
                        out.push(SettingRow {
                            scope,
                            scope_key,
                            setting,
                            value: serde_json::from_str(&value_json)?,
                        });
                    }
                }
                Ok(out)
            })
            .await
    }
}
