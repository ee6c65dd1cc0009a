//! Table metadata repository.
//!
//! Schema (columns + primary key) is stored as JSON alongside the cached row
//! count and file size. The engine file remains the source of truth for data;
//! caches are refreshed after every write that lands.

use duckdb::params;

use cellar_core::{ColumnDef, Error, Result, TableMeta};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct TableRepo {
    shared: Shared,
}

impl TableRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, meta: &TableMeta) -> Result<()> {
        let m = meta.clone();
        let columns = serde_json::to_string(&m.columns)?;
        let pk = serde_json::to_string(&m.primary_key)?;
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO tables (project_id, bucket, name, columns_json, \
                     primary_key_json, row_count_cache, size_bytes_cache, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        m.project_id,
                        m.bucket,
                        m.name,
                        columns,
                        pk,
                        m.row_count_cache,
                        m.size_bytes_cache,
                        fmt_ts(&m.created_at)
                    ],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())
                .map_err(|e| match e {
                    Error::Conflict(_) => Error::Conflict(format!(
                        "table {}.{} already exists",
                        m.bucket, m.name
                    )),
                    other => other,
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get(
        &self,
        project_id: &str,
        bucket: &str,
        name: &str,
    ) -> Result<Option<TableMeta>> {
        let (pid, bucket, name) = (project_id.to_string(), bucket.to_string(), name.to_string());
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT project_id, bucket, name, columns_json, primary_key_json, \
                     row_count_cache, size_bytes_cache, created_at \
                     FROM tables WHERE project_id = ? AND bucket = ? AND name = ?",
                    params![pid, bucket, name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                            row.get::<_, String>(7)?,
                        ))
                    },
                ))?;
                row.map(Self::hydrate).transpose()
            })
            .await
    }

    pub async fn require(&self, project_id: &str, bucket: &str, name: &str) -> Result<TableMeta> {
        self.get(project_id, bucket, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("table {bucket}.{name}")))
    }

    pub async fn list(&self, project_id: &str, bucket: Option<&str>) -> Result<Vec<TableMeta>> {
        let pid = project_id.to_string();
        let bucket = bucket.map(str::to_string);
        self.shared
            .read(move |conn| {
                let sql_all = "SELECT project_id, bucket, name, columns_json, primary_key_json, \
                               row_count_cache, size_bytes_cache, created_at \
                               FROM tables WHERE project_id = ? ORDER BY bucket, name";
                let sql_bucket = "SELECT project_id, bucket, name, columns_json, primary_key_json, \
                                  row_count_cache, size_bytes_cache, created_at \
                                  FROM tables WHERE project_id = ? AND bucket = ? \
                                  ORDER BY bucket, name";
                let mut out = Vec::new();
                match bucket {
                    Some(b) => {
                        let mut stmt = conn.prepare(sql_bucket)?;
                        let rows = stmt.query_map(params![pid, b], Self::raw_row)?;
                        for row in rows {
                            out.push(Self::hydrate(row?)?);
                        }
                    }
                    None => {
                        let mut stmt = conn.prepare(sql_all)?;
                        let rows = stmt.query_map(params![pid], Self::raw_row)?;
                        for row in rows {
                            out.push(Self::hydrate(row?)?);
                        }
                    }
                }
                Ok(out)
            })
            .await
    }

    /// Replace the stored schema after a DDL operation.
    pub async fn update_schema(
        &self,
        project_id: &str,
        bucket: &str,
        name: &str,
        columns: &[ColumnDef],
        primary_key: &[String],
    ) -> Result<()> {
        let (pid, bucket, name) = (project_id.to_string(), bucket.to_string(), name.to_string());
        let columns = serde_json::to_string(columns)?;
        let pk = serde_json::to_string(primary_key)?;
        self.shared
            .write(move |conn| {
                let updated = conn.execute(
                    "UPDATE tables SET columns_json = ?, primary_key_json = ? \
                     WHERE project_id = ? AND bucket = ? AND name = ?",
                    params![columns, pk, pid, bucket, name],
                )?;
                if updated == 0 {
                    return Err(Error::NotFound(format!("table {bucket}.{name}")));
                }
                Ok(())
            })
            .await
    }

    /// Refresh the row-count and size caches after a data write.
    pub async fn update_cache(
        &self,
        project_id: &str,
        bucket: &str,
        name: &str,
        row_count: i64,
        size_bytes: i64,
    ) -> Result<()> {
        let (pid, bucket, name) = (project_id.to_string(), bucket.to_string(), name.to_string());
        self.shared
            .write(move |conn| {
                conn.execute(
                    "UPDATE tables SET row_count_cache = ?, size_bytes_cache = ? \
                     WHERE project_id = ? AND bucket = ? AND name = ?",
                    params![row_count, size_bytes, pid, bucket, name],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, project_id: &str, bucket: &str, name: &str) -> Result<()> {
        let (pid, bucket, name) = (project_id.to_string(), bucket.to_string(), name.to_string());
        self.shared
            .write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM tables WHERE project_id = ? AND bucket = ? AND name = ?",
                    params![pid, bucket, name],
                )?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("table {bucket}.{name}")));
                }
                Ok(())
            })
            .await
    }

    #[allow(clippy::type_complexity)]
    fn raw_row(
        row: &duckdb::Row<'_>,
    ) -> duckdb::Result<(String, String, String, String, String, i64, i64, String)> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn hydrate(
        raw: (String, String, String, String, String, i64, i64, String),
    ) -> Result<TableMeta> {
        let (project_id, bucket, name, columns_json, pk_json, rows, bytes, created_at) = raw;
        Ok(TableMeta {
            project_id,
            bucket,
            name,
            columns: serde_json::from_str(&columns_json)
                .map_err(|e| Error::Internal(format!("corrupt columns_json: {e}")))?,
            primary_key: serde_json::from_str(&pk_json)
                .map_err(|e| Error::Internal(format!("corrupt primary_key_json: {e}")))?,
            row_count_cache: rows,
            size_bytes_cache: bytes,
            created_at: parse_ts(&created_at)?,
        })
    }
}
