//! Table engine: per-table DDL, row writes, deletion, and preview.
//!
//! Every write acquires the table lock first, resolves the branch location,
//! acts on the engine file, then records the outcome in the registry. Reads
//! bypass the lock manager entirely.

use chrono::Utc;
use duckdb::params;
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::{
    defaults, quote_ident, validate_branch_id, validate_column_name, validate_project_id,
    validate_table_name, BranchSource, ColumnDef, Error, Result, TableMeta, DEFAULT_BRANCH,
};

use crate::locks::TableKey;
use crate::table_db;
use crate::{resolver, Engine};

/// Preview payload: column order plus row objects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub columns: Vec<String>,
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
    pub row_count: i64,
}

/// A predicate is "match all" iff, lower-cased and with whitespace stripped,
/// it is empty, `true`, or `1=1`. No general tautology solving.
pub fn is_match_all_predicate(predicate: &str) -> bool {
    let normalized: String = predicate
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    normalized.is_empty() || normalized == "true" || normalized == "1=1"
}

fn validate_table_addr(project: &str, branch: &str, bucket: &str, table: &str) -> Result<()> {
    validate_project_id(project)?;
    validate_branch_id(branch)?;
    cellar_core::parse_bucket_dir(bucket)?;
    validate_table_name(table)?;
    Ok(())
}

impl Engine {
    /// Create a table: a fresh engine file whose schema matches the request.
    pub async fn create_table(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    ) -> Result<TableMeta> {
        validate_table_addr(project, branch, bucket, table)?;
        if columns.is_empty() {
            return Err(Error::InvalidArgument("a table needs at least one column".into()));
        }
        let mut normalized = Vec::with_capacity(columns.len());
        for col in columns {
            validate_column_name(&col.name)?;
            normalized.push(ColumnDef {
                type_name: table_db::normalize_type(&col.type_name)?,
                ..col
            });
        }
        for pk_col in &primary_key {
            if !normalized.iter().any(|c| &c.name == pk_col) {
                return Err(Error::InvalidArgument(format!(
                    "primary key column {pk_col:?} is not in the schema"
                )));
            }
        }
        self.registry.buckets.require_by_dir(project, bucket).await?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;

        if branch == DEFAULT_BRANCH
            && self.registry.tables.get(project, bucket, table).await?.is_some()
        {
            return Err(Error::Conflict(format!("table {bucket}.{table} already exists")));
        }
        let resolved =
            resolver::resolve_create(&self.registry, &self.layout, project, branch, bucket, table)
                .await?;

        cellar_core::Layout::ensure_parent(&resolved.path)?;
        let create = || -> Result<()> {
            let conn = table_db::open_rw(&resolved.path)?;
            conn.execute_batch(&table_db::create_table_sql(table, &normalized, &primary_key))?;
            Ok(())
        };
        if let Err(e) = create() {
            let _ = std::fs::remove_file(&resolved.path);
            if resolved.source == BranchSource::BranchOnly {
                let _ = self
                    .registry
                    .branch_tables
                    .delete(project, branch, bucket, table)
                    .await;
            }
            return Err(table_db::classify_sql_error(e));
        }

        let meta = TableMeta {
            project_id: project.to_string(),
            bucket: bucket.to_string(),
            name: table.to_string(),
            columns: normalized,
            primary_key,
            row_count_cache: 0,
            size_bytes_cache: table_db::file_size(&resolved.path),
            created_at: Utc::now(),
        };
        if branch == DEFAULT_BRANCH {
            if let Err(e) = self.registry.tables.insert(&meta).await {
                // Registry failed after the file landed: remove the file.
                let _ = std::fs::remove_file(&resolved.path);
                return Err(e);
            }
        }

        info!(project_id = project, branch_id = branch, bucket, table, "table created");
        Ok(meta)
    }

    /// Drop a table, auto-snapshotting first when the trigger is configured.
    pub async fn drop_table(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved =
            resolver::resolve_drop(&self.registry, &self.layout, project, branch, bucket, table)
                .await?;

        if branch == DEFAULT_BRANCH {
            self.auto_snapshot_locked(project, bucket, table, "drop_table", &resolved.path)
                .await?;
        }

        std::fs::remove_file(&resolved.path)?;
        if branch == DEFAULT_BRANCH {
            self.registry.tables.delete(project, bucket, table).await?;
        } else {
            self.registry
                .branch_tables
                .delete(project, branch, bucket, table)
                .await?;
        }
        info!(project_id = project, branch_id = branch, bucket, table, "table dropped");
        Ok(())
    }

    /// Append a column.
    pub async fn add_column(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        column: ColumnDef,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;
        validate_column_name(&column.name)?;
        let type_name = table_db::normalize_type(&column.type_name)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let (columns, primary_key) = {
            let conn = table_db::open_rw(&resolved.path)?;
            let (columns, _) = table_db::read_schema(&conn, table)?;
            if columns.iter().any(|c| c.name == column.name) {
                return Err(Error::Conflict(format!("column {} already exists", column.name)));
            }
            if !column.nullable
                && column.default.is_none()
                && table_db::row_count(&conn, table)? > 0
            {
                return Err(Error::FailedPrecondition(format!(
                    "cannot add NOT NULL column {} without a default to a non-empty table",
                    column.name
                )));
            }

            let mut sql = format!(
                "ALTER TABLE {} ADD COLUMN {} {type_name}",
                quote_ident(table),
                quote_ident(&column.name)
            );
            if let Some(default) = &column.default {
                sql.push_str(&format!(" DEFAULT {default}"));
            }
            conn.execute_batch(&sql)
                .map_err(|e| table_db::classify_sql_error(e.into()))?;
            table_db::read_schema(&conn, table)?
        };

        self.sync_schema_cache(project, branch, bucket, table, columns, primary_key)
            .await
    }

    /// Remove a column. Refuses primary-key members.
    pub async fn drop_column(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        column: &str,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;
        validate_column_name(column)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        // Validate on a short-lived handle: the snapshot below needs the
        // file lock for its own read.
        {
            let conn = table_db::open_rw(&resolved.path)?;
            let (columns, primary_key) = table_db::read_schema(&conn, table)?;
            if !columns.iter().any(|c| c.name == column) {
                return Err(Error::NotFound(format!("column {column}")));
            }
            if primary_key.iter().any(|c| c == column) {
                return Err(Error::FailedPrecondition(format!(
                    "column {column} is part of the primary key"
                )));
            }
        }

        if branch == DEFAULT_BRANCH {
            self.auto_snapshot_locked(project, bucket, table, "drop_column", &resolved.path)
                .await?;
        }

        let (columns, primary_key) = {
            let conn = table_db::open_rw(&resolved.path)?;
            conn.execute_batch(&format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ))?;
            table_db::read_schema(&conn, table)?
        };

        self.sync_schema_cache(project, branch, bucket, table, columns, primary_key)
            .await
    }

    /// Rename a column or change its type. Type changes must preserve
    /// representable values; the engine rejects lossy conversions.
    pub async fn alter_column(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        column: &str,
        rename_to: Option<&str>,
        new_type: Option<&str>,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;
        validate_column_name(column)?;
        if rename_to.is_none() && new_type.is_none() {
            return Err(Error::InvalidArgument(
                "alter_column needs a rename or a new type".into(),
            ));
        }

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let (columns, primary_key) = {
            let conn = table_db::open_rw(&resolved.path)?;
            let (columns, _) = table_db::read_schema(&conn, table)?;
            if !columns.iter().any(|c| c.name == column) {
                return Err(Error::NotFound(format!("column {column}")));
            }

            if let Some(type_name) = new_type {
                let type_name = table_db::normalize_type(type_name)?;
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DATA TYPE {type_name}",
                    quote_ident(table),
                    quote_ident(column)
                ))
                .map_err(|e| table_db::classify_sql_error(e.into()))?;
            }
            if let Some(new_name) = rename_to {
                validate_column_name(new_name)?;
                conn.execute_batch(&format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    quote_ident(table),
                    quote_ident(column),
                    quote_ident(new_name)
                ))?;
            }
            table_db::read_schema(&conn, table)?
        };

        self.sync_schema_cache(project, branch, bucket, table, columns, primary_key)
            .await
    }

    /// Declare a primary key. The engine cannot add a constraint in place,
    /// so the table is rebuilt: duplicate check, staged table, swap.
    pub async fn add_primary_key(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        key_columns: Vec<String>,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;
        if key_columns.is_empty() {
            return Err(Error::InvalidArgument("primary key needs at least one column".into()));
        }

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let conn = table_db::open_rw(&resolved.path)?;
        let (columns, existing_pk) = table_db::read_schema(&conn, table)?;
        if !existing_pk.is_empty() {
            return Err(Error::FailedPrecondition("table already has a primary key".into()));
        }
        for key_col in &key_columns {
            if !columns.iter().any(|c| &c.name == key_col) {
                return Err(Error::InvalidArgument(format!("column {key_col:?} does not exist")));
            }
        }

        let key_list: Vec<String> = key_columns.iter().map(|c| quote_ident(c)).collect();
        let duplicates: i64 = conn.query_row(
            &format!(
                "SELECT count(*) FROM (SELECT {k} FROM {t} GROUP BY {k} HAVING count(*) > 1)",
                k = key_list.join(", "),
                t = quote_ident(table)
            ),
            params![],
            |row| row.get(0),
        )?;
        if duplicates > 0 {
            return Err(Error::Conflict(format!(
                "{duplicates} duplicate key group(s); cannot add primary key"
            )));
        }
        let nulls: i64 = conn.query_row(
            &format!(
                "SELECT count(*) FROM {t} WHERE {cond}",
                t = quote_ident(table),
                cond = key_list
                    .iter()
                    .map(|c| format!("{c} IS NULL"))
                    .collect::<Vec<_>>()
                    .join(" OR ")
            ),
            params![],
            |row| row.get(0),
        )?;
        if nulls > 0 {
            return Err(Error::FailedPrecondition(
                "primary key columns contain NULLs".into(),
            ));
        }

        let rebuilt: Vec<ColumnDef> = columns
            .iter()
            .map(|c| ColumnDef {
                nullable: c.nullable && !key_columns.contains(&c.name),
                ..c.clone()
            })
            .collect();
        self.rebuild_with_schema(&conn, table, &rebuilt, &key_columns)?;
        let (columns, primary_key) = table_db::read_schema(&conn, table)?;
        drop(conn);
        self.sync_schema_cache(project, branch, bucket, table, columns, primary_key)
            .await
    }

    /// Remove the primary key declaration. Data is unchanged.
    pub async fn drop_primary_key(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
    ) -> Result<()> {
        validate_table_addr(project, branch, bucket, table)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let conn = table_db::open_rw(&resolved.path)?;
        let (columns, primary_key) = table_db::read_schema(&conn, table)?;
        if primary_key.is_empty() {
            return Err(Error::FailedPrecondition("table has no primary key".into()));
        }

        self.rebuild_with_schema(&conn, table, &columns, &[])?;
        let (columns, primary_key) = table_db::read_schema(&conn, table)?;
        drop(conn);
        self.sync_schema_cache(project, branch, bucket, table, columns, primary_key)
            .await
    }

    /// Delete rows matching a SQL predicate. A match-all predicate with the
    /// truncate trigger configured snapshots the table first.
    pub async fn delete_rows(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        predicate: &str,
    ) -> Result<i64> {
        validate_table_addr(project, branch, bucket, table)?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let match_all = is_match_all_predicate(predicate);
        if match_all && branch == DEFAULT_BRANCH {
            self.auto_snapshot_truncate_locked(project, bucket, table, &resolved.path)
                .await?;
        }

        let (deleted, rows_left) = {
            let conn = table_db::open_rw(&resolved.path)?;
            let sql = if match_all {
                format!("DELETE FROM {}", quote_ident(table))
            } else {
                format!("DELETE FROM {} WHERE {predicate}", quote_ident(table))
            };
            let deleted = conn
                .execute(&sql, params![])
                .map_err(|e| table_db::classify_sql_error(e.into()))? as i64;
            let rows_left = table_db::row_count(&conn, table)?;
            let _ = conn.execute_batch("CHECKPOINT");
            (deleted, rows_left)
        };

        self.refresh_data_cache(project, branch, bucket, table, rows_left, &resolved.path)
            .await?;
        info!(project_id = project, branch_id = branch, bucket, table, deleted, "rows deleted");
        Ok(deleted)
    }

    /// Insert JSON rows. System columns (leading `_`) are never trusted from
    /// the caller; `_timestamp` is set server-side.
    pub async fn insert_rows(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        rows: Vec<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<i64> {
        validate_table_addr(project, branch, bucket, table)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let conn = table_db::open_rw(&resolved.path)?;
        let (columns, _) = table_db::read_schema(&conn, table)?;
        let now = Utc::now().to_rfc3339();

        let insert_columns: Vec<&ColumnDef> = columns.iter().collect();
        let column_list: Vec<String> =
            insert_columns.iter().map(|c| quote_ident(&c.name)).collect();
        let placeholders: Vec<&str> = insert_columns.iter().map(|_| "?").collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            column_list.join(", "),
            placeholders.join(", ")
        );

        let mut stmt = conn.prepare(&sql)?;
        let mut inserted = 0i64;
        for row in &rows {
            let mut values = Vec::with_capacity(insert_columns.len());
            for col in &insert_columns {
                let value = if col.name.starts_with('_') {
                    if col.name == "_timestamp" {
                        duckdb::types::Value::Text(now.clone())
                    } else {
                        duckdb::types::Value::Null
                    }
                } else {
                    match row.get(&col.name) {
                        Some(v) => table_db::json_to_value(v)?,
                        None => duckdb::types::Value::Null,
                    }
                };
                values.push(value);
            }
            inserted += stmt
                .execute(duckdb::params_from_iter(values.iter()))
                .map_err(|e| table_db::classify_sql_error(e.into()))? as i64;
        }
        drop(stmt);
        let rows_total = table_db::row_count(&conn, table)?;
        let _ = conn.execute_batch("CHECKPOINT");
        drop(conn);

        self.refresh_data_cache(project, branch, bucket, table, rows_total, &resolved.path)
            .await?;
        Ok(inserted)
    }

    /// Preview up to `limit` rows. Stable PK ordering when a PK exists.
    pub async fn preview(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        limit: Option<i64>,
        offset: Option<i64>,
        columns: Option<Vec<String>>,
    ) -> Result<Preview> {
        validate_table_addr(project, branch, bucket, table)?;
        let limit = limit.unwrap_or(defaults::PREVIEW_LIMIT);
        if limit > defaults::PREVIEW_MAX_LIMIT {
            return Err(Error::InvalidArgument(format!(
                "preview limit {limit} exceeds maximum {}",
                defaults::PREVIEW_MAX_LIMIT
            )));
        }
        let offset = offset.unwrap_or(0).max(0);

        let resolved = self.resolve_read(project, branch, bucket, table).await?;
        let conn = table_db::open_ro(&resolved.path)?;
        let (schema, primary_key) = table_db::read_schema(&conn, table)?;

        let selected: Vec<String> = match &columns {
            Some(wanted) => {
                for name in wanted {
                    if !schema.iter().any(|c| &c.name == name) {
                        return Err(Error::NotFound(format!("column {name}")));
                    }
                }
                wanted.clone()
            }
            None => schema.iter().map(|c| c.name.clone()).collect(),
        };

        let order = if primary_key.is_empty() {
            String::new()
        } else {
            format!(
                " ORDER BY {}",
                primary_key
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        let select_list: Vec<String> = selected.iter().map(|c| quote_ident(c)).collect();
        let sql = format!(
            "SELECT {} FROM {}{order} LIMIT {limit} OFFSET {offset}",
            select_list.join(", "),
            quote_ident(table)
        );

        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map(params![], |row| {
            let mut object = serde_json::Map::new();
            for (idx, name) in selected.iter().enumerate() {
                let value: duckdb::types::Value = row.get(idx)?;
                object.insert(name.clone(), table_db::value_to_json(value));
            }
            Ok(object)
        })?;
        let mut out = Vec::new();
        for row in mapped {
            out.push(row?);
        }
        drop(stmt);

        let row_count = table_db::row_count(&conn, table)?;
        Ok(Preview {
            columns: selected,
            rows: out,
            row_count,
        })
    }

    // ─── Internal helpers ──────────────────────────────────────────────────

    pub(crate) async fn resolve_write_locked(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
    ) -> Result<ResolvedWrite> {
        resolver::resolve_write(
            &self.registry,
            &self.layout,
            &self.locks,
            project,
            branch,
            bucket,
            table,
        )
        .await
    }

    /// Rebuild a table in place with a new schema: staged table, data copy,
    /// drop, rename.
    fn rebuild_with_schema(
        &self,
        conn: &duckdb::Connection,
        table: &str,
        columns: &[ColumnDef],
        primary_key: &[String],
    ) -> Result<()> {
        let staged = format!("{table}__rebuild");
        let column_list: Vec<String> = columns.iter().map(|c| quote_ident(&c.name)).collect();
        conn.execute_batch(&format!(
            "{create}; INSERT INTO {staged_q} ({cols}) SELECT {cols} FROM {orig}; \
             DROP TABLE {orig}; ALTER TABLE {staged_q} RENAME TO {orig};",
            create = table_db::create_table_sql(&staged, columns, primary_key),
            staged_q = quote_ident(&staged),
            cols = column_list.join(", "),
            orig = quote_ident(table),
        ))
        .map_err(|e| table_db::classify_sql_error(e.into()))?;
        Ok(())
    }

    /// Refresh registry schema metadata after DDL (default branch only).
    /// Takes the already-read schema so no engine handle crosses an await.
    async fn sync_schema_cache(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        columns: Vec<ColumnDef>,
        primary_key: Vec<String>,
    ) -> Result<()> {
        if branch != DEFAULT_BRANCH {
            return Ok(());
        }
        self.registry
            .tables
            .update_schema(project, bucket, table, &columns, &primary_key)
            .await
    }

    /// Refresh row-count/size caches after a data write (default branch
    /// only). Callers CHECKPOINT and close their handle first so the file
    /// size reflects the write.
    pub(crate) async fn refresh_data_cache(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        rows: i64,
        path: &std::path::Path,
    ) -> Result<()> {
        if branch != DEFAULT_BRANCH {
            return Ok(());
        }
        self.registry
            .tables
            .update_cache(project, bucket, table, rows, table_db::file_size(path))
            .await
    }
}

type ResolvedWrite = crate::ResolvedTable;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_all_predicate_normalisation() {
        assert!(is_match_all_predicate(""));
        assert!(is_match_all_predicate("  "));
        assert!(is_match_all_predicate("TRUE"));
        assert!(is_match_all_predicate("1 = 1"));
        assert!(is_match_all_predicate("1=1"));
        assert!(!is_match_all_predicate("id = 1"));
        assert!(!is_match_all_predicate("true OR false"));
    }
}
