//! Import pipeline: STAGING → TRANSFORM → CLEANUP.
//!
//! The source lands in a staging database under `_staging/<uuid>.db`, is
//! transformed into the destination according to the mode, and the staging
//! file is dropped on success and failure alike. The whole run holds the
//! destination's table lock.

use duckdb::{params, Connection};
use tracing::{info, warn};
use uuid::Uuid;

use cellar_core::{
    quote_ident, ColumnDef, DataFormat, DedupMode, Error, ImportOptions, ImportResult,
    ImportSource, Layout, Result,
};

use crate::locks::TableKey;
use crate::table_db;
use crate::Engine;

/// Escape a string for embedding in single quotes in engine SQL.
fn sql_string(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// Parse an internal S3 path (`project_<id>/<key>`).
pub(crate) fn parse_internal_s3_path(path: &str) -> Result<(String, String)> {
    let rest = path
        .strip_prefix("project_")
        .ok_or_else(|| Error::InvalidArgument(format!("not an internal S3 path: {path:?}")))?;
    let (project, key) = rest
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgument(format!("S3 path {path:?} has no key")))?;
    if key.is_empty() || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(Error::InvalidArgument(format!("invalid S3 key in {path:?}")));
    }
    Ok((project.to_string(), key.to_string()))
}

impl Engine {
    pub async fn import_table(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        options: ImportOptions,
    ) -> Result<ImportResult> {
        let reader = self.source_reader(project, &options).await?;

        let _guard = self
            .locks
            .acquire(&TableKey::new(project, branch, bucket, table))
            .await;
        let resolved = self.resolve_write_locked(project, branch, bucket, table).await?;

        let staging_path = self.layout.staging_file(&Uuid::new_v4().to_string());
        Layout::ensure_parent(&staging_path)?;

        let outcome = self
            .run_import(&resolved.path, &staging_path, table, &options, &reader)
            .await;

        // CLEANUP runs on both success and failure.
        if let Err(e) = std::fs::remove_file(&staging_path) {
            if staging_path.exists() {
                warn!(path = %staging_path.display(), error = %e, "staging file cleanup failed");
            }
        }

        let (imported_rows, table_rows_total, table_size_bytes, columns) = outcome?;
        if branch == cellar_core::DEFAULT_BRANCH {
            self.registry
                .tables
                .update_cache(project, bucket, table, table_rows_total, table_size_bytes)
                .await
                .ok();
        }

        info!(
            project_id = project,
            branch_id = branch,
            bucket,
            table,
            imported_rows,
            table_rows_total,
            "import complete"
        );
        Ok(ImportResult {
            imported_rows,
            table_rows_total,
            table_size_bytes,
            columns,
        })
    }

    /// Resolve the source into a `read_…(…)` SQL expression. Internal S3
    /// paths and registered files become local reads so an import can never
    /// deadlock on a call back into our own API.
    async fn source_reader(&self, project: &str, options: &ImportOptions) -> Result<SourceReader> {
        let (location, remote) = match &options.source {
            ImportSource::FileId(id) => {
                let entry = self.registry.files.require(id).await?;
                if entry.project_id != project {
                    return Err(Error::PermissionDenied(format!(
                        "file {id} belongs to another project"
                    )));
                }
                if entry.staged_until.is_some() {
                    return Err(Error::FailedPrecondition(format!(
                        "file {id} is still staged; register it first"
                    )));
                }
                let path = self.layout.root().join(&entry.storage_path);
                if !path.exists() {
                    return Err(Error::NotFound(format!("file {id} data is missing")));
                }
                (path.to_string_lossy().to_string(), false)
            }
            ImportSource::Url(url) => {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(Error::InvalidArgument(format!("unsupported URL {url:?}")));
                }
                (url.clone(), true)
            }
            ImportSource::S3Path(path) => {
                let (src_project, key) = parse_internal_s3_path(path)?;
                if src_project != project {
                    return Err(Error::PermissionDenied(
                        "S3 source belongs to another project".to_string(),
                    ));
                }
                let local = self.layout.s3_object_path(&src_project, &key);
                if !local.exists() {
                    return Err(Error::NotFound(format!("S3 object {path}")));
                }
                (local.to_string_lossy().to_string(), false)
            }
        };

        let expr = match options.format {
            DataFormat::Csv => format!("read_csv_auto('{}')", sql_string(&location)),
            DataFormat::Parquet => format!("read_parquet('{}')", sql_string(&location)),
        };
        Ok(SourceReader { expr, remote })
    }

    /// STAGING + TRANSFORM against an open destination connection.
    async fn run_import(
        &self,
        dest_path: &std::path::Path,
        staging_path: &std::path::Path,
        table: &str,
        options: &ImportOptions,
        reader: &SourceReader,
    ) -> Result<(i64, i64, i64, Vec<String>)> {
        let conn = table_db::open_rw(dest_path)?;
        if reader.remote {
            conn.execute_batch("INSTALL httpfs; LOAD httpfs;")
                .map_err(|e| Error::Internal(format!("httpfs extension unavailable: {e}")))?;
        }

        conn.execute_batch(&format!(
            "ATTACH '{}' AS staging; CREATE TABLE staging.data AS SELECT * FROM {};",
            sql_string(&staging_path.to_string_lossy()),
            reader.expr
        ))
        .map_err(|e| table_db::classify_sql_error(e.into()))?;

        let result = self.transform(&conn, table, options);

        // Detach before the file is removed by the caller.
        if let Err(e) = conn.execute_batch("DETACH staging") {
            warn!(error = %e, "staging detach failed");
        }

        let (imported_rows, columns) = result?;
        let rows_total = table_db::row_count(&conn, table)?;
        let _ = conn.execute_batch("CHECKPOINT");
        let size = table_db::file_size(dest_path);
        Ok((imported_rows, rows_total, size, columns))
    }

    /// TRANSFORM: mode-dependent load from `staging.data` into the table.
    fn transform(
        &self,
        conn: &Connection,
        table: &str,
        options: &ImportOptions,
    ) -> Result<(i64, Vec<String>)> {
        let (dest_columns, primary_key) = table_db::read_schema(conn, table)?;
        let staged: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT column_name FROM duckdb_columns() \
                 WHERE database_name = 'staging' AND table_name = 'data' \
                 ORDER BY column_index",
            )?;
            let rows = stmt.query_map(params![], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let select_exprs = build_select_list(&dest_columns, &staged)?;
        let column_list: Vec<String> =
            dest_columns.iter().map(|c| quote_ident(&c.name)).collect();
        let quoted_table = quote_ident(table);

        let imported = if !options.incremental {
            // Full load: truncate destination, then insert in file order.
            conn.execute(&format!("DELETE FROM {quoted_table}"), params![])?;
            conn.execute(
                &format!(
                    "INSERT INTO {quoted_table} ({}) SELECT {} FROM staging.data",
                    column_list.join(", "),
                    select_exprs.join(", ")
                ),
                params![],
            )
            .map_err(|e| table_db::classify_sql_error(e.into()))? as i64
        } else {
            match options.dedup {
                DedupMode::UpdateDuplicates => {
                    if primary_key.is_empty() {
                        return Err(Error::FailedPrecondition(
                            "update_duplicates needs a primary key on the destination".into(),
                        ));
                    }
                    // Last occurrence in file order wins within the staging set.
                    let pk_list: Vec<String> =
                        primary_key.iter().map(|c| quote_ident(c)).collect();
                    conn.execute(
                        &format!(
                            "INSERT OR REPLACE INTO {quoted_table} ({cols}) \
                             SELECT {exprs} FROM (\
                                 SELECT *, row_number() OVER (\
                                     PARTITION BY {pk} ORDER BY rowid DESC\
                                 ) AS __occurrence FROM staging.data\
                             ) WHERE __occurrence = 1",
                            cols = column_list.join(", "),
                            exprs = select_exprs.join(", "),
                            pk = pk_list.join(", ")
                        ),
                        params![],
                    )
                    .map_err(|e| table_db::classify_sql_error(e.into()))? as i64
                }
                DedupMode::InsertDuplicates => conn
                    .execute(
                        &format!(
                            "INSERT INTO {quoted_table} ({}) SELECT {} FROM staging.data",
                            column_list.join(", "),
                            select_exprs.join(", ")
                        ),
                        params![],
                    )
                    .map_err(|e| table_db::classify_sql_error(e.into()))?
                    as i64,
                DedupMode::FailOnDuplicates => {
                    if primary_key.is_empty() {
                        return Err(Error::FailedPrecondition(
                            "fail_on_duplicates needs a primary key on the destination".into(),
                        ));
                    }
                    let join: Vec<String> = primary_key
                        .iter()
                        .map(|c| format!("s.{q} = t.{q}", q = quote_ident(c)))
                        .collect();
                    let clashes: i64 = conn.query_row(
                        &format!(
                            "SELECT count(*) FROM staging.data s JOIN {quoted_table} t ON {}",
                            join.join(" AND ")
                        ),
                        params![],
                        |row| row.get(0),
                    )?;
                    if clashes > 0 {
                        return Err(Error::Conflict(format!(
                            "{clashes} staged row(s) match existing primary keys"
                        )));
                    }
                    conn.execute(
                        &format!(
                            "INSERT INTO {quoted_table} ({}) SELECT {} FROM staging.data",
                            column_list.join(", "),
                            select_exprs.join(", ")
                        ),
                        params![],
                    )
                    .map_err(|e| table_db::classify_sql_error(e.into()))?
                        as i64
                }
            }
        };

        let columns = dest_columns.iter().map(|c| c.name.clone()).collect();
        Ok((imported, columns))
    }
}

struct SourceReader {
    expr: String,
    remote: bool,
}

/// One select expression per destination column. System columns (leading
/// underscore) are never read from the source: `_timestamp` becomes now(),
/// anything else NULL. Missing source columns load as NULL.
fn build_select_list(dest: &[ColumnDef], staged: &[String]) -> Result<Vec<String>> {
    let mut exprs = Vec::with_capacity(dest.len());
    for col in dest {
        let expr = if col.name.starts_with('_') {
            if col.name == "_timestamp" {
                "now()".to_string()
            } else {
                "NULL".to_string()
            }
        } else if staged.iter().any(|s| s == &col.name) {
            quote_ident(&col.name)
        } else {
            "NULL".to_string()
        };
        exprs.push(expr);
    }
    Ok(exprs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_internal_s3_path() {
        let (project, key) = parse_internal_s3_path("project_p1/data/a.csv").unwrap();
        assert_eq!(project, "p1");
        assert_eq!(key, "data/a.csv");

        assert!(parse_internal_s3_path("bucket/a.csv").is_err());
        assert!(parse_internal_s3_path("project_p1/").is_err());
        assert!(parse_internal_s3_path("project_p1/../etc").is_err());
    }

    #[test]
    fn test_select_list_handles_system_and_missing_columns() {
        let dest = vec![
            ColumnDef {
                name: "id".into(),
                type_name: "INTEGER".into(),
                nullable: false,
                default: None,
            },
            ColumnDef {
                name: "extra".into(),
                type_name: "VARCHAR".into(),
                nullable: true,
                default: None,
            },
            ColumnDef {
                name: "_timestamp".into(),
                type_name: "TIMESTAMP".into(),
                nullable: true,
                default: None,
            },
        ];
        let staged = vec!["id".to_string(), "_timestamp".to_string()];
        let exprs = build_select_list(&dest, &staged).unwrap();
        assert_eq!(exprs, vec!["\"id\"", "NULL", "now()"]);
    }
}
