//! Export pipeline: table → CSV or Parquet, optionally filtered and
//! compressed, written to a local path or an internal S3 destination.

use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::{
    quote_ident, DataFormat, Error, ExportCompression, ExportOptions, Layout, Result,
    DEFAULT_BRANCH,
};

use crate::import::parse_internal_s3_path;
use crate::locks::TableKey;
use crate::table_db;
use crate::Engine;

/// Outcome of an export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportInfo {
    pub destination: String,
    pub rows: i64,
    pub size_bytes: i64,
}

fn sql_string(raw: &str) -> String {
    raw.replace('\'', "''")
}

/// COPY options for a format/compression pair. CSV accepts gzip only;
/// Parquet accepts gzip, zstd, and snappy.
fn copy_options(format: DataFormat, compression: ExportCompression) -> Result<String> {
    match (format, compression) {
        (DataFormat::Csv, ExportCompression::None) => Ok("FORMAT CSV, HEADER".to_string()),
        (DataFormat::Csv, ExportCompression::Gzip) => {
            Ok("FORMAT CSV, HEADER, COMPRESSION GZIP".to_string())
        }
        (DataFormat::Csv, other) => Err(Error::InvalidArgument(format!(
            "{other:?} compression is not supported for CSV exports"
        ))),
        (DataFormat::Parquet, ExportCompression::None) => {
            Ok("FORMAT PARQUET, COMPRESSION UNCOMPRESSED".to_string())
        }
        (DataFormat::Parquet, ExportCompression::Gzip) => {
            Ok("FORMAT PARQUET, COMPRESSION GZIP".to_string())
        }
        (DataFormat::Parquet, ExportCompression::Zstd) => {
            Ok("FORMAT PARQUET, COMPRESSION ZSTD".to_string())
        }
        (DataFormat::Parquet, ExportCompression::Snappy) => {
            Ok("FORMAT PARQUET, COMPRESSION SNAPPY".to_string())
        }
    }
}

impl Engine {
    pub async fn export_table(
        &self,
        project: &str,
        branch: &str,
        bucket: &str,
        table: &str,
        options: ExportOptions,
    ) -> Result<ExportInfo> {
        let copy_opts = copy_options(options.format, options.compression)?;

        // A live view on a dev branch diverges before export, the same as
        // every other branch-scoped pipeline operation. The lock is held for
        // the duration of the branch-side export.
        let _guard = if branch == DEFAULT_BRANCH {
            None
        } else {
            Some(
                self.locks
                    .acquire(&TableKey::new(project, branch, bucket, table))
                    .await,
            )
        };
        let resolved = if branch == DEFAULT_BRANCH {
            self.resolve_read(project, branch, bucket, table).await?
        } else {
            self.resolve_write_locked(project, branch, bucket, table).await?
        };

        let destination = self.resolve_destination(project, &options.destination)?;
        Layout::ensure_parent(std::path::Path::new(&destination))?;

        let conn = table_db::open_ro(&resolved.path)?;
        let (schema, _) = table_db::read_schema(&conn, table)?;

        let select_list = match &options.columns {
            Some(wanted) => {
                for name in wanted {
                    if !schema.iter().any(|c| &c.name == name) {
                        return Err(Error::NotFound(format!("column {name}")));
                    }
                }
                wanted.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            }
            None => "*".to_string(),
        };
        let mut query = format!("SELECT {select_list} FROM {}", quote_ident(table));
        if let Some(where_clause) = &options.where_clause {
            if !where_clause.trim().is_empty() {
                query.push_str(&format!(" WHERE {where_clause}"));
            }
        }
        if let Some(limit) = options.limit {
            if limit < 0 {
                return Err(Error::InvalidArgument("negative export limit".into()));
            }
            query.push_str(&format!(" LIMIT {limit}"));
        }

        let rows: i64 = conn
            .query_row(
                &format!("SELECT count(*) FROM ({query})"),
                duckdb::params![],
                |row| row.get(0),
            )
            .map_err(|e| table_db::classify_sql_error(e.into()))?;
        conn.execute_batch(&format!(
            "COPY ({query}) TO '{}' ({copy_opts})",
            sql_string(&destination)
        ))
        .map_err(|e| table_db::classify_sql_error(e.into()))?;

        let size_bytes = table_db::file_size(std::path::Path::new(&destination));
        info!(
            project_id = project,
            branch_id = branch,
            bucket,
            table,
            rows,
            size_bytes,
            "export complete"
        );
        Ok(ExportInfo {
            destination,
            rows,
            size_bytes,
        })
    }

    /// Internal S3 destinations (`project_<id>/<key>`) map onto the object
    /// store; anything else is treated as a local filesystem path.
    fn resolve_destination(&self, project: &str, destination: &str) -> Result<String> {
        if destination.starts_with("project_") {
            let (dest_project, key) = parse_internal_s3_path(destination)?;
            if dest_project != project {
                return Err(Error::PermissionDenied(
                    "export destination belongs to another project".to_string(),
                ));
            }
            return Ok(self
                .layout
                .s3_object_path(&dest_project, &key)
                .to_string_lossy()
                .to_string());
        }
        Ok(destination.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_options_matrix() {
        assert!(copy_options(DataFormat::Csv, ExportCompression::Gzip).is_ok());
        assert!(copy_options(DataFormat::Csv, ExportCompression::Zstd).is_err());
        assert!(copy_options(DataFormat::Parquet, ExportCompression::Snappy).is_ok());
        assert_eq!(
            copy_options(DataFormat::Csv, ExportCompression::None).unwrap(),
            "FORMAT CSV, HEADER"
        );
    }
}
