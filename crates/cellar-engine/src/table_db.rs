//! Per-table engine file helpers.
//!
//! Every table is exactly one DuckDB file containing one table named after
//! the logical table. These helpers open files in the right mode, build DDL,
//! and read schema/row-count facts back out of a file.

use std::path::Path;

use duckdb::{params, AccessMode, Config, Connection};

use cellar_core::{quote_ident, ColumnDef, Error, Result};

/// Engine types accepted for user columns, with aliases normalised.
pub fn normalize_type(raw: &str) -> Result<String> {
    let upper = raw.trim().to_ascii_uppercase();
    let canonical = match upper.as_str() {
        "INT" | "INTEGER" | "INT4" => "INTEGER",
        "BIGINT" | "INT8" | "LONG" => "BIGINT",
        "SMALLINT" | "INT2" => "SMALLINT",
        "DOUBLE" | "FLOAT8" => "DOUBLE",
        "FLOAT" | "REAL" | "FLOAT4" => "FLOAT",
        "VARCHAR" | "TEXT" | "STRING" | "CHAR" => "VARCHAR",
        "BOOLEAN" | "BOOL" => "BOOLEAN",
        "DATE" => "DATE",
        "TIME" => "TIME",
        "TIMESTAMP" | "DATETIME" => "TIMESTAMP",
        "BLOB" | "BYTEA" => "BLOB",
        other => {
            // DECIMAL(p,s) passes through with its parameters.
            if other.starts_with("DECIMAL") || other.starts_with("NUMERIC") {
                return Ok(upper);
            }
            return Err(Error::InvalidArgument(format!("unsupported type {raw:?}")));
        }
    };
    Ok(canonical.to_string())
}

/// Whether a canonical type participates in numeric profiling.
pub fn is_numeric_type(type_name: &str) -> bool {
    matches!(
        type_name.to_ascii_uppercase().as_str(),
        "INTEGER" | "BIGINT" | "SMALLINT" | "DOUBLE" | "FLOAT"
    ) || type_name.to_ascii_uppercase().starts_with("DECIMAL")
        || type_name.to_ascii_uppercase().starts_with("NUMERIC")
}

/// Open a table file read-write.
pub fn open_rw(path: &Path) -> Result<Connection> {
    Ok(Connection::open(path)?)
}

/// Open a table file read-only. Fails if the file does not exist.
pub fn open_ro(path: &Path) -> Result<Connection> {
    if !path.exists() {
        return Err(Error::NotFound(format!("table file {}", path.display())));
    }
    let config = Config::default().access_mode(AccessMode::ReadOnly)?;
    Ok(Connection::open_with_flags(path, config)?)
}

/// Build the CREATE TABLE statement for a fresh table file.
pub fn create_table_sql(table: &str, columns: &[ColumnDef], primary_key: &[String]) -> String {
    let mut parts: Vec<String> = columns
        .iter()
        .map(|col| {
            let mut part = format!("{} {}", quote_ident(&col.name), col.type_name);
            if !col.nullable {
                part.push_str(" NOT NULL");
            }
            if let Some(default) = &col.default {
                part.push_str(&format!(" DEFAULT {default}"));
            }
            part
        })
        .collect();
    if !primary_key.is_empty() {
        let cols: Vec<String> = primary_key.iter().map(|c| quote_ident(c)).collect();
        parts.push(format!("PRIMARY KEY ({})", cols.join(", ")));
    }
    format!("CREATE TABLE {} ({})", quote_ident(table), parts.join(", "))
}

/// Row count of the single table in a file.
pub fn row_count(conn: &Connection, table: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {}", quote_ident(table)),
        params![],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// On-disk size of a table file (0 if absent).
pub fn file_size(path: &Path) -> i64 {
    std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0)
}

/// Column names of a table inside an open file, in declaration order.
pub fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map(params![], |row| row.get::<_, String>(1))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Read the live schema of a table out of its file.
///
/// The file, not the registry cache, is authoritative for schema-dependent
/// operations; the registry row is refreshed after DDL lands.
pub fn read_schema(conn: &Connection, table: &str) -> Result<(Vec<ColumnDef>, Vec<String>)> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let rows = stmt.query_map(params![], |row| {
        Ok((
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, bool>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, bool>(5)?,
        ))
    })?;
    let mut columns = Vec::new();
    let mut primary_key = Vec::new();
    for row in rows {
        let (name, type_name, notnull, default, pk) = row?;
        if pk {
            primary_key.push(name.clone());
        }
        columns.push(ColumnDef {
            name,
            type_name,
            nullable: !notnull,
            default,
        });
    }
    Ok((columns, primary_key))
}

/// Convert a JSON value into an engine parameter value.
pub fn json_to_value(value: &serde_json::Value) -> Result<duckdb::types::Value> {
    use duckdb::types::Value;
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::BigInt(i)
            } else if let Some(f) = n.as_f64() {
                Value::Double(f)
            } else {
                return Err(Error::InvalidArgument(format!("unrepresentable number {n}")));
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        other => {
            return Err(Error::InvalidArgument(format!(
                "unsupported cell value {other}"
            )))
        }
    })
}

/// Render an engine value as a JSON value for preview payloads.
pub fn value_to_json(value: duckdb::types::Value) -> serde_json::Value {
    use duckdb::types::Value;
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(b),
        Value::TinyInt(v) => serde_json::json!(v),
        Value::SmallInt(v) => serde_json::json!(v),
        Value::Int(v) => serde_json::json!(v),
        Value::BigInt(v) => serde_json::json!(v),
        Value::HugeInt(v) => serde_json::json!(v as i64),
        Value::UTinyInt(v) => serde_json::json!(v),
        Value::USmallInt(v) => serde_json::json!(v),
        Value::UInt(v) => serde_json::json!(v),
        Value::UBigInt(v) => serde_json::json!(v),
        Value::Float(v) => serde_json::json!(v),
        Value::Double(v) => serde_json::json!(v),
        Value::Text(s) => serde_json::Value::String(s),
        Value::Blob(b) => serde_json::Value::String(hex::encode(b)),
        other => serde_json::Value::String(format!("{other:?}")),
    }
}

/// Classify an engine error produced while running caller-supplied SQL
/// fragments (predicates, defaults): parse and bind failures are the
/// caller's fault, not an I/O problem.
pub fn classify_sql_error(err: Error) -> Error {
    match err {
        Error::Engine(e) => {
            let msg = e.to_string();
            if msg.contains("Parser Error")
                || msg.contains("Binder Error")
                || msg.contains("Conversion Error")
            {
                Error::InvalidArgument(msg)
            } else {
                Error::Engine(e).reclassify_constraint()
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_type_aliases() {
        assert_eq!(normalize_type("int").unwrap(), "INTEGER");
        assert_eq!(normalize_type("Text").unwrap(), "VARCHAR");
        assert_eq!(normalize_type("DECIMAL(10,2)").unwrap(), "DECIMAL(10,2)");
        assert!(normalize_type("GEOMETRY").is_err());
    }

    #[test]
    fn test_create_table_sql_shape() {
        let columns = vec![
            ColumnDef {
                name: "id".into(),
                type_name: "INTEGER".into(),
                nullable: false,
                default: None,
            },
            ColumnDef {
                name: "amt".into(),
                type_name: "DOUBLE".into(),
                nullable: true,
                default: Some("0".into()),
            },
        ];
        let sql = create_table_sql("orders", &columns, &["id".to_string()]);
        assert_eq!(
            sql,
            "CREATE TABLE \"orders\" (\"id\" INTEGER NOT NULL, \"amt\" DOUBLE DEFAULT 0, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_roundtrip_file_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        let conn = open_rw(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE orders (id INTEGER PRIMARY KEY, amt DOUBLE); \
             INSERT INTO orders VALUES (1, 10.0), (2, 20.0);",
        )
        .unwrap();
        assert_eq!(row_count(&conn, "orders").unwrap(), 2);
        assert_eq!(column_names(&conn, "orders").unwrap(), vec!["id", "amt"]);
        drop(conn);

        let ro = open_ro(&path).unwrap();
        assert!(ro
            .execute("INSERT INTO orders VALUES (3, 30.0)", params![])
            .is_err());
    }

    #[test]
    fn test_json_value_conversion() {
        use duckdb::types::Value;
        assert!(matches!(
            json_to_value(&serde_json::json!(5)).unwrap(),
            Value::BigInt(5)
        ));
        assert!(matches!(
            json_to_value(&serde_json::json!(2.5)).unwrap(),
            Value::Double(_)
        ));
        assert!(json_to_value(&serde_json::json!([1, 2])).is_err());
    }
}
