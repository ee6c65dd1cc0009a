//! Startup schema migrations.
//!
//! Forward-only and idempotent: `schema_version` holds the highest applied
//! migration number; every startup applies anything newer in order. A version
//! on disk that is *ahead* of this binary is fatal.

use duckdb::{params, Connection};
use tracing::info;

use cellar_core::{Error, Result};

/// All migrations in chronological order. Never reorder or edit an entry
/// after release; append a new one.
const MIGRATIONS: &[(i64, &str)] = &[(1, INITIAL_SCHEMA)];

const INITIAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id          VARCHAR PRIMARY KEY,
    name        VARCHAR NOT NULL,
    description VARCHAR,
    created_at  VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    project_id  VARCHAR NOT NULL,
    key_hash    VARCHAR NOT NULL UNIQUE,
    description VARCHAR,
    created_at  VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS buckets (
    project_id  VARCHAR NOT NULL,
    name        VARCHAR NOT NULL,
    stage       VARCHAR NOT NULL,
    created_at  VARCHAR NOT NULL,
    PRIMARY KEY (project_id, stage, name)
);

CREATE TABLE IF NOT EXISTS tables (
    project_id       VARCHAR NOT NULL,
    bucket           VARCHAR NOT NULL,
    name             VARCHAR NOT NULL,
    columns_json     VARCHAR NOT NULL,
    primary_key_json VARCHAR NOT NULL,
    row_count_cache  BIGINT NOT NULL DEFAULT 0,
    size_bytes_cache BIGINT NOT NULL DEFAULT 0,
    created_at       VARCHAR NOT NULL,
    PRIMARY KEY (project_id, bucket, name)
);

CREATE TABLE IF NOT EXISTS branches (
    project_id VARCHAR NOT NULL,
    branch_id  VARCHAR NOT NULL,
    name       VARCHAR NOT NULL,
    created_at VARCHAR NOT NULL,
    PRIMARY KEY (project_id, branch_id)
);

CREATE TABLE IF NOT EXISTS branch_tables (
    project_id VARCHAR NOT NULL,
    branch_id  VARCHAR NOT NULL,
    bucket     VARCHAR NOT NULL,
    table_name VARCHAR NOT NULL,
    source     VARCHAR NOT NULL,
    PRIMARY KEY (project_id, branch_id, bucket, table_name)
);

CREATE TABLE IF NOT EXISTS shares (
    src_project    VARCHAR NOT NULL,
    bucket         VARCHAR NOT NULL,
    target_project VARCHAR NOT NULL,
    created_at     VARCHAR NOT NULL,
    PRIMARY KEY (src_project, bucket, target_project)
);

CREATE TABLE IF NOT EXISTS links (
    target_project VARCHAR NOT NULL,
    bucket         VARCHAR NOT NULL,
    src_project    VARCHAR NOT NULL,
    src_bucket     VARCHAR NOT NULL,
    created_at     VARCHAR NOT NULL,
    PRIMARY KEY (target_project, bucket)
);

CREATE TABLE IF NOT EXISTS snapshots (
    id            VARCHAR PRIMARY KEY,
    project_id    VARCHAR NOT NULL,
    bucket        VARCHAR NOT NULL,
    table_name    VARCHAR NOT NULL,
    kind          VARCHAR NOT NULL,
    trigger_name  VARCHAR NOT NULL,
    created_at    VARCHAR NOT NULL,
    expires_at    VARCHAR NOT NULL,
    row_count     BIGINT NOT NULL,
    size_bytes    BIGINT NOT NULL,
    artifact_path VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_settings (
    scope      VARCHAR NOT NULL,
    scope_key  VARCHAR NOT NULL,
    setting    VARCHAR NOT NULL,
    value_json VARCHAR NOT NULL,
    PRIMARY KEY (scope, scope_key, setting)
);

CREATE TABLE IF NOT EXISTS files (
    id           VARCHAR PRIMARY KEY,
    project_id   VARCHAR NOT NULL,
    name         VARCHAR NOT NULL,
    size_bytes   BIGINT NOT NULL,
    sha256       VARCHAR NOT NULL,
    tags_json    VARCHAR NOT NULL,
    storage_path VARCHAR NOT NULL,
    created_at   VARCHAR NOT NULL,
    staged_until VARCHAR
);

CREATE TABLE IF NOT EXISTS workspaces (
    id               VARCHAR PRIMARY KEY,
    project_id       VARCHAR NOT NULL,
    branch_id        VARCHAR,
    db_path          VARCHAR NOT NULL,
    size_limit_bytes BIGINT NOT NULL,
    expires_at       VARCHAR NOT NULL,
    status           VARCHAR NOT NULL,
    created_at       VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS workspace_credentials (
    workspace_id  VARCHAR PRIMARY KEY,
    username      VARCHAR NOT NULL UNIQUE,
    password_hash VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS pg_sessions (
    session_id       VARCHAR PRIMARY KEY,
    workspace_id     VARCHAR NOT NULL,
    client_addr      VARCHAR NOT NULL,
    connected_at     VARCHAR NOT NULL,
    last_activity_at VARCHAR NOT NULL
);

CREATE TABLE IF NOT EXISTS idempotency (
    key           VARCHAR PRIMARY KEY,
    fingerprint   VARCHAR NOT NULL,
    response_body VARCHAR NOT NULL,
    status_code   INTEGER NOT NULL,
    inserted_at   VARCHAR NOT NULL
);
"#;

/// Apply pending migrations. Safe to call on every startup.
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (version BIGINT NOT NULL)",
    )?;

    let current: i64 = conn.query_row(
        "SELECT coalesce(max(version), 0) FROM schema_version",
        params![],
        |row| row.get(0),
    )?;

    let latest = MIGRATIONS.last().map(|(v, _)| *v).unwrap_or(0);
    if current > latest {
        return Err(Error::FailedPrecondition(format!(
            "registry schema version {current} is newer than this binary supports ({latest})"
        )));
    }

    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?)",
            params![*version],
        )?;
        tx.commit()?;
        info!(version, "registry migration applied");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        run(&mut conn).unwrap();

        let version: i64 = conn
            .query_row("SELECT max(version) FROM schema_version", params![], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn test_future_schema_version_is_fatal() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", params![])
            .unwrap();
        assert!(run(&mut conn).is_err());
    }
}
