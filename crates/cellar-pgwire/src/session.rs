//! One pg-wire session: cleartext auth against workspace credentials, the
//! simple query protocol, a minimal extended protocol, statement and idle
//! timeouts, and a registry session row kept current for the lifetime of the
//! connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use duckdb::types::Value;
use duckdb::Connection;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cellar_core::{Error, ErrorClass, Result, Workspace};
use cellar_engine::Engine;

use crate::protocol::{self, Frame, Startup};

/// Per-session resource limits, programmed at session start.
#[derive(Debug, Clone)]
pub struct SessionLimits {
    pub statement_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(cellar_core::defaults::STATEMENT_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(cellar_core::defaults::IDLE_TIMEOUT_SECS),
        }
    }
}

/// Result of executing one statement.
struct QueryOutcome {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    tag: String,
}

/// Drive one client connection from startup to termination.
pub async fn run_session<S>(
    engine: Engine,
    mut stream: S,
    peer: SocketAddr,
    limits: SessionLimits,
    mut shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = serve(&engine, &mut stream, peer, &limits, &mut shutdown).await {
        debug!(peer = %peer, error = %e, "pg-wire session ended with error");
    }
}

async fn serve<S>(
    engine: &Engine,
    stream: &mut S,
    peer: SocketAddr,
    limits: &SessionLimits,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let params = match protocol::read_startup(stream).await? {
        Startup::Start(params) => params,
        Startup::Cancel => return Ok(()),
    };
    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };
    let username = get("user");
    let database = get("database");

    stream.write_all(&protocol::auth_cleartext_password()).await?;

    let frame = protocol::read_frame(stream).await?;
    if frame.tag != b'p' {
        fail(stream, ErrorClass::Unauthenticated, "expected password message").await?;
        return Ok(());
    }
    let (password, _) = protocol::take_cstring(&frame.body)?;

    let workspace = match engine.authenticate_workspace(&username, &password).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(peer = %peer, user = %username, "pg-wire auth failed");
            fail(stream, ErrorClass::Unauthenticated, &e.to_string()).await?;
            return Ok(());
        }
    };
    let expected_db = format!("workspace_{}", workspace.id);
    if database != expected_db && database != workspace.id {
        fail(
            stream,
            ErrorClass::Unauthenticated,
            &format!("database {database:?} does not match the workspace"),
        )
        .await?;
        return Ok(());
    }

    let conn = engine.open_workspace_session(&workspace).await?;

    let session_id = Uuid::new_v4().simple().to_string();
    let now = Utc::now();
    engine
        .registry()
        .workspaces
        .session_insert(&cellar_core::PgSession {
            session_id: session_id.clone(),
            workspace_id: workspace.id.clone(),
            client_addr: peer.to_string(),
            connected_at: now,
            last_activity_at: now,
        })
        .await?;
    info!(peer = %peer, workspace_id = %workspace.id, session_id = %session_id, "pg-wire session opened");

    stream.write_all(&protocol::auth_ok()).await?;
    for (key, value) in [
        ("server_version", "15.0 (cellar)"),
        ("server_encoding", "UTF8"),
        ("client_encoding", "UTF8"),
        ("DateStyle", "ISO, MDY"),
    ] {
        stream.write_all(&protocol::parameter_status(key, value)).await?;
    }
    stream
        .write_all(&protocol::backend_key_data(rand::random::<i32>().abs(), rand::random()))
        .await?;
    stream.write_all(&protocol::ready_for_query()).await?;

    let result = message_loop(
        engine, stream, &workspace, conn, &session_id, limits, shutdown,
    )
    .await;

    engine
        .registry()
        .workspaces
        .session_delete(&session_id)
        .await
        .ok();
    info!(session_id = %session_id, "pg-wire session closed");
    result
}

#[allow(clippy::too_many_arguments)]
async fn message_loop<S>(
    engine: &Engine,
    stream: &mut S,
    workspace: &Workspace,
    conn: Connection,
    session_id: &str,
    limits: &SessionLimits,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // The connection is owned here and moved into a blocking task for each
    // statement; a statement timeout therefore ends the session (the
    // runaway query keeps the moved connection).
    let mut conn = Some(conn);
    let mut prepared: HashMap<String, String> = HashMap::new();
    let mut portals: HashMap<String, String> = HashMap::new();

    loop {
        let frame = tokio::select! {
            read = tokio::time::timeout(limits.idle_timeout, protocol::read_frame(stream)) => {
                match read {
                    Ok(Ok(frame)) => frame,
                    Ok(Err(_)) => return Ok(()), // client hung up
                    Err(_) => {
                        debug!(session_id, "idle timeout");
                        let msg = protocol::error_response(
                            ErrorClass::Timeout,
                            "idle timeout: closing session",
                        );
                        stream.write_all(&msg).await.ok();
                        return Ok(());
                    }
                }
            }
            _ = shutdown.changed() => {
                let msg = protocol::error_response(
                    ErrorClass::Internal,
                    "server is shutting down",
                );
                stream.write_all(&msg).await.ok();
                return Ok(());
            }
        };

        match frame.tag {
            b'X' => return Ok(()),
            b'Q' => {
                let (sql, _) = protocol::take_cstring(&frame.body)?;
                let taken = conn.take().expect("session connection");
                match execute_with_timeout(taken, sql, limits.statement_timeout).await {
                    (Some(returned), Ok(outcome)) => {
                        conn = Some(returned);
                        send_outcome(stream, &outcome).await?;
                    }
                    (Some(returned), Err(e)) => {
                        conn = Some(returned);
                        stream
                            .write_all(&protocol::error_response(e.class(), &e.to_string()))
                            .await?;
                    }
                    (None, result) => {
                        // Timed out: the connection is gone with the query.
                        let msg = result.err().map(|e| e.to_string()).unwrap_or_default();
                        stream
                            .write_all(&protocol::error_response(ErrorClass::Timeout, &msg))
                            .await?;
                        return Ok(());
                    }
                }
                if !engine.workspace_within_limit(workspace) {
                    stream
                        .write_all(&protocol::error_response(
                            ErrorClass::ResourceExhausted,
                            "workspace size limit exceeded",
                        ))
                        .await?;
                }
                engine
                    .registry()
                    .workspaces
                    .session_touch(session_id, &Utc::now())
                    .await
                    .ok();
                stream.write_all(&protocol::ready_for_query()).await?;
            }
            b'P' => {
                let (name, rest) = protocol::take_cstring(&frame.body)?;
                let (sql, _) = protocol::take_cstring(rest)?;
                prepared.insert(name, sql);
                stream.write_all(&protocol::parse_complete()).await?;
            }
            b'B' => {
                let (portal, rest) = protocol::take_cstring(&frame.body)?;
                let (statement, rest) = protocol::take_cstring(rest)?;
                // Parameter binding is limited to zero parameters.
                if rest.len() < 2 {
                    return Err(Error::InvalidArgument("malformed Bind message".into()));
                }
                let param_formats = i16::from_be_bytes([rest[0], rest[1]]);
                let format_bytes = 2 + (param_formats.max(0) as usize) * 2;
                if rest.len() < format_bytes + 2 {
                    return Err(Error::InvalidArgument("malformed Bind message".into()));
                }
                let after = &rest[format_bytes..];
                let param_count = i16::from_be_bytes([after[0], after[1]]);
                if param_count > 0 {
                    stream
                        .write_all(&protocol::error_response(
                            ErrorClass::InvalidArgument,
                            "bound parameters are not supported; inline the values",
                        ))
                        .await?;
                    continue;
                }
                let sql = prepared.get(&statement).cloned().unwrap_or_default();
                portals.insert(portal, sql);
                stream.write_all(&protocol::bind_complete()).await?;
            }
            b'D' => {
                // Row metadata is sent at execute time.
                stream.write_all(&protocol::no_data()).await?;
            }
            b'E' => {
                let (portal, _) = protocol::take_cstring(&frame.body)?;
                let sql = portals.get(&portal).cloned().unwrap_or_default();
                let taken = conn.take().expect("session connection");
                match execute_with_timeout(taken, sql, limits.statement_timeout).await {
                    (Some(returned), Ok(outcome)) => {
                        conn = Some(returned);
                        send_outcome(stream, &outcome).await?;
                    }
                    (Some(returned), Err(e)) => {
                        conn = Some(returned);
                        stream
                            .write_all(&protocol::error_response(e.class(), &e.to_string()))
                            .await?;
                    }
                    (None, _) => {
                        stream
                            .write_all(&protocol::error_response(
                                ErrorClass::Timeout,
                                "statement timeout",
                            ))
                            .await?;
                        return Ok(());
                    }
                }
            }
            b'S' => stream.write_all(&protocol::ready_for_query()).await?,
            b'C' => stream.write_all(&protocol::close_complete()).await?,
            b'H' => {} // Flush: everything is written eagerly.
            other => {
                stream
                    .write_all(&protocol::error_response(
                        ErrorClass::InvalidArgument,
                        &format!("unsupported message type {:?}", other as char),
                    ))
                    .await?;
            }
        }
    }
}

async fn send_outcome<S>(stream: &mut S, outcome: &QueryOutcome) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    if outcome.tag == "EMPTY" {
        stream.write_all(&protocol::empty_query_response()).await?;
        return Ok(());
    }
    if !outcome.columns.is_empty() {
        stream
            .write_all(&protocol::row_description(&outcome.columns))
            .await?;
        for row in &outcome.rows {
            stream.write_all(&protocol::data_row(row)).await?;
        }
    }
    stream
        .write_all(&protocol::command_complete(&outcome.tag))
        .await?;
    Ok(())
}

async fn fail<S>(stream: &mut S, class: ErrorClass, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&protocol::error_response(class, message))
        .await?;
    Ok(())
}

/// Run a statement on a blocking thread with a timeout. Returns the
/// connection when the statement finished in time; `None` when the timeout
/// won the race and the connection is lost to the still-running query.
async fn execute_with_timeout(
    conn: Connection,
    sql: String,
    timeout: Duration,
) -> (Option<Connection>, Result<QueryOutcome>) {
    let handle = tokio::task::spawn_blocking(move || {
        let result = run_statement(&conn, &sql);
        (conn, result)
    });
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok((conn, result))) => (Some(conn), result),
        Ok(Err(join_err)) => (
            None,
            Err(Error::Internal(format!("statement task failed: {join_err}"))),
        ),
        Err(_) => (None, Err(Error::Timeout("statement timeout".to_string()))),
    }
}

fn run_statement(conn: &Connection, sql: &str) -> Result<QueryOutcome> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Ok(QueryOutcome {
            columns: vec![],
            rows: vec![],
            tag: "EMPTY".to_string(),
        });
    }

    // Multi-statement simple queries run as a batch with one summary tag.
    if trimmed.contains(';') {
        conn.execute_batch(sql)
            .map_err(|e| cellar_engine::table_db::classify_sql_error(e.into()))?;
        return Ok(QueryOutcome {
            columns: vec![],
            rows: vec![],
            tag: "OK".to_string(),
        });
    }

    let keyword = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();
    let returns_rows = matches!(
        keyword.as_str(),
        "SELECT" | "WITH" | "VALUES" | "SHOW" | "DESCRIBE" | "FROM" | "PRAGMA" | "EXPLAIN"
    );

    if returns_rows {
        let mut stmt = conn
            .prepare(trimmed)
            .map_err(|e| cellar_engine::table_db::classify_sql_error(e.into()))?;
        let mut rows = stmt
            .query(duckdb::params![])
            .map_err(|e| cellar_engine::table_db::classify_sql_error(e.into()))?;

        let mut columns: Vec<String> = Vec::new();
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            if columns.is_empty() {
                columns = row
                    .as_ref()
                    .column_names()
                    .iter()
                    .map(|c| c.to_string())
                    .collect();
            }
            let mut record = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: Value = row.get(idx)?;
                record.push(render_value(value));
            }
            out.push(record);
        }
        if columns.is_empty() {
            if let Some(stmt) = rows.as_ref() {
                columns = stmt.column_names().iter().map(|c| c.to_string()).collect();
            }
        }

        let tag = format!("SELECT {}", out.len());
        Ok(QueryOutcome {
            columns,
            rows: out,
            tag,
        })
    } else {
        let affected = conn
            .execute(trimmed, duckdb::params![])
            .map_err(|e| cellar_engine::table_db::classify_sql_error(e.into()))?;
        let tag = match keyword.as_str() {
            "INSERT" => format!("INSERT 0 {affected}"),
            "UPDATE" => format!("UPDATE {affected}"),
            "DELETE" => format!("DELETE {affected}"),
            "CREATE" => "CREATE TABLE".to_string(),
            "DROP" => "DROP TABLE".to_string(),
            "ALTER" => "ALTER TABLE".to_string(),
            "BEGIN" => "BEGIN".to_string(),
            "COMMIT" => "COMMIT".to_string(),
            "ROLLBACK" => "ROLLBACK".to_string(),
            _ => "OK".to_string(),
        };
        Ok(QueryOutcome {
            columns: vec![],
            rows: vec![],
            tag,
        })
    }
}

/// Render an engine value in PostgreSQL text format. NULL is `None`.
fn render_value(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Boolean(b) => Some(if b { "t" } else { "f" }.to_string()),
        Value::TinyInt(v) => Some(v.to_string()),
        Value::SmallInt(v) => Some(v.to_string()),
        Value::Int(v) => Some(v.to_string()),
        Value::BigInt(v) => Some(v.to_string()),
        Value::HugeInt(v) => Some(v.to_string()),
        Value::UTinyInt(v) => Some(v.to_string()),
        Value::USmallInt(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::UBigInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        Value::Text(s) => Some(s),
        Value::Blob(b) => Some(format!("\\x{}", hex_lower(&b))),
        other => Some(format!("{other:?}")),
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_value_text_format() {
        assert_eq!(render_value(Value::Null), None);
        assert_eq!(render_value(Value::Boolean(true)).unwrap(), "t");
        assert_eq!(render_value(Value::BigInt(4)).unwrap(), "4");
        assert_eq!(render_value(Value::Text("x".into())).unwrap(), "x");
    }

    #[test]
    fn test_run_statement_select_and_ddl() {
        let conn = Connection::open_in_memory().unwrap();
        let outcome = run_statement(&conn, "CREATE TABLE t (id INTEGER)").unwrap();
        assert_eq!(outcome.tag, "CREATE TABLE");

        let outcome = run_statement(&conn, "INSERT INTO t VALUES (1), (2)").unwrap();
        assert_eq!(outcome.tag, "INSERT 0 2");

        let outcome = run_statement(&conn, "SELECT count(*) AS n FROM t").unwrap();
        assert_eq!(outcome.columns, vec!["n"]);
        assert_eq!(outcome.rows, vec![vec![Some("2".to_string())]]);
        assert_eq!(outcome.tag, "SELECT 1");
    }

    #[test]
    fn test_run_statement_empty_query() {
        let conn = Connection::open_in_memory().unwrap();
        let outcome = run_statement(&conn, "  ;").unwrap();
        assert_eq!(outcome.tag, "EMPTY");
    }
}
