//! Workspace, credential, and pg-session repositories.

use chrono::{DateTime, Utc};
use duckdb::params;

use cellar_core::{
    Error, PgSession, Result, Workspace, WorkspaceCredentials, WorkspaceStatus,
};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct WorkspaceRepo {
    shared: Shared,
}

impl WorkspaceRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, ws: &Workspace, creds: &WorkspaceCredentials) -> Result<()> {
        let w = ws.clone();
        let c = creds.clone();
        self.shared
            .write(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO workspaces (id, project_id, branch_id, db_path, \
                     size_limit_bytes, expires_at, status, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        w.id,
                        w.project_id,
                        w.branch_id,
                        w.db_path,
                        w.size_limit_bytes,
                        fmt_ts(&w.expires_at),
                        w.status.as_str(),
                        fmt_ts(&w.created_at)
                    ],
                )?;
                tx.execute(
                    "INSERT INTO workspace_credentials (workspace_id, username, password_hash) \
                     VALUES (?, ?, ?)",
                    params![c.workspace_id, c.username, c.password_hash],
                )?;
                tx.commit()?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let id = id.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT id, project_id, branch_id, db_path, size_limit_bytes, expires_at, \
                     status, created_at FROM workspaces WHERE id = ?",
                    params![id],
                    Self::raw_row,
                ))?;
                row.map(Self::hydrate).transpose()
            })
            .await
    }

    pub async fn require(&self, id: &str) -> Result<Workspace> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("workspace {id}")))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Workspace>> {
        let pid = project_id.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, branch_id, db_path, size_limit_bytes, expires_at, \
                     status, created_at FROM workspaces WHERE project_id = ? ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![pid], Self::raw_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(Self::hydrate(row?)?);
                }
                Ok(out)
            })
            .await
    }

    /// Workspaces whose TTL has lapsed but are still marked active.
    pub async fn expired(&self, now: &DateTime<Utc>) -> Result<Vec<Workspace>> {
        let cutoff = fmt_ts(now);
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, project_id, branch_id, db_path, size_limit_bytes, expires_at, \
                     status, created_at FROM workspaces \
                     WHERE status = 'active' AND expires_at < ?",
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

    pub async fn set_status(&self, id: &str, status: WorkspaceStatus) -> Result<()> {
        let id = id.to_string();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "UPDATE workspaces SET status = ? WHERE id = ?",
                    params![status.as_str(), id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn delete_cascade(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.shared
            .write(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM pg_sessions WHERE workspace_id = ?", params![id])?;
                tx.execute(
                    "DELETE FROM workspace_credentials WHERE workspace_id = ?",
                    params![id],
                )?;
                let removed =
                    tx.execute("DELETE FROM workspaces WHERE id = ?", params![id])?;
                tx.commit()?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("workspace {id}")));
                }
                Ok(())
            })
            .await
    }

    // ─── Credentials ───────────────────────────────────────────────────────

    pub async fn credentials(&self, workspace_id: &str) -> Result<Option<WorkspaceCredentials>> {
        let id = workspace_id.to_string();
        self.shared
            .read(move |conn| {
                optional(conn.query_row(
                    "SELECT workspace_id, username, password_hash FROM workspace_credentials \
                     WHERE workspace_id = ?",
                    params![id],
                    |row| {
                        Ok(WorkspaceCredentials {
                            workspace_id: row.get(0)?,
                            username: row.get(1)?,
                            password_hash: row.get(2)?,
                        })
                    },
                ))
            })
            .await
    }

    pub async fn credentials_by_username(
        &self,
        username: &str,
    ) -> Result<Option<WorkspaceCredentials>> {
        let username = username.to_string();
        self.shared
            .read(move |conn| {
                optional(conn.query_row(
                    "SELECT workspace_id, username, password_hash FROM workspace_credentials \
                     WHERE username = ?",
                    params![username],
                    |row| {
                        Ok(WorkspaceCredentials {
                            workspace_id: row.get(0)?,
                            username: row.get(1)?,
                            password_hash: row.get(2)?,
                        })
                    },
                ))
            })
            .await
    }

    /// Rotate the stored password hash. Existing sessions remain connected.
    pub async fn reset_password(&self, workspace_id: &str, password_hash: &str) -> Result<()> {
        let (id, hash) = (workspace_id.to_string(), password_hash.to_string());
        self.shared
            .write(move |conn| {
                let updated = conn.execute(
                    "UPDATE workspace_credentials SET password_hash = ? WHERE workspace_id = ?",
                    params![hash, id],
                )?;
                if updated == 0 {
                    return Err(Error::NotFound(format!("workspace {id}")));
                }
                Ok(())
            })
            .await
    }

    // ─── Sessions ──────────────────────────────────────────────────────────

    pub async fn session_insert(&self, session: &PgSession) -> Result<()> {
        let s = session.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO pg_sessions (session_id, workspace_id, client_addr, \
                     connected_at, last_activity_at) VALUES (?, ?, ?, ?, ?)",
                    params![
                        s.session_id,
                        s.workspace_id,
                        s.client_addr,
                        fmt_ts(&s.connected_at),
                        fmt_ts(&s.last_activity_at)
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn session_touch(&self, session_id: &str, at: &DateTime<Utc>) -> Result<()> {
        let (id, at) = (session_id.to_string(), fmt_ts(at));
        self.shared
            .write(move |conn| {
                conn.execute(
                    "UPDATE pg_sessions SET last_activity_at = ? WHERE session_id = ?",
                    params![at, id],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn session_delete(&self, session_id: &str) -> Result<()> {
        let id = session_id.to_string();
        self.shared
            .write(move |conn| {
                conn.execute("DELETE FROM pg_sessions WHERE session_id = ?", params![id])?;
                Ok(())
            })
            .await
    }

    pub async fn sessions_for_workspace(&self, workspace_id: &str) -> Result<Vec<PgSession>> {
        let wid = workspace_id.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, workspace_id, client_addr, connected_at, \
                     last_activity_at FROM pg_sessions WHERE workspace_id = ? \
                     ORDER BY connected_at",
                )?;
                let rows = stmt.query_map(params![wid], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (session_id, workspace_id, client_addr, connected_at, last_activity_at) =
                        row?;
                    out.push(PgSession {
                        session_id,
                        workspace_id,
                        client_addr,
                        connected_at: parse_ts(&connected_at)?,
                        last_activity_at: parse_ts(&last_activity_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    #[allow(clippy::type_complexity)]
    fn raw_row(
        row: &duckdb::Row<'_>,
    ) -> duckdb::Result<(
        String,
        String,
        Option<String>,
        String,
        i64,
        String,
        String,
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
        ))
    }

    #[allow(clippy::type_complexity)]
    fn hydrate(
        raw: (
            String,
            String,
            Option<String>,
            String,
            i64,
            String,
            String,
            String,
        ),
    ) -> Result<Workspace> {
        let (id, project_id, branch_id, db_path, size_limit, expires_at, status, created_at) = raw;
        Ok(Workspace {
            id,
            project_id,
            branch_id,
            db_path,
            size_limit_bytes: size_limit,
            expires_at: parse_ts(&expires_at)?,
            status: WorkspaceStatus::parse(&status)?,
            created_at: parse_ts(&created_at)?,
        })
    }
}
