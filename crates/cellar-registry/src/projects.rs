//! Project repository.

use duckdb::params;

use cellar_core::{Error, Project, Result};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct ProjectRepo {
    shared: Shared,
}

impl ProjectRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, project: &Project) -> Result<()> {
        let p = project.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO projects (id, name, description, created_at) VALUES (?, ?, ?, ?)",
                    params![p.id, p.name, p.description, fmt_ts(&p.created_at)],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())
                .map_err(|e| match e {
                    Error::Conflict(_) => Error::Conflict(format!("project {} already exists", p.id)),
                    other => other,
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Project>> {
        let id = id.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT id, name, description, created_at FROM projects WHERE id = ?",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                ))?;
                row.map(|(id, name, description, created_at)| {
                    Ok(Project {
                        id,
                        name,
                        description,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    /// Fetch a project, erroring with NotFound when absent.
    pub async fn require(&self, id: &str) -> Result<Project> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {id}")))
    }

    pub async fn list(&self) -> Result<Vec<Project>> {
        self.shared
            .read(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, description, created_at FROM projects ORDER BY id",
                )?;
                let rows = stmt.query_map(params![], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, name, description, created_at) = row?;
                    out.push(Project {
                        id,
                        name,
                        description,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Hard delete of a project and every registry row hanging off it.
    ///
    /// Buckets → tables → snapshots → files → workspaces, plus branches,
    /// shares/links, keys, and credentials/sessions. Filesystem cleanup is
    /// the caller's responsibility (registry first, disk second).
    pub async fn delete_cascade(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.shared
            .write(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM pg_sessions WHERE workspace_id IN \
                     (SELECT id FROM workspaces WHERE project_id = ?)",
                    params![id],
                )?;
                tx.execute(
                    "DELETE FROM workspace_credentials WHERE workspace_id IN \
                     (SELECT id FROM workspaces WHERE project_id = ?)",
                    params![id],
                )?;
                tx.execute("DELETE FROM workspaces WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM files WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM snapshots WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM branch_tables WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM branches WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM tables WHERE project_id = ?", params![id])?;
                tx.execute("DELETE FROM buckets WHERE project_id = ?", params![id])?;
                tx.execute(
                    "DELETE FROM shares WHERE src_project = ? OR target_project = ?",
                    params![id, id],
                )?;
                tx.execute(
                    "DELETE FROM links WHERE target_project = ? OR src_project = ?",
                    params![id, id],
                )?;
                tx.execute("DELETE FROM api_keys WHERE project_id = ?", params![id])?;
                tx.execute(
                    "DELETE FROM snapshot_settings WHERE scope != 'system' AND \
                     (scope_key = ? OR scope_key LIKE ? || '/%')",
                    params![id, id],
                )?;
                let removed = tx.execute("DELETE FROM projects WHERE id = ?", params![id])?;
                tx.commit()?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("project {id}")));
                }
                Ok(())
            })
            .await
    }
}
