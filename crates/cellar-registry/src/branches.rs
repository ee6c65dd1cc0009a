//! Branch and branch-table repositories.
//!
//! A `branch_tables` row exists only once a branch has diverged from main for
//! that table; its absence is what makes live view work.

use duckdb::params;

use cellar_core::{Branch, BranchSource, BranchTable, Error, Result, DEFAULT_BRANCH};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct BranchRepo {
    shared: Shared,
}

impl BranchRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, branch: &Branch) -> Result<()> {
        if branch.branch_id == DEFAULT_BRANCH {
            return Err(Error::InvalidArgument(
                "the default branch is implicit and cannot be created".to_string(),
            ));
        }
        let b = branch.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO branches (project_id, branch_id, name, created_at) \
                     VALUES (?, ?, ?, ?)",
                    params![b.project_id, b.branch_id, b.name, fmt_ts(&b.created_at)],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())
                .map_err(|e| match e {
                    Error::Conflict(_) => {
                        Error::Conflict(format!("branch {} already exists", b.branch_id))
                    }
                    other => other,
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, project_id: &str, branch_id: &str) -> Result<Option<Branch>> {
        let (pid, bid) = (project_id.to_string(), branch_id.to_string());
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT project_id, branch_id, name, created_at FROM branches \
                     WHERE project_id = ? AND branch_id = ?",
                    params![pid, bid],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                ))?;
                row.map(|(project_id, branch_id, name, created_at)| {
                    Ok(Branch {
                        project_id,
                        branch_id,
                        name,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    /// A branch exists if it is the default sentinel or has a row.
    pub async fn require(&self, project_id: &str, branch_id: &str) -> Result<()> {
        if branch_id == DEFAULT_BRANCH {
            return Ok(());
        }
        self.get(project_id, branch_id)
            .await?
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("branch {branch_id}")))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Branch>> {
        let pid = project_id.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, branch_id, name, created_at FROM branches \
                     WHERE project_id = ? ORDER BY branch_id",
                )?;
                let rows = stmt.query_map(params![pid], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (project_id, branch_id, name, created_at) = row?;
                    out.push(Branch {
                        project_id,
                        branch_id,
                        name,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Delete a branch and its divergence rows.
    pub async fn delete_cascade(&self, project_id: &str, branch_id: &str) -> Result<()> {
        let (pid, bid) = (project_id.to_string(), branch_id.to_string());
        self.shared
            .write(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM branch_tables WHERE project_id = ? AND branch_id = ?",
                    params![pid, bid],
                )?;
                let removed = tx.execute(
                    "DELETE FROM branches WHERE project_id = ? AND branch_id = ?",
                    params![pid, bid],
                )?;
                tx.commit()?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("branch {bid}")));
                }
                Ok(())
            })
            .await
    }
}

#[derive(Clone)]
pub struct BranchTableRepo {
    shared: Shared,
}

impl BranchTableRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn get(
        &self,
        project_id: &str,
        branch_id: &str,
        bucket: &str,
        table: &str,
    ) -> Result<Option<BranchTable>> {
        let (pid, bid, bucket, table) = (
            project_id.to_string(),
            branch_id.to_string(),
            bucket.to_string(),
            table.to_string(),
        );
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT project_id, branch_id, bucket, table_name, source \
                     FROM branch_tables \
                     WHERE project_id = ? AND branch_id = ? AND bucket = ? AND table_name = ?",
                    params![pid, bid, bucket, table],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                ))?;
                row.map(|(project_id, branch_id, bucket, table, source)| {
                    Ok(BranchTable {
                        project_id,
                        branch_id,
                        bucket,
                        table,
                        source: BranchSource::parse(&source)?,
                    })
                })
                .transpose()
            })
            .await
    }

    pub async fn upsert(&self, row: &BranchTable) -> Result<()> {
        let r = row.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO branch_tables \
                     (project_id, branch_id, bucket, table_name, source) VALUES (?, ?, ?, ?, ?)",
                    params![r.project_id, r.branch_id, r.bucket, r.table, r.source.as_str()],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn list_for_branch(
        &self,
        project_id: &str,
        branch_id: &str,
    ) -> Result<Vec<BranchTable>> {
        let (pid, bid) = (project_id.to_string(), branch_id.to_string());
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, branch_id, bucket, table_name, source \
                     FROM branch_tables WHERE project_id = ? AND branch_id = ? \
                     ORDER BY bucket, table_name",
                )?;
                let rows = stmt.query_map(params![pid, bid], |row| {
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
                    let (project_id, branch_id, bucket, table, source) = row?;
                    out.push(BranchTable {
                        project_id,
                        branch_id,
                        bucket,
                        table,
                        source: BranchSource::parse(&source)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete(
        &self,
        project_id: &str,
        branch_id: &str,
        bucket: &str,
        table: &str,
    ) -> Result<()> {
        let (pid, bid, bucket, table) = (
            project_id.to_string(),
            branch_id.to_string(),
            bucket.to_string(),
            table.to_string(),
        );
        self.shared
            .write(move |conn| {
                conn.execute(
                    "DELETE FROM branch_tables \
                     WHERE project_id = ? AND branch_id = ? AND bucket = ? AND table_name = ?",
                    params![pid, bid, bucket, table],
                )?;
                Ok(())
            })
            .await
    }
}
