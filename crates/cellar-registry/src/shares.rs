//! Bucket share and link repositories.
//!
//! A share grants a target project the right to link a bucket; a link makes
//! the source bucket appear inside the target project under the same name.
//! Reads on a linked bucket pass through to the source; writes are denied at
//! the resolver.

use duckdb::params;

use cellar_core::{Error, Link, Result, Share};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct ShareRepo {
    shared: Shared,
}

impl ShareRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, share: &Share) -> Result<()> {
        let s = share.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO shares (src_project, bucket, target_project, created_at) \
                     VALUES (?, ?, ?, ?)",
                    params![s.src_project, s.bucket, s.target_project, fmt_ts(&s.created_at)],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())?;
                Ok(())
            })
            .await
    }

    pub async fn exists(
        &self,
        src_project: &str,
        bucket: &str,
        target_project: &str,
    ) -> Result<bool> {
        let (src, bucket, target) = (
            src_project.to_string(),
            bucket.to_string(),
            target_project.to_string(),
        );
        self.shared
            .read(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT count(*) FROM shares \
                     WHERE src_project = ? AND bucket = ? AND target_project = ?",
                    params![src, bucket, target],
                    |row| row.get(0),
                )?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn list_for_project(&self, src_project: &str) -> Result<Vec<Share>> {
        let src = src_project.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT src_project, bucket, target_project, created_at FROM shares \
                     WHERE src_project = ? ORDER BY bucket, target_project",
                )?;
                let rows = stmt.query_map(params![src], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (src_project, bucket, target_project, created_at) = row?;
                    out.push(Share {
                        src_project,
                        bucket,
                        target_project,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete(
        &self,
        src_project: &str,
        bucket: &str,
        target_project: &str,
    ) -> Result<()> {
        let (src, bucket, target) = (
            src_project.to_string(),
            bucket.to_string(),
            target_project.to_string(),
        );
        self.shared
            .write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM shares \
                     WHERE src_project = ? AND bucket = ? AND target_project = ?",
                    params![src, bucket, target],
                )?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("share of {bucket}")));
                }
                Ok(())
            })
            .await
    }
}

#[derive(Clone)]
pub struct LinkRepo {
    shared: Shared,
}

impl LinkRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, link: &Link) -> Result<()> {
        let l = link.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO links (target_project, bucket, src_project, src_bucket, created_at) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        l.target_project,
                        l.bucket,
                        l.src_project,
                        l.src_bucket,
                        fmt_ts(&l.created_at)
                    ],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())
                .map_err(|e| match e {
                    Error::Conflict(_) => Error::Conflict(format!(
                        "bucket {} is already linked into project {}",
                        l.bucket, l.target_project
                    )),
                    other => other,
                })?;
                Ok(())
            })
            .await
    }

    /// Look up a link by the name it appears under in the target project.
    pub async fn get(&self, target_project: &str, bucket: &str) -> Result<Option<Link>> {
        let (target, bucket) = (target_project.to_string(), bucket.to_string());
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT target_project, bucket, src_project, src_bucket, created_at \
                     FROM links WHERE target_project = ? AND bucket = ?",
                    params![target, bucket],
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
                row.map(|(target_project, bucket, src_project, src_bucket, created_at)| {
                    Ok(Link {
                        target_project,
                        bucket,
                        src_project,
                        src_bucket,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    pub async fn list_for_project(&self, target_project: &str) -> Result<Vec<Link>> {
        let target = target_project.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT target_project, bucket, src_project, src_bucket, created_at \
                     FROM links WHERE target_project = ? ORDER BY bucket",
                )?;
                let rows = stmt.query_map(params![target], |row| {
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
                    let (target_project, bucket, src_project, src_bucket, created_at) = row?;
                    out.push(Link {
                        target_project,
                        bucket,
                        src_project,
                        src_bucket,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete(&self, target_project: &str, bucket: &str) -> Result<()> {
        let (target, bucket) = (target_project.to_string(), bucket.to_string());
        self.shared
            .write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM links WHERE target_project = ? AND bucket = ?",
                    params![target, bucket],
                )?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("link {bucket}")));
                }
                Ok(())
            })
            .await
    }
}
