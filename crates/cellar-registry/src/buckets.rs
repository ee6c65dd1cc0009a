//! Bucket repository.

use duckdb::params;

use cellar_core::{Bucket, Error, Result, Stage};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct BucketRepo {
    shared: Shared,
}

impl BucketRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, bucket: &Bucket) -> Result<()> {
        let b = bucket.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO buckets (project_id, name, stage, created_at) VALUES (?, ?, ?, ?)",
                    params![b.project_id, b.name, b.stage.as_str(), fmt_ts(&b.created_at)],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())
                .map_err(|e| match e {
                    Error::Conflict(_) => {
                        Error::Conflict(format!("bucket {} already exists", b.display_id()))
                    }
                    other => other,
                })?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, project_id: &str, stage: Stage, name: &str) -> Result<Option<Bucket>> {
        let pid = project_id.to_string();
        let name = name.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT project_id, name, stage, created_at FROM buckets \
                     WHERE project_id = ? AND stage = ? AND name = ?",
                    params![pid, stage.as_str(), name],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                ))?;
                row.map(Self::hydrate).transpose()
            })
            .await
    }

    /// Fetch a bucket by its directory name (`in_c_sales`).
    pub async fn get_by_dir(&self, project_id: &str, dir: &str) -> Result<Option<Bucket>> {
        let (stage, name) = cellar_core::parse_bucket_dir(dir)?;
        self.get(project_id, stage, &name).await
    }

    pub async fn require_by_dir(&self, project_id: &str, dir: &str) -> Result<Bucket> {
        self.get_by_dir(project_id, dir)
            .await?
            .ok_or_else(|| Error::NotFound(format!("bucket {dir} in project {project_id}")))
    }

    pub async fn list(&self, project_id: &str) -> Result<Vec<Bucket>> {
        let pid = project_id.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, name, stage, created_at FROM buckets \
                     WHERE project_id = ? ORDER BY stage, name",
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
                    out.push(Self::hydrate(row?)?);
                }
                Ok(out)
            })
            .await
    }

    pub async fn delete(&self, project_id: &str, stage: Stage, name: &str) -> Result<()> {
        let pid = project_id.to_string();
        let name = name.to_string();
        self.shared
            .write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM buckets WHERE project_id = ? AND stage = ? AND name = ?",
                    params![pid, stage.as_str(), name],
                )?;
                if removed == 0 {
                    return Err(Error::NotFound(format!("bucket {}_c_{name}", stage.as_str())));
                }
                Ok(())
            })
            .await
    }

    fn hydrate(raw: (String, String, String, String)) -> Result<Bucket> {
        let (project_id, name, stage, created_at) = raw;
        Ok(Bucket {
            project_id,
            name,
            stage: Stage::parse(&stage)?,
            created_at: parse_ts(&created_at)?,
        })
    }
}
