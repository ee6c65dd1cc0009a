//! API key repository.
//!
//! Keys are stored as hex SHA-256 hashes only. Rotation is revoke-and-create;
//! a revoked key fails closed on the next request.

use duckdb::params;

use cellar_core::{ApiKey, Error, Result};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct ApiKeyRepo {
    shared: Shared,
}

impl ApiKeyRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    pub async fn insert(&self, key: &ApiKey) -> Result<()> {
        let k = key.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO api_keys (project_id, key_hash, description, created_at) \
                     VALUES (?, ?, ?, ?)",
                    params![k.project_id, k.key_hash, k.description, fmt_ts(&k.created_at)],
                )
                .map_err(|e| Error::from(e).reclassify_constraint())?;
                Ok(())
            })
            .await
    }

    /// Resolve a presented key hash to its owning project.
    pub async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>> {
        let hash = key_hash.to_string();
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT project_id, key_hash, description, created_at \
                     FROM api_keys WHERE key_hash = ?",
                    params![hash],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                ))?;
                row.map(|(project_id, key_hash, description, created_at)| {
                    Ok(ApiKey {
                        project_id,
                        key_hash,
                        description,
                        created_at: parse_ts(&created_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    pub async fn list_for_project(&self, project_id: &str) -> Result<Vec<ApiKey>> {
        let pid = project_id.to_string();
        self.shared
            .read(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT project_id, key_hash, description, created_at \
                     FROM api_keys WHERE project_id = ? ORDER BY created_at",
                )?;
                let rows = stmt.query_map(params![pid], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (project_id, key_hash, description, created_at) = row?;
                    out.push(ApiKey {
                        project_id,
                        key_hash,
                        description,
                        created_at: parse_ts(&created_at)?,
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Revoke one key. Returns NotFound if no such key exists on the project.
    pub async fn revoke(&self, project_id: &str, key_hash: &str) -> Result<()> {
        let pid = project_id.to_string();
        let hash = key_hash.to_string();
        self.shared
            .write(move |conn| {
                let removed = conn.execute(
                    "DELETE FROM api_keys WHERE project_id = ? AND key_hash = ?",
                    params![pid, hash],
                )?;
                if removed == 0 {
                    return Err(Error::NotFound("api key".to_string()));
                }
                Ok(())
            })
            .await
    }

    /// Stable signing secret for the project's pre-signed URLs: the hash of
    /// its oldest live key. Plaintext keys are never stored, so the hash is
    /// the key material; revoking that key invalidates outstanding URLs.
    pub async fn signing_key(&self, project_id: &str) -> Result<String> {
        let keys = self.list_for_project(project_id).await?;
        keys.into_iter()
            .next()
            .map(|k| k.key_hash)
            .ok_or_else(|| {
                Error::FailedPrecondition(format!("project {project_id} has no API key"))
            })
    }
}
