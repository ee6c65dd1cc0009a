//! Idempotency cache repository.
//!
//! Entries live for ten minutes. The janitor purges lapsed rows; lookups also
//! ignore them so a slow sweep never resurrects a stale response.

use chrono::{DateTime, Duration, Utc};
use duckdb::params;

use cellar_core::{defaults, IdempotencyEntry, Result};

use crate::conn::{fmt_ts, optional, parse_ts, Shared};

#[derive(Clone)]
pub struct IdempotencyRepo {
    shared: Shared,
}

impl IdempotencyRepo {
    pub(crate) fn new(shared: Shared) -> Self {
        Self { shared }
    }

    /// Fetch a live cache entry. Expired rows read as misses.
    pub async fn get(&self, key: &str, now: &DateTime<Utc>) -> Result<Option<IdempotencyEntry>> {
        let key = key.to_string();
        let floor = fmt_ts(&(*now - Duration::seconds(defaults::IDEMPOTENCY_TTL_SECS)));
        self.shared
            .read(move |conn| {
                let row = optional(conn.query_row(
                    "SELECT key, fingerprint, response_body, status_code, inserted_at \
                     FROM idempotency WHERE key = ? AND inserted_at >= ?",
                    params![key, floor],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i32>(3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                ))?;
                row.map(|(key, fingerprint, response_body, status, inserted_at)| {
                    Ok(IdempotencyEntry {
                        key,
                        fingerprint,
                        response_body,
                        status_code: status as u16,
                        inserted_at: parse_ts(&inserted_at)?,
                    })
                })
                .transpose()
            })
            .await
    }

    /// Store (or refresh) the cached response for a key.
    pub async fn put(&self, entry: &IdempotencyEntry) -> Result<()> {
        let e = entry.clone();
        self.shared
            .write(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO idempotency \
                     (key, fingerprint, response_body, status_code, inserted_at) \
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        e.key,
                        e.fingerprint,
                        e.response_body,
                        e.status_code as i32,
                        fmt_ts(&e.inserted_at)
                    ],
                )?;
                Ok(())
            })
            .await
    }

    /// Remove entries older than the TTL. Returns how many were purged.
    pub async fn purge_expired(&self, now: &DateTime<Utc>) -> Result<usize> {
        let floor = fmt_ts(&(*now - Duration::seconds(defaults::IDEMPOTENCY_TTL_SECS)));
        self.shared
            .write(move |conn| {
                let purged = conn.execute(
                    "DELETE FROM idempotency WHERE inserted_at < ?",
                    params![floor],
                )?;
                Ok(purged)
            })
            .await
    }
}
