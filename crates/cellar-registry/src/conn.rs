//! Registry connection discipline.
//!
//! One writer connection per process, serialized behind an async mutex. Read
//! paths briefly take the same mutex only to clone a cursor onto the shared
//! engine instance, then run unserialised. Registry writes and per-table file
//! writes are never part of one transaction; components compensate on partial
//! failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use duckdb::Connection;
use tokio::sync::Mutex;

use cellar_core::{Error, Result};

/// Shared state behind every repository handle.
pub struct RegistryShared {
    writer: Mutex<Connection>,
    path: PathBuf,
}

impl RegistryShared {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            Error::Internal(format!("cannot open registry {}: {e}", path.display()))
        })?;
        Ok(Self {
            writer: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// In-memory registry for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            writer: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run a closure with the writer connection. Serialized process-wide.
    pub async fn write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send,
        R: Send,
    {
        let mut guard = self.writer.lock().await;
        f(&mut guard)
    }

    /// Run a closure with a read cursor cloned off the shared instance.
    ///
    /// The writer lock is held only for the clone, not for the query.
    pub async fn read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send,
        R: Send,
    {
        let cursor = {
            let guard = self.writer.lock().await;
            guard.try_clone()?
        };
        f(&cursor)
    }
}

/// Shared handle type every repository stores.
pub type Shared = Arc<RegistryShared>;

/// Collapse `QueryReturnedNoRows` into `None`.
pub(crate) fn optional<T>(result: duckdb::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse an RFC 3339 timestamp column.
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("bad timestamp {raw:?} in registry: {e}")))
}

/// Serialize a timestamp for storage. Fixed microsecond precision keeps
/// lexicographic TEXT comparison consistent with time order.
pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
