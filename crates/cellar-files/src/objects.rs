//! Flat object storage for the S3-compatible surface.
//!
//! Bucket `project_<P>` maps onto `files/project_<P>/s3/` and keys are
//! storage-relative paths below it. ETags are the hex MD5 of the stored
//! bytes, computed on demand.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cellar_core::{Error, Layout, Result};

/// Metadata for one stored object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub key: String,
    pub size_bytes: i64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// List result: matched objects plus delimiter-grouped common prefixes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOutcome {
    pub objects: Vec<ObjectMeta>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct ObjectStore {
    layout: Layout,
}

impl ObjectStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// Store an object, replacing any previous content. Atomic via
    /// temp-then-rename. Returns the new ETag.
    pub async fn put(&self, project: &str, key: &str, data: &[u8]) -> Result<ObjectMeta> {
        validate_key(key)?;
        let path = self.layout.s3_object_path(project, key);
        Layout::ensure_parent(&path)?;

        let tmp = path.with_extension("part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size_bytes: data.len() as i64,
            etag: etag_of(data),
            last_modified: Utc::now(),
        })
    }

    pub async fn get(&self, project: &str, key: &str) -> Result<(Vec<u8>, ObjectMeta)> {
        validate_key(key)?;
        let path = self.layout.s3_object_path(project, key);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(format!("object {key}")))?;
        let meta = self.meta_for(key, &path, &data).await?;
        Ok((data, meta))
    }

    pub async fn head(&self, project: &str, key: &str) -> Result<ObjectMeta> {
        validate_key(key)?;
        let path = self.layout.s3_object_path(project, key);
        let data = tokio::fs::read(&path)
            .await
            .map_err(|_| Error::NotFound(format!("object {key}")))?;
        self.meta_for(key, &path, &data).await
    }

    /// Returns whether an object was actually removed.
    pub async fn delete(&self, project: &str, key: &str) -> Result<bool> {
        validate_key(key)?;
        let path = self.layout.s3_object_path(project, key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// ListObjectsV2 semantics: lexicographic keys filtered by prefix, with
    /// optional delimiter grouping and a max-keys cap.
    pub async fn list(
        &self,
        project: &str,
        prefix: &str,
        delimiter: Option<&str>,
        max_keys: usize,
    ) -> Result<ListOutcome> {
        let root = self.layout.s3_object_path(project, "");
        let mut keys = Vec::new();
        collect_keys(&root, &root, &mut keys)?;
        keys.sort();

        let mut outcome = ListOutcome::default();
        let mut seen_prefixes = std::collections::BTreeSet::new();
        for key in keys.into_iter().filter(|k| k.starts_with(prefix)) {
            if outcome.objects.len() + seen_prefixes.len() >= max_keys {
                outcome.truncated = true;
                break;
            }
            if let Some(delim) = delimiter {
                let rest = &key[prefix.len()..];
                if let Some(pos) = rest.find(delim) {
                    seen_prefixes.insert(format!("{prefix}{}{delim}", &rest[..pos]));
                    continue;
                }
            }
            let path = self.layout.s3_object_path(project, &key);
            let data = tokio::fs::read(&path).await?;
            outcome.objects.push(self.meta_for(&key, &path, &data).await?);
        }
        outcome.common_prefixes = seen_prefixes.into_iter().collect();
        Ok(outcome)
    }

    async fn meta_for(
        &self,
        key: &str,
        path: &std::path::Path,
        data: &[u8],
    ) -> Result<ObjectMeta> {
        let modified = tokio::fs::metadata(path)
            .await?
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ObjectMeta {
            key: key.to_string(),
            size_bytes: data.len() as i64,
            etag: etag_of(data),
            last_modified: modified,
        })
    }
}

/// Hex MD5, as S3 ETags for non-multipart objects.
pub fn etag_of(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > 1024 {
        return Err(Error::InvalidArgument("invalid object key".to_string()));
    }
    if key.starts_with('/')
        || key
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(Error::InvalidArgument(format!("invalid object key {key:?}")));
    }
    Ok(())
}

fn collect_keys(
    root: &std::path::Path,
    dir: &std::path::Path,
    keys: &mut Vec<String>,
) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_keys(root, &path, keys)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            keys.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        (dir, ObjectStore::new(layout))
    }

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let (_dir, store) = store();
        let body = b"a,b\n1,2";
        let put = store.put("p1", "data/a.csv", body).await.unwrap();
        assert_eq!(put.size_bytes, 7);
        assert_eq!(put.etag, etag_of(body));

        let (data, meta) = store.get("p1", "data/a.csv").await.unwrap();
        assert_eq!(data, body);
        assert_eq!(meta.etag, put.etag);

        let head = store.head("p1", "data/a.csv").await.unwrap();
        assert_eq!(head.size_bytes, 7);

        assert!(store.delete("p1", "data/a.csv").await.unwrap());
        assert!(!store.delete("p1", "data/a.csv").await.unwrap());
        assert!(store.get("p1", "data/a.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_list_with_prefix_and_delimiter() {
        let (_dir, store) = store();
        store.put("p1", "data/a.csv", b"1").await.unwrap();
        store.put("p1", "data/sub/b.csv", b"2").await.unwrap();
        store.put("p1", "other/c.csv", b"3").await.unwrap();

        let all = store.list("p1", "data/", None, 1000).await.unwrap();
        assert_eq!(all.objects.len(), 2);
        assert!(all.objects.iter().any(|o| o.key == "data/a.csv"));

        let grouped = store.list("p1", "data/", Some("/"), 1000).await.unwrap();
        assert_eq!(grouped.objects.len(), 1);
        assert_eq!(grouped.common_prefixes, vec!["data/sub/"]);

        let capped = store.list("p1", "", None, 2).await.unwrap();
        assert!(capped.truncated);
        assert_eq!(capped.objects.len(), 2);
    }

    #[tokio::test]
    async fn test_key_validation() {
        let (_dir, store) = store();
        assert!(store.put("p1", "../escape", b"x").await.is_err());
        assert!(store.put("p1", "/abs", b"x").await.is_err());
        assert!(store.put("p1", "a//b", b"x").await.is_err());
        assert!(store.put("p1", "ok/key.txt", b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_project_isolation() {
        let (_dir, store) = store();
        store.put("p1", "k.txt", b"one").await.unwrap();
        assert!(store.get("p2", "k.txt").await.is_err());
    }
}
