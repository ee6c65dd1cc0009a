//! Managed file store: prepare → upload → register.
//!
//! `prepare` allocates a staged registry row and an upload key; `upload`
//! streams bytes into the staging area computing SHA-256 as it goes;
//! `register` verifies, enforces quotas, and moves the file into its final
//! date-tree location. Staged uploads past their window are reaped by the
//! janitor.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use cellar_core::{defaults, Error, FileEntry, Layout, Result};
use cellar_registry::Registry;

/// Handle returned by `prepare`. The upload key doubles as the staging
/// file name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareOutcome {
    pub file_id: String,
    pub upload_key: String,
    pub staging_path: String,
    pub staged_until: DateTime<Utc>,
}

#[derive(Clone)]
pub struct FilesStore {
    registry: Registry,
    layout: Layout,
}

impl FilesStore {
    pub fn new(registry: Registry, layout: Layout) -> Self {
        Self { registry, layout }
    }

    /// Stage a new upload slot. Rejects early when the file-count quota is
    /// already exhausted; the byte quota is enforced at `register` when the
    /// size is known.
    pub async fn prepare(
        &self,
        project: &str,
        name: &str,
        tags: Vec<String>,
    ) -> Result<PrepareOutcome> {
        let name = sanitize_name(name)?;
        let (count, _) = self.registry.files.usage(project).await?;
        if count >= defaults::FILES_MAX_COUNT {
            return Err(Error::ResourceExhausted(format!(
                "project {project} is at its file-count quota"
            )));
        }

        let file_id = Uuid::new_v4().simple().to_string();
        let upload_key = Uuid::new_v4().simple().to_string();
        let staging_abs = self.layout.file_staging_path(project, &upload_key);
        Layout::ensure_parent(&staging_abs)?;
        let staging_rel = relative_to_root(&self.layout, &staging_abs);
        let staged_until = Utc::now() + Duration::seconds(defaults::STAGED_UPLOAD_TTL_SECS);

        self.registry
            .files
            .insert(&FileEntry {
                id: file_id.clone(),
                project_id: project.to_string(),
                name,
                size_bytes: 0,
                sha256: String::new(),
                tags,
                storage_path: staging_rel.clone(),
                created_at: Utc::now(),
                staged_until: Some(staged_until),
            })
            .await?;

        Ok(PrepareOutcome {
            file_id,
            upload_key,
            staging_path: staging_rel,
            staged_until,
        })
    }

    /// Write uploaded bytes into the staging slot. Returns `(size, sha256)`.
    pub async fn upload(
        &self,
        project: &str,
        file_id: &str,
        upload_key: &str,
        data: &[u8],
    ) -> Result<(i64, String)> {
        let entry = self.require_staged(project, file_id).await?;
        let staging_abs = self.layout.root().join(&entry.storage_path);
        if staging_abs
            .file_name()
            .map(|n| n.to_string_lossy() != upload_key)
            .unwrap_or(true)
        {
            return Err(Error::PermissionDenied("upload key mismatch".to_string()));
        }

        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hex::encode(hasher.finalize());

        // Atomic write: temp file + rename.
        let tmp = staging_abs.with_extension("part");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &staging_abs).await?;

        Ok((data.len() as i64, digest))
    }

    /// Finalise an upload: verify the digest, enforce quotas, move into the
    /// date tree, and promote the registry row.
    pub async fn register(
        &self,
        project: &str,
        file_id: &str,
        client_sha256: Option<&str>,
    ) -> Result<FileEntry> {
        let entry = self.require_staged(project, file_id).await?;
        let staging_abs = self.layout.root().join(&entry.storage_path);
        if !staging_abs.exists() {
            return Err(Error::FailedPrecondition(format!(
                "file {file_id} has no uploaded bytes"
            )));
        }

        let data = tokio::fs::read(&staging_abs).await?;
        let size = data.len() as i64;
        let digest = hex::encode(Sha256::digest(&data));
        if let Some(expected) = client_sha256 {
            if !expected.eq_ignore_ascii_case(&digest) {
                return Err(Error::FailedPrecondition(format!(
                    "SHA-256 mismatch for file {file_id}"
                )));
            }
        }

        let (count, bytes) = self.registry.files.usage(project).await?;
        if count >= defaults::FILES_MAX_COUNT {
            return Err(Error::ResourceExhausted(format!(
                "project {project} is at its file-count quota"
            )));
        }
        if bytes + size > defaults::FILES_MAX_BYTES {
            return Err(Error::ResourceExhausted(format!(
                "project {project} is at its storage quota"
            )));
        }

        let now = Utc::now();
        let final_abs = self
            .layout
            .file_storage_path(project, &now, file_id, &entry.name);
        Layout::ensure_parent(&final_abs)?;
        tokio::fs::rename(&staging_abs, &final_abs).await?;

        let final_rel = relative_to_root(&self.layout, &final_abs);
        if let Err(e) = self
            .registry
            .files
            .promote(file_id, &final_rel, size, &digest)
            .await
        {
            // Register failed after the move: put the bytes back so the
            // staged upload stays resumable.
            let _ = tokio::fs::rename(&final_abs, &staging_abs).await;
            return Err(e);
        }

        info!(project_id = project, file_id, size_bytes = size, "file registered");
        self.registry.files.require(file_id).await
    }

    /// Absolute path of a registered file for download streaming.
    pub async fn download_path(&self, project: &str, file_id: &str) -> Result<(FileEntry, std::path::PathBuf)> {
        let entry = self.registry.files.require(file_id).await?;
        if entry.project_id != project {
            return Err(Error::PermissionDenied(format!(
                "file {file_id} belongs to another project"
            )));
        }
        if entry.staged_until.is_some() {
            return Err(Error::FailedPrecondition(format!("file {file_id} is not registered")));
        }
        let path = self.layout.root().join(&entry.storage_path);
        if !path.exists() {
            return Err(Error::NotFound(format!("file {file_id} data is missing")));
        }
        Ok((entry, path))
    }

    /// Delete a file: registry row first, then bytes (orphans tolerated).
    pub async fn delete(&self, project: &str, file_id: &str) -> Result<()> {
        let entry = self.registry.files.require(file_id).await?;
        if entry.project_id != project {
            return Err(Error::PermissionDenied(format!(
                "file {file_id} belongs to another project"
            )));
        }
        self.registry.files.delete(file_id).await?;
        let path = self.layout.root().join(&entry.storage_path);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if path.exists() {
                warn!(file_id, error = %e, "file bytes removal failed; orphan left");
            }
        }
        Ok(())
    }

    /// Janitor entry point: drop staged uploads past their window.
    pub async fn reap_staged(&self, now: &DateTime<Utc>) -> Result<usize> {
        let expired = self.registry.files.expired_staged(now).await?;
        let mut reaped = 0;
        for entry in expired {
            let path = self.layout.root().join(&entry.storage_path);
            let _ = tokio::fs::remove_file(&path).await;
            self.registry.files.delete(&entry.id).await?;
            reaped += 1;
        }
        Ok(reaped)
    }

    async fn require_staged(&self, project: &str, file_id: &str) -> Result<FileEntry> {
        let entry = self.registry.files.require(file_id).await?;
        if entry.project_id != project {
            return Err(Error::PermissionDenied(format!(
                "file {file_id} belongs to another project"
            )));
        }
        if entry.staged_until.is_none() {
            return Err(Error::FailedPrecondition(format!(
                "file {file_id} is already registered"
            )));
        }
        Ok(entry)
    }
}

/// File names keep their extension but never path components.
fn sanitize_name(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > 255 {
        return Err(Error::InvalidArgument("invalid file name".to_string()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') || trimmed == "." || trimmed == ".." {
        return Err(Error::InvalidArgument(format!("invalid file name {raw:?}")));
    }
    Ok(trimmed.to_string())
}

fn relative_to_root(layout: &Layout, path: &std::path::Path) -> String {
    path.strip_prefix(layout.root())
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> (tempfile::TempDir, FilesStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let registry = Registry::open(&layout.registry_path()).await.unwrap();
        registry
            .projects
            .insert(&cellar_core::Project {
                id: "p1".into(),
                name: "p1".into(),
                description: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let store = FilesStore::new(registry, layout);
        (dir, store)
    }

    #[tokio::test]
    async fn test_prepare_upload_register_roundtrip() {
        let (_dir, store) = fixture().await;
        let prep = store.prepare("p1", "a.csv", vec!["raw".into()]).await.unwrap();

        let body = b"a,b\n1,2\n";
        let (size, digest) = store
            .upload("p1", &prep.file_id, &prep.upload_key, body)
            .await
            .unwrap();
        assert_eq!(size, body.len() as i64);

        let entry = store
            .register("p1", &prep.file_id, Some(&digest))
            .await
            .unwrap();
        assert!(entry.staged_until.is_none());
        assert!(entry.storage_path.contains("files/project_p1/"));

        let (_, path) = store.download_path("p1", &prep.file_id).await.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), body);
    }

    #[tokio::test]
    async fn test_register_rejects_digest_mismatch() {
        let (_dir, store) = fixture().await;
        let prep = store.prepare("p1", "a.csv", vec![]).await.unwrap();
        store
            .upload("p1", &prep.file_id, &prep.upload_key, b"payload")
            .await
            .unwrap();

        let err = store
            .register("p1", &prep.file_id, Some("deadbeef"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), cellar_core::ErrorClass::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_upload_requires_matching_key() {
        let (_dir, store) = fixture().await;
        let prep = store.prepare("p1", "a.csv", vec![]).await.unwrap();
        let err = store
            .upload("p1", &prep.file_id, "wrong-key", b"data")
            .await
            .unwrap_err();
        assert_eq!(err.class(), cellar_core::ErrorClass::PermissionDenied);
    }

    #[tokio::test]
    async fn test_reap_staged_removes_expired_uploads() {
        let (_dir, store) = fixture().await;
        let prep = store.prepare("p1", "a.csv", vec![]).await.unwrap();
        store
            .upload("p1", &prep.file_id, &prep.upload_key, b"data")
            .await
            .unwrap();

        // Not yet expired.
        assert_eq!(store.reap_staged(&Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + Duration::seconds(defaults::STAGED_UPLOAD_TTL_SECS + 60);
        assert_eq!(store.reap_staged(&later).await.unwrap(), 1);
        assert!(store.download_path("p1", &prep.file_id).await.is_err());
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("data.csv").unwrap(), "data.csv");
        assert!(sanitize_name("../x").is_err());
        assert!(sanitize_name("a/b").is_err());
        assert!(sanitize_name("").is_err());
    }
}
