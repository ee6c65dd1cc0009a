//! On-disk path layout.
//!
//! Single owner of the directory invariant:
//!
//! ```text
//! <data_root>/
//!   metadata.db
//!   project_<P>/                         # default branch
//!     <stage>_c_<name>/<table>.db
//!   project_<P>_branch_<B>/              # dev branch
//!     <stage>_c_<name>/<table>.db
//!   _staging/<uuid>.db
//!   snapshots/project_<P>/snap_<T>_<ts>/
//!   files/project_<P>/staging/<upload_key>
//!   files/project_<P>/YYYY/MM/DD/<file_id>.<name>
//! ```
//!
//! All directories are created mode 0700; the process user owns all data.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};

use crate::error::Result;
use crate::models::DEFAULT_BRANCH;

/// Maps logical identifiers to filesystem paths under one data root.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The metadata registry file.
    pub fn registry_path(&self) -> PathBuf {
        self.root.join("metadata.db")
    }

    /// Project root for a branch. `default` maps to the main directory.
    pub fn project_dir(&self, project: &str, branch: &str) -> PathBuf {
        if branch == DEFAULT_BRANCH {
            self.root.join(format!("project_{project}"))
        } else {
            self.root.join(format!("project_{project}_branch_{branch}"))
        }
    }

    /// Bucket directory; `bucket` is the directory name (`{stage}_c_{name}`).
    pub fn bucket_dir(&self, project: &str, branch: &str, bucket: &str) -> PathBuf {
        self.project_dir(project, branch).join(bucket)
    }

    /// The engine file backing one table.
    pub fn table_file(&self, project: &str, branch: &str, bucket: &str, table: &str) -> PathBuf {
        self.bucket_dir(project, branch, bucket)
            .join(format!("{table}.db"))
    }

    /// Import staging database, always under the data root.
    pub fn staging_file(&self, id: &str) -> PathBuf {
        self.root.join("_staging").join(format!("{id}.db"))
    }

    /// Snapshot artifact directory for one snapshot of one table.
    pub fn snapshot_dir(&self, project: &str, table: &str, ts: &DateTime<Utc>) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("project_{project}"))
            .join(format!("snap_{table}_{}", ts.format("%Y%m%d%H%M%S%f")))
    }

    /// File-store root for one project.
    pub fn files_dir(&self, project: &str) -> PathBuf {
        self.root.join("files").join(format!("project_{project}"))
    }

    /// Staging location for an in-flight upload.
    pub fn file_staging_path(&self, project: &str, upload_key: &str) -> PathBuf {
        self.files_dir(project).join("staging").join(upload_key)
    }

    /// Final date-tree location of a registered file.
    pub fn file_storage_path(
        &self,
        project: &str,
        date: &DateTime<Utc>,
        file_id: &str,
        name: &str,
    ) -> PathBuf {
        self.files_dir(project)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{file_id}.{name}"))
    }

    /// Object storage location for the S3-compatible surface:
    /// bucket `project_<P>`, key `<key>`.
    pub fn s3_object_path(&self, project: &str, key: &str) -> PathBuf {
        self.files_dir(project).join("s3").join(key)
    }

    /// Workspace database file.
    pub fn workspace_file(&self, workspace_id: &str) -> PathBuf {
        self.root
            .join("workspaces")
            .join(format!("workspace_{workspace_id}.db"))
    }

    /// Create a directory (and parents) with owner-only permissions.
    pub fn ensure_dir(path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }

    /// Ensure the parent directory of a file path exists, mode 0700.
    pub fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_branch_maps_to_main_dir() {
        let layout = Layout::new("/data");
        assert_eq!(
            layout.table_file("p1", "default", "in_c_s", "orders"),
            PathBuf::from("/data/project_p1/in_c_s/orders.db")
        );
    }

    #[test]
    fn test_dev_branch_gets_own_dir() {
        let layout = Layout::new("/data");
        assert_eq!(
            layout.table_file("p1", "dev", "in_c_s", "orders"),
            PathBuf::from("/data/project_p1_branch_dev/in_c_s/orders.db")
        );
    }

    #[test]
    fn test_staging_is_under_root() {
        let layout = Layout::new("/data");
        let p = layout.staging_file("abc");
        assert!(p.starts_with("/data/_staging"));
        assert!(p.to_string_lossy().ends_with("abc.db"));
    }

    #[test]
    fn test_file_storage_path_uses_date_tree() {
        let layout = Layout::new("/data");
        let date = DateTime::parse_from_rfc3339("2026-03-09T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let p = layout.file_storage_path("p1", &date, "f42", "a.csv");
        assert_eq!(
            p,
            PathBuf::from("/data/files/project_p1/2026/03/09/f42.a.csv")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_ensure_dir_sets_owner_only_mode() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/deep");
        Layout::ensure_dir(&dir).unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
