//! Workspace engine: per-workspace engine files with read-only attachments
//! of project tables, credentials, and session resource limits.
//!
//! A workspace is its own DuckDB file the user may write freely. On session
//! start every table visible to the owning project (or branch) is attached
//! read-only and surfaced as `<bucket>.<table>` views, so an interactive
//! client sees the project catalog without ever holding a writable handle to
//! a project file.

use chrono::{DateTime, Duration, Utc};
use duckdb::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use cellar_core::{
    defaults, quote_ident, Error, Layout, Result, Workspace, WorkspaceCredentials,
    WorkspaceStatus, DEFAULT_BRANCH,
};

use crate::{resolver, table_db, Engine};

/// Creation outcome: the password is returned exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceGrant {
    pub workspace: Workspace,
    pub username: String,
    pub password: String,
}

/// Options accepted at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceOptions {
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    #[serde(default)]
    pub size_limit_bytes: Option<i64>,
}

impl Engine {
    /// Allocate a workspace file and credentials.
    pub async fn create_workspace(
        &self,
        project: &str,
        options: WorkspaceOptions,
    ) -> Result<WorkspaceGrant> {
        self.registry.projects.require(project).await?;
        if let Some(branch) = &options.branch_id {
            self.registry.branches.require(project, branch).await?;
        }

        let id = Uuid::new_v4().simple().to_string();
        let db_path = self.layout.workspace_file(&id);
        Layout::ensure_parent(&db_path)?;

        // Materialise the file up front so a failed registry insert has
        // something concrete to compensate.
        {
            let conn = table_db::open_rw(&db_path)?;
            conn.execute_batch("CHECKPOINT")?;
        }

        let (username, password, password_hash) =
            cellar_crypto::generate_workspace_credentials(&id);
        let now = Utc::now();
        let workspace = Workspace {
            id: id.clone(),
            project_id: project.to_string(),
            branch_id: options.branch_id,
            db_path: db_path.to_string_lossy().to_string(),
            size_limit_bytes: options
                .size_limit_bytes
                .unwrap_or(defaults::WORKSPACE_SIZE_LIMIT_BYTES),
            expires_at: now + Duration::seconds(options.ttl_secs.unwrap_or(defaults::WORKSPACE_TTL_SECS)),
            status: WorkspaceStatus::Active,
            created_at: now,
        };
        let credentials = WorkspaceCredentials {
            workspace_id: id.clone(),
            username: username.clone(),
            password_hash,
        };
        if let Err(e) = self.registry.workspaces.insert(&workspace, &credentials).await {
            let _ = std::fs::remove_file(&db_path);
            return Err(e);
        }

        info!(project_id = project, workspace_id = %id, "workspace created");
        Ok(WorkspaceGrant {
            workspace,
            username,
            password,
        })
    }

    /// Delete a workspace, its credentials, sessions, and file.
    pub async fn drop_workspace(&self, workspace_id: &str) -> Result<()> {
        let workspace = self.registry.workspaces.require(workspace_id).await?;
        self.registry.workspaces.delete_cascade(workspace_id).await?;
        // Registry first, file second; an orphan file is tolerated.
        if let Err(e) = std::fs::remove_file(&workspace.db_path) {
            if std::path::Path::new(&workspace.db_path).exists() {
                warn!(workspace_id, error = %e, "workspace file removal failed");
            }
        }
        Ok(())
    }

    /// Rotate the workspace password. Live sessions stay connected; new
    /// logins need the new password.
    pub async fn reset_workspace_password(&self, workspace_id: &str) -> Result<WorkspaceGrant> {
        let workspace = self.registry.workspaces.require(workspace_id).await?;
        let credentials = self
            .registry
            .workspaces
            .credentials(workspace_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("workspace {workspace_id} has no credentials")))?;

        let (_, password, password_hash) = cellar_crypto::generate_workspace_credentials(workspace_id);
        self.registry
            .workspaces
            .reset_password(workspace_id, &password_hash)
            .await?;
        info!(workspace_id, "workspace password reset");
        Ok(WorkspaceGrant {
            workspace,
            username: credentials.username,
            password,
        })
    }

    /// Verify pg-wire login material and return the workspace, failing
    /// closed on expired or errored workspaces.
    pub async fn authenticate_workspace(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Workspace> {
        let credentials = self
            .registry
            .workspaces
            .credentials_by_username(username)
            .await?
            .ok_or_else(|| Error::Unauthenticated("unknown workspace user".to_string()))?;
        if !cellar_crypto::verify_password(password, &credentials.password_hash) {
            return Err(Error::Unauthenticated("password mismatch".to_string()));
        }
        let workspace = self.registry.workspaces.require(&credentials.workspace_id).await?;
        if workspace.status != WorkspaceStatus::Active || workspace.expires_at < Utc::now() {
            return Err(Error::FailedPrecondition(format!(
                "workspace {} is not active",
                workspace.id
            )));
        }
        Ok(workspace)
    }

    /// Janitor entry point: flag active workspaces past their TTL.
    pub async fn expire_workspaces(&self, now: &DateTime<Utc>) -> Result<usize> {
        let expired = self.registry.workspaces.expired(now).await?;
        let count = expired.len();
        for workspace in expired {
            self.registry
                .workspaces
                .set_status(&workspace.id, WorkspaceStatus::Expired)
                .await?;
            info!(workspace_id = %workspace.id, "workspace expired");
        }
        Ok(count)
    }

    /// Open a session connection on the workspace file: resource knobs set,
    /// every visible project table attached read-only under
    /// `<bucket>.<table>`.
    pub async fn open_workspace_session(&self, workspace: &Workspace) -> Result<Connection> {
        let db_path = std::path::Path::new(&workspace.db_path);
        if table_db::file_size(db_path) > workspace.size_limit_bytes {
            return Err(Error::ResourceExhausted(format!(
                "workspace {} exceeds its size limit",
                workspace.id
            )));
        }

        let temp_dir = self.layout.root().join("workspaces").join(format!("tmp_{}", workspace.id));
        Layout::ensure_dir(&temp_dir)?;
        let conn = table_db::open_rw(db_path)?;
        conn.execute_batch(&format!(
            "SET memory_limit = '{}'; SET temp_directory = '{}'; \
             SET max_temp_directory_size = '{}';",
            defaults::SESSION_MEMORY_LIMIT,
            temp_dir.to_string_lossy().replace('\'', "''"),
            defaults::SESSION_TEMP_LIMIT
        ))?;

        for statement in self.session_attach_plan(workspace).await? {
            conn.execute_batch(&statement)?;
        }
        Ok(conn)
    }

    /// The ATTACH/view statements making the project catalog visible.
    pub async fn session_attach_plan(&self, workspace: &Workspace) -> Result<Vec<String>> {
        let project = &workspace.project_id;
        let branch = workspace.branch_id.as_deref().unwrap_or(DEFAULT_BRANCH);

        // Visible tables: every main table (branch rows override location),
        // branch-only tables, and tables of linked buckets.
        let mut entries: Vec<(String, String)> = Vec::new();
        for meta in self.registry.tables.list(project, None).await? {
            entries.push((meta.bucket, meta.name));
        }
        if branch != DEFAULT_BRANCH {
            for row in self
                .registry
                .branch_tables
                .list_for_branch(project, branch)
                .await?
            {
                if !entries.iter().any(|(b, t)| b == &row.bucket && t == &row.table) {
                    entries.push((row.bucket, row.table));
                }
            }
        }
        for link in self.registry.links.list_for_project(project).await? {
            for meta in self
                .registry
                .tables
                .list(&link.src_project, Some(&link.src_bucket))
                .await?
            {
                entries.push((link.bucket.clone(), meta.name));
            }
        }

        let mut statements = Vec::new();
        for (idx, (bucket, table)) in entries.iter().enumerate() {
            let resolved = match resolver::resolve_read(
                &self.registry,
                &self.layout,
                project,
                branch,
                bucket,
                table,
            )
            .await
            {
                Ok(r) => r,
                // A registry row without a file is an invariant breach for
                // writers, but a session bootstrap just skips it.
                Err(Error::NotFound(_)) | Err(Error::Internal(_)) => continue,
                Err(e) => return Err(e),
            };
            let alias = format!("__src_{idx}");
            statements.push(format!(
                "ATTACH '{}' AS {} (READ_ONLY);",
                resolved.path.to_string_lossy().replace('\'', "''"),
                quote_ident(&alias)
            ));
            statements.push(format!(
                "CREATE SCHEMA IF NOT EXISTS {};",
                quote_ident(bucket)
            ));
            statements.push(format!(
                "CREATE OR REPLACE VIEW {}.{} AS SELECT * FROM {}.{};",
                quote_ident(bucket),
                quote_ident(table),
                quote_ident(&alias),
                quote_ident(table)
            ));
        }
        Ok(statements)
    }

    /// Post-statement guard used by the pg-wire session loop.
    pub fn workspace_within_limit(&self, workspace: &Workspace) -> bool {
        table_db::file_size(std::path::Path::new(&workspace.db_path)) <= workspace.size_limit_bytes
    }
}
