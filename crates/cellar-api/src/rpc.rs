//! RPC bridge: a single `Execute` endpoint taking a tagged command envelope
//! from the external control plane and dispatching it onto core operations.
//!
//! Commands address tables with flexible paths (`[bucket]`,
//! `[project, bucket]`, or `[project, branch, bucket]`) which are
//! canonicalised once at this edge; everything downstream sees the full
//! tuple.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::{ColumnDef, Error, ExportOptions, ImportOptions, DEFAULT_BRANCH};

use crate::auth::{resolve_key, AuthContext};
use crate::error::{status_for, ApiError};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Conventionally the project id.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub principal: Option<String>,
    /// The API key.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub credentials: Credentials,
    pub command: Command,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub runtime_options: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct LogMessage {
    pub level: &'static str,
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_response: Option<serde_json::Value>,
    pub messages: Vec<LogMessage>,
}

/// Tagged command envelope. The discriminator travels as `type`, the body
/// as `payload`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Command {
    CreateProjectCommand(CreateProjectPayload),
    CreateBucketCommand(CreateBucketPayload),
    CreateBranchCommand(CreateBranchPayload),
    CreateTableCommand(CreateTablePayload),
    DropTableCommand(TablePayload),
    ImportTableCommand(ImportPayload),
    ExportTableCommand(ExportPayload),
    PreviewTableCommand(PreviewPayload),
    DeleteRowsCommand(DeleteRowsPayload),
    CreateSnapshotCommand(TablePayload),
    RestoreSnapshotCommand(SnapshotPayload),
    ListBucketsCommand(ProjectPayload),
    ListTablesCommand(BucketPayload),
    CreateWorkspaceCommand(WorkspacePayload),
}

/// Flexible table/bucket address: one, two, or three leading segments.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathSpec(pub Vec<String>);

impl PathSpec {
    /// Canonicalise to `(project, branch, bucket)`, filling the project
    /// from credentials and the branch with `default` where omitted.
    pub fn canonicalise(&self, auth_project: Option<&str>) -> Result<(String, String, String), Error> {
        match self.0.as_slice() {
            [bucket] => {
                let project = auth_project.ok_or_else(|| {
                    Error::InvalidArgument(
                        "path [bucket] needs a project in credentials".to_string(),
                    )
                })?;
                Ok((project.to_string(), DEFAULT_BRANCH.to_string(), bucket.clone()))
            }
            [project, bucket] => {
                Ok((project.clone(), DEFAULT_BRANCH.to_string(), bucket.clone()))
            }
            [project, branch, bucket] => {
                Ok((project.clone(), branch.clone(), bucket.clone()))
            }
            other => Err(Error::InvalidArgument(format!(
                "path must have 1..=3 segments, got {}",
                other.len()
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectPayload {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBucketPayload {
    #[serde(default)]
    pub project: Option<String>,
    pub name: String,
    pub stage: cellar_core::Stage,
}

#[derive(Debug, Deserialize)]
pub struct CreateBranchPayload {
    #[serde(default)]
    pub project: Option<String>,
    pub branch_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateTablePayload {
    pub path: PathSpec,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TablePayload {
    pub path: PathSpec,
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportPayload {
    pub path: PathSpec,
    pub table: String,
    #[serde(flatten)]
    pub options: ImportOptions,
}

#[derive(Debug, Deserialize)]
pub struct ExportPayload {
    pub path: PathSpec,
    pub table: String,
    #[serde(flatten)]
    pub options: ExportOptions,
}

#[derive(Debug, Deserialize)]
pub struct PreviewPayload {
    pub path: PathSpec,
    pub table: String,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteRowsPayload {
    pub path: PathSpec,
    pub table: String,
    #[serde(default)]
    pub r#where: String,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotPayload {
    pub snapshot_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ProjectPayload {
    #[serde(default)]
    pub project: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BucketPayload {
    pub path: PathSpec,
}

#[derive(Debug, Deserialize)]
pub struct WorkspacePayload {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub branch_id: Option<String>,
}

/// `POST /rpc/execute`.
pub async fn execute(
    State(state): State<AppState>,
    Json(request): Json<ExecuteRequest>,
) -> Response {
    let mut messages = Vec::new();

    let auth = match authenticate(&state, &request.credentials).await {
        Ok(auth) => auth,
        Err(e) => return rpc_error(e, messages),
    };
    let auth_project = request
        .credentials
        .host
        .clone()
        .or_else(|| auth.project_id.clone());

    let result = dispatch(&state, &auth, auth_project.as_deref(), request.command, &mut messages).await;
    match result {
        Ok(response) => Json(ExecuteResponse {
            command_response: Some(response),
            messages,
        })
        .into_response(),
        Err(e) => rpc_error(e, messages),
    }
}

async fn authenticate(state: &AppState, credentials: &Credentials) -> Result<AuthContext, ApiError> {
    let secret = credentials
        .secret
        .as_deref()
        .ok_or_else(|| ApiError(Error::Unauthenticated("credentials.secret missing".into())))?;
    resolve_key(state, secret).await
}

fn rpc_error(err: ApiError, mut messages: Vec<LogMessage>) -> Response {
    let class = err.0.class();
    messages.push(LogMessage {
        level: "error",
        text: format!("{}: {}", class.as_str(), err.0),
    });
    (
        status_for(class),
        Json(ExecuteResponse {
            command_response: None,
            messages,
        }),
    )
        .into_response()
}

async fn dispatch(
    state: &AppState,
    auth: &AuthContext,
    auth_project: Option<&str>,
    command: Command,
    messages: &mut Vec<LogMessage>,
) -> Result<serde_json::Value, ApiError> {
    match command {
        Command::CreateProjectCommand(payload) => {
            auth.require_admin()?;
            cellar_core::validate_project_id(&payload.id)?;
            let project = cellar_core::Project {
                id: payload.id.clone(),
                name: payload.name,
                description: payload.description,
                created_at: chrono::Utc::now(),
            };
            state.registry().projects.insert(&project).await?;
            let (plaintext, hash) = cellar_crypto::generate_project_key(&project.id);
            state
                .registry()
                .keys
                .insert(&cellar_core::ApiKey {
                    project_id: project.id.clone(),
                    key_hash: hash,
                    description: Some("initial project key".to_string()),
                    created_at: chrono::Utc::now(),
                })
                .await?;
            cellar_core::Layout::ensure_dir(
                &state.engine.layout().project_dir(&project.id, DEFAULT_BRANCH),
            )?;
            info!(project_id = %project.id, "rpc: project created");
            messages.push(LogMessage {
                level: "info",
                text: format!("project {} created", project.id),
            });
            Ok(serde_json::json!({ "project": project, "apiKey": plaintext }))
        }
        Command::CreateBucketCommand(payload) => {
            let project = required_project(payload.project.as_deref(), auth_project)?;
            auth.require_project(&project)?;
            let bucket = cellar_core::Bucket {
                project_id: project.clone(),
                name: payload.name,
                stage: payload.stage,
                created_at: chrono::Utc::now(),
            };
            state.registry().buckets.insert(&bucket).await?;
            cellar_core::Layout::ensure_dir(&state.engine.layout().bucket_dir(
                &project,
                DEFAULT_BRANCH,
                &bucket.dir_name(),
            ))?;
            messages.push(LogMessage {
                level: "info",
                text: format!("bucket {} created", bucket.display_id()),
            });
            Ok(serde_json::json!({ "bucket": bucket.dir_name() }))
        }
        Command::CreateBranchCommand(payload) => {
            let project = required_project(payload.project.as_deref(), auth_project)?;
            auth.require_project(&project)?;
            let branch = cellar_core::Branch {
                project_id: project.clone(),
                branch_id: payload.branch_id.clone(),
                name: payload.branch_id.clone(),
                created_at: chrono::Utc::now(),
            };
            state.registry().branches.insert(&branch).await?;
            cellar_core::Layout::ensure_dir(
                &state.engine.layout().project_dir(&project, &payload.branch_id),
            )?;
            messages.push(LogMessage {
                level: "info",
                text: format!("branch {} created", payload.branch_id),
            });
            Ok(serde_json::to_value(&branch).map_err(Error::from)?)
        }
        Command::CreateTableCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let meta = state
                .engine
                .create_table(
                    &project,
                    &branch,
                    &bucket,
                    &payload.name,
                    payload.columns,
                    payload.primary_key,
                )
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("table {bucket}.{} created", payload.name),
            });
            Ok(serde_json::to_value(&meta).map_err(Error::from)?)
        }
        Command::DropTableCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            state
                .engine
                .drop_table(&project, &branch, &bucket, &payload.table)
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("table {bucket}.{} dropped", payload.table),
            });
            Ok(serde_json::json!({ "dropped": true }))
        }
        Command::ImportTableCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let result = state
                .engine
                .import_table(&project, &branch, &bucket, &payload.table, payload.options)
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!(
                    "imported {} row(s) into {bucket}.{}",
                    result.imported_rows, payload.table
                ),
            });
            Ok(serde_json::to_value(&result).map_err(Error::from)?)
        }
        Command::ExportTableCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let info = state
                .engine
                .export_table(&project, &branch, &bucket, &payload.table, payload.options)
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("exported {} row(s)", info.rows),
            });
            Ok(serde_json::to_value(&info).map_err(Error::from)?)
        }
        Command::PreviewTableCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let preview = state
                .engine
                .preview(
                    &project,
                    &branch,
                    &bucket,
                    &payload.table,
                    payload.limit,
                    None,
                    None,
                )
                .await?;
            Ok(serde_json::to_value(&preview).map_err(Error::from)?)
        }
        Command::DeleteRowsCommand(payload) => {
            let (project, branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let deleted = state
                .engine
                .delete_rows(&project, &branch, &bucket, &payload.table, &payload.r#where)
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("deleted {deleted} row(s)"),
            });
            Ok(serde_json::json!({ "deletedRows": deleted }))
        }
        Command::CreateSnapshotCommand(payload) => {
            let (project, _branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let snapshot = state
                .engine
                .create_snapshot(&project, &bucket, &payload.table)
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("snapshot {} created", snapshot.id),
            });
            Ok(serde_json::to_value(&snapshot).map_err(Error::from)?)
        }
        Command::RestoreSnapshotCommand(payload) => {
            let snapshot = state.registry().snapshots.require(&payload.snapshot_id).await?;
            auth.require_project(&snapshot.project_id)?;
            let restored = state.engine.restore_snapshot(&payload.snapshot_id).await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("snapshot {} restored", restored.id),
            });
            Ok(serde_json::to_value(&restored).map_err(Error::from)?)
        }
        Command::ListBucketsCommand(payload) => {
            let project = required_project(payload.project.as_deref(), auth_project)?;
            auth.require_project(&project)?;
            let buckets = state.registry().buckets.list(&project).await?;
            let names: Vec<String> = buckets.iter().map(|b| b.dir_name()).collect();
            Ok(serde_json::json!({ "buckets": names }))
        }
        Command::ListTablesCommand(payload) => {
            let (project, _branch, bucket) = payload.path.canonicalise(auth_project)?;
            auth.require_project(&project)?;
            let tables = state.registry().tables.list(&project, Some(&bucket)).await?;
            let names: Vec<&String> = tables.iter().map(|t| &t.name).collect();
            Ok(serde_json::json!({ "tables": names }))
        }
        Command::CreateWorkspaceCommand(payload) => {
            let project = required_project(payload.project.as_deref(), auth_project)?;
            auth.require_project(&project)?;
            let grant = state
                .engine
                .create_workspace(
                    &project,
                    cellar_engine::workspace::WorkspaceOptions {
                        branch_id: payload.branch_id,
                        ..Default::default()
                    },
                )
                .await?;
            messages.push(LogMessage {
                level: "info",
                text: format!("workspace {} created", grant.workspace.id),
            });
            Ok(serde_json::to_value(&grant).map_err(Error::from)?)
        }
    }
}

fn required_project(explicit: Option<&str>, from_auth: Option<&str>) -> Result<String, ApiError> {
    explicit
        .or(from_auth)
        .map(str::to_string)
        .ok_or_else(|| ApiError(Error::InvalidArgument("project is required".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_canonicalisation() {
        let one = PathSpec(vec!["in_c_s".into()]);
        assert_eq!(
            one.canonicalise(Some("p1")).unwrap(),
            ("p1".into(), "default".into(), "in_c_s".into())
        );
        assert!(one.canonicalise(None).is_err());

        let two = PathSpec(vec!["p2".into(), "in_c_s".into()]);
        assert_eq!(
            two.canonicalise(Some("p1")).unwrap(),
            ("p2".into(), "default".into(), "in_c_s".into())
        );

        let three = PathSpec(vec!["p2".into(), "dev".into(), "in_c_s".into()]);
        assert_eq!(
            three.canonicalise(None).unwrap(),
            ("p2".into(), "dev".into(), "in_c_s".into())
        );

        assert!(PathSpec(vec![]).canonicalise(Some("p1")).is_err());
    }

    #[test]
    fn test_command_envelope_deserialises() {
        let raw = serde_json::json!({
            "credentials": { "host": "p1", "secret": "k" },
            "command": {
                "type": "CreateTableCommand",
                "payload": {
                    "path": ["in_c_s"],
                    "name": "orders",
                    "columns": [{"name": "id", "type": "INTEGER", "nullable": false}],
                    "primary_key": ["id"]
                }
            },
            "features": ["x"],
            "runtimeOptions": { "runId": "r1" }
        });
        let request: ExecuteRequest = serde_json::from_value(raw).unwrap();
        assert!(matches!(request.command, Command::CreateTableCommand(_)));
        assert_eq!(request.credentials.host.as_deref(), Some("p1"));
    }
}
