//! Workspace handlers: creation (credentials shown once), listing, deletion,
//! and credential reset.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use cellar_core::{Error, PgSession, Workspace};
use cellar_engine::workspace::WorkspaceOptions;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WorkspaceCreated {
    #[serde(flatten)]
    pub workspace: Workspace,
    pub username: String,
    /// Shown exactly once.
    pub password: String,
    pub database: String,
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(options): Json<WorkspaceOptions>,
) -> Result<(StatusCode, Json<WorkspaceCreated>), ApiError> {
    auth.require_project(&project_id)?;
    let grant = state.engine.create_workspace(&project_id, options).await?;
    let database = format!("workspace_{}", grant.workspace.id);
    Ok((
        StatusCode::CREATED,
        Json(WorkspaceCreated {
            workspace: grant.workspace,
            username: grant.username,
            password: grant.password,
            database,
        }),
    ))
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Workspace>>, ApiError> {
    auth.require_project(&project_id)?;
    Ok(Json(state.registry().workspaces.list(&project_id).await?))
}

pub async fn get(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, workspace_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let workspace = state.registry().workspaces.require(&workspace_id).await?;
    if workspace.project_id != project_id {
        return Err(Error::NotFound(format!("workspace {workspace_id}")).into());
    }
    let sessions: Vec<PgSession> = state
        .registry()
        .workspaces
        .sessions_for_workspace(&workspace_id)
        .await?;
    Ok(Json(serde_json::json!({
        "workspace": workspace,
        "sessions": sessions,
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, workspace_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    let workspace = state.registry().workspaces.require(&workspace_id).await?;
    if workspace.project_id != project_id {
        return Err(Error::NotFound(format!("workspace {workspace_id}")).into());
    }
    state.engine.drop_workspace(&workspace_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Rotate the password. Live sessions stay; new logins need the new secret.
pub async fn reset_credentials(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, workspace_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let workspace = state.registry().workspaces.require(&workspace_id).await?;
    if workspace.project_id != project_id {
        return Err(Error::NotFound(format!("workspace {workspace_id}")).into());
    }
    let grant = state.engine.reset_workspace_password(&workspace_id).await?;
    Ok(Json(serde_json::json!({
        "workspace_id": workspace_id,
        "username": grant.username,
        "password": grant.password,
    })))
}
