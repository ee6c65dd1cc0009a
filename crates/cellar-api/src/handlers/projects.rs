//! Project and API key management handlers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::{validate_project_id, ApiKey, Error, Layout, Project};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::idempotency;
use crate::state::AppState;

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateProjectRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Create a project plus its first API key. Admin only; the key plaintext
/// appears exactly once, in this response.
pub async fn create_project(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_admin()?;
    let request: CreateProjectRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;
    validate_project_id(&request.id)?;

    idempotency::execute(
        &state,
        &headers,
        "POST",
        "/projects",
        None,
        &body,
        || async {
            let project = Project {
                id: request.id.clone(),
                name: request.name.clone(),
                description: request.description.clone(),
                created_at: Utc::now(),
            };
            state.registry().projects.insert(&project).await?;

            let (plaintext, hash) = cellar_crypto::generate_project_key(&project.id);
            state
                .registry()
                .keys
                .insert(&ApiKey {
                    project_id: project.id.clone(),
                    key_hash: hash,
                    description: Some("initial project key".to_string()),
                    created_at: Utc::now(),
                })
                .await?;

            let project_dir = state.engine.layout().project_dir(&project.id, "default");
            Layout::ensure_dir(&project_dir)?;

            info!(project_id = %project.id, "project created");
            Ok((
                StatusCode::CREATED,
                serde_json::json!({
                    "project": project,
                    "api_key": plaintext,
                }),
            ))
        },
    )
    .await
}

pub async fn list_projects(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Json<Vec<Project>>, ApiError> {
    auth.require_admin()?;
    Ok(Json(state.registry().projects.list().await?))
}

pub async fn get_project(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    auth.require_project(&project_id)?;
    Ok(Json(state.registry().projects.require(&project_id).await?))
}

/// Hard delete: registry cascade first, then the project's directory trees.
pub async fn delete_project(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    auth.require_admin()?;
    let branches = state.registry().branches.list(&project_id).await?;
    state.registry().projects.delete_cascade(&project_id).await?;

    let layout = state.engine.layout();
    let mut dirs = vec![
        layout.project_dir(&project_id, "default"),
        layout.files_dir(&project_id),
        layout.root().join("snapshots").join(format!("project_{project_id}")),
    ];
    for branch in branches {
        dirs.push(layout.project_dir(&project_id, &branch.branch_id));
    }
    for dir in dirs {
        let _ = std::fs::remove_dir_all(dir);
    }

    info!(project_id = %project_id, "project deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub description: Option<String>,
}

pub async fn create_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    auth.require_admin()?;
    state.registry().projects.require(&project_id).await?;

    let (plaintext, hash) = cellar_crypto::generate_project_key(&project_id);
    state
        .registry()
        .keys
        .insert(&ApiKey {
            project_id: project_id.clone(),
            key_hash: hash.clone(),
            description: request.description,
            created_at: Utc::now(),
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "api_key": plaintext, "key_hash": hash })),
    ))
}

#[derive(Debug, Serialize)]
pub struct KeyInfo {
    pub key_hash: String,
    pub description: Option<String>,
    pub created_at: chrono::DateTime<Utc>,
}

pub async fn list_keys(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<KeyInfo>>, ApiError> {
    auth.require_project(&project_id)?;
    let keys = state.registry().keys.list_for_project(&project_id).await?;
    Ok(Json(
        keys.into_iter()
            .map(|k| KeyInfo {
                key_hash: k.key_hash,
                description: k.description,
                created_at: k.created_at,
            })
            .collect(),
    ))
}

/// Revocation removes the row; the old key fails closed immediately.
pub async fn revoke_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, key_hash)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_admin()?;
    state.registry().keys.revoke(&project_id, &key_hash).await?;
    info!(project_id = %project_id, "api key revoked");
    Ok(StatusCode::NO_CONTENT)
}

// ─── Branches ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateBranchRequest {
    pub branch_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

pub async fn create_branch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let request: CreateBranchRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;
    cellar_core::validate_branch_id(&request.branch_id)?;
    if request.branch_id == cellar_core::DEFAULT_BRANCH {
        return Err(Error::InvalidArgument("the default branch always exists".into()).into());
    }

    let path = format!("/projects/{project_id}/branches");
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            state.registry().projects.require(&project_id).await?;
            let branch = cellar_core::Branch {
                project_id: project_id.clone(),
                branch_id: request.branch_id.clone(),
                name: request.name.clone().unwrap_or_else(|| request.branch_id.clone()),
                created_at: Utc::now(),
            };
            state.registry().branches.insert(&branch).await?;
            Layout::ensure_dir(
                &state
                    .engine
                    .layout()
                    .project_dir(&project_id, &request.branch_id),
            )?;
            info!(project_id = %project_id, branch_id = %request.branch_id, "branch created");
            Ok((StatusCode::CREATED, serde_json::to_value(&branch)?))
        },
    )
    .await
}

pub async fn list_branches(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<cellar_core::Branch>>, ApiError> {
    auth.require_project(&project_id)?;
    Ok(Json(state.registry().branches.list(&project_id).await?))
}

/// Delete a branch: divergence rows cascade, then the branch directory.
pub async fn delete_branch(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    if branch_id == cellar_core::DEFAULT_BRANCH {
        return Err(Error::InvalidArgument("the default branch cannot be deleted".into()).into());
    }
    state
        .registry()
        .branches
        .delete_cascade(&project_id, &branch_id)
        .await?;
    let _ = std::fs::remove_dir_all(state.engine.layout().project_dir(&project_id, &branch_id));
    info!(project_id = %project_id, branch_id = %branch_id, "branch deleted");
    Ok(StatusCode::NO_CONTENT)
}
