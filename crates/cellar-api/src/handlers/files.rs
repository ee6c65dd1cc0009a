//! File store handlers: prepare/upload/register, listing, download, delete.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use cellar_core::FileEntry;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PrepareRequest {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn prepare(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(request): Json<PrepareRequest>,
) -> Result<(StatusCode, Json<cellar_files::PrepareOutcome>), ApiError> {
    auth.require_project(&project_id)?;
    state.registry().projects.require(&project_id).await?;
    let outcome = state
        .files
        .prepare(&project_id, &request.name, request.tags)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub key: String,
}

pub async fn upload(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, file_id)): Path<(String, String)>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let (size, sha256) = state
        .files
        .upload(&project_id, &file_id, &params.key, &body)
        .await?;
    Ok(Json(serde_json::json!({
        "file_id": file_id,
        "size_bytes": size,
        "sha256": sha256,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub sha256: Option<String>,
}

pub async fn register(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, file_id)): Path<(String, String)>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<FileEntry>, ApiError> {
    auth.require_project(&project_id)?;
    let entry = state
        .files
        .register(&project_id, &file_id, request.sha256.as_deref())
        .await?;
    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub tag: Option<String>,
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<FileEntry>>, ApiError> {
    auth.require_project(&project_id)?;
    let files = state
        .registry()
        .files
        .list(&project_id, params.tag.as_deref())
        .await?;
    Ok(Json(files))
}

pub async fn get(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<Json<FileEntry>, ApiError> {
    auth.require_project(&project_id)?;
    let entry = state.registry().files.require(&file_id).await?;
    if entry.project_id != project_id {
        return Err(cellar_core::Error::NotFound(format!("file {file_id}")).into());
    }
    Ok(Json(entry))
}

/// Stream the stored bytes back with strong validators.
pub async fn download(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let (entry, path) = state.files.download_path(&project_id, &file_id).await?;
    let data = tokio::fs::read(&path).await.map_err(cellar_core::Error::from)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        "application/octet-stream".parse().expect("static header"),
    );
    if let Ok(value) = format!("\"{}\"", entry.sha256).parse() {
        headers.insert("etag", value);
    }
    if let Ok(value) = format!("attachment; filename=\"{}\"", entry.name).parse() {
        headers.insert("content-disposition", value);
    }
    Ok((StatusCode::OK, headers, data).into_response())
}

pub async fn delete(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, file_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state.files.delete(&project_id, &file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Quota usage derived on demand from the registry and filesystem.
pub async fn usage(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let (count, bytes) = state.registry().files.usage(&project_id).await?;
    Ok(Json(serde_json::json!({
        "files_count": count,
        "files_bytes": bytes,
        "files_count_limit": cellar_core::defaults::FILES_MAX_COUNT,
        "files_bytes_limit": cellar_core::defaults::FILES_MAX_BYTES,
    })))
}
