//! Bucket, share, and link handlers. Buckets are project-level containers;
//! branches see every bucket of their project.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use cellar_core::{validate_bucket_name, Bucket, Error, Layout, Link, Share, Stage};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::idempotency;
use crate::state::AppState;

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateBucketRequest {
    pub name: String,
    pub stage: Stage,
}

#[derive(Debug, Serialize)]
pub struct BucketInfo {
    pub id: String,
    pub name: String,
    pub stage: Stage,
    pub directory: String,
    pub created_at: chrono::DateTime<Utc>,
    pub linked_from: Option<String>,
}

pub async fn create_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let request: CreateBucketRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;
    validate_bucket_name(&request.name)?;

    let path = format!("/projects/{project_id}/buckets");
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            state.registry().projects.require(&project_id).await?;
            let bucket = Bucket {
                project_id: project_id.clone(),
                name: request.name.clone(),
                stage: request.stage,
                created_at: Utc::now(),
            };
            state.registry().buckets.insert(&bucket).await?;
            Layout::ensure_dir(&state.engine.layout().bucket_dir(
                &project_id,
                "default",
                &bucket.dir_name(),
            ))?;
            info!(project_id = %project_id, bucket = %bucket.dir_name(), "bucket created");
            Ok((
                StatusCode::CREATED,
                serde_json::json!({
                    "id": bucket.display_id(),
                    "directory": bucket.dir_name(),
                    "stage": bucket.stage,
                    "name": bucket.name,
                }),
            ))
        },
    )
    .await
}

pub async fn list_buckets(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<BucketInfo>>, ApiError> {
    auth.require_project(&project_id)?;
    let mut out = Vec::new();
    for bucket in state.registry().buckets.list(&project_id).await? {
        out.push(BucketInfo {
            id: bucket.display_id(),
            directory: bucket.dir_name(),
            name: bucket.name,
            stage: bucket.stage,
            created_at: bucket.created_at,
            linked_from: None,
        });
    }
    for link in state.registry().links.list_for_project(&project_id).await? {
        let (stage, name) = cellar_core::parse_bucket_dir(&link.bucket)?;
        out.push(BucketInfo {
            id: cellar_core::bucket_display_id(stage, &name),
            directory: link.bucket.clone(),
            name,
            stage,
            created_at: link.created_at,
            linked_from: Some(link.src_project),
        });
    }
    Ok(Json(out))
}

/// Delete an empty bucket. Tables must be dropped first.
pub async fn delete_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket_dir)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    let bucket = state
        .registry()
        .buckets
        .require_by_dir(&project_id, &bucket_dir)
        .await?;
    let tables = state
        .registry()
        .tables
        .list(&project_id, Some(&bucket_dir))
        .await?;
    if !tables.is_empty() {
        return Err(Error::FailedPrecondition(format!(
            "bucket {bucket_dir} still holds {} table(s)",
            tables.len()
        ))
        .into());
    }
    state
        .registry()
        .buckets
        .delete(&project_id, bucket.stage, &bucket.name)
        .await?;
    let _ = std::fs::remove_dir_all(state.engine.layout().bucket_dir(
        &project_id,
        "default",
        &bucket_dir,
    ));
    info!(project_id = %project_id, bucket = %bucket_dir, "bucket deleted");
    Ok(StatusCode::NO_CONTENT)
}

// ─── Shares & links ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ShareRequest {
    pub target_project: String,
}

/// Grant another project the right to link this bucket.
pub async fn share_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket_dir)): Path<(String, String)>,
    Json(request): Json<ShareRequest>,
) -> Result<(StatusCode, Json<Share>), ApiError> {
    auth.require_project(&project_id)?;
    state
        .registry()
        .buckets
        .require_by_dir(&project_id, &bucket_dir)
        .await?;
    state
        .registry()
        .projects
        .require(&request.target_project)
        .await?;

    let share = Share {
        src_project: project_id.clone(),
        bucket: bucket_dir,
        target_project: request.target_project,
        created_at: Utc::now(),
    };
    state.registry().shares.insert(&share).await?;
    Ok((StatusCode::CREATED, Json(share)))
}

pub async fn list_shares(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Share>>, ApiError> {
    auth.require_project(&project_id)?;
    Ok(Json(
        state.registry().shares.list_for_project(&project_id).await?,
    ))
}

pub async fn unshare_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket_dir, target)): Path<(String, String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .registry()
        .shares
        .delete(&project_id, &bucket_dir, &target)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub src_project: String,
    pub src_bucket: String,
}

/// Link a shared bucket into this project under the same name. Reads pass
/// through to the source; writes are denied at the resolver.
pub async fn link_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(request): Json<LinkRequest>,
) -> Result<(StatusCode, Json<Link>), ApiError> {
    auth.require_project(&project_id)?;
    state.registry().projects.require(&project_id).await?;
    state
        .registry()
        .buckets
        .require_by_dir(&request.src_project, &request.src_bucket)
        .await?;

    if !state
        .registry()
        .shares
        .exists(&request.src_project, &request.src_bucket, &project_id)
        .await?
    {
        return Err(Error::PermissionDenied(format!(
            "bucket {} is not shared with project {project_id}",
            request.src_bucket
        ))
        .into());
    }

    let link = Link {
        target_project: project_id.clone(),
        bucket: request.src_bucket.clone(),
        src_project: request.src_project,
        src_bucket: request.src_bucket,
        created_at: Utc::now(),
    };
    state.registry().links.insert(&link).await?;
    info!(project_id = %project_id, bucket = %link.bucket, src = %link.src_project, "bucket linked");
    Ok((StatusCode::CREATED, Json(link)))
}

pub async fn list_links(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Link>>, ApiError> {
    auth.require_project(&project_id)?;
    Ok(Json(
        state.registry().links.list_for_project(&project_id).await?,
    ))
}

pub async fn unlink_bucket(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket_dir)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state.registry().links.delete(&project_id, &bucket_dir).await?;
    Ok(StatusCode::NO_CONTENT)
}
