//! Snapshot handlers: manual snapshots, listing, restore, deletion, and the
//! hierarchical trigger/retention configuration.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;

use cellar_core::settings::SettingScope;
use cellar_core::{Error, ScopeChain, Snapshot, SnapshotKind};

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::idempotency;
use crate::metrics::Metrics;
use crate::state::AppState;

pub async fn create_snapshot(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket, table)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let path = format!("/projects/{project_id}/buckets/{bucket}/tables/{table}/snapshots");
    let body = serde_json::json!({});
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            let snapshot = state
                .engine
                .create_snapshot(&project_id, &bucket, &table)
                .await?;
            Metrics::bump(&state.metrics.snapshots_created);
            Ok((StatusCode::CREATED, serde_json::to_value(&snapshot)?))
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct SnapshotListParams {
    pub bucket: Option<String>,
    pub table: Option<String>,
    pub kind: Option<String>,
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Query(params): Query<SnapshotListParams>,
) -> Result<Json<Vec<Snapshot>>, ApiError> {
    auth.require_project(&project_id)?;
    let kind = params.kind.as_deref().map(SnapshotKind::parse).transpose()?;
    let snapshots = state
        .registry()
        .snapshots
        .list(
            &project_id,
            params.bucket.as_deref(),
            params.table.as_deref(),
            kind,
        )
        .await?;
    Ok(Json(snapshots))
}

pub async fn restore_snapshot(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, snapshot_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let path = format!("/projects/{project_id}/snapshots/{snapshot_id}/restore");
    let body = serde_json::json!({});
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            let snapshot = state.registry().snapshots.require(&snapshot_id).await?;
            if snapshot.project_id != project_id {
                return Err(Error::NotFound(format!("snapshot {snapshot_id}")).into());
            }
            let restored = state.engine.restore_snapshot(&snapshot_id).await?;
            Ok((StatusCode::OK, serde_json::to_value(&restored)?))
        },
    )
    .await
}

pub async fn delete_snapshot(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, snapshot_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    let snapshot = state.registry().snapshots.require(&snapshot_id).await?;
    if snapshot.project_id != project_id {
        return Err(Error::NotFound(format!("snapshot {snapshot_id}")).into());
    }
    state.engine.delete_snapshot(&snapshot_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Settings ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetSettingRequest {
    pub scope: SettingScope,
    /// `""` for system scope, `<project>` for project scope,
    /// `<project>/<bucket>` for bucket, `<project>/<bucket>/<table>` for table.
    pub scope_key: String,
    pub setting: String,
    pub value: serde_json::Value,
}

const RECOGNISED_SETTINGS: &[&str] = &[
    "auto_snapshot_triggers",
    "manual_retention_days",
    "auto_retention_days",
];

pub async fn set_setting(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(project_id): Path<String>,
    Json(request): Json<SetSettingRequest>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    if !RECOGNISED_SETTINGS.contains(&request.setting.as_str()) {
        return Err(Error::InvalidArgument(format!(
            "unknown setting {:?}",
            request.setting
        ))
        .into());
    }
    // System scope needs the admin key; everything else must stay inside
    // the caller's project.
    match request.scope {
        SettingScope::System => auth.require_admin()?,
        _ => {
            let owner = request.scope_key.split('/').next().unwrap_or_default();
            if owner != project_id {
                return Err(Error::PermissionDenied(
                    "scope key is outside the project".to_string(),
                )
                .into());
            }
        }
    }
    state
        .registry()
        .settings
        .set(request.scope, &request.scope_key, &request.setting, &request.value)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// The effective snapshot configuration for one table, after walking
/// table → bucket → project → system.
pub async fn effective_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, bucket, table)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let config = state
        .engine
        .snapshot_config(&project_id, &bucket, &table)
        .await?;
    let mut triggers: Vec<&String> = config.auto_triggers.iter().collect();
    triggers.sort();
    let chain = ScopeChain::for_table(&project_id, &bucket, &table);
    let scopes: Vec<String> = chain
        .iter()
        .map(|(scope, key)| format!("{}:{}", scope.as_str(), key))
        .collect();
    Ok(Json(serde_json::json!({
        "auto_snapshot_triggers": triggers,
        "manual_retention_days": config.manual_retention_days,
        "auto_retention_days": config.auto_retention_days,
        "resolution_order": scopes,
    })))
}
