//! Table handlers: DDL, row writes, deletion, preview, profile, and the
//! import/export pipeline endpoints. All branch-scoped.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use cellar_core::{ColumnDef, Error, ExportOptions, ImportOptions, TableMeta};
use cellar_engine::profile::ProfileMode;

use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::idempotency;
use crate::metrics::Metrics;
use crate::state::AppState;

type TableAddr = Path<(String, String, String, String)>;

#[derive(Debug, Deserialize, Serialize)]
pub struct CreateTableRequest {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
}

pub async fn create_table(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let request: CreateTableRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;

    let path = format!("/projects/{project_id}/branches/{branch_id}/buckets/{bucket}/tables");
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            let meta = state
                .engine
                .create_table(
                    &project_id,
                    &branch_id,
                    &bucket,
                    &request.name,
                    request.columns.clone(),
                    request.primary_key.clone(),
                )
                .await?;
            Ok((StatusCode::CREATED, serde_json::to_value(&meta)?))
        },
    )
    .await
}

#[derive(Debug, Serialize)]
pub struct TableListEntry {
    #[serde(flatten)]
    pub meta: TableMeta,
    /// main | branch | branch_only, from the branch's point of view.
    pub source: String,
}

pub async fn list_tables(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket)): Path<(String, String, String)>,
) -> Result<Json<Vec<TableListEntry>>, ApiError> {
    auth.require_project(&project_id)?;

    // A linked bucket lists the source project's tables, read-only.
    if state
        .registry()
        .buckets
        .get_by_dir(&project_id, &bucket)
        .await?
        .is_none()
    {
        let link = state
            .registry()
            .links
            .get(&project_id, &bucket)
            .await?
            .ok_or_else(|| Error::NotFound(format!("bucket {bucket}")))?;
        let mut out = Vec::new();
        for meta in state
            .registry()
            .tables
            .list(&link.src_project, Some(&link.src_bucket))
            .await?
        {
            out.push(TableListEntry {
                meta,
                source: "main".to_string(),
            });
        }
        return Ok(Json(out));
    }

    let mut out = Vec::new();
    for meta in state.registry().tables.list(&project_id, Some(&bucket)).await? {
        let source = if branch_id == cellar_core::DEFAULT_BRANCH {
            "main".to_string()
        } else {
            state
                .registry()
                .branch_tables
                .get(&project_id, &branch_id, &bucket, &meta.name)
                .await?
                .map(|row| row.source.as_str().to_string())
                .unwrap_or_else(|| "main".to_string())
        };
        out.push(TableListEntry { meta, source });
    }

    if branch_id != cellar_core::DEFAULT_BRANCH {
        for row in state
            .registry()
            .branch_tables
            .list_for_branch(&project_id, &branch_id)
            .await?
        {
            if row.bucket != bucket || out.iter().any(|e| e.meta.name == row.table) {
                continue;
            }
            // Branch-only tables have no registry row; introspect the file.
            let resolved = state
                .engine
                .resolve_read(&project_id, &branch_id, &bucket, &row.table)
                .await?;
            let conn = cellar_engine::table_db::open_ro(&resolved.path)?;
            let (columns, primary_key) = cellar_engine::table_db::read_schema(&conn, &row.table)?;
            let row_count = cellar_engine::table_db::row_count(&conn, &row.table)?;
            out.push(TableListEntry {
                meta: TableMeta {
                    project_id: project_id.clone(),
                    bucket: bucket.clone(),
                    name: row.table.clone(),
                    columns,
                    primary_key,
                    row_count_cache: row_count,
                    size_bytes_cache: cellar_engine::table_db::file_size(&resolved.path),
                    created_at: chrono::Utc::now(),
                },
                source: row.source.as_str().to_string(),
            });
        }
    }
    Ok(Json(out))
}

pub async fn get_table(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
) -> Result<Json<serde_json::Value>, ApiError> {
    auth.require_project(&project_id)?;
    let resolved = state
        .engine
        .resolve_read(&project_id, &branch_id, &bucket, &table)
        .await?;
    let conn = cellar_engine::table_db::open_ro(&resolved.path)?;
    let (columns, primary_key) = cellar_engine::table_db::read_schema(&conn, &table)?;
    let row_count = cellar_engine::table_db::row_count(&conn, &table)?;
    Ok(Json(serde_json::json!({
        "project_id": project_id,
        "bucket": bucket,
        "name": table,
        "columns": columns,
        "primary_key": primary_key,
        "row_count": row_count,
        "size_bytes": cellar_engine::table_db::file_size(&resolved.path),
        "source": resolved.source,
    })))
}

pub async fn drop_table(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .drop_table(&project_id, &branch_id, &bucket, &table)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct AddColumnRequest {
    #[serde(flatten)]
    pub column: ColumnDef,
}

pub async fn add_column(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    Json(request): Json<AddColumnRequest>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .add_column(&project_id, &branch_id, &bucket, &table, request.column)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn drop_column(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table, column)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .drop_column(&project_id, &branch_id, &bucket, &table, &column)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AlterColumnRequest {
    #[serde(default)]
    pub rename_to: Option<String>,
    #[serde(default, rename = "type")]
    pub new_type: Option<String>,
}

pub async fn alter_column(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table, column)): Path<(
        String,
        String,
        String,
        String,
        String,
    )>,
    Json(request): Json<AlterColumnRequest>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .alter_column(
            &project_id,
            &branch_id,
            &bucket,
            &table,
            &column,
            request.rename_to.as_deref(),
            request.new_type.as_deref(),
        )
        .await?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
pub struct PrimaryKeyRequest {
    pub columns: Vec<String>,
}

pub async fn add_primary_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    Json(request): Json<PrimaryKeyRequest>,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .add_primary_key(&project_id, &branch_id, &bucket, &table, request.columns)
        .await?;
    Ok(StatusCode::CREATED)
}

pub async fn drop_primary_key(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
) -> Result<StatusCode, ApiError> {
    auth.require_project(&project_id)?;
    state
        .engine
        .drop_primary_key(&project_id, &branch_id, &bucket, &table)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InsertRowsRequest {
    pub rows: Vec<serde_json::Map<String, serde_json::Value>>,
}

pub async fn insert_rows(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let request: InsertRowsRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;

    let path =
        format!("/projects/{project_id}/branches/{branch_id}/buckets/{bucket}/tables/{table}/rows");
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            let inserted = state
                .engine
                .insert_rows(&project_id, &branch_id, &bucket, &table, request.rows.clone())
                .await?;
            Ok((
                StatusCode::CREATED,
                serde_json::json!({ "inserted_rows": inserted }),
            ))
        },
    )
    .await
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DeleteRowsRequest {
    /// SQL predicate; empty, `true`, or `1=1` deletes everything.
    #[serde(default)]
    pub r#where: String,
}

pub async fn delete_rows(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let request: DeleteRowsRequest = serde_json::from_value(body.clone()).map_err(Error::from)?;

    let path =
        format!("/projects/{project_id}/branches/{branch_id}/buckets/{bucket}/tables/{table}/rows");
    idempotency::execute(
        &state,
        &headers,
        "DELETE",
        &path,
        Some(&project_id),
        &body,
        || async {
            let deleted = state
                .engine
                .delete_rows(&project_id, &branch_id, &bucket, &table, &request.r#where)
                .await?;
            Ok((
                StatusCode::OK,
                serde_json::json!({ "deleted_rows": deleted }),
            ))
        },
    )
    .await
}

#[derive(Debug, Deserialize)]
pub struct PreviewParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Comma-separated column list.
    pub columns: Option<String>,
}

pub async fn preview(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    Query(params): Query<PreviewParams>,
) -> Result<Json<cellar_engine::table::Preview>, ApiError> {
    auth.require_project(&project_id)?;
    let columns = params
        .columns
        .map(|raw| raw.split(',').map(|c| c.trim().to_string()).collect());
    let preview = state
        .engine
        .preview(
            &project_id,
            &branch_id,
            &bucket,
            &table,
            params.limit,
            params.offset,
            columns,
        )
        .await?;
    Ok(Json(preview))
}

#[derive(Debug, Deserialize)]
pub struct ProfileParams {
    pub mode: Option<String>,
    pub columns: Option<String>,
}

pub async fn profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    Query(params): Query<ProfileParams>,
) -> Result<Json<cellar_engine::profile::TableProfile>, ApiError> {
    auth.require_project(&project_id)?;
    let mode = match params.mode.as_deref() {
        None => ProfileMode::Quality,
        Some(raw) => ProfileMode::parse(raw)?,
    };
    let columns = params
        .columns
        .map(|raw| raw.split(',').map(|c| c.trim().to_string()).collect());
    let profile = state
        .engine
        .profile_table(&project_id, &branch_id, &bucket, &table, columns, mode)
        .await?;
    Ok(Json(profile))
}

pub async fn import_table(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    auth.require_project(&project_id)?;
    let options: ImportOptions = serde_json::from_value(body.clone()).map_err(Error::from)?;

    let path = format!(
        "/projects/{project_id}/branches/{branch_id}/buckets/{bucket}/tables/{table}/import"
    );
    idempotency::execute(
        &state,
        &headers,
        "POST",
        &path,
        Some(&project_id),
        &body,
        || async {
            let result = state
                .engine
                .import_table(&project_id, &branch_id, &bucket, &table, options.clone())
                .await?;
            Metrics::bump(&state.metrics.imports_total);
            Ok((StatusCode::OK, serde_json::to_value(&result)?))
        },
    )
    .await
}

pub async fn export_table(
    State(state): State<AppState>,
    auth: AuthContext,
    Path((project_id, branch_id, bucket, table)): TableAddr,
    Json(options): Json<ExportOptions>,
) -> Result<Json<cellar_engine::export::ExportInfo>, ApiError> {
    auth.require_project(&project_id)?;
    let info = state
        .engine
        .export_table(&project_id, &branch_id, &bucket, &table, options)
        .await?;
    Ok(Json(info))
}
