//! # cellar-api
//!
//! HTTP transport for cellar: the REST API, the S3-compatible surface, the
//! RPC bridge, and the health/metrics endpoints, assembled into one axum
//! router over the lifecycle-owned application state.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod metrics;
pub mod rpc;
pub mod s3;
pub mod state;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::state::AppState;

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(RequestId::new(id))
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Deep health: the registry answers and the data root is present.
async fn health_deep(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let projects = state.registry().projects.list().await?;
    let data_root_ok = state.engine.layout().root().is_dir();
    Ok(Json(serde_json::json!({
        "status": if data_root_ok { "ok" } else { "degraded" },
        "projects": projects.len(),
        "data_root": state.engine.layout().root().display().to_string(),
    })))
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    let text = state.metrics.render(&state.engine);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        text,
    )
        .into_response()
}

/// Request accounting plus the global rate limit. Health and metrics stay
/// reachable under pressure.
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    if !matches!(path.as_str(), "/health" | "/health/deep" | "/metrics") {
        if let Some(limiter) = &state.rate_limiter {
            if limiter.check().is_err() {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(serde_json::json!({
                        "error": "rate limit exceeded",
                        "code": "ResourceExhausted",
                    })),
                )
                    .into_response();
            }
        }
    }
    Metrics::bump(&state.metrics.requests_total);
    let response = next.run(request).await;
    if response.status().is_server_error() {
        Metrics::bump(&state.metrics.requests_failed);
    }
    response
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    use handlers::{buckets, files, projects, snapshots, tables, workspaces};

    Router::new()
        // Health & metrics (unauthenticated)
        .route("/health", get(health))
        .route("/health/deep", get(health_deep))
        .route("/metrics", get(metrics_endpoint))
        // Projects & keys
        .route("/projects", post(projects::create_project).get(projects::list_projects))
        .route(
            "/projects/:project",
            get(projects::get_project).delete(projects::delete_project),
        )
        .route(
            "/projects/:project/keys",
            post(projects::create_key).get(projects::list_keys),
        )
        .route("/projects/:project/keys/:hash", delete(projects::revoke_key))
        // Branches
        .route(
            "/projects/:project/branches",
            post(projects::create_branch).get(projects::list_branches),
        )
        .route(
            "/projects/:project/branches/:branch",
            delete(projects::delete_branch),
        )
        // Buckets, shares, links
        .route(
            "/projects/:project/buckets",
            post(buckets::create_bucket).get(buckets::list_buckets),
        )
        .route("/projects/:project/buckets/link", post(buckets::link_bucket))
        .route("/projects/:project/buckets/links", get(buckets::list_links))
        .route("/projects/:project/buckets/:bucket", delete(buckets::delete_bucket))
        .route(
            "/projects/:project/buckets/:bucket/link",
            delete(buckets::unlink_bucket),
        )
        .route(
            "/projects/:project/buckets/:bucket/share",
            post(buckets::share_bucket),
        )
        .route(
            "/projects/:project/buckets/:bucket/share/:target",
            delete(buckets::unshare_bucket),
        )
        .route("/projects/:project/shares", get(buckets::list_shares))
        // Tables (branch-scoped)
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables",
            post(tables::create_table).get(tables::list_tables),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table",
            get(tables::get_table).delete(tables::drop_table),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/columns",
            post(tables::add_column),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/columns/:column",
            put(tables::alter_column).delete(tables::drop_column),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/primary-key",
            post(tables::add_primary_key).delete(tables::drop_primary_key),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/rows",
            post(tables::insert_rows).delete(tables::delete_rows),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/preview",
            get(tables::preview),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/profile",
            get(tables::profile),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/import",
            post(tables::import_table),
        )
        .route(
            "/projects/:project/branches/:branch/buckets/:bucket/tables/:table/export",
            post(tables::export_table),
        )
        // Snapshots & settings
        .route(
            "/projects/:project/buckets/:bucket/tables/:table/snapshots",
            post(snapshots::create_snapshot),
        )
        .route(
            "/projects/:project/buckets/:bucket/tables/:table/snapshot-config",
            get(snapshots::effective_config),
        )
        .route("/projects/:project/snapshots", get(snapshots::list_snapshots))
        .route(
            "/projects/:project/snapshots/:snapshot/restore",
            post(snapshots::restore_snapshot),
        )
        .route(
            "/projects/:project/snapshots/:snapshot",
            delete(snapshots::delete_snapshot),
        )
        .route(
            "/projects/:project/snapshot-settings",
            put(snapshots::set_setting),
        )
        // Files
        .route("/projects/:project/files/prepare", post(files::prepare))
        .route("/projects/:project/files/usage", get(files::usage))
        .route("/projects/:project/files", get(files::list))
        .route(
            "/projects/:project/files/:file",
            get(files::get).delete(files::delete),
        )
        .route("/projects/:project/files/:file/upload", put(files::upload))
        .route("/projects/:project/files/:file/register", post(files::register))
        .route("/projects/:project/files/:file/download", get(files::download))
        // Workspaces
        .route(
            "/projects/:project/workspaces",
            post(workspaces::create).get(workspaces::list),
        )
        .route(
            "/projects/:project/workspaces/:workspace",
            get(workspaces::get).delete(workspaces::delete),
        )
        .route(
            "/projects/:project/workspaces/:workspace/reset-credentials",
            post(workspaces::reset_credentials),
        )
        // S3-compatible surface
        .route("/s3/:bucket", get(s3::list_objects))
        .route("/s3/:bucket/presign", post(s3::presign))
        // `get` serves HEAD too; the handler branches on the real method.
        .route(
            "/s3/:bucket/*key",
            get(s3::get_object)
                .put(s3::put_object)
                .delete(s3::delete_object),
        )
        // RPC bridge
        .route("/rpc/execute", post(rpc::execute))
        // Layers
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuidV7))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
