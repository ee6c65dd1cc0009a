//! Idempotent write wrapper.
//!
//! Every write endpoint runs through [`execute`]. With no `X-Idempotency-Key`
//! header the operation just runs. With a key, the cache is consulted before
//! the table lock is ever taken: a hit with the same request fingerprint
//! replays the stored response byte-identically; a hit with a different
//! fingerprint is a conflict; a miss runs the operation and caches whatever
//! it answered, success or failure, for the TTL window.

use std::future::Future;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

use cellar_core::{Error, IdempotencyEntry};

use crate::error::{status_for, ApiError};
use crate::metrics::Metrics;
use crate::state::AppState;

pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Run a write operation with idempotency semantics.
pub async fn execute<F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
    path: &str,
    project_id: Option<&str>,
    body: &serde_json::Value,
    op: F,
) -> Result<Response, ApiError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, serde_json::Value), ApiError>>,
{
    let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        let (status, value) = op().await?;
        return Ok(json_response(status, &value.to_string()));
    };

    let canonical = serde_json::to_vec(body).unwrap_or_default();
    let fingerprint = cellar_crypto::request_fingerprint(method, path, project_id, &canonical);

    let now = Utc::now();
    if let Some(entry) = state.registry().idempotency.get(&key, &now).await? {
        if entry.fingerprint == fingerprint {
            Metrics::bump(&state.metrics.idempotency_replays);
            let status = StatusCode::from_u16(entry.status_code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            let mut response = json_response(status, &entry.response_body);
            response
                .headers_mut()
                .insert("x-idempotency-replayed", "true".parse().expect("static header"));
            return Ok(response);
        }
        Metrics::bump(&state.metrics.idempotency_conflicts);
        return Err(Error::Conflict(format!(
            "idempotency key {key:?} was used with a different request"
        ))
        .into());
    }

    // Miss: run to completion and cache the outcome, even when the caller
    // has already disconnected.
    let (status, body_text) = match op().await {
        Ok((status, value)) => (status, value.to_string()),
        Err(ApiError(err)) => {
            let class = err.class();
            let status = status_for(class);
            let body = serde_json::json!({
                "error": err.to_string(),
                "code": class.as_str(),
            })
            .to_string();
            (status, body)
        }
    };

    state
        .registry()
        .idempotency
        .put(&IdempotencyEntry {
            key,
            fingerprint,
            response_body: body_text.clone(),
            status_code: status.as_u16(),
            inserted_at: now,
        })
        .await?;

    Ok(json_response(status, &body_text))
}

fn json_response(status: StatusCode, body: &str) -> Response {
    (
        status,
        [("content-type", "application/json")],
        body.to_string(),
    )
        .into_response()
}
