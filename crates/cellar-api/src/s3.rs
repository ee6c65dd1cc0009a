//! S3-compatible object surface.
//!
//! Bucket = `project_<id>`, key = storage-relative path. Accepted
//! authentication: `Authorization: Bearer`, `X-Api-Key`, or a pre-signed
//! URL (`?signature=…&expires=…`, HMAC-SHA256 over method/bucket/key/expires
//! keyed by the project's API key material). AWS Signature V4 is rejected
//! with `SignatureVersionNotSupported`. Responses are S3-shaped XML where
//! the protocol requires it, JSON elsewhere.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;

use cellar_core::{Error, ErrorClass};

use crate::auth::{presented_key, resolve_key, AuthContext};
use crate::error::ApiError;
use crate::metrics::Metrics;
use crate::state::AppState;

/// `project_<id>` → project id.
fn bucket_project(bucket: &str) -> Result<&str, ApiError> {
    bucket
        .strip_prefix("project_")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError(Error::NotFound(format!("bucket {bucket}"))))
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_error(status: StatusCode, code: &str, message: &str) -> Response {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <Error><Code>{}</Code><Message>{}</Message></Error>",
        xml_escape(code),
        xml_escape(message)
    );
    (status, [("content-type", "application/xml")], body).into_response()
}

/// Render a core error as an S3 XML error document.
fn render_s3_error(err: ApiError) -> Response {
    let class = err.0.class();
    let (status, code) = match class {
        ErrorClass::NotFound => (StatusCode::NOT_FOUND, "NoSuchKey"),
        ErrorClass::Unauthenticated => (StatusCode::UNAUTHORIZED, "AccessDenied"),
        ErrorClass::PermissionDenied => (StatusCode::FORBIDDEN, "AccessDenied"),
        ErrorClass::InvalidArgument => (StatusCode::BAD_REQUEST, "InvalidArgument"),
        ErrorClass::ResourceExhausted => (StatusCode::SERVICE_UNAVAILABLE, "SlowDown"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    };
    xml_error(status, code, &err.0.to_string())
}

/// Resolve the caller for one S3 request. Pre-signed URLs short-circuit;
/// SigV4 fails with its own code; otherwise the normal key headers apply.
async fn s3_auth(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    method: &str,
    bucket: &str,
    key: &str,
) -> Result<AuthContext, Response> {
    let project = match bucket_project(bucket) {
        Ok(p) => p.to_string(),
        Err(e) => return Err(render_s3_error(e)),
    };

    if let (Some(signature), Some(expires)) = (query.get("signature"), query.get("expires")) {
        let expires: i64 = match expires.parse() {
            Ok(v) => v,
            Err(_) => {
                return Err(xml_error(
                    StatusCode::BAD_REQUEST,
                    "InvalidArgument",
                    "expires must be a unix timestamp",
                ))
            }
        };
        if expires < Utc::now().timestamp() {
            return Err(xml_error(
                StatusCode::FORBIDDEN,
                "AccessDenied",
                "pre-signed URL has expired",
            ));
        }
        let signing_key = match state.registry().keys.signing_key(&project).await {
            Ok(k) => k,
            Err(e) => return Err(render_s3_error(e.into())),
        };
        match cellar_crypto::presign_verify(&signing_key, method, bucket, key, expires, signature) {
            Ok(true) => return Ok(AuthContext::project(&project)),
            Ok(false) => {
                return Err(xml_error(
                    StatusCode::FORBIDDEN,
                    "SignatureDoesNotMatch",
                    "pre-signed URL signature mismatch",
                ))
            }
            Err(e) => return Err(render_s3_error(e.into())),
        }
    }

    if let Some(value) = headers.get("authorization") {
        if value
            .to_str()
            .map(|v| v.starts_with("AWS4-HMAC-SHA256"))
            .unwrap_or(false)
        {
            return Err(xml_error(
                StatusCode::UNAUTHORIZED,
                "SignatureVersionNotSupported",
                "AWS Signature V4 is not supported; use Bearer, X-Api-Key, or a pre-signed URL",
            ));
        }
    }

    let Some(presented) = presented_key(headers) else {
        return Err(xml_error(
            StatusCode::UNAUTHORIZED,
            "AccessDenied",
            "missing credentials",
        ));
    };
    let auth = match resolve_key(state, &presented).await {
        Ok(auth) => auth,
        Err(e) => return Err(render_s3_error(e)),
    };
    if let Err(e) = auth.require_project(&project) {
        return Err(render_s3_error(e));
    }
    Ok(auth)
}

pub async fn put_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    Metrics::bump(&state.metrics.s3_requests_total);
    if let Err(resp) = s3_auth(&state, &headers, &query, "PUT", &bucket, &key).await {
        return resp;
    }
    let project = bucket_project(&bucket).expect("validated").to_string();
    match state.objects.put(&project, &key, &body).await {
        Ok(meta) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = format!("\"{}\"", meta.etag).parse() {
                headers.insert("etag", value);
            }
            (StatusCode::OK, headers).into_response()
        }
        Err(e) => render_s3_error(e.into()),
    }
}

/// Serves GET and HEAD (axum routes HEAD through the get handler; the body
/// is stripped by the HTTP layer while Content-Length and ETag remain).
pub async fn get_object(
    State(state): State<AppState>,
    method: axum::http::Method,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    Metrics::bump(&state.metrics.s3_requests_total);
    if let Err(resp) = s3_auth(&state, &headers, &query, method.as_str(), &bucket, &key).await {
        return resp;
    }
    let project = bucket_project(&bucket).expect("validated").to_string();
    match state.objects.get(&project, &key).await {
        Ok((data, meta)) => object_response(data, &meta),
        Err(e) => render_s3_error(e.into()),
    }
}

pub async fn delete_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    Metrics::bump(&state.metrics.s3_requests_total);
    if let Err(resp) = s3_auth(&state, &headers, &query, "DELETE", &bucket, &key).await {
        return resp;
    }
    let project = bucket_project(&bucket).expect("validated").to_string();
    match state.objects.delete(&project, &key).await {
        // S3 DELETE is idempotent: 204 whether or not the key existed.
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => render_s3_error(e.into()),
    }
}

/// ListObjectsV2.
pub async fn list_objects(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    Metrics::bump(&state.metrics.s3_requests_total);
    if let Err(resp) = s3_auth(&state, &headers, &query, "GET", &bucket, "").await {
        return resp;
    }
    let project = bucket_project(&bucket).expect("validated").to_string();

    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let delimiter = query.get("delimiter").cloned();
    let max_keys = query
        .get("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000usize)
        .min(1000);

    let outcome = match state
        .objects
        .list(&project, &prefix, delimiter.as_deref(), max_keys)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return render_s3_error(e.into()),
    };

    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\">");
    xml.push_str(&format!("<Name>{}</Name>", xml_escape(&bucket)));
    xml.push_str(&format!("<Prefix>{}</Prefix>", xml_escape(&prefix)));
    xml.push_str(&format!("<KeyCount>{}</KeyCount>", outcome.objects.len()));
    xml.push_str(&format!("<MaxKeys>{max_keys}</MaxKeys>"));
    xml.push_str(&format!(
        "<IsTruncated>{}</IsTruncated>",
        outcome.truncated
    ));
    for object in &outcome.objects {
        xml.push_str(&format!(
            "<Contents><Key>{}</Key><Size>{}</Size><ETag>&quot;{}&quot;</ETag>\
             <LastModified>{}</LastModified></Contents>",
            xml_escape(&object.key),
            object.size_bytes,
            object.etag,
            object.last_modified.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        ));
    }
    for prefix in &outcome.common_prefixes {
        xml.push_str(&format!(
            "<CommonPrefixes><Prefix>{}</Prefix></CommonPrefixes>",
            xml_escape(prefix)
        ));
    }
    xml.push_str("</ListBucketResult>");
    (StatusCode::OK, [("content-type", "application/xml")], xml).into_response()
}

#[derive(Debug, Deserialize)]
pub struct PresignRequest {
    pub key: String,
    pub method: String,
    /// Validity window in seconds.
    pub expires_in: i64,
}

/// Issue a pre-signed URL for one object operation.
pub async fn presign(
    State(state): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<PresignRequest>,
) -> Response {
    Metrics::bump(&state.metrics.s3_requests_total);
    if let Err(resp) = s3_auth(&state, &headers, &query, "POST", &bucket, "").await {
        return resp;
    }
    let project = bucket_project(&bucket).expect("validated").to_string();

    let method = request.method.to_ascii_uppercase();
    if !matches!(method.as_str(), "GET" | "PUT" | "HEAD" | "DELETE") {
        return render_s3_error(
            Error::InvalidArgument(format!("method {method:?} cannot be pre-signed")).into(),
        );
    }
    if request.expires_in <= 0 || request.expires_in > 7 * 24 * 3600 {
        return render_s3_error(
            Error::InvalidArgument("expires_in must be within (0, 604800] seconds".into()).into(),
        );
    }

    let expires = Utc::now().timestamp() + request.expires_in;
    let signing_key = match state.registry().keys.signing_key(&project).await {
        Ok(k) => k,
        Err(e) => return render_s3_error(e.into()),
    };
    let signature = match cellar_crypto::presign_signature(
        &signing_key,
        &method,
        &bucket,
        &request.key,
        expires,
    ) {
        Ok(s) => s,
        Err(e) => return render_s3_error(e.into()),
    };

    Json(serde_json::json!({
        "url": format!(
            "/s3/{bucket}/{}?signature={signature}&expires={expires}",
            request.key
        ),
        "method": method,
        "expires": expires,
    }))
    .into_response()
}

fn object_response(data: Vec<u8>, meta: &cellar_files::ObjectMeta) -> Response {
    let mut headers = HeaderMap::new();
    if let Ok(value) = format!("\"{}\"", meta.etag).parse() {
        headers.insert("etag", value);
    }
    if let Ok(value) = meta.last_modified.to_rfc2822().parse() {
        headers.insert("last-modified", value);
    }
    headers.insert(
        "content-type",
        "application/octet-stream".parse().expect("static header"),
    );
    (StatusCode::OK, headers, data).into_response()
}
