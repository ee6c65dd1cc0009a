//! HTTP-level integration tests: a real server on an ephemeral port driven
//! with reqwest. Covers project lifecycle, idempotent writes, auth scoping,
//! and the S3 object round-trip.

use std::net::SocketAddr;

use cellar_api::state::AppState;
use cellar_core::Layout;
use cellar_engine::{Engine, SnapshotCodec};
use cellar_files::{FilesStore, ObjectStore};
use cellar_registry::Registry;

const ADMIN_KEY: &str = "test-admin-key";

struct TestServer {
    _dir: tempfile::TempDir,
    base: String,
    client: reqwest::Client,
}

async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(dir.path());
    Layout::ensure_dir(layout.root()).unwrap();
    let registry = Registry::open(&layout.registry_path()).await.unwrap();
    let engine = Engine::new(registry.clone(), layout.clone(), SnapshotCodec::Zstd);
    let files = FilesStore::new(registry.clone(), layout.clone());
    let objects = ObjectStore::new(layout.clone());
    let state = AppState::new(engine, files, objects, ADMIN_KEY.to_string(), None);

    let app = cellar_api::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _dir: dir,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
    }
}

impl TestServer {
    /// Create project `p1` with one bucket and return its API key.
    async fn seed_project(&self) -> String {
        let response = self
            .client
            .post(format!("{}/projects", self.base))
            .bearer_auth(ADMIN_KEY)
            .json(&serde_json::json!({ "id": "p1", "name": "Project one" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let body: serde_json::Value = response.json().await.unwrap();
        let key = body["api_key"].as_str().unwrap().to_string();
        assert!(key.starts_with("proj_p1_admin_"));

        let response = self
            .client
            .post(format!("{}/projects/p1/buckets", self.base))
            .bearer_auth(&key)
            .json(&serde_json::json!({ "name": "s", "stage": "in" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        key
    }

    async fn create_orders_table(&self, key: &str) {
        let response = self
            .client
            .post(format!(
                "{}/projects/p1/branches/default/buckets/in_c_s/tables",
                self.base
            ))
            .bearer_auth(key)
            .json(&serde_json::json!({
                "name": "orders",
                "columns": [
                    { "name": "id", "type": "INTEGER", "nullable": false },
                    { "name": "amt", "type": "DOUBLE" }
                ],
                "primary_key": ["id"]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
    }
}

#[tokio::test]
async fn test_health_and_metrics_are_open() {
    let server = spawn_server().await;
    let response = server
        .client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .get(format!("{}/metrics", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("cellar_requests_total"));
}

#[tokio::test]
async fn test_project_lifecycle_and_scoping() {
    let server = spawn_server().await;
    let key = server.seed_project().await;

    // Project key reads its own project.
    let response = server
        .client
        .get(format!("{}/projects/p1", server.base))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Project keys cannot create projects.
    let response = server
        .client
        .post(format!("{}/projects", server.base))
        .bearer_auth(&key)
        .json(&serde_json::json!({ "id": "p2", "name": "nope" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);

    // Missing key fails closed.
    let response = server
        .client
        .get(format!("{}/projects/p1", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Revoked keys fail closed on the next request.
    let keys: serde_json::Value = server
        .client
        .get(format!("{}/projects/p1/keys", server.base))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let hash = keys[0]["key_hash"].as_str().unwrap();
    let response = server
        .client
        .delete(format!("{}/projects/p1/keys/{hash}", server.base))
        .bearer_auth(ADMIN_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    let response = server
        .client
        .get(format!("{}/projects/p1", server.base))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn test_table_rows_and_preview() {
    let server = spawn_server().await;
    let key = server.seed_project().await;
    server.create_orders_table(&key).await;

    let response = server
        .client
        .post(format!(
            "{}/projects/p1/branches/default/buckets/in_c_s/tables/orders/rows",
            server.base
        ))
        .bearer_auth(&key)
        .json(&serde_json::json!({
            "rows": [
                { "id": 2, "amt": 20.0 },
                { "id": 1, "amt": 10.0 }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let preview: serde_json::Value = server
        .client
        .get(format!(
            "{}/projects/p1/branches/default/buckets/in_c_s/tables/orders/preview?limit=10",
            server.base
        ))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(preview["row_count"], 2);
    // PK ordering.
    assert_eq!(preview["rows"][0]["id"], 1);
    assert_eq!(preview["rows"][1]["id"], 2);
}

#[tokio::test]
async fn test_idempotent_writes_replay_and_conflict() {
    let server = spawn_server().await;
    let key = server.seed_project().await;
    server.create_orders_table(&key).await;

    let url = format!(
        "{}/projects/p1/branches/default/buckets/in_c_s/tables/orders/rows",
        server.base
    );
    let body = serde_json::json!({ "rows": [{ "id": 7, "amt": 70.0 }] });

    let first = server
        .client
        .post(&url)
        .bearer_auth(&key)
        .header("X-Idempotency-Key", "write-7")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 201);
    let first_body = first.text().await.unwrap();

    // Same key, same fingerprint: byte-identical replay, no second insert.
    let second = server
        .client
        .post(&url)
        .bearer_auth(&key)
        .header("X-Idempotency-Key", "write-7")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 201);
    assert_eq!(second.headers().get("x-idempotency-replayed").unwrap(), "true");
    assert_eq!(second.text().await.unwrap(), first_body);

    let preview: serde_json::Value = server
        .client
        .get(format!(
            "{}/projects/p1/branches/default/buckets/in_c_s/tables/orders/preview",
            server.base
        ))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(preview["row_count"], 1);

    // Same key, different fingerprint: conflict.
    let clash = server
        .client
        .post(&url)
        .bearer_auth(&key)
        .header("X-Idempotency-Key", "write-7")
        .json(&serde_json::json!({ "rows": [{ "id": 8, "amt": 80.0 }] }))
        .send()
        .await
        .unwrap();
    assert_eq!(clash.status(), 409);
}

#[tokio::test]
async fn test_s3_object_roundtrip() {
    let server = spawn_server().await;
    let key = server.seed_project().await;
    let body = "a,b\n1,2";
    let expected_etag = format!("\"{:x}\"", md5::compute(body.as_bytes()));

    // PUT
    let response = server
        .client
        .put(format!("{}/s3/project_p1/data/a.csv", server.base))
        .bearer_auth(&key)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("etag").unwrap().to_str().unwrap(),
        expected_etag
    );

    // HEAD
    let response = server
        .client
        .head(format!("{}/s3/project_p1/data/a.csv", server.base))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        "7"
    );
    assert_eq!(
        response.headers().get("etag").unwrap().to_str().unwrap(),
        expected_etag
    );

    // List
    let response = server
        .client
        .get(format!(
            "{}/s3/project_p1?list-type=2&prefix=data/",
            server.base
        ))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let xml = response.text().await.unwrap();
    assert!(xml.contains("<Key>data/a.csv</Key>"));

    // DELETE then GET → NoSuchKey
    let response = server
        .client
        .delete(format!("{}/s3/project_p1/data/a.csv", server.base))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = server
        .client
        .get(format!("{}/s3/project_p1/data/a.csv", server.base))
        .bearer_auth(&key)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert!(response.text().await.unwrap().contains("NoSuchKey"));
}

#[tokio::test]
async fn test_s3_rejects_sigv4_and_foreign_keys() {
    let server = spawn_server().await;
    let _key = server.seed_project().await;

    let response = server
        .client
        .get(format!("{}/s3/project_p1/data/a.csv", server.base))
        .header(
            "authorization",
            "AWS4-HMAC-SHA256 Credential=AKIA/20260101/us-east-1/s3/aws4_request",
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    assert!(response
        .text()
        .await
        .unwrap()
        .contains("SignatureVersionNotSupported"));

    // A second project's key cannot touch p1's bucket.
    let response = server
        .client
        .post(format!("{}/projects", server.base))
        .bearer_auth(ADMIN_KEY)
        .json(&serde_json::json!({ "id": "p2", "name": "two" }))
        .send()
        .await
        .unwrap();
    let p2_key = response.json::<serde_json::Value>().await.unwrap()["api_key"]
        .as_str()
        .unwrap()
        .to_string();
    let response = server
        .client
        .put(format!("{}/s3/project_p1/steal.txt", server.base))
        .bearer_auth(&p2_key)
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_s3_presigned_url_flow() {
    let server = spawn_server().await;
    let key = server.seed_project().await;

    server
        .client
        .put(format!("{}/s3/project_p1/data/a.csv", server.base))
        .bearer_auth(&key)
        .body("a,b\n1,2")
        .send()
        .await
        .unwrap();

    let presign: serde_json::Value = server
        .client
        .post(format!("{}/s3/project_p1/presign", server.base))
        .bearer_auth(&key)
        .json(&serde_json::json!({
            "key": "data/a.csv",
            "method": "GET",
            "expires_in": 300
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let url = presign["url"].as_str().unwrap();

    // The pre-signed URL authorises without any credential headers.
    let response = server
        .client
        .get(format!("{}{url}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "a,b\n1,2");

    // Tampering with the key invalidates the signature.
    let tampered = url.replace("data/a.csv", "data/b.csv");
    let response = server
        .client
        .get(format!("{}{tampered}", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_rpc_bridge_dispatch() {
    let server = spawn_server().await;
    let key = server.seed_project().await;

    let response = server
        .client
        .post(format!("{}/rpc/execute", server.base))
        .json(&serde_json::json!({
            "credentials": { "host": "p1", "secret": key },
            "command": {
                "type": "CreateTableCommand",
                "payload": {
                    "path": ["in_c_s"],
                    "name": "events",
                    "columns": [{ "name": "id", "type": "BIGINT", "nullable": false }],
                    "primary_key": ["id"]
                }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["commandResponse"]["name"] == "events");
    assert!(body["messages"].as_array().unwrap().iter().any(|m| m["level"] == "info"));

    // Unknown command type is an InvalidArgument at the envelope edge.
    let response = server
        .client
        .post(format!("{}/rpc/execute", server.base))
        .json(&serde_json::json!({
            "credentials": { "secret": ADMIN_KEY },
            "command": { "type": "ExplodeCommand", "payload": {} }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 422);
}
