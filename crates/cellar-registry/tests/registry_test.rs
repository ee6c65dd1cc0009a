//! Registry integration tests over a real on-disk DuckDB file.

use chrono::{Duration, Utc};
use tempfile::tempdir;

use cellar_core::settings::SettingScope;
use cellar_core::{
    ApiKey, Branch, BranchSource, BranchTable, Bucket, ColumnDef, FileEntry, IdempotencyEntry,
    Project, ScopeChain, Snapshot, SnapshotConfig, SnapshotKind, Stage, TableMeta,
};
use cellar_registry::Registry;

fn project(id: &str) -> Project {
    Project {
        id: id.to_string(),
        name: format!("Project {id}"),
        description: None,
        created_at: Utc::now(),
    }
}

fn table_meta(project: &str, bucket: &str, name: &str) -> TableMeta {
    TableMeta {
        project_id: project.to_string(),
        bucket: bucket.to_string(),
        name: name.to_string(),
        columns: vec![
            ColumnDef {
                name: "id".into(),
                type_name: "INTEGER".into(),
                nullable: false,
                default: None,
            },
            ColumnDef {
                name: "amt".into(),
                type_name: "DOUBLE".into(),
                nullable: true,
                default: None,
            },
        ],
        primary_key: vec!["id".into()],
        row_count_cache: 0,
        size_bytes_cache: 0,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_open_on_disk_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("metadata.db");

    {
        let registry = Registry::open(&path).await.unwrap();
        registry.projects.insert(&project("p1")).await.unwrap();
    }

    // Reopen: migrations are idempotent and data survives.
    let registry = Registry::open(&path).await.unwrap();
    let found = registry.projects.get("p1").await.unwrap().unwrap();
    assert_eq!(found.name, "Project p1");
}

#[tokio::test]
async fn test_duplicate_project_is_conflict() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry.projects.insert(&project("p1")).await.unwrap();
    let err = registry.projects.insert(&project("p1")).await.unwrap_err();
    assert_eq!(err.class(), cellar_core::ErrorClass::Conflict);
}

#[tokio::test]
async fn test_api_key_lookup_and_revoke() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry.projects.insert(&project("p1")).await.unwrap();
    let key = ApiKey {
        project_id: "p1".into(),
        key_hash: "abc123".into(),
        description: Some("ci".into()),
        created_at: Utc::now(),
    };
    registry.keys.insert(&key).await.unwrap();

    let found = registry.keys.find_by_hash("abc123").await.unwrap().unwrap();
    assert_eq!(found.project_id, "p1");

    registry.keys.revoke("p1", "abc123").await.unwrap();
    assert!(registry.keys.find_by_hash("abc123").await.unwrap().is_none());
}

#[tokio::test]
async fn test_table_schema_roundtrip() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry
        .tables
        .insert(&table_meta("p1", "in_c_s", "orders"))
        .await
        .unwrap();

    let meta = registry.tables.require("p1", "in_c_s", "orders").await.unwrap();
    assert_eq!(meta.primary_key, vec!["id".to_string()]);
    assert_eq!(meta.columns.len(), 2);
    assert!(meta.has_primary_key());

    registry
        .tables
        .update_cache("p1", "in_c_s", "orders", 42, 4096)
        .await
        .unwrap();
    let meta = registry.tables.require("p1", "in_c_s", "orders").await.unwrap();
    assert_eq!(meta.row_count_cache, 42);
}

#[tokio::test]
async fn test_branch_table_absent_means_live_view() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry
        .branches
        .insert(&Branch {
            project_id: "p1".into(),
            branch_id: "dev".into(),
            name: "dev".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    assert!(registry
        .branch_tables
        .get("p1", "dev", "in_c_s", "orders")
        .await
        .unwrap()
        .is_none());

    registry
        .branch_tables
        .upsert(&BranchTable {
            project_id: "p1".into(),
            branch_id: "dev".into(),
            bucket: "in_c_s".into(),
            table: "orders".into(),
            source: BranchSource::Branch,
        })
        .await
        .unwrap();

    let row = registry
        .branch_tables
        .get("p1", "dev", "in_c_s", "orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source, BranchSource::Branch);

    // Branch deletion cascades divergence rows.
    registry.branches.delete_cascade("p1", "dev").await.unwrap();
    assert!(registry
        .branch_tables
        .get("p1", "dev", "in_c_s", "orders")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_settings_resolution_through_registry() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry
        .settings
        .set(
            SettingScope::Project,
            "p1",
            "auto_snapshot_triggers",
            &serde_json::json!(["truncate"]),
        )
        .await
        .unwrap();

    let chain = ScopeChain::for_table("p1", "in_c_s", "orders");
    let rows = registry.settings.rows_for_chain(&chain).await.unwrap();
    let config = SnapshotConfig::resolve(&rows, &chain);
    assert!(config.trigger_enabled("truncate"));
    assert!(!config.trigger_enabled("drop_table"));
}

#[tokio::test]
async fn test_snapshot_expiry_listing() {
    let registry = Registry::open_in_memory().await.unwrap();
    let now = Utc::now();
    let snap = |id: &str, expires| Snapshot {
        id: id.to_string(),
        project_id: "p1".into(),
        bucket: "in_c_s".into(),
        table: "orders".into(),
        kind: SnapshotKind::Auto,
        trigger: "truncate".into(),
        created_at: now,
        expires_at: expires,
        row_count: 4,
        size_bytes: 1024,
        artifact_path: format!("snapshots/project_p1/snap_orders_{id}"),
    };
    registry.snapshots.insert(&snap("old", now - Duration::days(1))).await.unwrap();
    registry.snapshots.insert(&snap("new", now + Duration::days(6))).await.unwrap();

    let expired = registry.snapshots.expired(&now).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].id, "old");
}

#[tokio::test]
async fn test_file_quota_usage_ignores_staged() {
    let registry = Registry::open_in_memory().await.unwrap();
    let now = Utc::now();
    let entry = |id: &str, staged| FileEntry {
        id: id.to_string(),
        project_id: "p1".into(),
        name: "a.csv".into(),
        size_bytes: 100,
        sha256: "00".into(),
        tags: vec!["raw".into()],
        storage_path: format!("files/project_p1/{id}"),
        created_at: now,
        staged_until: staged,
    };
    registry.files.insert(&entry("f1", None)).await.unwrap();
    registry
        .files
        .insert(&entry("f2", Some(now + Duration::hours(24))))
        .await
        .unwrap();

    let (count, bytes) = registry.files.usage("p1").await.unwrap();
    assert_eq!(count, 1);
    assert_eq!(bytes, 100);

    let listed = registry.files.list("p1", Some("raw")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "f1");
}

#[tokio::test]
async fn test_idempotency_ttl_semantics() {
    let registry = Registry::open_in_memory().await.unwrap();
    let now = Utc::now();
    registry
        .idempotency
        .put(&IdempotencyEntry {
            key: "k1".into(),
            fingerprint: "fp".into(),
            response_body: "{\"ok\":true}".into(),
            status_code: 201,
            inserted_at: now - Duration::seconds(700),
        })
        .await
        .unwrap();

    // Past TTL: reads as a miss even before the janitor runs.
    assert!(registry.idempotency.get("k1", &now).await.unwrap().is_none());

    let purged = registry.idempotency.purge_expired(&now).await.unwrap();
    assert_eq!(purged, 1);
}

#[tokio::test]
async fn test_project_cascade_delete() {
    let registry = Registry::open_in_memory().await.unwrap();
    registry.projects.insert(&project("p1")).await.unwrap();
    registry
        .buckets
        .insert(&Bucket {
            project_id: "p1".into(),
            name: "s".into(),
            stage: Stage::In,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    registry
        .tables
        .insert(&table_meta("p1", "in_c_s", "orders"))
        .await
        .unwrap();

    registry.projects.delete_cascade("p1").await.unwrap();
    assert!(registry.projects.get("p1").await.unwrap().is_none());
    assert!(registry.buckets.get_by_dir("p1", "in_c_s").await.unwrap().is_none());
    assert!(registry.tables.get("p1", "in_c_s", "orders").await.unwrap().is_none());
}
