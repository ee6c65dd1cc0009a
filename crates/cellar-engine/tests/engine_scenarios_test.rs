//! End-to-end engine scenarios over real on-disk engine files: create →
//! import → preview, incremental upsert, branch copy-on-write, and
//! snapshot-before-truncate with restore.

use chrono::Utc;
use tempfile::TempDir;

use cellar_core::settings::SettingScope;
use cellar_core::{
    Bucket, BranchSource, ColumnDef, DedupMode, FileEntry, ImportOptions, ImportSource, Layout,
    SnapshotKind, Stage,
};
use cellar_engine::{Engine, SnapshotCodec};
use cellar_registry::Registry;

struct Fixture {
    _dir: TempDir,
    engine: Engine,
    layout: Layout,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    Layout::ensure_dir(layout.root()).unwrap();
    let registry = Registry::open(&layout.registry_path()).await.unwrap();

    registry
        .projects
        .insert(&cellar_core::Project {
            id: "p1".into(),
            name: "Project one".into(),
            description: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
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

    let engine = Engine::new(registry, layout.clone(), SnapshotCodec::Zstd);
    Fixture {
        _dir: dir,
        engine,
        layout,
    }
}

fn orders_columns() -> Vec<ColumnDef> {
    vec![
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
    ]
}

/// Register a CSV body as a project file and return its id.
async fn seed_csv(fx: &Fixture, id: &str, body: &str) -> String {
    let storage_path = format!("files/project_p1/seed/{id}.csv");
    let abs = fx.layout.root().join(&storage_path);
    Layout::ensure_parent(&abs).unwrap();
    std::fs::write(&abs, body).unwrap();
    fx.engine
        .registry()
        .files
        .insert(&FileEntry {
            id: id.to_string(),
            project_id: "p1".into(),
            name: format!("{id}.csv"),
            size_bytes: body.len() as i64,
            sha256: String::new(),
            tags: vec![],
            storage_path,
            created_at: Utc::now(),
            staged_until: None,
        })
        .await
        .unwrap();
    id.to_string()
}

fn import_opts(file_id: &str, incremental: bool, dedup: DedupMode) -> ImportOptions {
    ImportOptions {
        source: ImportSource::FileId(file_id.to_string()),
        format: cellar_core::DataFormat::Csv,
        incremental,
        dedup,
    }
}

#[tokio::test]
async fn test_create_import_preview() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();

    let file_id = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n").await;
    let result = fx
        .engine
        .import_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            import_opts(&file_id, false, DedupMode::UpdateDuplicates),
        )
        .await
        .unwrap();
    assert_eq!(result.imported_rows, 3);
    assert_eq!(result.table_rows_total, 3);
    assert_eq!(result.columns, vec!["id", "amt"]);

    let preview = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(preview.row_count, 3);
    assert_eq!(preview.rows.len(), 3);
    let ids: Vec<i64> = preview
        .rows
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_incremental_upsert_updates_and_appends() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    let delta = seed_csv(&fx, "f2", "id,amt\n2,25\n4,40\n").await;
    let result = fx
        .engine
        .import_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            import_opts(&delta, true, DedupMode::UpdateDuplicates),
        )
        .await
        .unwrap();
    assert_eq!(result.table_rows_total, 4);

    let preview = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    let row2 = preview.rows.iter().find(|r| r["id"] == 2).unwrap();
    assert_eq!(row2["amt"].as_f64().unwrap(), 25.0);

    // Re-importing the same delta leaves the row count unchanged.
    let delta2 = seed_csv(&fx, "f3", "id,amt\n2,25\n4,40\n").await;
    let again = fx
        .engine
        .import_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            import_opts(&delta2, true, DedupMode::UpdateDuplicates),
        )
        .await
        .unwrap();
    assert_eq!(again.table_rows_total, 4);
}

#[tokio::test]
async fn test_last_staged_occurrence_wins() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let file = seed_csv(&fx, "f1", "id,amt\n7,1\n7,2\n7,3\n").await;
    fx.engine
        .import_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            import_opts(&file, true, DedupMode::UpdateDuplicates),
        )
        .await
        .unwrap();

    let preview = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(preview.row_count, 1);
    assert_eq!(preview.rows[0]["amt"].as_f64().unwrap(), 3.0);
}

#[tokio::test]
async fn test_fail_on_duplicates_aborts() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    let clash = seed_csv(&fx, "f2", "id,amt\n1,99\n2,20\n").await;
    let err = fx
        .engine
        .import_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            import_opts(&clash, true, DedupMode::FailOnDuplicates),
        )
        .await
        .unwrap_err();
    assert_eq!(err.class(), cellar_core::ErrorClass::Conflict);

    // Destination unchanged.
    let preview = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(preview.row_count, 1);
    assert_eq!(preview.rows[0]["amt"].as_f64().unwrap(), 10.0);
}

#[tokio::test]
async fn test_branch_cow_isolation() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n4,40\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    fx.engine
        .registry()
        .branches
        .insert(&cellar_core::Branch {
            project_id: "p1".into(),
            branch_id: "dev".into(),
            name: "dev".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    // Live view: the branch sees main's rows, no divergence row exists.
    let preview = fx
        .engine
        .preview("p1", "dev", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(preview.row_count, 4);
    assert!(fx
        .engine
        .registry()
        .branch_tables
        .get("p1", "dev", "in_c_s", "orders")
        .await
        .unwrap()
        .is_none());

    // First branch write triggers CoW.
    let mut row = serde_json::Map::new();
    row.insert("id".into(), serde_json::json!(5));
    row.insert("amt".into(), serde_json::json!(50));
    fx.engine
        .insert_rows("p1", "dev", "in_c_s", "orders", vec![row])
        .await
        .unwrap();

    let dev = fx
        .engine
        .preview("p1", "dev", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(dev.row_count, 5);

    let main = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(main.row_count, 4);

    let divergence = fx
        .engine
        .registry()
        .branch_tables
        .get("p1", "dev", "in_c_s", "orders")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(divergence.source, BranchSource::Branch);
}

#[tokio::test]
async fn test_branch_only_table_is_invisible_on_main() {
    let fx = fixture().await;
    fx.engine
        .registry()
        .branches
        .insert(&cellar_core::Branch {
            project_id: "p1".into(),
            branch_id: "dev".into(),
            name: "dev".into(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    fx.engine
        .create_table("p1", "dev", "in_c_s", "scratch", orders_columns(), vec![])
        .await
        .unwrap();

    let row = fx
        .engine
        .registry()
        .branch_tables
        .get("p1", "dev", "in_c_s", "scratch")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.source, BranchSource::BranchOnly);

    let err = fx
        .engine
        .preview("p1", "default", "in_c_s", "scratch", Some(10), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.class(), cellar_core::ErrorClass::NotFound);
}

#[tokio::test]
async fn test_snapshot_before_truncate_and_restore() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n4,40\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    fx.engine
        .registry()
        .settings
        .set(
            SettingScope::Project,
            "p1",
            "auto_snapshot_triggers",
            &serde_json::json!(["truncate_table"]),
        )
        .await
        .unwrap();

    let deleted = fx
        .engine
        .delete_rows("p1", "default", "in_c_s", "orders", "1=1")
        .await
        .unwrap();
    assert_eq!(deleted, 4);

    let snapshots = fx
        .engine
        .registry()
        .snapshots
        .list("p1", None, Some("orders"), Some(SnapshotKind::Auto))
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].row_count, 4);
    assert_eq!(snapshots[0].trigger, "truncate_table");

    let empty = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(empty.row_count, 0);

    fx.engine.restore_snapshot(&snapshots[0].id).await.unwrap();
    let restored = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(restored.row_count, 4);
    let ids: Vec<i64> = restored
        .rows
        .iter()
        .map(|r| r["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_delete_without_trigger_takes_no_snapshot() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    fx.engine
        .delete_rows("p1", "default", "in_c_s", "orders", "id = 1")
        .await
        .unwrap();
    // Predicate deletes never trigger, and no truncate trigger is configured.
    fx.engine
        .delete_rows("p1", "default", "in_c_s", "orders", "1=1")
        .await
        .unwrap();

    let snapshots = fx
        .engine
        .registry()
        .snapshots
        .list("p1", None, None, None)
        .await
        .unwrap();
    assert!(snapshots.is_empty());
}

#[tokio::test]
async fn test_add_primary_key_rejects_duplicates() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec![])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n1,20\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::InsertDuplicates))
        .await
        .unwrap();

    let err = fx
        .engine
        .add_primary_key("p1", "default", "in_c_s", "orders", vec!["id".into()])
        .await
        .unwrap_err();
    assert_eq!(err.class(), cellar_core::ErrorClass::Conflict);

    // After deduplication the key lands and is enforced.
    fx.engine
        .delete_rows("p1", "default", "in_c_s", "orders", "amt = 20")
        .await
        .unwrap();
    fx.engine
        .add_primary_key("p1", "default", "in_c_s", "orders", vec!["id".into()])
        .await
        .unwrap();

    let mut dup = serde_json::Map::new();
    dup.insert("id".into(), serde_json::json!(1));
    dup.insert("amt".into(), serde_json::json!(99));
    let err = fx
        .engine
        .insert_rows("p1", "default", "in_c_s", "orders", vec![dup])
        .await
        .unwrap_err();
    assert_eq!(err.class(), cellar_core::ErrorClass::Conflict);
}

#[tokio::test]
async fn test_export_csv_roundtrip() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    let dest = fx.layout.root().join("out.csv");
    let info = fx
        .engine
        .export_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            cellar_core::ExportOptions {
                format: cellar_core::DataFormat::Csv,
                where_clause: Some("id >= 2".into()),
                columns: None,
                limit: None,
                compression: cellar_core::ExportCompression::None,
                destination: dest.to_string_lossy().to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(info.rows, 2);

    let body = std::fs::read_to_string(&dest).unwrap();
    assert!(body.contains("id,amt"));
    assert!(body.contains('3'));
    assert!(!body.lines().any(|l| l.starts_with("1,")));
}

#[tokio::test]
async fn test_profile_reports_stats_and_quality() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n2,20\n3,30\n4,40\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    let profile = fx
        .engine
        .profile_table(
            "p1",
            "default",
            "in_c_s",
            "orders",
            None,
            cellar_engine::profile::ProfileMode::Quality,
        )
        .await
        .unwrap();

    assert_eq!(profile.row_count, 4);
    assert_eq!(profile.quality_label, "Excellent");
    let amt = profile.columns.iter().find(|c| c.name == "amt").unwrap();
    assert_eq!(amt.count, 4);
    assert_eq!(amt.null_count, 0);
    let stats = amt.numeric.as_ref().unwrap();
    assert_eq!(stats.min, Some(10.0));
    assert_eq!(stats.max, Some(40.0));
    assert_eq!(stats.avg, Some(25.0));

    // id and amt are perfectly correlated in this fixture.
    assert!(profile
        .correlations
        .iter()
        .any(|p| (p.r - 1.0).abs() < 1e-9));
}

#[tokio::test]
async fn test_drop_table_with_trigger_snapshots_first() {
    let fx = fixture().await;
    fx.engine
        .create_table("p1", "default", "in_c_s", "orders", orders_columns(), vec!["id".into()])
        .await
        .unwrap();
    let base = seed_csv(&fx, "f1", "id,amt\n1,10\n").await;
    fx.engine
        .import_table("p1", "default", "in_c_s", "orders", import_opts(&base, false, DedupMode::UpdateDuplicates))
        .await
        .unwrap();

    // drop_table triggers by default.
    fx.engine
        .drop_table("p1", "default", "in_c_s", "orders")
        .await
        .unwrap();

    let snapshots = fx
        .engine
        .registry()
        .snapshots
        .list("p1", None, Some("orders"), Some(SnapshotKind::Auto))
        .await
        .unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].trigger, "drop_table");

    // Restore recreates the dropped table from the artifact.
    fx.engine.restore_snapshot(&snapshots[0].id).await.unwrap();
    let restored = fx
        .engine
        .preview("p1", "default", "in_c_s", "orders", Some(10), None, None)
        .await
        .unwrap();
    assert_eq!(restored.row_count, 1);
}
