//! Domain entities persisted in the metadata registry.
//!
//! Every struct here is the canonical in-memory shape of a registry row.
//! Timestamps are UTC and stored as RFC 3339 text in the registry file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Branch id naming the project's main line. Never stored as a row.
pub const DEFAULT_BRANCH: &str = "default";

/// Bucket stage: `in` buckets receive imports, `out` buckets hold results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    In,
    Out,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::In => "in",
            Stage::Out => "out",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in" => Ok(Stage::In),
            "out" => Ok(Stage::Out),
            other => Err(Error::InvalidArgument(format!("unknown stage {other:?}"))),
        }
    }
}

/// A tenant project. Owns a directory tree, buckets, files, and workspaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A project-scoped API key. Only the SHA-256 of the plaintext is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub project_id: String,
    pub key_hash: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A bucket: a namespaced container for tables, realised as a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub project_id: String,
    pub name: String,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// User-facing id, e.g. `in.c-sales`.
    pub fn display_id(&self) -> String {
        crate::names::bucket_display_id(self.stage, &self.name)
    }

    /// Directory and attach-alias name, e.g. `in_c_sales`.
    pub fn dir_name(&self) -> String {
        crate::names::bucket_dir_name(self.stage, &self.name)
    }
}

/// Column definition inside a table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Engine type name (INTEGER, BIGINT, DOUBLE, VARCHAR, BOOLEAN, DATE,
    /// TIMESTAMP, ...). Validated against the supported set at creation.
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Registry row describing one table (exactly one engine file on disk).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub project_id: String,
    /// Bucket directory name (`{stage}_c_{name}`), the table's namespace.
    pub bucket: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub row_count_cache: i64,
    #[serde(default)]
    pub size_bytes_cache: i64,
    pub created_at: DateTime<Utc>,
}

impl TableMeta {
    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }
}

/// A development branch of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub project_id: String,
    pub branch_id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Where a branch-visible table physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchSource {
    /// Live view: reads pass through to the main file.
    Main,
    /// Copy-on-write materialisation of a main table.
    Branch,
    /// Created on the branch, never existed on main.
    BranchOnly,
}

impl BranchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchSource::Main => "main",
            BranchSource::Branch => "branch",
            BranchSource::BranchOnly => "branch_only",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "main" => Ok(BranchSource::Main),
            "branch" => Ok(BranchSource::Branch),
            "branch_only" => Ok(BranchSource::BranchOnly),
            other => Err(Error::Internal(format!("unknown branch source {other:?}"))),
        }
    }
}

/// Divergence record: exists only when a branch has its own copy of a table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchTable {
    pub project_id: String,
    pub branch_id: String,
    pub bucket: String,
    pub table: String,
    pub source: BranchSource,
}

/// Grant making a bucket linkable by another project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub src_project: String,
    pub bucket: String,
    pub target_project: String,
    pub created_at: DateTime<Utc>,
}

/// A linked bucket: reads pass through to the source project, writes denied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub target_project: String,
    pub bucket: String,
    pub src_project: String,
    pub src_bucket: String,
    pub created_at: DateTime<Utc>,
}

/// How a snapshot came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Manual,
    Auto,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Manual => "manual",
            SnapshotKind::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "manual" => Ok(SnapshotKind::Manual),
            "auto" => Ok(SnapshotKind::Auto),
            other => Err(Error::Internal(format!("unknown snapshot kind {other:?}"))),
        }
    }
}

/// A restorable point-in-time export of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub project_id: String,
    pub bucket: String,
    pub table: String,
    pub kind: SnapshotKind,
    /// Trigger name: `manual`, `drop_table`, `truncate`, `delete_all_rows`,
    /// `drop_column`, or any configured trigger.
    pub trigger: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub row_count: i64,
    pub size_bytes: i64,
    pub artifact_path: String,
}

/// A stored file in the content-addressed file store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub size_bytes: i64,
    pub sha256: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub storage_path: String,
    pub created_at: DateTime<Utc>,
    /// Set while the upload is staged; cleared by `register`.
    #[serde(default)]
    pub staged_until: Option<DateTime<Utc>>,
}

/// Workspace lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Active,
    Expired,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::Expired => "expired",
            WorkspaceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(WorkspaceStatus::Active),
            "expired" => Ok(WorkspaceStatus::Expired),
            "error" => Ok(WorkspaceStatus::Error),
            other => Err(Error::Internal(format!("unknown workspace status {other:?}"))),
        }
    }
}

/// A per-user engine file with read-only attachments of project tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub branch_id: Option<String>,
    pub db_path: String,
    pub size_limit_bytes: i64,
    pub expires_at: DateTime<Utc>,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
}

/// Login material for a workspace. The password is stored hashed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceCredentials {
    pub workspace_id: String,
    pub username: String,
    pub password_hash: String,
}

/// One live pg-wire connection bound to a workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgSession {
    pub session_id: String,
    pub workspace_id: String,
    pub client_addr: String,
    pub connected_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Cached response for an idempotent write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyEntry {
    pub key: String,
    pub fingerprint: String,
    pub response_body: String,
    pub status_code: u16,
    pub inserted_at: DateTime<Utc>,
}

// =============================================================================
// IMPORT / EXPORT OPTIONS
// =============================================================================

/// Duplicate handling for incremental imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    /// UPSERT on the primary key; last staged occurrence wins.
    UpdateDuplicates,
    /// Append everything; duplicates allowed.
    InsertDuplicates,
    /// Abort with Conflict when any staged PK already exists.
    FailOnDuplicates,
}

/// Where import data comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum ImportSource {
    /// A file id previously registered in the file store.
    FileId(String),
    /// A direct URL readable by the engine's HTTP extension.
    Url(String),
    /// An internal S3 path (`project_<id>/<key>`), resolved to a local path.
    S3Path(String),
}

/// Source data format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Csv,
    Parquet,
}

/// Options controlling one import run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    pub source: ImportSource,
    #[serde(default = "default_csv")]
    pub format: DataFormat,
    /// false = full load (truncate + insert), true = incremental.
    #[serde(default)]
    pub incremental: bool,
    #[serde(default = "default_dedup")]
    pub dedup: DedupMode,
}

fn default_csv() -> DataFormat {
    DataFormat::Csv
}

fn default_dedup() -> DedupMode {
    DedupMode::UpdateDuplicates
}

/// Counts reported when an import completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportResult {
    pub imported_rows: i64,
    pub table_rows_total: i64,
    pub table_size_bytes: i64,
    pub columns: Vec<String>,
}

/// Export compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportCompression {
    None,
    Gzip,
    Zstd,
    Snappy,
}

/// Options controlling one export run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportOptions {
    #[serde(default = "default_csv")]
    pub format: DataFormat,
    #[serde(default)]
    pub where_clause: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default = "default_compression")]
    pub compression: ExportCompression,
    /// Local filesystem path or internal S3 destination (`project_<id>/<key>`).
    pub destination: String,
}

fn default_compression() -> ExportCompression {
    ExportCompression::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        assert_eq!(Stage::parse("in").unwrap(), Stage::In);
        assert_eq!(Stage::parse("out").unwrap().as_str(), "out");
        assert!(Stage::parse("mid").is_err());
    }

    #[test]
    fn test_bucket_ids() {
        let b = Bucket {
            project_id: "p1".into(),
            name: "s".into(),
            stage: Stage::In,
            created_at: Utc::now(),
        };
        assert_eq!(b.display_id(), "in.c-s");
        assert_eq!(b.dir_name(), "in_c_s");
    }

    #[test]
    fn test_branch_source_roundtrip() {
        for s in [BranchSource::Main, BranchSource::Branch, BranchSource::BranchOnly] {
            assert_eq!(BranchSource::parse(s.as_str()).unwrap(), s);
        }
    }

    #[test]
    fn test_column_def_defaults() {
        let col: ColumnDef = serde_json::from_str(r#"{"name":"id","type":"INTEGER"}"#).unwrap();
        assert!(col.nullable);
        assert!(col.default.is_none());
    }

    #[test]
    fn test_import_options_deserialization() {
        let opts: ImportOptions = serde_json::from_str(
            r#"{"source":{"type":"file_id","value":"f1"},"incremental":true,"dedup":"fail_on_duplicates"}"#,
        )
        .unwrap();
        assert!(opts.incremental);
        assert_eq!(opts.dedup, DedupMode::FailOnDuplicates);
        assert_eq!(opts.format, DataFormat::Csv);
    }
}
