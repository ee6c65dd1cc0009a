//! Structured logging field name constants for cellar.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation tools can query by standardized names across subsystems.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-row iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated across request → core → janitor sub-calls.
/// Format: UUIDv7 (time-ordered).
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "api", "registry", "engine", "files", "pgwire", "jobs", "s3"
pub const SUBSYSTEM: &str = "subsystem";

/// Logical operation name, e.g. "import", "create_table", "restore".
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

pub const PROJECT_ID: &str = "project_id";
pub const BRANCH_ID: &str = "branch_id";
pub const BUCKET: &str = "bucket";
pub const TABLE: &str = "table";
pub const SNAPSHOT_ID: &str = "snapshot_id";
pub const FILE_ID: &str = "file_id";
pub const WORKSPACE_ID: &str = "workspace_id";
pub const SESSION_ID: &str = "session_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Time spent waiting on a table lock, in milliseconds.
pub const LOCK_WAIT_MS: &str = "lock_wait_ms";

/// Row count affected or returned.
pub const ROW_COUNT: &str = "row_count";

/// Byte size of a file, artifact, or payload.
pub const SIZE_BYTES: &str = "size_bytes";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
