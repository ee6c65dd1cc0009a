//! Centralized default constants for the cellar system.
//!
//! **This module is the single source of truth** for all shared default
//! values. All crates reference these constants instead of defining their own
//! magic numbers.

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 8080;

/// Default PostgreSQL wire-protocol port.
pub const PG_PORT: u16 = 5432;

/// Default rate limit: max requests per period.
pub const RATE_LIMIT_REQUESTS: u64 = 600;

/// Default rate limit: period in seconds.
pub const RATE_LIMIT_PERIOD_SECS: u64 = 60;

/// Maximum request body size in bytes (2 GB, covers bulk CSV imports).
pub const MAX_BODY_SIZE_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Grace window for in-flight pg-wire queries on shutdown, in seconds.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

// =============================================================================
// IDEMPOTENCY
// =============================================================================

/// Idempotency cache entry TTL in seconds (10 minutes).
pub const IDEMPOTENCY_TTL_SECS: i64 = 600;

// =============================================================================
// SNAPSHOTS
// =============================================================================

/// Retention for manually requested snapshots, in days.
pub const MANUAL_RETENTION_DAYS: i64 = 90;

/// Retention for auto-triggered snapshots, in days.
pub const AUTO_RETENTION_DAYS: i64 = 7;

/// Default snapshot artifact compression codec (zstd | gzip | snappy).
pub const SNAPSHOT_CODEC: &str = "zstd";

/// Trigger names enabled when no configuration row exists at any scope.
pub const DEFAULT_AUTO_TRIGGERS: &[&str] = &["drop_table"];

// =============================================================================
// FILES
// =============================================================================

/// Per-project file count quota.
pub const FILES_MAX_COUNT: i64 = 10_000;

/// Per-project file byte quota (1 TiB).
pub const FILES_MAX_BYTES: i64 = 1024 * 1024 * 1024 * 1024;

/// Staged upload lifetime before the janitor reaps it, in seconds (24h).
pub const STAGED_UPLOAD_TTL_SECS: i64 = 24 * 3600;

// =============================================================================
// WORKSPACES
// =============================================================================

/// Default workspace lifetime in seconds (24h).
pub const WORKSPACE_TTL_SECS: i64 = 24 * 3600;

/// Default workspace database size limit (10 GiB).
pub const WORKSPACE_SIZE_LIMIT_BYTES: i64 = 10 * 1024 * 1024 * 1024;

/// Default per-session statement timeout in seconds (5 minutes).
pub const STATEMENT_TIMEOUT_SECS: u64 = 300;

/// Default per-session idle timeout in seconds (1 hour).
pub const IDLE_TIMEOUT_SECS: u64 = 3600;

/// Default per-session memory cap handed to the engine.
pub const SESSION_MEMORY_LIMIT: &str = "2GB";

/// Default per-session temp-spill cap handed to the engine.
pub const SESSION_TEMP_LIMIT: &str = "10GB";

// =============================================================================
// TABLE ENGINE
// =============================================================================

/// Default preview page size.
pub const PREVIEW_LIMIT: i64 = 100;

/// Hard ceiling for a single preview request.
pub const PREVIEW_MAX_LIMIT: i64 = 10_000;

/// Sample size per column for profile pattern detection.
pub const PROFILE_PATTERN_SAMPLE: i64 = 1_000;

/// Minimum |Pearson r| for a correlation pair to be reported.
pub const CORRELATION_MIN_ABS: f64 = 0.3;

/// Maximum number of correlation pairs reported per profile.
pub const CORRELATION_TOP_N: usize = 20;

// =============================================================================
// CONCURRENCY
// =============================================================================

/// Conceptual per-project pending-write depth. Realised as per-table locks
/// with synchronous acquisition; callers past this depth simply wait.
pub const WRITE_QUEUE_DEPTH: usize = 1000;

/// Janitor sweep cadence in seconds.
pub const JANITOR_INTERVAL_SECS: u64 = 60;

/// Unreferenced table-lock reclamation cadence in seconds.
pub const LOCK_JANITOR_INTERVAL_SECS: u64 = 300;
