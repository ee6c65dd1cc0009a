//! Process-local counters served as Prometheus text format.
//!
//! Metric names are stable but non-normative; the counted events are the
//! contract: requests, idempotency replays/conflicts, and lock waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use cellar_engine::Engine;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub idempotency_replays: AtomicU64,
    pub idempotency_conflicts: AtomicU64,
    pub imports_total: AtomicU64,
    pub snapshots_created: AtomicU64,
    pub s3_requests_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            idempotency_replays: AtomicU64::new(0),
            idempotency_conflicts: AtomicU64::new(0),
            imports_total: AtomicU64::new(0),
            snapshots_created: AtomicU64::new(0),
            s3_requests_total: AtomicU64::new(0),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render everything in Prometheus text exposition format.
    pub fn render(&self, engine: &Engine) -> String {
        let lock_stats = engine.locks().stats();
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "cellar_requests_total",
            "HTTP requests handled",
            self.requests_total.load(Ordering::Relaxed),
        );
        counter(
            "cellar_requests_failed_total",
            "HTTP requests answered with 5xx",
            self.requests_failed.load(Ordering::Relaxed),
        );
        counter(
            "cellar_idempotency_replays_total",
            "Responses served from the idempotency cache",
            self.idempotency_replays.load(Ordering::Relaxed),
        );
        counter(
            "cellar_idempotency_conflicts_total",
            "Idempotency keys reused with a different request fingerprint",
            self.idempotency_conflicts.load(Ordering::Relaxed),
        );
        counter(
            "cellar_imports_total",
            "Completed table imports",
            self.imports_total.load(Ordering::Relaxed),
        );
        counter(
            "cellar_snapshots_created_total",
            "Snapshots created (manual and auto)",
            self.snapshots_created.load(Ordering::Relaxed),
        );
        counter(
            "cellar_s3_requests_total",
            "Requests on the S3-compatible surface",
            self.s3_requests_total.load(Ordering::Relaxed),
        );
        counter(
            "cellar_table_lock_acquisitions_total",
            "Table lock acquisitions",
            lock_stats.acquisitions,
        );
        counter(
            "cellar_table_lock_wait_ms_total",
            "Cumulative milliseconds spent waiting on table locks",
            lock_stats.wait_ms_total,
        );
        out.push_str(&format!(
            "# HELP cellar_table_locks_live Table locks currently tracked\n\
             # TYPE cellar_table_locks_live gauge\ncellar_table_locks_live {}\n",
            lock_stats.live_locks
        ));
        out.push_str(&format!(
            "# HELP cellar_uptime_seconds Process uptime\n\
             # TYPE cellar_uptime_seconds gauge\ncellar_uptime_seconds {}\n",
            self.started.elapsed().as_secs()
        ));
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_shape() {
        let metrics = Metrics::new();
        Metrics::bump(&metrics.requests_total);
        Metrics::bump(&metrics.requests_total);

        // Rendering needs an engine; fabricate a minimal one.
        let dir = tempfile::tempdir().unwrap();
        let layout = cellar_core::Layout::new(dir.path());
        let rt = tokio::runtime::Runtime::new().unwrap();
        let registry = rt
            .block_on(cellar_registry::Registry::open(&layout.registry_path()))
            .unwrap();
        let engine = Engine::new(registry, layout, cellar_engine::SnapshotCodec::Zstd);

        let text = metrics.render(&engine);
        assert!(text.contains("cellar_requests_total 2"));
        assert!(text.contains("# TYPE cellar_requests_total counter"));
        assert!(text.contains("cellar_table_locks_live 0"));
    }
}
