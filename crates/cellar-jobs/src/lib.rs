//! # cellar-jobs
//!
//! Background janitor for cellar. One periodic worker runs the sweeps the
//! error-handling design tolerates deferring: expired snapshots, lapsed
//! idempotency entries, staged uploads past their window, expired
//! workspaces, and unreferenced table locks.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use cellar_engine::Engine;
use cellar_files::FilesStore;

/// Configuration for the janitor worker.
#[derive(Debug, Clone)]
pub struct JanitorConfig {
    /// Sweep cadence in seconds.
    pub interval_secs: u64,
    /// Lock-map reclamation cadence in seconds (slower than the sweep).
    pub lock_interval_secs: u64,
    /// Whether the janitor runs at all.
    pub enabled: bool,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: cellar_core::defaults::JANITOR_INTERVAL_SECS,
            lock_interval_secs: cellar_core::defaults::LOCK_JANITOR_INTERVAL_SECS,
            enabled: true,
        }
    }
}

impl JanitorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JANITOR_ENABLED` | `true` | Enable/disable the janitor |
    /// | `JANITOR_INTERVAL_SECS` | `60` | Sweep cadence |
    /// | `JANITOR_LOCK_INTERVAL_SECS` | `300` | Lock reclamation cadence |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JANITOR_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);
        let interval_secs = std::env::var("JANITOR_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cellar_core::defaults::JANITOR_INTERVAL_SECS);
        let lock_interval_secs = std::env::var("JANITOR_LOCK_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(cellar_core::defaults::LOCK_JANITOR_INTERVAL_SECS);
        Self {
            interval_secs,
            lock_interval_secs,
            enabled,
        }
    }
}

/// Handle for controlling a running janitor.
pub struct JanitorHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl JanitorHandle {
    /// Signal the janitor to stop after the current sweep.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// The janitor worker.
pub struct Janitor {
    engine: Engine,
    files: FilesStore,
    config: JanitorConfig,
}

impl Janitor {
    pub fn new(engine: Engine, files: FilesStore, config: JanitorConfig) -> Self {
        Self {
            engine,
            files,
            config,
        }
    }

    /// Start the worker and return a control handle.
    pub fn start(self) -> JanitorHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        JanitorHandle { shutdown_tx }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("janitor disabled");
            return;
        }
        info!(
            interval_secs = self.config.interval_secs,
            "janitor started"
        );

        let mut since_lock_sweep = 0u64;
        loop {
            tokio::select! {
                _ = sleep(Duration::from_secs(self.config.interval_secs)) => {}
                _ = shutdown_rx.recv() => {
                    info!("janitor stopped");
                    return;
                }
            }

            self.sweep_once().await;

            since_lock_sweep += self.config.interval_secs;
            if since_lock_sweep >= self.config.lock_interval_secs {
                since_lock_sweep = 0;
                let reclaimed = self.engine.locks().reclaim_unreferenced();
                if reclaimed > 0 {
                    debug!(reclaimed, "table locks reclaimed");
                }
            }
        }
    }

    /// Run every sweep once. Each sweep failure is logged and deferred to
    /// the next cycle; one failing sweep never blocks the others.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        match self.engine.purge_expired_snapshots(&now).await {
            Ok(0) => {}
            Ok(purged) => info!(purged, "expired snapshots removed"),
            Err(e) => warn!(error = %e, "snapshot expiry sweep failed"),
        }

        match self.engine.registry().idempotency.purge_expired(&now).await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "idempotency entries evicted"),
            Err(e) => warn!(error = %e, "idempotency sweep failed"),
        }

        match self.files.reap_staged(&now).await {
            Ok(0) => {}
            Ok(reaped) => info!(reaped, "expired staged uploads reaped"),
            Err(e) => warn!(error = %e, "staged upload sweep failed"),
        }

        match self.engine.expire_workspaces(&now).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "workspaces expired"),
            Err(e) => warn!(error = %e, "workspace expiry sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellar_core::Layout;
    use cellar_registry::Registry;

    #[tokio::test]
    async fn test_sweep_once_on_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let registry = Registry::open(&layout.registry_path()).await.unwrap();
        let engine = Engine::new(
            registry.clone(),
            layout.clone(),
            cellar_engine::SnapshotCodec::Zstd,
        );
        let files = FilesStore::new(registry, layout);

        // Must not error with nothing to do.
        Janitor::new(engine, files, JanitorConfig::default())
            .sweep_once()
            .await;
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path());
        let registry = Registry::open(&layout.registry_path()).await.unwrap();
        let engine = Engine::new(
            registry.clone(),
            layout.clone(),
            cellar_engine::SnapshotCodec::Zstd,
        );
        let files = FilesStore::new(registry, layout);

        let handle = Janitor::new(
            engine,
            files,
            JanitorConfig {
                interval_secs: 3600,
                lock_interval_secs: 3600,
                enabled: true,
            },
        )
        .start();
        handle.shutdown().await;
    }
}
