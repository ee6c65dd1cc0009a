//! PG-wire TCP server with graceful shutdown: stop accepting on signal,
//! drain in-flight sessions up to a grace window, then force-close.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use cellar_core::Result;
use cellar_engine::Engine;

use crate::session::{run_session, SessionLimits};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct PgServerConfig {
    pub bind: SocketAddr,
    pub limits: SessionLimits,
    pub shutdown_grace: Duration,
}

impl PgServerConfig {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            limits: SessionLimits::default(),
            shutdown_grace: Duration::from_secs(cellar_core::defaults::SHUTDOWN_GRACE_SECS),
        }
    }
}

/// Handle to a running server.
pub struct PgServerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
    pub local_addr: SocketAddr,
}

impl PgServerHandle {
    /// Trigger graceful shutdown and wait for the server to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Bind and start serving. Returns once the listener is live.
pub async fn serve(engine: Engine, config: PgServerConfig) -> Result<PgServerHandle> {
    let listener = TcpListener::bind(config.bind).await?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "pg-wire listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let join = tokio::spawn(accept_loop(engine, listener, config, shutdown_rx));

    Ok(PgServerHandle {
        shutdown_tx,
        join,
        local_addr,
    })
}

async fn accept_loop(
    engine: Engine,
    listener: TcpListener,
    config: PgServerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let engine = engine.clone();
                        let limits = config.limits.clone();
                        let session_shutdown = shutdown_rx.clone();
                        sessions.spawn(async move {
                            run_session(engine, stream, peer, limits, session_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            _ = shutdown_rx.changed() => break,
        }
        // Opportunistically reap finished sessions.
        while sessions.try_join_next().is_some() {}
    }

    info!(
        in_flight = sessions.len(),
        grace_secs = config.shutdown_grace.as_secs(),
        "pg-wire draining sessions"
    );
    let drain = async {
        while sessions.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("grace window elapsed; force-closing pg-wire sessions");
        sessions.abort_all();
        while sessions.join_next().await.is_some() {}
    }
    info!("pg-wire stopped");
}
