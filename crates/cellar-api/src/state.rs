//! Shared application state: the lifecycle-owned core handed to every
//! handler via the axum state extractor.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use cellar_engine::Engine;
use cellar_files::{FilesStore, ObjectStore};
use cellar_registry::Registry;

use crate::metrics::Metrics;

pub type GlobalLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    pub files: FilesStore,
    pub objects: ObjectStore,
    /// Plaintext admin key from the environment; compared constant-time.
    pub admin_key: String,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Option<Arc<GlobalLimiter>>,
}

impl AppState {
    pub fn new(
        engine: Engine,
        files: FilesStore,
        objects: ObjectStore,
        admin_key: String,
        rate_limit_per_minute: Option<u64>,
    ) -> Self {
        let rate_limiter = rate_limit_per_minute
            .and_then(|v| u32::try_from(v).ok())
            .and_then(NonZeroU32::new)
            .map(|per_minute| Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))));
        Self {
            engine,
            files,
            objects,
            admin_key,
            metrics: Arc::new(Metrics::new()),
            rate_limiter,
        }
    }

    pub fn registry(&self) -> &Registry {
        self.engine.registry()
    }
}
