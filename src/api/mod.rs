use std::sync::Arc;

use crate::cache::CacheService;
use crate::config::Config;
use crate::db::store::ScanStore;

pub mod dashboard;
pub mod health;
pub mod routes;
pub mod scan;

/// Submission only enqueues (writes a `pending` row); claiming and driving
/// scans is the worker pool's job, spawned independently in `main`. The API
/// layer never holds a database handle across a scanner invocation.
#[derive(Clone)]
pub struct AppState {
    pub store: ScanStore,
    pub cache: CacheService,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(store: ScanStore, cache: CacheService, config: Arc<Config>) -> Self {
        Self { store, cache, config }
    }
}
