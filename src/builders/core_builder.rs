//! Composition-root construction of the runtime core from configuration.

use std::hash::Hash;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::AdaptiveCache;
use crate::config::RuntimeConfig;
use crate::core::{AppResult, TaskScheduler};
use crate::resource::ResourceLifecycleManager;

/// The assembled runtime core: scheduler, resource manager, and cache,
/// with both background sweepers running and the cache supervised for
/// memory pressure.
///
/// Owned by the application's composition root and passed by reference to
/// whatever needs it; there is no process-wide singleton, so tests can
/// build isolated instances per case.
pub struct RuntimeCore<T, K, V> {
    /// Task scheduler for units of work producing `T`.
    pub scheduler: Arc<TaskScheduler<T>>,
    /// Registry of external handles.
    pub resources: Arc<ResourceLifecycleManager>,
    /// Memoization cache.
    pub cache: Arc<AdaptiveCache<K, V>>,
    sweepers: Vec<tokio::task::JoinHandle<()>>,
}

impl<T, K, V> RuntimeCore<T, K, V>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Graceful shutdown: stop admitting tasks, cancel queued work, stop
    /// the sweepers, and release every registered resource.
    pub async fn shutdown(self) {
        self.scheduler.shutdown();
        for sweeper in &self.sweepers {
            sweeper.abort();
        }
        self.resources.release_all().await;
    }
}

/// Validate `config` and assemble a [`RuntimeCore`].
pub fn build_runtime_core<T, K, V>(config: &RuntimeConfig) -> AppResult<RuntimeCore<T, K, V>>
where
    T: Send + 'static,
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Serialize + Send + 'static,
{
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid runtime config: {e}"))?;

    let scheduler = Arc::new(TaskScheduler::new(&config.scheduler));
    let resources = Arc::new(ResourceLifecycleManager::new(&config.resources));
    let cache = Arc::new(AdaptiveCache::new(&config.cache));

    resources.supervise(&cache);
    let sweepers = vec![resources.start_sweeper(), cache.start_sweeper()];

    Ok(RuntimeCore {
        scheduler,
        resources,
        cache,
        sweepers,
    })
}
