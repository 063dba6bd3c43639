//! Registry of externally owned handles with idle reclamation and
//! memory-pressure relief.
//!
//! Owners register a handle with an async release callback at acquisition
//! time, `touch` it on use, and either release it explicitly or let the
//! background sweep reclaim it after the idle threshold. When process
//! memory crosses the configured fraction of its ceiling, the manager
//! releases handles idle beyond a shorter emergency threshold and tells
//! the caches it supervises to shed their contents.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::AdaptiveCache;
use crate::config::ResourceConfig;

pub mod memory;

pub use memory::MemoryInfo;

/// Kind of tracked external handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A headless-browser or scraping session.
    BrowserSession,
    /// An open file handle.
    File,
    /// A network connection.
    Network,
    /// A pending timer registration.
    Timer,
    /// A large memory allocation tracked for accounting.
    MemoryBlock,
    /// Caller-defined kind.
    Other(String),
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BrowserSession => f.write_str("browser_session"),
            Self::File => f.write_str("file"),
            Self::Network => f.write_str("network"),
            Self::Timer => f.write_str("timer"),
            Self::MemoryBlock => f.write_str("memory_block"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

/// Cooperative shedding hook for components the manager supervises under
/// memory pressure.
pub trait PressureTarget: Send + Sync {
    /// Drop reclaimable contents.
    fn shed(&self);
    /// Estimated bytes currently held, for relief logging.
    fn held_bytes(&self) -> u64;
}

impl<K, V> PressureTarget for AdaptiveCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn shed(&self) {
        self.clear();
    }

    fn held_bytes(&self) -> u64 {
        self.memory_usage_bytes()
    }
}

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

struct Registered {
    kind: ResourceKind,
    created_at: Instant,
    last_used_at: Instant,
    release: ReleaseFn,
    metadata: Option<serde_json::Value>,
}

/// Registry statistics, snapshotted by
/// [`ResourceLifecycleManager::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStats {
    /// Currently registered handles.
    pub total_registered: usize,
    /// Live handle count per kind label.
    pub counts_by_kind: HashMap<String, usize>,
    /// Age of the oldest live handle per kind label, in milliseconds.
    pub oldest_age_ms_by_kind: HashMap<String, u64>,
    /// Release callbacks that errored since construction.
    pub release_failures: u64,
}

/// Tracks externally owned handles and reclaims them when idle, on
/// explicit release, under memory pressure, or at shutdown.
///
/// A release callback is consumed together with its registry entry, so it
/// runs at most once per registration; a second `release` on the same id
/// returns `false`. Callback errors are logged and absorbed, so a broken
/// external resource never occupies a registry slot permanently.
pub struct ResourceLifecycleManager {
    registry: Mutex<HashMap<String, Registered>>,
    config: ResourceConfig,
    pressure_targets: Mutex<Vec<Weak<dyn PressureTarget>>>,
    last_relief: Mutex<Option<Instant>>,
    release_failures: Arc<AtomicU64>,
}

impl ResourceLifecycleManager {
    /// Build a manager from validated configuration.
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            config: config.clone(),
            pressure_targets: Mutex::new(Vec::new()),
            last_relief: Mutex::new(None),
            release_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register an external handle under `id` with its release callback.
    ///
    /// Re-registering an id replaces the previous entry; the displaced
    /// entry's release callback runs in the background with the usual
    /// absorbed-failure semantics, so the old external handle is not
    /// leaked.
    pub fn register<F, Fut>(
        &self,
        id: impl Into<String>,
        kind: ResourceKind,
        release: F,
        metadata: Option<serde_json::Value>,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.into();
        let now = Instant::now();
        let entry = Registered {
            kind: kind.clone(),
            created_at: now,
            last_used_at: now,
            release: Box::new(move || Box::pin(release())),
            metadata,
        };
        let displaced = self.registry.lock().insert(id.clone(), entry);
        if let Some(old) = displaced {
            tracing::warn!(resource = %id, "re-registered id, releasing displaced entry");
            let failures = Arc::clone(&self.release_failures);
            let old_id = id.clone();
            tokio::spawn(async move {
                if let Err(error) = (old.release)().await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(resource = %old_id, kind = %old.kind, %error, "displaced entry release failed");
                }
            });
        }
        tracing::debug!(resource = %id, %kind, "resource registered");
    }

    /// Register a handle under a generated id, returning the id.
    pub fn register_anonymous<F, Fut>(&self, kind: ResourceKind, release: F) -> String
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        self.register(id.clone(), kind, release, None);
        id
    }

    /// Refresh a handle's last-used time. Returns whether it was found.
    pub fn touch(&self, id: &str) -> bool {
        let mut registry = self.registry.lock();
        match registry.get_mut(id) {
            Some(entry) => {
                entry.last_used_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Opaque metadata attached at registration, if any.
    pub fn metadata(&self, id: &str) -> Option<serde_json::Value> {
        self.registry
            .lock()
            .get(id)
            .and_then(|entry| entry.metadata.clone())
    }

    /// Release one handle. Returns `false` if the id is unknown or was
    /// already released.
    pub async fn release(&self, id: &str) -> bool {
        let entry = self.registry.lock().remove(id);
        match entry {
            Some(entry) => {
                self.run_release(id.to_string(), entry).await;
                true
            }
            None => false,
        }
    }

    /// Release every handle of `kind`, returning how many were released.
    pub async fn release_by_kind(&self, kind: &ResourceKind) -> usize {
        let drained = self.drain_matching(|entry| entry.kind == *kind);
        self.run_releases(drained).await
    }

    /// Release every handle idle longer than `max_idle`, returning how
    /// many were released.
    pub async fn release_expired(&self, max_idle: Duration) -> usize {
        let cutoff = Instant::now();
        let drained =
            self.drain_matching(|entry| cutoff.duration_since(entry.last_used_at) > max_idle);
        let count = self.run_releases(drained).await;
        if count > 0 {
            tracing::info!(count, max_idle_ms = max_idle.as_millis() as u64, "reclaimed idle resources");
        }
        count
    }

    /// Release everything, awaiting every callback. Partial failures are
    /// logged and never block the remaining releases. Used for graceful
    /// shutdown.
    pub async fn release_all(&self) {
        let drained = self.drain_matching(|_| true);
        let count = self.run_releases(drained).await;
        tracing::info!(count, "released all resources");
    }

    /// Supervise a pressure target: under memory pressure it is told to
    /// shed its contents. Only a weak reference is held.
    pub fn supervise(&self, target: &Arc<impl PressureTarget + 'static>) {
        let target: Arc<dyn PressureTarget> = Arc::clone(target) as Arc<dyn PressureTarget>;
        self.pressure_targets.lock().push(Arc::downgrade(&target));
    }

    /// Current process memory snapshot against the configured ceiling.
    pub fn memory_info(&self) -> MemoryInfo {
        memory::sample(self.config.memory_ceiling_bytes)
    }

    /// Whether process memory exceeds the configured pressure fraction.
    pub fn is_under_memory_pressure(&self) -> bool {
        self.memory_info().used_ratio >= self.config.memory_pressure_ratio
    }

    /// Snapshot registry statistics.
    pub fn stats(&self) -> ResourceStats {
        let now = Instant::now();
        let registry = self.registry.lock();
        let mut counts_by_kind: HashMap<String, usize> = HashMap::new();
        let mut oldest_age_ms_by_kind: HashMap<String, u64> = HashMap::new();
        for entry in registry.values() {
            let label = entry.kind.to_string();
            *counts_by_kind.entry(label.clone()).or_insert(0) += 1;
            let age_ms = now.duration_since(entry.created_at).as_millis() as u64;
            let oldest = oldest_age_ms_by_kind.entry(label).or_insert(0);
            if age_ms > *oldest {
                *oldest = age_ms;
            }
        }
        ResourceStats {
            total_registered: registry.len(),
            counts_by_kind,
            oldest_age_ms_by_kind,
            release_failures: self.release_failures.load(Ordering::Relaxed),
        }
    }

    /// Run one sweep cycle: reclaim idle handles, then check memory and
    /// relieve pressure if needed. Exposed for deterministic tests; the
    /// background sweeper calls this on every tick.
    pub async fn sweep(&self) {
        self.release_expired(Duration::from_millis(self.config.idle_timeout_ms))
            .await;
        if self.is_under_memory_pressure() {
            self.relieve_pressure().await;
        }
    }

    /// Pressure-relief sequence: release handles idle beyond the
    /// emergency threshold and shed supervised targets. Rate-limited to
    /// once per sweep interval so repeated sweeps under sustained
    /// pressure do not thrash.
    pub async fn relieve_pressure(&self) {
        let window = Duration::from_millis(self.config.sweep_interval_ms);
        {
            let mut last = self.last_relief.lock();
            if let Some(at) = *last {
                if at.elapsed() < window {
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        let info = self.memory_info();
        tracing::warn!(
            rss_bytes = info.rss_bytes,
            ceiling_bytes = info.ceiling_bytes,
            used_ratio = info.used_ratio,
            "memory pressure detected, starting relief"
        );

        let released = self
            .release_expired(Duration::from_millis(self.config.emergency_idle_timeout_ms))
            .await;

        let mut shed_bytes: u64 = 0;
        let targets = {
            let mut targets = self.pressure_targets.lock();
            targets.retain(|t| t.strong_count() > 0);
            targets.clone()
        };
        for target in targets {
            if let Some(target) = target.upgrade() {
                shed_bytes += target.held_bytes();
                target.shed();
            }
        }
        // No collector to hint at in this runtime; freed allocations
        // return to the allocator as the drops above complete.
        tracing::warn!(released, shed_bytes, "memory pressure relief finished");
    }

    fn drain_matching(&self, matches: impl Fn(&Registered) -> bool) -> Vec<(String, Registered)> {
        let mut registry = self.registry.lock();
        let ids: Vec<String> = registry
            .iter()
            .filter(|(_, entry)| matches(entry))
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| registry.remove(&id).map(|entry| (id, entry)))
            .collect()
    }

    async fn run_releases(&self, drained: Vec<(String, Registered)>) -> usize {
        let count = drained.len();
        let futures = drained
            .into_iter()
            .map(|(id, entry)| self.run_release(id, entry));
        join_all(futures).await;
        count
    }

    /// Invoke one release callback with all-settled semantics: an error
    /// is logged and the handle still counts as released.
    async fn run_release(&self, id: String, entry: Registered) {
        let kind = entry.kind.clone();
        if let Err(error) = (entry.release)().await {
            self.release_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(resource = %id, %kind, %error, "release callback failed; entry removed anyway");
        } else {
            tracing::debug!(resource = %id, %kind, "resource released");
        }
    }
}

impl ResourceLifecycleManager {
    /// Spawn the background sweep loop. Holds only a weak reference and
    /// exits once the manager is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.sweep_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else { break };
                manager.sweep().await;
            }
        })
    }

    /// Hook process termination (ctrl-c / SIGINT) to `release_all`, so
    /// external handles are cleaned up before the process exits.
    pub fn install_signal_handler(manager: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("termination signal received, releasing resources");
                manager.release_all().await;
            }
        })
    }
}
