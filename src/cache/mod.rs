//! Bounded key/value cache with per-entry TTL and LRU eviction.
//!
//! Higher layers memoize expensive operations here. Two independent
//! ceilings bound the cache: an item count and a total estimated byte
//! size, both enforced before every insertion. Expired entries are
//! reclaimed lazily on access and by a periodic sweep.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::CacheConfig;
use crate::core::AppResult;

/// Ceiling on the periodic sweep interval, so a long default TTL cannot
/// leave expired memory lingering for minutes.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Fallback size estimate when a value cannot be serialized.
const FALLBACK_ENTRY_BYTES: usize = 64;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    access_count: u64,
    last_accessed_at: Instant,
    size_bytes: usize,
}

struct CacheInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    memory_bytes: u64,
}

/// Cache statistics, snapshotted by [`AdaptiveCache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live entry count.
    pub size: usize,
    /// hits / (hits + misses); 0 when no accesses have occurred.
    pub hit_rate: f64,
    /// Total estimated bytes held.
    pub memory_usage_bytes: u64,
    /// `get` calls that returned a value.
    pub hits: u64,
    /// `get` calls that found nothing, including expired entries.
    pub misses: u64,
    /// Insertions performed.
    pub sets: u64,
    /// Explicit deletions performed.
    pub deletes: u64,
    /// Entries removed by LRU eviction or TTL expiry (lazy or swept).
    pub evictions: u64,
}

/// Generic bounded cache with TTL expiry and least-recently-used eviction.
///
/// All map access goes through one mutex; contention is acceptable at the
/// documented scale of at most a few thousand entries.
pub struct AdaptiveCache<K, V> {
    inner: Mutex<CacheInner<K, V>>,
    default_ttl: Duration,
    max_items: usize,
    max_memory_bytes: u64,
    estimator: Arc<dyn Fn(&V) -> usize + Send + Sync>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> AdaptiveCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Build a cache whose size estimator is the serialized JSON length
    /// of each value.
    pub fn new(config: &CacheConfig) -> Self
    where
        V: Serialize,
    {
        Self::with_estimator(config, |value: &V| {
            serde_json::to_vec(value)
                .map(|b| b.len())
                .unwrap_or(FALLBACK_ENTRY_BYTES)
        })
    }

    /// Build a cache with a caller-supplied size estimator.
    pub fn with_estimator(
        config: &CacheConfig,
        estimator: impl Fn(&V) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                memory_bytes: 0,
            }),
            default_ttl: Duration::from_millis(config.default_ttl_ms),
            max_items: config.max_items,
            max_memory_bytes: config.max_memory_bytes,
            estimator: Arc::new(estimator),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Insert or replace an entry. `ttl` defaults to the configured TTL.
    ///
    /// Capacity is settled before the insert: least-recently-accessed
    /// entries are evicted until both the item-count and byte ceilings
    /// hold, or the cache is empty.
    pub fn set(&self, key: K, value: V, ttl: Option<Duration>) {
        let size_bytes = (self.estimator)(&value);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&key) {
            inner.memory_bytes = inner.memory_bytes.saturating_sub(old.size_bytes as u64);
        }
        self.ensure_capacity(&mut inner, size_bytes as u64);
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl.unwrap_or(self.default_ttl),
                access_count: 0,
                last_accessed_at: now,
                size_bytes,
            },
        );
        inner.memory_bytes += size_bytes as u64;
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    /// Look up an unexpired entry, refreshing its recency.
    ///
    /// An expired entry found here counts as a miss and is deleted on the
    /// spot, independent of the periodic sweep.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let live = inner.entries.get(key).map(|e| e.expires_at > now);
        match live {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                inner.entries.get_mut(key).map(|entry| {
                    entry.access_count += 1;
                    entry.last_accessed_at = now;
                    entry.value.clone()
                })
            }
            Some(false) => {
                if let Some(entry) = inner.entries.remove(key) {
                    inner.memory_bytes =
                        inner.memory_bytes.saturating_sub(entry.size_bytes as u64);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether an unexpired entry exists. Does not touch recency or the
    /// hit/miss counters.
    pub fn has(&self, key: &K) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .map(|e| e.expires_at > now)
            .unwrap_or(false)
    }

    /// Remove an entry. Returns whether one was present.
    pub fn delete(&self, key: &K) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.remove(key) {
            Some(entry) => {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.size_bytes as u64);
                self.deletes.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Look up a batch of keys, one slot per input key.
    pub fn get_many(&self, keys: &[K]) -> Vec<Option<V>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Insert a batch of entries under one TTL choice.
    pub fn set_many(&self, items: Vec<(K, V)>, ttl: Option<Duration>) {
        for (key, value) in items {
            self.set(key, value, ttl);
        }
    }

    /// Return the cached value for `key`, or invoke `compute`, store its
    /// result, and return it.
    ///
    /// Concurrent calls for the same key during an in-flight compute are
    /// not deduplicated; both may invoke `compute`.
    pub async fn with_cache<F, Fut>(&self, key: K, compute: F, ttl: Option<Duration>) -> AppResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<V>>,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }
        let value = compute().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.memory_bytes = 0;
        if dropped > 0 {
            tracing::debug!(dropped, "cache cleared");
        }
    }

    /// Live entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Total estimated bytes currently held.
    pub fn memory_usage_bytes(&self) -> u64 {
        self.inner.lock().memory_bytes
    }

    /// Snapshot cache statistics. The hit rate is computed here, never
    /// dividing by zero.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let accesses = hits + misses;
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            hit_rate: if accesses == 0 {
                0.0
            } else {
                hits as f64 / accesses as f64
            },
            memory_usage_bytes: inner.memory_bytes,
            hits,
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Purge every expired entry regardless of capacity pressure.
    /// Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        let mut reclaimed: u64 = 0;
        inner.entries.retain(|_, entry| {
            if entry.expires_at > now {
                true
            } else {
                reclaimed += entry.size_bytes as u64;
                false
            }
        });
        inner.memory_bytes = inner.memory_bytes.saturating_sub(reclaimed);
        let removed = before - inner.entries.len();
        if removed > 0 {
            self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Interval for the periodic sweep: a quarter of the default TTL,
    /// capped so long TTLs still sweep at least once a minute.
    pub fn sweep_interval(&self) -> Duration {
        (self.default_ttl / 4).min(MAX_SWEEP_INTERVAL)
    }

    /// Evict least-recently-accessed entries until both ceilings can
    /// absorb `incoming_bytes`, or the cache is empty.
    ///
    /// The victim search is a linear min-scan over `last_accessed_at`.
    /// That is adequate at the documented scale (at most a few thousand
    /// entries); an ordered index would be needed before growing beyond
    /// that.
    fn ensure_capacity(&self, inner: &mut CacheInner<K, V>, incoming_bytes: u64) {
        while !inner.entries.is_empty()
            && (inner.entries.len() >= self.max_items
                || inner.memory_bytes + incoming_bytes > self.max_memory_bytes)
        {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed_at)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else { break };
            if let Some(entry) = inner.entries.remove(&key) {
                inner.memory_bytes = inner.memory_bytes.saturating_sub(entry.size_bytes as u64);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("evicted least-recently-used cache entry");
            }
        }
    }
}

impl<K, V> AdaptiveCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn the periodic expiry sweep. The loop holds only a weak
    /// reference and exits on its own once the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else { break };
                cache.sweep_expired();
            }
        })
    }
}
