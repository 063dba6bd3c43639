//! Integration tests for the resource lifecycle manager.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use watchtower_runtime::cache::AdaptiveCache;
use watchtower_runtime::config::{CacheConfig, ResourceConfig};
use watchtower_runtime::resource::{ResourceKind, ResourceLifecycleManager};

fn manager() -> ResourceLifecycleManager {
    ResourceLifecycleManager::new(&ResourceConfig::default())
}

fn counting_release(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<anyhow::Result<()>> + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(Ok(()))
    }
}

#[tokio::test]
async fn release_is_idempotent_per_registration() {
    let manager = manager();
    let released = Arc::new(AtomicUsize::new(0));

    manager.register("session-1", ResourceKind::BrowserSession, counting_release(&released), None);

    assert!(manager.release("session-1").await);
    assert!(!manager.release("session-1").await);
    assert_eq!(released.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_release_is_absorbed_and_entry_removed() {
    let manager = manager();
    manager.register(
        "broken",
        ResourceKind::Network,
        || async { Err(anyhow::anyhow!("connection already dropped")) },
        None,
    );

    assert!(manager.release("broken").await);
    let stats = manager.stats();
    assert_eq!(stats.total_registered, 0);
    assert_eq!(stats.release_failures, 1);
}

#[tokio::test]
async fn release_by_kind_only_touches_that_kind() {
    let manager = manager();
    let released = Arc::new(AtomicUsize::new(0));

    manager.register("net-1", ResourceKind::Network, counting_release(&released), None);
    manager.register("net-2", ResourceKind::Network, counting_release(&released), None);
    manager.register("file-1", ResourceKind::File, counting_release(&released), None);

    let count = manager.release_by_kind(&ResourceKind::Network).await;
    assert_eq!(count, 2);
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert_eq!(manager.stats().total_registered, 1);
}

#[tokio::test]
async fn release_expired_spares_recently_touched_handles() {
    let manager = manager();
    let released = Arc::new(AtomicUsize::new(0));

    manager.register("stale", ResourceKind::File, counting_release(&released), None);
    manager.register("fresh", ResourceKind::File, counting_release(&released), None);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(manager.touch("fresh"));
    assert!(!manager.touch("missing"));

    let count = manager.release_expired(Duration::from_millis(50)).await;
    assert_eq!(count, 1);
    let stats = manager.stats();
    assert_eq!(stats.total_registered, 1);
    assert_eq!(stats.counts_by_kind.get("file"), Some(&1));
}

#[tokio::test]
async fn release_all_settles_every_callback_despite_failures() {
    let manager = manager();
    let released = Arc::new(AtomicUsize::new(0));

    manager.register("ok-1", ResourceKind::Timer, counting_release(&released), None);
    manager.register(
        "bad",
        ResourceKind::Timer,
        || async { Err(anyhow::anyhow!("boom")) },
        None,
    );
    manager.register("ok-2", ResourceKind::Timer, counting_release(&released), None);

    manager.release_all().await;
    assert_eq!(released.load(Ordering::SeqCst), 2);
    let stats = manager.stats();
    assert_eq!(stats.total_registered, 0);
    assert_eq!(stats.release_failures, 1);
}

#[tokio::test]
async fn stats_group_by_kind_with_custom_labels() {
    let manager = manager();
    manager.register(
        "s-1",
        ResourceKind::BrowserSession,
        || async { Ok(()) },
        Some(serde_json::json!({"site": "example.org"})),
    );
    manager.register(
        "gpu",
        ResourceKind::Other("gpu_context".into()),
        || async { Ok(()) },
        None,
    );

    let stats = manager.stats();
    assert_eq!(stats.total_registered, 2);
    assert_eq!(stats.counts_by_kind.get("browser_session"), Some(&1));
    assert_eq!(stats.counts_by_kind.get("gpu_context"), Some(&1));
    assert!(stats.oldest_age_ms_by_kind.contains_key("browser_session"));

    assert_eq!(
        manager.metadata("s-1"),
        Some(serde_json::json!({"site": "example.org"}))
    );
    assert_eq!(manager.metadata("gpu"), None);
}

#[tokio::test]
async fn re_registering_an_id_releases_the_displaced_entry() {
    let manager = manager();
    let old_released = Arc::new(AtomicUsize::new(0));
    let new_released = Arc::new(AtomicUsize::new(0));

    manager.register("conn", ResourceKind::Network, counting_release(&old_released), None);
    manager.register("conn", ResourceKind::Network, counting_release(&new_released), None);

    // The displaced callback runs on a background task.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(old_released.load(Ordering::SeqCst), 1);
    assert_eq!(new_released.load(Ordering::SeqCst), 0);
    assert_eq!(manager.stats().total_registered, 1);

    assert!(manager.release("conn").await);
    assert_eq!(new_released.load(Ordering::SeqCst), 1);
    assert_eq!(manager.stats().total_registered, 0);
}

#[tokio::test]
async fn register_anonymous_returns_a_usable_id() {
    let manager = manager();
    let id = manager.register_anonymous(ResourceKind::MemoryBlock, || async { Ok(()) });
    assert!(manager.touch(&id));
    assert!(manager.release(&id).await);
}

#[tokio::test]
async fn pressure_relief_sheds_supervised_caches_and_rate_limits() {
    let manager = Arc::new(ResourceLifecycleManager::new(&ResourceConfig {
        sweep_interval_ms: 60_000,
        ..ResourceConfig::default()
    }));
    let cache: Arc<AdaptiveCache<String, String>> =
        Arc::new(AdaptiveCache::new(&CacheConfig::default()));
    cache.set("k".into(), "v".into(), None);
    manager.supervise(&cache);

    manager.relieve_pressure().await;
    assert!(cache.is_empty());

    // A second relief inside the same sweep window is a no-op.
    cache.set("k".into(), "v".into(), None);
    manager.relieve_pressure().await;
    assert_eq!(cache.len(), 1);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn tiny_ceiling_reports_memory_pressure() {
    let manager = ResourceLifecycleManager::new(&ResourceConfig {
        memory_ceiling_bytes: Some(1),
        ..ResourceConfig::default()
    });
    let info = manager.memory_info();
    assert!(info.rss_bytes > 0);
    assert!(manager.is_under_memory_pressure());
}
