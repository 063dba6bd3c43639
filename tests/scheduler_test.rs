//! Integration tests for the task scheduler.
//!
//! Timing-sensitive cases run under tokio's paused clock so backoff and
//! timeout assertions are deterministic.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use watchtower_runtime::config::SchedulerConfig;
use watchtower_runtime::core::{Priority, SchedulerError, Task, TaskError, TaskScheduler};

fn config(max_concurrency: usize, queue_capacity: usize) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrency,
        queue_capacity,
        default_timeout_ms: 5_000,
        default_max_retries: 0,
        retry_base_delay_ms: 100,
    }
}

#[tokio::test(start_paused = true)]
async fn bounded_concurrency_never_exceeds_limit() {
    let scheduler = TaskScheduler::new(&config(2, 64));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for i in 0..10u32 {
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let task = Task::from_fn(move || {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }
        });
        scheduler.submit(task).unwrap();
    }

    scheduler.await_idle().await;
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(scheduler.stats().completed, 10);
    assert_eq!(scheduler.stats().peak_concurrency, 2);
}

#[tokio::test]
async fn priority_order_drains_high_before_normal_before_low() {
    let scheduler = TaskScheduler::new(&config(1, 64));
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    for (name, priority) in [
        ("a", Priority::Low),
        ("b", Priority::High),
        ("c", Priority::Normal),
    ] {
        let order = Arc::clone(&order);
        scheduler
            .submit(
                Task::from_fn(move || {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().push(name);
                        Ok(())
                    }
                })
                .with_priority(priority),
            )
            .unwrap();
    }

    scheduler.await_idle().await;
    assert_eq!(*order.lock(), vec!["b", "c", "a"]);
}

#[tokio::test]
async fn fifo_within_equal_priority() {
    let scheduler = TaskScheduler::new(&config(1, 64));
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    for i in 0..10u32 {
        let order = Arc::clone(&order);
        scheduler
            .submit(Task::from_fn(move || {
                let order = Arc::clone(&order);
                async move {
                    order.lock().push(i);
                    Ok(())
                }
            }))
            .unwrap();
    }

    scheduler.await_idle().await;
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn failing_task_retries_with_exponential_backoff() {
    let mut cfg = config(1, 16);
    cfg.retry_base_delay_ms = 100;
    let scheduler = TaskScheduler::new(&cfg);
    let attempts = Arc::new(AtomicUsize::new(0));

    let started = tokio::time::Instant::now();
    let attempts_in = Arc::clone(&attempts);
    let handle = scheduler
        .submit(
            Task::from_fn(move || {
                let attempts = Arc::clone(&attempts_in);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("flaky dependency"))
                }
            })
            .with_max_retries(3),
        )
        .unwrap();

    let result = handle.await;
    // One initial attempt plus three retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(!result.is_success());
    assert_eq!(result.retry_count, 3);
    assert!(matches!(result.error, Some(TaskError::Failed(_))));

    // Backoff delays: 100 + 200 + 400 ms minimum.
    assert!(started.elapsed() >= Duration::from_millis(700));

    let stats = scheduler.stats();
    assert_eq!(stats.retried, 3);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_at_the_timeout_not_the_closure_duration() {
    let scheduler = TaskScheduler::new(&config(1, 16));

    let started = tokio::time::Instant::now();
    let handle = scheduler
        .submit(
            Task::from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

    let result = handle.await;
    let elapsed = started.elapsed();
    assert!(matches!(result.error, Some(TaskError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(scheduler.stats().timed_out, 1);
}

#[tokio::test]
async fn submit_fails_fast_when_queue_is_full() {
    let scheduler = TaskScheduler::new(&config(1, 2));

    // Nothing yields between these submits, so the queue still holds
    // both tasks when the third arrives.
    scheduler
        .submit(Task::from_fn(|| async { Ok(()) }))
        .unwrap();
    scheduler
        .submit(Task::from_fn(|| async { Ok(()) }))
        .unwrap();
    let err = scheduler
        .submit(Task::from_fn(|| async { Ok(()) }))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull(2)));

    scheduler.await_idle().await;
    assert_eq!(scheduler.stats().completed, 2);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_drops_queued_tasks_and_spares_running_ones() {
    let scheduler = TaskScheduler::new(&config(1, 16));

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(
            scheduler
                .submit(Task::from_fn(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }))
                .unwrap(),
        );
    }

    // Let the drain loop claim the head task (running) and the one
    // behind it (waiting on a permit); the rest stay queued.
    tokio::time::sleep(Duration::from_millis(1)).await;
    scheduler.cancel_all();

    let results = futures::future::join_all(handles).await;
    let cancelled = results
        .iter()
        .filter(|r| matches!(r.error, Some(TaskError::Cancelled)))
        .count();
    let succeeded = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(cancelled, 2);
    assert_eq!(succeeded, 2);
    assert_eq!(scheduler.stats().cancelled, 2);
}

#[tokio::test(start_paused = true)]
async fn submit_batch_returns_one_result_per_task() {
    let scheduler = TaskScheduler::new(&config(2, 16));

    let tasks = vec![
        Task::from_fn(|| async { Ok(1u32) }).with_id("one"),
        Task::from_fn(|| async { Err::<u32, _>(anyhow::anyhow!("boom")) }).with_id("two"),
        Task::from_fn(|| async { Ok(3u32) }).with_id("three"),
    ];

    let results = scheduler.submit_batch(tasks).await.unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].id, "one");
    assert_eq!(results[0].value, Some(1));
    assert!(matches!(results[1].error, Some(TaskError::Failed(_))));
    assert_eq!(results[2].value, Some(3));
}

#[tokio::test]
async fn submit_batch_rejects_oversized_batches_whole() {
    let scheduler: TaskScheduler<u32> = TaskScheduler::new(&config(1, 2));

    let tasks: Vec<Task<u32>> = (0..3)
        .map(|i| Task::from_fn(move || async move { Ok(i) }))
        .collect();
    let err = scheduler.submit_batch(tasks).await.unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull(2)));
    assert_eq!(scheduler.stats().total_tasks, 0);
}

#[tokio::test]
async fn submit_batch_is_rejected_whole_when_capacity_is_partly_used() {
    let scheduler = TaskScheduler::new(&config(1, 2));
    scheduler
        .submit(Task::from_fn(|| async { Ok(0u32) }))
        .unwrap();

    let tasks: Vec<Task<u32>> = (1..3)
        .map(|i| Task::from_fn(move || async move { Ok(i) }))
        .collect();
    let err = scheduler.submit_batch(tasks).await.unwrap_err();
    assert!(matches!(err, SchedulerError::QueueFull(2)));
    // Only the standalone submission entered the system.
    assert_eq!(scheduler.stats().total_tasks, 1);

    scheduler.await_idle().await;
    assert_eq!(scheduler.stats().completed, 1);
}

// Hammers the submit/complete/idle interleaving across worker threads;
// a false idle signal shows up as a completion count short of the round's
// total.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn await_idle_never_resolves_before_every_task_finishes() {
    let scheduler = TaskScheduler::new(&config(2, 256));
    let completed = Arc::new(AtomicUsize::new(0));

    for round in 0..50usize {
        for _ in 0..4 {
            let completed = Arc::clone(&completed);
            scheduler
                .submit(Task::from_fn(move || {
                    let completed = Arc::clone(&completed);
                    async move {
                        tokio::task::yield_now().await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .unwrap();
        }
        scheduler.await_idle().await;
        assert_eq!(completed.load(Ordering::SeqCst), (round + 1) * 4);
    }
}

#[tokio::test]
async fn await_idle_resolves_immediately_when_nothing_submitted() {
    let scheduler: TaskScheduler<()> = TaskScheduler::new(&config(2, 16));
    scheduler.await_idle().await;
}

#[tokio::test(start_paused = true)]
async fn raising_the_concurrency_limit_takes_effect() {
    let scheduler = TaskScheduler::new(&config(1, 32));

    for _ in 0..6 {
        scheduler
            .submit(Task::from_fn(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }))
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
    scheduler.set_concurrency_limit(3);
    assert_eq!(scheduler.concurrency_limit(), 3);

    scheduler.await_idle().await;
    let stats = scheduler.stats();
    assert_eq!(stats.completed, 6);
    assert!(stats.peak_concurrency >= 2);
    assert!(stats.peak_concurrency <= 3);
}

#[tokio::test(start_paused = true)]
async fn end_to_end_five_tasks_limit_two() {
    let scheduler = TaskScheduler::new(&config(2, 16));

    let mut handles = Vec::new();
    for i in 0..5u32 {
        handles.push(
            scheduler
                .submit(Task::from_fn(move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(i)
                }))
                .unwrap(),
        );
    }

    scheduler.await_idle().await;
    let stats = scheduler.stats();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.peak_concurrency, 2);
    assert_eq!(stats.active_count, 0);
    assert_eq!(stats.current_queue_size, 0);
    assert!(stats.success_rate > 0.999);

    let results = futures::future::join_all(handles).await;
    let mut values: Vec<u32> = results.into_iter().filter_map(|r| r.value).collect();
    values.sort_unstable();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn shutdown_rejects_new_submissions() {
    let scheduler: TaskScheduler<()> = TaskScheduler::new(&config(1, 16));
    scheduler.shutdown();
    let err = scheduler
        .submit(Task::from_fn(|| async { Ok(()) }))
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Shutdown));
}
