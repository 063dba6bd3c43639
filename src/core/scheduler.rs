//! Priority-aware task scheduler bounded by a counting-semaphore budget.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, watch, OwnedSemaphorePermit, Semaphore};

use crate::config::SchedulerConfig;
use crate::core::error::{SchedulerError, TaskError};
use crate::core::queue::PriorityQueue;
use crate::core::task::{Task, TaskResult, TaskState};

/// Aggregate scheduler statistics, snapshotted by [`TaskScheduler::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    /// Tasks admitted into the queue since construction.
    pub total_tasks: u64,
    /// Tasks that reached `Succeeded`.
    pub completed: u64,
    /// Tasks that exhausted retries with a work error.
    pub failed: u64,
    /// Tasks that exhausted retries with a timeout as the final error.
    pub timed_out: u64,
    /// Individual retry attempts performed across all tasks.
    pub retried: u64,
    /// Queued tasks dropped by `cancel_all`.
    pub cancelled: u64,
    /// Mean execution time of terminal tasks in milliseconds, excluding
    /// queue wait and backoff delays. 0 when nothing has finished.
    pub avg_duration_ms: f64,
    /// completed / (completed + failed + timed_out); 0 when nothing has
    /// finished.
    pub success_rate: f64,
    /// Current queue depth.
    pub current_queue_size: usize,
    /// Tasks currently holding a permit.
    pub active_count: usize,
    /// Highest observed permit-holder count.
    pub peak_concurrency: usize,
    /// Highest observed queue depth.
    pub peak_queue_size: usize,
}

/// Resolves to the task's terminal [`TaskResult`].
///
/// Returned by [`TaskScheduler::submit`]; it never errors: failure,
/// timeout, and cancellation are all expressed inside the result.
pub struct TaskHandle<T> {
    id: String,
    rx: oneshot::Receiver<TaskResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Id of the submitted task.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> std::fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = TaskResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender only disappears when the scheduler shuts down
            // with the task still in flight.
            Poll::Ready(Err(_)) => Poll::Ready(TaskResult::cancelled(this.id.clone())),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct QueuedEntry<T> {
    task: Task<T>,
    tx: oneshot::Sender<TaskResult<T>>,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
    duration_ms_total: AtomicU64,
    peak_concurrency: AtomicUsize,
    peak_queue_size: AtomicUsize,
}

struct Inner<T> {
    queue: Mutex<PriorityQueue<QueuedEntry<T>>>,
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    /// Permit holders (running or backing off).
    active: AtomicUsize,
    /// Tasks popped from the queue but not yet terminal; superset of
    /// `active` that also covers the pop-to-permit window, so idle
    /// detection never fires early.
    inflight: AtomicUsize,
    draining: AtomicBool,
    shutdown: AtomicBool,
    idle_tx: watch::Sender<bool>,
    counters: Counters,
    default_timeout: Duration,
    default_max_retries: u32,
    retry_base_delay: Duration,
}

/// Accepts prioritized units of work, holds them in a bounded queue, and
/// drains them under a fixed concurrency budget with timeout racing and
/// exponential-backoff retry.
///
/// A single guarded drain loop per instance pops the queue head, acquires
/// a semaphore permit (suspending the loop, never the submitter), and
/// spawns the attempt cycle. The permit is released only at the terminal
/// outcome, so a task backing off between retries still occupies its
/// concurrency slot.
///
/// Timeouts do not cancel the underlying closure: the racing timer only
/// makes the scheduler treat the attempt as failed, and the orphaned
/// future may keep running in the background.
pub struct TaskScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> TaskScheduler<T> {
    /// Build a scheduler from validated configuration.
    pub fn new(config: &SchedulerConfig) -> Self {
        let limit = config.max_concurrency;
        let inner = Inner {
            queue: Mutex::new(PriorityQueue::new(config.queue_capacity)),
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            active: AtomicUsize::new(0),
            inflight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle_tx: watch::channel(true).0,
            counters: Counters::default(),
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            default_max_retries: config.default_max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Submit one task, receiving a handle that resolves to its terminal
    /// result.
    ///
    /// Fails only for admission problems: [`SchedulerError::QueueFull`]
    /// when the queue is at capacity (fail fast, never block the caller)
    /// or [`SchedulerError::Shutdown`]. A task that ran and failed is
    /// reported through the handle, not here.
    pub fn submit(&self, task: Task<T>) -> Result<TaskHandle<T>, SchedulerError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        let (tx, rx) = oneshot::channel();
        let id = task.id.clone();
        let priority = task.priority;
        {
            let mut queue = self.inner.queue.lock();
            queue.push(priority, QueuedEntry { task, tx })?;
            let depth = queue.len();
            self.inner
                .counters
                .peak_queue_size
                .fetch_max(depth, Ordering::AcqRel);
            let _ = self.inner.idle_tx.send_replace(false);
        }
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task = %id, ?priority, state = ?TaskState::Queued, "task enqueued");
        self.ensure_draining();
        Ok(TaskHandle { id, rx })
    }

    /// Submit a batch, resolving once every member has a terminal outcome.
    ///
    /// The whole batch is spliced into the queue under one lock, so a
    /// batch is all-or-nothing at admission even against concurrent
    /// submitters; individual member failures are reported inside the
    /// returned results, never as an error.
    pub async fn submit_batch(
        &self,
        tasks: Vec<Task<T>>,
    ) -> Result<Vec<TaskResult<T>>, SchedulerError> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SchedulerError::Shutdown);
        }
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let count = tasks.len();
        let mut handles = Vec::with_capacity(count);
        let mut entries = Vec::with_capacity(count);
        for task in tasks {
            let (tx, rx) = oneshot::channel();
            let id = task.id.clone();
            let priority = task.priority;
            entries.push((priority, QueuedEntry { task, tx }));
            handles.push(TaskHandle { id, rx });
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.push_all(entries)?;
            let depth = queue.len();
            self.inner
                .counters
                .peak_queue_size
                .fetch_max(depth, Ordering::AcqRel);
            let _ = self.inner.idle_tx.send_replace(false);
        }
        self.inner
            .counters
            .total
            .fetch_add(count as u64, Ordering::Relaxed);
        tracing::debug!(count, "batch enqueued");
        self.ensure_draining();
        Ok(futures::future::join_all(handles).await)
    }

    /// Resolve once the queue and the in-flight set are both empty.
    ///
    /// Signalled by the completion path the moment the last task settles;
    /// there is no polling interval. Resolves immediately on an idle
    /// scheduler.
    pub async fn await_idle(&self) {
        let mut rx = self.inner.idle_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Drop every queued task, resolving each as cancelled. Already
    /// running tasks are never interrupted and finish naturally.
    pub fn cancel_all(&self) {
        let drained = self.inner.queue.lock().drain();
        let count = drained.len();
        for entry in drained {
            self.inner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(task = %entry.task.id, state = ?TaskState::Cancelled, "queued task cancelled");
            let _ = entry.tx.send(TaskResult::cancelled(entry.task.id));
        }
        Self::signal_if_idle(&self.inner);
        if count > 0 {
            tracing::info!(count, "cleared pending queue");
        }
    }

    /// Adjust the concurrency budget at runtime.
    ///
    /// Raising the limit releases extra permits immediately. Lowering it
    /// retires surplus permits as running tasks hand them back, so the
    /// active count converges on the new limit without interrupting work.
    pub fn set_concurrency_limit(&self, limit: usize) {
        let old = self.inner.limit.swap(limit, Ordering::AcqRel);
        if limit > old {
            self.inner.semaphore.add_permits(limit - old);
        } else if limit < old {
            let semaphore = Arc::clone(&self.inner.semaphore);
            let surplus = (old - limit) as u32;
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        tracing::info!(old, new = limit, "concurrency limit changed");
    }

    /// Current concurrency budget.
    pub fn concurrency_limit(&self) -> usize {
        self.inner.limit.load(Ordering::Acquire)
    }

    /// Stop admitting work: cancels every queued task and rejects future
    /// submissions. In-flight tasks still run to completion.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.cancel_all();
        tracing::info!("scheduler shut down");
    }

    /// Snapshot aggregate statistics.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.inner.counters;
        let completed = c.completed.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let timed_out = c.timed_out.load(Ordering::Relaxed);
        let terminal = completed + failed + timed_out;
        let duration_total = c.duration_ms_total.load(Ordering::Relaxed);
        SchedulerStats {
            total_tasks: c.total.load(Ordering::Relaxed),
            completed,
            failed,
            timed_out,
            retried: c.retried.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            avg_duration_ms: if terminal == 0 {
                0.0
            } else {
                duration_total as f64 / terminal as f64
            },
            success_rate: if terminal == 0 {
                0.0
            } else {
                completed as f64 / terminal as f64
            },
            current_queue_size: self.inner.queue.lock().len(),
            active_count: self.inner.active.load(Ordering::Acquire),
            peak_concurrency: c.peak_concurrency.load(Ordering::Relaxed),
            peak_queue_size: c.peak_queue_size.load(Ordering::Relaxed),
        }
    }

    /// Start the drain loop unless one is already running.
    fn ensure_draining(&self) {
        if !self.inner.draining.swap(true, Ordering::AcqRel) {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(Self::drain_loop(inner));
        }
    }

    /// The single drain loop: pop the head, wait for a permit, dispatch.
    /// The reentrancy guard (`draining`) keeps two loops from overlapping;
    /// the re-check after clearing it closes the race with a submit that
    /// arrived while this loop was winding down.
    async fn drain_loop(inner: Arc<Inner<T>>) {
        loop {
            // The pop and the inflight increment share one critical
            // section; `signal_if_idle` takes the same lock, so it can
            // never observe the queue empty with the popped task not yet
            // counted.
            let next = {
                let mut queue = inner.queue.lock();
                let entry = queue.pop();
                if entry.is_some() {
                    inner.inflight.fetch_add(1, Ordering::AcqRel);
                }
                entry
            };
            match next {
                Some(entry) => {
                    match Arc::clone(&inner.semaphore).acquire_owned().await {
                        Ok(permit) => Self::dispatch(&inner, entry, permit),
                        Err(_) => {
                            // Semaphore closed mid-shutdown.
                            inner.inflight.fetch_sub(1, Ordering::AcqRel);
                            let _ = entry.tx.send(TaskResult::cancelled(entry.task.id));
                            Self::signal_if_idle(&inner);
                        }
                    }
                }
                None => {
                    inner.draining.store(false, Ordering::Release);
                    let more = !inner.queue.lock().is_empty();
                    if more && !inner.draining.swap(true, Ordering::AcqRel) {
                        continue;
                    }
                    break;
                }
            }
        }
    }

    /// Spawn the attempt cycle for one dequeued task.
    fn dispatch(inner: &Arc<Inner<T>>, entry: QueuedEntry<T>, permit: OwnedSemaphorePermit) {
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            let active = inner.active.fetch_add(1, Ordering::AcqRel) + 1;
            inner
                .counters
                .peak_concurrency
                .fetch_max(active, Ordering::AcqRel);
            tracing::debug!(task = %entry.task.id, state = ?TaskState::Running, active, "task dispatched");

            let result = Self::run_with_retries(&inner, &entry.task).await;

            let c = &inner.counters;
            match &result.error {
                None => {
                    c.completed.fetch_add(1, Ordering::Relaxed);
                }
                Some(e) if e.is_timeout() => {
                    c.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                Some(_) => {
                    c.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
            c.duration_ms_total
                .fetch_add(result.duration.as_millis() as u64, Ordering::Relaxed);

            inner.active.fetch_sub(1, Ordering::AcqRel);
            inner.inflight.fetch_sub(1, Ordering::AcqRel);
            drop(permit);
            let _ = entry.tx.send(result);
            Self::signal_if_idle(&inner);
        });
    }

    /// Run attempts until success or the retry budget is spent, backing
    /// off `base_delay * 2^k` between attempt k and k+1. Timeouts are a
    /// distinct error variant but follow the same retry policy.
    async fn run_with_retries(inner: &Inner<T>, task: &Task<T>) -> TaskResult<T> {
        let timeout = task.timeout.unwrap_or(inner.default_timeout);
        let max_retries = task.max_retries.unwrap_or(inner.default_max_retries);
        let mut retry_count = 0u32;
        let mut exec_time = Duration::ZERO;

        loop {
            let started = Instant::now();
            let attempt = tokio::time::timeout(timeout, task.work.run()).await;
            exec_time += started.elapsed();

            let error = match attempt {
                Ok(Ok(value)) => {
                    tracing::debug!(task = %task.id, state = ?TaskState::Succeeded, retry_count, "task succeeded");
                    return TaskResult {
                        id: task.id.clone(),
                        value: Some(value),
                        error: None,
                        duration: exec_time,
                        retry_count,
                    };
                }
                Ok(Err(e)) => TaskError::Failed(e),
                Err(_) => TaskError::Timeout(timeout),
            };

            if retry_count < max_retries {
                let delay = inner.retry_base_delay * 2u32.saturating_pow(retry_count);
                tracing::warn!(
                    task = %task.id,
                    state = ?TaskState::Retrying,
                    attempt = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "attempt failed, backing off"
                );
                inner.counters.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            tracing::warn!(task = %task.id, state = ?TaskState::Failed, retry_count, error = %error, "retries exhausted");
            return TaskResult {
                id: task.id.clone(),
                value: None,
                error: Some(error),
                duration: exec_time,
                retry_count,
            };
        }
    }

    /// Flip the idle flag when the queue and in-flight set are both empty.
    /// Runs under the queue lock so it serializes against `submit`.
    fn signal_if_idle(inner: &Inner<T>) {
        let queue = inner.queue.lock();
        if queue.is_empty() && inner.inflight.load(Ordering::Acquire) == 0 {
            let _ = inner.idle_tx.send_replace(true);
        }
    }
}
