//! Task model: priorities, the typed work seam, and terminal results.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::TaskError;

/// Priority used for queue ordering. Variants are declared in ascending
/// order so the derived `Ord` ranks `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work, drained last.
    Low,
    /// Default priority for submitted work.
    #[default]
    Normal,
    /// Drained ahead of normal and low work.
    High,
    /// Drained ahead of everything else. A steady stream of critical
    /// tasks can starve lower priorities; callers needing fairness must
    /// manage it externally.
    Critical,
}

/// A unit of schedulable work producing a `T`.
///
/// The scheduler may invoke `run` more than once on the same value when
/// retrying, so implementations must be callable repeatedly.
#[async_trait]
pub trait TaskWork<T>: Send + Sync + 'static {
    /// Execute one attempt of the work.
    async fn run(&self) -> Result<T, anyhow::Error>;
}

/// Adapter turning an async closure into a [`TaskWork`] trait object.
pub struct FnWork<F> {
    f: F,
}

impl<F> FnWork<F> {
    /// Wrap a closure returning a future of `Result<T>`.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<T, F, Fut> TaskWork<T> for FnWork<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, anyhow::Error>> + Send,
{
    async fn run(&self) -> Result<T, anyhow::Error> {
        (self.f)().await
    }
}

/// A schedulable task. Immutable once enqueued; the scheduler tracks the
/// retry counter alongside it rather than mutating the record.
pub struct Task<T> {
    /// Unique identifier, caller-supplied or uuid-generated.
    pub id: String,
    /// Queue ordering priority.
    pub priority: Priority,
    /// Per-task timeout; `None` uses the scheduler default.
    pub timeout: Option<Duration>,
    /// Per-task retry ceiling; `None` uses the scheduler default.
    pub max_retries: Option<u32>,
    /// Opaque caller context carried through to logs.
    pub metadata: Option<serde_json::Value>,
    pub(crate) work: Arc<dyn TaskWork<T>>,
}

impl<T> Task<T> {
    /// Create a task around an existing work trait object with a generated
    /// id and default priority/timeout/retries.
    pub fn new(work: Arc<dyn TaskWork<T>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            priority: Priority::default(),
            timeout: None,
            max_retries: None,
            metadata: None,
            work,
        }
    }

    /// Create a task from an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send,
    {
        Self::new(Arc::new(FnWork::new(f)))
    }

    /// Override the generated id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the queue priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a per-task timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a per-task retry ceiling.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Attach opaque metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Lifecycle states of a task, used for transition logging.
///
/// `Queued` and `Retrying` re-enter `Running`; `Succeeded`, `Failed`, and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting in the priority queue.
    Queued,
    /// Holding a permit and executing an attempt.
    Running,
    /// Last attempt failed; waiting out the backoff delay.
    Retrying,
    /// Terminal: the work returned a value.
    Succeeded,
    /// Terminal: retries exhausted (failure or timeout).
    Failed,
    /// Terminal: dropped from the queue by `cancel_all`.
    Cancelled,
}

/// Terminal outcome of a task. Produced exactly once per submission.
#[derive(Debug)]
pub struct TaskResult<T> {
    /// Id of the originating task.
    pub id: String,
    /// The produced value on success.
    pub value: Option<T>,
    /// The final error on failure, timeout, or cancellation.
    pub error: Option<TaskError>,
    /// Time spent executing attempts, excluding queue wait and backoff.
    pub duration: Duration,
    /// Number of retries performed (0 for a first-attempt outcome).
    pub retry_count: u32,
}

impl<T> TaskResult<T> {
    /// Whether the task reached `Succeeded`.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub(crate) fn cancelled(id: String) -> Self {
        Self {
            id,
            value: None,
            error: Some(TaskError::Cancelled),
            duration: Duration::ZERO,
            retry_count: 0,
        }
    }
}
