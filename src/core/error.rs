//! Error types for scheduler operations.

use thiserror::Error;

/// Errors returned across the scheduler's public API boundary.
///
/// Task-execution failures never appear here: they are captured into the
/// task's [`crate::core::TaskResult`] so a rejected submission ("your task
/// never entered the system") stays distinguishable from a task that ran
/// and failed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pending queue is at capacity; the submission was rejected.
    #[error("queue full: capacity {0} reached")]
    QueueFull(usize),
    /// The scheduler has been shut down and accepts no new work.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// Terminal error attached to a [`crate::core::TaskResult`].
#[derive(Debug, Error)]
pub enum TaskError {
    /// The work closure did not complete within its timeout. The closure
    /// itself may still be running in the background; only the scheduler's
    /// view of the task is finished.
    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The task was still queued when `cancel_all` cleared the queue.
    #[error("task cancelled before it started")]
    Cancelled,
    /// The work closure itself returned an error on its final attempt.
    #[error("task failed: {0}")]
    Failed(#[from] anyhow::Error),
}

impl TaskError {
    /// Whether this error is the distinct timeout variant, tracked
    /// separately in scheduler statistics.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
