//! Core scheduling abstractions: tasks, the priority queue, and the
//! semaphore-bounded scheduler.

pub mod error;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use error::{AppResult, SchedulerError, TaskError};
pub use queue::PriorityQueue;
pub use scheduler::{SchedulerStats, TaskHandle, TaskScheduler};
pub use task::{FnWork, Priority, Task, TaskResult, TaskState, TaskWork};
