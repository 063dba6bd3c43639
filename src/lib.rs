//! # Watchtower Runtime
//!
//! The concurrency and resource-management core of the Watchtower
//! monitoring agent. The agent's scraping and reporting layers submit
//! closures here as units of work and consume aggregate statistics; this
//! crate bounds, schedules, retries, and cleans up after them.
//!
//! ## Components
//!
//! Three components compose the core, leaves first:
//!
//! - [`cache::AdaptiveCache`]: a generic bounded key/value store with
//!   per-entry TTL and least-recently-used eviction, for memoizing
//!   expensive operations.
//! - [`resource::ResourceLifecycleManager`]: a registry of externally
//!   owned handles with release callbacks; reclaims idle handles on a
//!   background sweep and reacts to process memory pressure by shedding
//!   supervised caches and forcing emergency releases.
//! - [`core::TaskScheduler`]: a priority-aware scheduler bounded by a
//!   counting-semaphore concurrency budget, with a bounded fail-fast
//!   queue, timeout racing, and exponential-backoff retry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use watchtower_runtime::builders::build_runtime_core;
//! use watchtower_runtime::config::RuntimeConfig;
//! use watchtower_runtime::core::{Priority, Task};
//!
//! let core = build_runtime_core::<String, String, String>(&RuntimeConfig::default())?;
//!
//! let handle = core.scheduler.submit(
//!     Task::from_fn(|| async { Ok("checked".to_string()) })
//!         .with_priority(Priority::High),
//! )?;
//! let result = handle.await;
//! assert!(result.is_success());
//!
//! core.scheduler.await_idle().await;
//! core.shutdown().await;
//! ```
//!
//! ## Guarantees and non-guarantees
//!
//! - The active-task count never exceeds the concurrency budget.
//! - Within one priority level, submission order is preserved; across
//!   levels, higher priority always drains first, with no starvation
//!   protection for lower levels.
//! - A timed-out closure is abandoned, not interrupted; only the
//!   scheduler's view of the task finishes at the timeout.
//! - `cancel_all` affects queued tasks only, never in-flight ones.

/// Builders to construct the runtime core from configuration.
pub mod builders;
/// Bounded TTL/LRU cache for memoization.
pub mod cache;
/// Configuration models for all components.
pub mod config;
/// Task model, priority queue, and scheduler.
pub mod core;
/// Resource handle registry and memory-pressure handling.
pub mod resource;
/// Shared utilities: clock and telemetry bootstrap.
pub mod util;
