//! Configuration models for the runtime core.

pub mod runtime;

pub use runtime::{CacheConfig, ResourceConfig, RuntimeConfig, SchedulerConfig};
