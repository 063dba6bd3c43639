//! Configuration structures for the scheduler, resource manager, and cache.

use serde::{Deserialize, Serialize};

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Concurrency budget (semaphore permits).
    pub max_concurrency: usize,
    /// Pending-queue capacity before submissions are rejected.
    pub queue_capacity: usize,
    /// Default per-task timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Default retry ceiling per task.
    pub default_max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub retry_base_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            // Small single-digit default, bounded by available cores.
            max_concurrency: num_cpus::get().clamp(1, 4),
            queue_capacity: 256,
            default_timeout_ms: 30_000,
            default_max_retries: 2,
            retry_base_delay_ms: 250,
        }
    }
}

impl SchedulerConfig {
    /// Validate scheduler configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency must be greater than 0".into());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.default_timeout_ms == 0 {
            return Err("default_timeout_ms must be greater than 0".into());
        }
        if self.retry_base_delay_ms == 0 {
            return Err("retry_base_delay_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Resource lifecycle manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Background sweep interval in milliseconds.
    pub sweep_interval_ms: u64,
    /// Idle threshold after which a handle is reclaimed, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Shorter idle threshold used during memory-pressure relief.
    pub emergency_idle_timeout_ms: u64,
    /// Fraction of the memory ceiling at which pressure relief triggers.
    pub memory_pressure_ratio: f64,
    /// Memory ceiling in bytes; `None` uses the host's total memory.
    pub memory_ceiling_bytes: Option<u64>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 30_000,
            idle_timeout_ms: 300_000,
            emergency_idle_timeout_ms: 60_000,
            memory_pressure_ratio: 0.85,
            memory_ceiling_bytes: None,
        }
    }
}

impl ResourceConfig {
    /// Validate resource manager configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.sweep_interval_ms == 0 {
            return Err("sweep_interval_ms must be greater than 0".into());
        }
        if self.emergency_idle_timeout_ms > self.idle_timeout_ms {
            return Err("emergency_idle_timeout_ms must not exceed idle_timeout_ms".into());
        }
        if !(0.0..=1.0).contains(&self.memory_pressure_ratio) || self.memory_pressure_ratio == 0.0 {
            return Err("memory_pressure_ratio must be within (0, 1]".into());
        }
        Ok(())
    }
}

/// Adaptive cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default entry time-to-live in milliseconds.
    pub default_ttl_ms: u64,
    /// Item-count ceiling.
    pub max_items: usize,
    /// Total estimated-memory ceiling in bytes.
    pub max_memory_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 300_000,
            max_items: 1_000,
            max_memory_bytes: 50 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl_ms == 0 {
            return Err("default_ttl_ms must be greater than 0".into());
        }
        if self.max_items == 0 {
            return Err("max_items must be greater than 0".into());
        }
        if self.max_memory_bytes == 0 {
            return Err("max_memory_bytes must be greater than 0".into());
        }
        Ok(())
    }
}

/// Root configuration for the runtime core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Task scheduler section.
    pub scheduler: SchedulerConfig,
    /// Resource lifecycle section.
    pub resources: ResourceConfig,
    /// Adaptive cache section.
    pub cache: CacheConfig,
}

impl RuntimeConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler: {e}"))?;
        self.resources
            .validate()
            .map_err(|e| format!("resources: {e}"))?;
        self.cache.validate().map_err(|e| format!("cache: {e}"))?;
        Ok(())
    }

    /// Parse runtime configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: RuntimeConfig =
            serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }
}
