//! Process memory sampling for pressure detection.
//!
//! Linux is the only deployment target with real numbers; values come
//! from `/proc/self/status` and `/proc/meminfo`. Other targets report
//! zeros, which disables pressure relief rather than faking it.

use serde::Serialize;

use crate::util::clock::now_ms;

/// Snapshot of process memory usage relative to a ceiling.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    /// Wall-clock sample time, milliseconds since the Unix epoch.
    pub sampled_at_ms: u128,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Virtual memory size in bytes.
    pub vm_bytes: u64,
    /// Memory ceiling the ratio is computed against: the configured
    /// override, or the host's total memory.
    pub ceiling_bytes: u64,
    /// rss / ceiling; 0 when no ceiling could be determined.
    pub used_ratio: f64,
}

/// Sample current process memory against `ceiling_override` or the
/// host total.
pub fn sample(ceiling_override: Option<u64>) -> MemoryInfo {
    let (rss_bytes, vm_bytes) = process_memory();
    let ceiling_bytes = ceiling_override.or_else(system_total_bytes).unwrap_or(0);
    let used_ratio = if ceiling_bytes == 0 {
        0.0
    } else {
        rss_bytes as f64 / ceiling_bytes as f64
    };
    MemoryInfo {
        sampled_at_ms: now_ms(),
        rss_bytes,
        vm_bytes,
        ceiling_bytes,
        used_ratio,
    }
}

#[cfg(target_os = "linux")]
fn process_memory() -> (u64, u64) {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return (0, 0);
    };
    let mut rss = 0;
    let mut vm = 0;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = parse_kb_line(rest);
        } else if let Some(rest) = line.strip_prefix("VmSize:") {
            vm = parse_kb_line(rest);
        }
    }
    (rss, vm)
}

#[cfg(not(target_os = "linux"))]
fn process_memory() -> (u64, u64) {
    (0, 0)
}

#[cfg(target_os = "linux")]
fn system_total_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:").map(parse_kb_line))
        .filter(|bytes| *bytes > 0)
}

#[cfg(not(target_os = "linux"))]
fn system_total_bytes() -> Option<u64> {
    None
}

/// Parse the `  1234 kB` tail of a /proc line into bytes.
#[cfg(target_os = "linux")]
fn parse_kb_line(rest: &str) -> u64 {
    rest.trim()
        .trim_end_matches("kB")
        .trim()
        .parse::<u64>()
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}
