//! CPU accounting on the unified cgroup v2 hierarchy
//!
//! Usage comes from the `usage_usec` line of `cpu.stat`; limits are written
//! to `cpu.max` as `"<quota_us> <period_us>"`.

use super::sysfs;
use super::ProbeError;
use std::path::Path;
use tokio::fs;

pub const STAT_FILE: &str = "cpu.stat";
pub const MAX_FILE: &str = "cpu.max";

const PERIOD_US: u64 = 100_000;

/// Extract `usage_usec` from `cpu.stat` contents
pub fn parse_usage_usec(content: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => value.parse().ok(),
            _ => None,
        }
    })
}

/// Cumulative CPU time of the cgroup, normalised to nanoseconds
pub async fn read_usage_ns(cgroup_dir: &Path) -> Result<u64, ProbeError> {
    let path = cgroup_dir.join(STAT_FILE);
    let content = fs::read_to_string(&path)
        .await
        .map_err(|e| ProbeError::from_io(&path, e))?;

    parse_usage_usec(&content)
        .map(|usec| usec.saturating_mul(1000))
        .ok_or_else(|| ProbeError::Parse {
            path,
            reason: "missing usage_usec".to_string(),
        })
}

pub fn cpu_max_value(limit: f64) -> String {
    let quota = (limit / 100.0 * PERIOD_US as f64).round().max(0.0) as u64;
    format!("{} {}", quota, PERIOD_US)
}

pub async fn write_cpu_max(cgroup_dir: &Path, limit: f64) -> Result<(), ProbeError> {
    sysfs::write_value(&cgroup_dir.join(MAX_FILE), &cpu_max_value(limit)).await
}
