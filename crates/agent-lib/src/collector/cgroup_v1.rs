//! CPU accounting on the legacy cgroup v1 hierarchy
//!
//! - `cpuacct.usage` holds cumulative CPU time in nanoseconds
//! - `cpu.cfs_quota_us` holds the CFS quota against a 100ms period, so a
//!   limit of `L` percent is written as `L * 1000`

use super::sysfs;
use super::ProbeError;
use std::path::Path;
use tokio::fs;

pub const USAGE_FILE: &str = "cpuacct.usage";
pub const QUOTA_FILE: &str = "cpu.cfs_quota_us";

/// Quota microseconds per percentage point, for the default 100ms period
const QUOTA_US_PER_PERCENT: f64 = 1000.0;

/// Cumulative CPU time of the cgroup in nanoseconds
pub async fn read_usage_ns(cgroup_dir: &Path) -> Result<u64, ProbeError> {
    sysfs::read_u64(&cgroup_dir.join(USAGE_FILE)).await
}

pub fn quota_value(limit: f64) -> String {
    format!("{}", (limit * QUOTA_US_PER_PERCENT).round().max(0.0) as u64)
}

pub async fn write_quota(cgroup_dir: &Path, limit: f64) -> Result<(), ProbeError> {
    sysfs::write_value(&cgroup_dir.join(QUOTA_FILE), &quota_value(limit)).await
}

/// Detect which cgroup version is mounted at `cgroup_root`
pub async fn detect_cgroup_version(cgroup_root: &Path) -> CgroupVersion {
    // The unified hierarchy exposes its controller list at the root
    if fs::metadata(cgroup_root.join("cgroup.controllers")).await.is_ok() {
        return CgroupVersion::V2;
    }

    let v1_cpu = cgroup_root.join("cpu");
    let v1_cpuacct = cgroup_root.join("cpuacct");
    if fs::metadata(&v1_cpu).await.is_ok() || fs::metadata(&v1_cpuacct).await.is_ok() {
        return CgroupVersion::V1;
    }

    CgroupVersion::Unknown
}

/// Cgroup version detected on the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
    Unknown,
}

impl CgroupVersion {
    /// Counter file that must exist before a pod counts as ready
    pub fn usage_file(self) -> &'static str {
        match self {
            CgroupVersion::V2 => super::cgroup_v2::STAT_FILE,
            CgroupVersion::V1 | CgroupVersion::Unknown => USAGE_FILE,
        }
    }
}
