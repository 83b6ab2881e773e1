//! GPU time-slicing through the Gemini sysfs interface
//!
//! Each pod directory exposes `total_runtime` (cumulative GPU time in
//! milliseconds) plus `gpu_limit`/`gpu_request`, both in per-mille of a
//! device. After limits change, writing `0` to the global resource config
//! makes the scheduler re-read every pod.

use super::sysfs;
use super::{ProbeError, RebalanceHook};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const RUNTIME_FILE: &str = "total_runtime";
pub const LIMIT_FILE: &str = "gpu_limit";
pub const REQUEST_FILE: &str = "gpu_request";

pub const DEFAULT_RESOURCE_CONF: &str = "/sys/kernel/gpu/gemini/resource_conf";

pub async fn read_runtime(pod_dir: &Path) -> Result<u64, ProbeError> {
    sysfs::read_u64(&pod_dir.join(RUNTIME_FILE)).await
}

/// Percentage points to per-mille
pub fn share_value(limit: f64) -> String {
    format!("{}", (limit * 10.0).round().max(0.0) as u64)
}

/// Write the limit as both the cap and the guaranteed share
pub async fn write_limit(pod_dir: &Path, limit: f64) -> Result<(), ProbeError> {
    let value = share_value(limit);
    sysfs::write_value(&pod_dir.join(LIMIT_FILE), &value).await?;
    sysfs::write_value(&pod_dir.join(REQUEST_FILE), &value).await
}

/// Triggers a Gemini re-balance by rewriting its resource config
pub struct GeminiHook {
    conf_path: PathBuf,
}

impl GeminiHook {
    pub fn new(conf_path: impl Into<PathBuf>) -> Self {
        Self {
            conf_path: conf_path.into(),
        }
    }
}

impl Default for GeminiHook {
    fn default() -> Self {
        Self::new(DEFAULT_RESOURCE_CONF)
    }
}

#[async_trait]
impl RebalanceHook for GeminiHook {
    async fn notify_limits_changed(&self) -> Result<(), ProbeError> {
        debug!(path = %self.conf_path.display(), "Requesting GPU re-balance");
        sysfs::write_value(&self.conf_path, "0").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_value() {
        assert_eq!(share_value(50.0), "500");
        assert_eq!(share_value(50.79), "508");
        assert_eq!(share_value(100.0), "1000");
    }

    #[tokio::test]
    async fn test_write_limit_sets_limit_and_request() {
        let dir = tempfile::tempdir().unwrap();
        write_limit(dir.path(), 33.0).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join(LIMIT_FILE)).unwrap(), "330");
        assert_eq!(std::fs::read_to_string(dir.path().join(REQUEST_FILE)).unwrap(), "330");
    }

    #[tokio::test]
    async fn test_gemini_hook_writes_zero() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("resource_conf");
        std::fs::write(&conf, "17").unwrap();

        GeminiHook::new(&conf).notify_limits_changed().await.unwrap();
        assert_eq!(std::fs::read_to_string(&conf).unwrap(), "0");
    }
}
