//! Filesystem-backed [`ResourceProbe`]

use super::cgroup_v1::{self, CgroupVersion};
use super::{cgroup_v2, gpu, sysfs};
use super::{CounterReading, PodPaths, ProbeError, ResourceHandle, ResourceProbe};
use crate::models::ResourceKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

const POD_PLACEHOLDER: &str = "{pod}";

/// Per-resource directory templates; `{pod}` is replaced with the pod name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathTemplates {
    pub cpu: String,
    pub gpu: String,
}

impl Default for PathTemplates {
    fn default() -> Self {
        Self {
            cpu: "/sys/fs/cgroup/cpu,cpuacct/kubepods/{pod}".to_string(),
            gpu: "/sys/kernel/gpu/gemini/pods/{pod}".to_string(),
        }
    }
}

impl PathTemplates {
    pub fn resolve(&self, kind: ResourceKind, pod_name: &str) -> PathBuf {
        let template = match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Gpu => &self.gpu,
        };
        PathBuf::from(template.replace(POD_PLACEHOLDER, pod_name))
    }
}

/// Reads cgroup CPU accounting and Gemini GPU runtime straight from sysfs
pub struct SysfsProbe {
    version: CgroupVersion,
    templates: PathTemplates,
}

impl SysfsProbe {
    pub fn new(version: CgroupVersion, templates: PathTemplates) -> Self {
        Self { version, templates }
    }

    /// Build a probe for whichever cgroup version is mounted at `cgroup_root`
    pub async fn detect(cgroup_root: &Path, templates: PathTemplates) -> Self {
        let version = cgroup_v1::detect_cgroup_version(cgroup_root).await;
        info!(version = ?version, root = %cgroup_root.display(), "Detected cgroup version");
        Self::new(version, templates)
    }

    pub fn cgroup_version(&self) -> CgroupVersion {
        self.version
    }

    fn counter_file(&self, kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Cpu => self.version.usage_file(),
            ResourceKind::Gpu => gpu::RUNTIME_FILE,
        }
    }
}

#[async_trait]
impl ResourceProbe for SysfsProbe {
    async fn resolve_paths(&self, pod_name: &str) -> Option<PodPaths> {
        let cpu = self.templates.resolve(ResourceKind::Cpu, pod_name);
        let gpu = self.templates.resolve(ResourceKind::Gpu, pod_name);

        for (kind, dir) in [(ResourceKind::Cpu, &cpu), (ResourceKind::Gpu, &gpu)] {
            if !sysfs::exists(&dir.join(self.counter_file(kind))).await {
                debug!(pod = pod_name, resource = %kind, path = %dir.display(), "Pod not ready yet");
                return None;
            }
        }

        Some(PodPaths {
            cpu: ResourceHandle {
                kind: ResourceKind::Cpu,
                path: cpu,
            },
            gpu: ResourceHandle {
                kind: ResourceKind::Gpu,
                path: gpu,
            },
        })
    }

    async fn read_counter(&self, handle: &ResourceHandle) -> Result<CounterReading, ProbeError> {
        let value = match (handle.kind, self.version) {
            (ResourceKind::Cpu, CgroupVersion::V2) => cgroup_v2::read_usage_ns(&handle.path).await?,
            (ResourceKind::Cpu, _) => cgroup_v1::read_usage_ns(&handle.path).await?,
            (ResourceKind::Gpu, _) => gpu::read_runtime(&handle.path).await?,
        };

        Ok(CounterReading {
            value,
            at: Instant::now(),
        })
    }

    async fn write_limit(&self, handle: &ResourceHandle, value: f64) -> Result<(), ProbeError> {
        match (handle.kind, self.version) {
            (ResourceKind::Cpu, CgroupVersion::V2) => {
                cgroup_v2::write_cpu_max(&handle.path, value).await
            }
            (ResourceKind::Cpu, _) => cgroup_v1::write_quota(&handle.path, value).await,
            (ResourceKind::Gpu, _) => gpu::write_limit(&handle.path, value).await,
        }
    }
}
