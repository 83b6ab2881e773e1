//! Node-side collaborators of the autoscaler
//!
//! The monitor only talks to the node through the traits in this module:
//! - [`ResourceProbe`] resolves per-pod counter/limit locations, reads
//!   usage counters and writes limits
//! - [`RebalanceHook`] is poked after every GPU limit write
//! - [`PodDiscovery`] reports pods newly granted a token reservation
//!
//! The in-tree implementations read the cgroup (v1 or v2) CPU hierarchy,
//! the GPU virtualisation sysfs tree, and the kubelet pod-resources socket.

mod activity;
mod cgroup_v1;
mod cgroup_v2;
mod discovery;
mod gpu;
mod probe;
mod sysfs;


pub use activity::{pulse_channel, ActivityHandle, ActivityWatcher};
pub use cgroup_v1::{detect_cgroup_version, CgroupVersion};
pub use discovery::{DiscoveryLoop, KubeletPodDiscovery, DEFAULT_KUBELET_SOCKET};
pub use gpu::{GeminiHook, DEFAULT_RESOURCE_CONF};
pub use probe::{PathTemplates, SysfsProbe};

use crate::models::{AdmittedPod, ResourceKind};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub use async_trait::async_trait;

/// Errors surfaced by resource probes
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The source vanished; for a running pod this means it completed
    #[error("resource source {} no longer exists", .0.display())]
    Missing(PathBuf),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

impl ProbeError {
    /// Map an I/O error, folding "not found" into [`ProbeError::Missing`]
    pub fn from_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            ProbeError::Missing(path)
        } else {
            ProbeError::Io { path, source }
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, ProbeError::Missing(_))
    }
}

/// Location of one resource of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub path: PathBuf,
}

/// Resolved locations for every resource of a pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodPaths {
    pub cpu: ResourceHandle,
    pub gpu: ResourceHandle,
}

impl PodPaths {
    pub fn handle(&self, kind: ResourceKind) -> &ResourceHandle {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Gpu => &self.gpu,
        }
    }
}

/// A raw monotonic counter and the moment it was read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterReading {
    pub value: u64,
    pub at: Instant,
}

/// Reads usage counters and writes limits for pod resources
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    /// Resolve the pod's resource locations; `None` until the runtime has
    /// materialised all of them
    async fn resolve_paths(&self, pod_name: &str) -> Option<PodPaths>;

    /// Read the current raw usage counter
    async fn read_counter(&self, handle: &ResourceHandle) -> Result<CounterReading, ProbeError>;

    /// Write a limit, expressed in percentage points
    async fn write_limit(&self, handle: &ResourceHandle, value: f64) -> Result<(), ProbeError>;
}

/// Notified after GPU limits change so the GPU scheduler can re-balance
#[async_trait]
pub trait RebalanceHook: Send + Sync {
    async fn notify_limits_changed(&self) -> Result<(), ProbeError>;
}

/// Source of newly admitted pods
#[async_trait]
pub trait PodDiscovery: Send + Sync {
    /// Pods granted a token reservation since the previous scan
    async fn scan(&self) -> Result<Vec<AdmittedPod>>;
}

/// The node I/O the monitor drives
#[derive(Clone)]
pub struct NodeIo {
    pub probe: Arc<dyn ResourceProbe>,
    pub hook: Arc<dyn RebalanceHook>,
}

impl NodeIo {
    pub fn new(probe: Arc<dyn ResourceProbe>, hook: Arc<dyn RebalanceHook>) -> Self {
        Self { probe, hook }
    }
}
