//! In-memory node used by unit tests

use crate::collector::{
    CounterReading, PodPaths, ProbeError, RebalanceHook, ResourceHandle, ResourceProbe,
};
use crate::models::ResourceKind;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub fn reading_at(t0: Instant, millis: u64, value: u64) -> CounterReading {
    CounterReading {
        value,
        at: t0 + Duration::from_millis(millis),
    }
}

pub fn fake_path(kind: ResourceKind, pod: &str) -> PathBuf {
    PathBuf::from(format!("/fake/{}/{}", kind, pod))
}

fn pod_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Default)]
struct NodeState {
    ready: HashSet<String>,
    gone: HashSet<String>,
    counters: HashMap<PathBuf, u64>,
    writes: Vec<(String, ResourceKind, f64)>,
    /// Timestamp of counter reads once frozen; wall clock otherwise
    clock: Option<Instant>,
}

/// Probe and re-balance hook backed by maps; every pod path lives under `/fake`
#[derive(Default)]
pub struct FakeNode {
    state: Mutex<NodeState>,
    rebalances: AtomicUsize,
    fail_writes: bool,
}

impl FakeNode {
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Default::default()
        }
    }

    pub fn mark_ready(&self, pod: &str) {
        self.state.lock().unwrap().ready.insert(pod.to_string());
    }

    /// Make every resource of `pod` vanish
    pub fn remove(&self, pod: &str) {
        self.state.lock().unwrap().gone.insert(pod.to_string());
    }

    /// Bring back a removed pod under the same name with fresh counters
    pub fn recreate(&self, pod: &str) {
        let mut state = self.state.lock().unwrap();
        state.gone.remove(pod);
        for kind in ResourceKind::ALL {
            state.counters.remove(&fake_path(kind, pod));
        }
    }

    pub fn advance(&self, pod: &str, kind: ResourceKind, delta: u64) {
        let mut state = self.state.lock().unwrap();
        *state.counters.entry(fake_path(kind, pod)).or_insert(0) += delta;
    }

    /// Stamp every later read with a fixed instant
    pub fn freeze_clock(&self) {
        self.state.lock().unwrap().clock = Some(Instant::now());
    }

    pub fn advance_clock(&self, by: Duration) {
        let mut state = self.state.lock().unwrap();
        let now = state.clock.unwrap_or_else(Instant::now);
        state.clock = Some(now + by);
    }

    pub fn writes(&self) -> Vec<(ResourceKind, f64)> {
        let state = self.state.lock().unwrap();
        state.writes.iter().map(|(_, kind, v)| (*kind, *v)).collect()
    }

    pub fn writes_for(&self, pod: &str) -> Vec<(ResourceKind, f64)> {
        let state = self.state.lock().unwrap();
        state
            .writes
            .iter()
            .filter(|(p, _, _)| p == pod)
            .map(|(_, kind, v)| (*kind, *v))
            .collect()
    }

    pub fn rebalances(&self) -> usize {
        self.rebalances.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResourceProbe for FakeNode {
    async fn resolve_paths(&self, pod_name: &str) -> Option<PodPaths> {
        let state = self.state.lock().unwrap();
        if !state.ready.contains(pod_name) {
            return None;
        }
        Some(PodPaths {
            cpu: ResourceHandle {
                kind: ResourceKind::Cpu,
                path: fake_path(ResourceKind::Cpu, pod_name),
            },
            gpu: ResourceHandle {
                kind: ResourceKind::Gpu,
                path: fake_path(ResourceKind::Gpu, pod_name),
            },
        })
    }

    async fn read_counter(&self, handle: &ResourceHandle) -> Result<CounterReading, ProbeError> {
        let state = self.state.lock().unwrap();
        if state.gone.contains(&pod_of(&handle.path)) {
            return Err(ProbeError::Missing(handle.path.clone()));
        }
        Ok(CounterReading {
            value: state.counters.get(&handle.path).copied().unwrap_or(0),
            at: state.clock.unwrap_or_else(Instant::now),
        })
    }

    async fn write_limit(&self, handle: &ResourceHandle, value: f64) -> Result<(), ProbeError> {
        if self.fail_writes {
            return Err(ProbeError::Io {
                path: handle.path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        let mut state = self.state.lock().unwrap();
        state
            .writes
            .push((pod_of(&handle.path), handle.kind, value));
        Ok(())
    }
}

#[async_trait]
impl RebalanceHook for FakeNode {
    async fn notify_limits_changed(&self) -> Result<(), ProbeError> {
        self.rebalances.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
