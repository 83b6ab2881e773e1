//! Core data models for the autoscaling agent

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resources whose limits are traded in tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Gpu,
}

impl ResourceKind {
    /// Every kind, in solver column order
    pub const ALL: [ResourceKind; 2] = [ResourceKind::Cpu, ResourceKind::Gpu];

    /// Token cost per unit of limit per second
    pub const fn price(self) -> f64 {
        match self {
            ResourceKind::Cpu => 1.0,
            ResourceKind::Gpu => 3.0,
        }
    }

    /// Divisor turning a raw counter delta per second into a 0-100 percentage
    pub const fn scale(self) -> f64 {
        match self {
            ResourceKind::Cpu => 10_000_000.0,
            ResourceKind::Gpu => 10.0,
        }
    }

    /// Position of this kind in `ALL`
    pub const fn index(self) -> usize {
        match self {
            ResourceKind::Cpu => 0,
            ResourceKind::Gpu => 1,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Gpu => "gpu",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per [`ResourceKind`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceVector([f64; 2]);

impl ResourceVector {
    pub const fn new(cpu: f64, gpu: f64) -> Self {
        Self([cpu, gpu])
    }

    pub fn from_fn(mut f: impl FnMut(ResourceKind) -> f64) -> Self {
        Self([f(ResourceKind::Cpu), f(ResourceKind::Gpu)])
    }

    pub fn get(&self, kind: ResourceKind) -> f64 {
        self.0[kind.index()]
    }

    pub fn set(&mut self, kind: ResourceKind, value: f64) {
        self.0[kind.index()] = value;
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceKind, f64)> + '_ {
        ResourceKind::ALL.iter().map(move |&kind| (kind, self.get(kind)))
    }

    /// Token spend rate `sum(price * value)`
    pub fn priced_sum(&self) -> f64 {
        self.iter().map(|(kind, value)| kind.price() * value).sum()
    }
}

impl std::ops::Index<ResourceKind> for ResourceVector {
    type Output = f64;

    fn index(&self, kind: ResourceKind) -> &f64 {
        &self.0[kind.index()]
    }
}

/// Pod lifecycle, ordered so that transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PodStatus {
    Initializing,
    NotReady,
    Running,
    Completed,
}

impl PodStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            PodStatus::Initializing => "initializing",
            PodStatus::NotReady => "not_ready",
            PodStatus::Running => "running",
            PodStatus::Completed => "completed",
        }
    }
}

/// A pod granted a token reservation by the admission side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmittedPod {
    pub name: String,
    /// Tokens per second
    pub token_reservation: f64,
}

/// Point-in-time view of one resource of one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub kind: ResourceKind,
    pub limit: f64,
    pub usage: f64,
    pub avg_usage: f64,
    pub dynamic_weight: f64,
}

/// Point-in-time view of one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub status: PodStatus,
    pub token_reservation: f64,
    pub token_queue: f64,
    pub update_count: u64,
    pub resources: Vec<ResourceSnapshot>,
}

/// Everything the exporter needs, published once per cycle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub node_name: String,
    /// Unix seconds when the snapshot was taken
    pub taken_at: i64,
    pub running: Vec<PodSnapshot>,
    pub not_ready: Vec<PodSnapshot>,
    pub completed: Vec<PodSnapshot>,
}
