//! Token-economy allocation
//!
//! Each pod spends its token budget on CPU and GPU limits, choosing the
//! limits that minimise `sum(weight * (limit - usage)^2)` minus the value
//! of the tokens spent. [`closed_form`] solves this per pod; when the
//! per-pod answers overflow a node-wide capacity, [`joint`] re-solves all
//! pods together through the linear solver.

pub mod closed_form;
pub mod joint;

pub use closed_form::{
    available_token, dynamic_weights, next_limits, update_token_queue, LimitPlan,
};
pub use joint::{solve_joint, violated_ceilings, JointError, JointPod, JointSolution};

use crate::models::{ResourceKind, ResourceVector};
use serde::{Deserialize, Serialize};

/// Upper bound applied to a pod's token queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueCap {
    /// Unspent tokens accumulate without limit
    #[default]
    Unbounded,
    /// Queue never exceeds one second of the pod's reservation
    Reservation,
}

/// Tunables of the allocation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Fixed weight multiplier; 0 selects usage-adaptive weights
    pub static_weight: f64,
    /// Share of the token queue added to the per-period budget
    pub carry_over: f64,
    pub queue_cap: QueueCap,
    /// Floor applied to every computed limit
    pub min_limit: f64,
    /// Node-wide ceiling on the sum of CPU limits
    pub cpu_capacity: f64,
    /// Node-wide ceiling on the sum of GPU limits
    pub gpu_capacity: f64,
    pub initial_cpu_limit: f64,
    pub initial_gpu_limit: f64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            static_weight: 0.0,
            carry_over: 0.0,
            queue_cap: QueueCap::Unbounded,
            min_limit: 10.0,
            cpu_capacity: 600.0,
            gpu_capacity: 100.0,
            initial_cpu_limit: 100.0,
            initial_gpu_limit: 50.0,
        }
    }
}

impl AllocationConfig {
    pub fn capacity(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_capacity,
            ResourceKind::Gpu => self.gpu_capacity,
        }
    }

    /// Limits written when a pod first becomes ready
    pub fn initial_limits(&self) -> ResourceVector {
        ResourceVector::new(self.initial_cpu_limit, self.initial_gpu_limit)
    }
}
