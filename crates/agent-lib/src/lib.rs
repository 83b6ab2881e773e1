//! Node-local token-economy autoscaler for CPU and GPU limits
//!
//! This crate provides the core functionality for:
//! - Per-pod usage tracking and token queues
//! - Closed-form and joint (capacity-aware) limit allocation
//! - The node monitor loop and its cgroup/sysfs collaborators
//! - Health checks and observability

pub mod allocation;
pub mod collector;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod proto;
pub mod solver;
pub mod state;

#[cfg(test)]
mod testing;

pub use allocation::{AllocationConfig, JointError, QueueCap};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use monitor::{Monitor, MonitorConfig, Trigger};
pub use observability::{AgentMetrics, StructuredLogger};
pub use solver::{AugmentedMatrix, SolverError};
pub use state::{PodState, ResourceState};
