//! Mutable per-pod and per-resource state driven by the monitor

mod pod;
mod resource;

pub use pod::{ApplyReport, LifecycleError, PodState};
pub use resource::{LimitWrite, ResourceState};
