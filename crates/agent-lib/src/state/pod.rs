//! Per-pod allocation state

use super::resource::{LimitWrite, ResourceState};
use crate::allocation::{self, AllocationConfig, LimitPlan, QueueCap};
use crate::collector::{CounterReading, NodeIo, PodPaths, ProbeError, ResourceHandle};
use crate::models::{PodSnapshot, PodStatus, ResourceKind, ResourceVector};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("pod {pod} cannot move from {from:?} to {to:?}")]
    Regression {
        pod: String,
        from: PodStatus,
        to: PodStatus,
    },
}

/// Writes performed by one [`PodState::apply_limits`] call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub written: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl ApplyReport {
    fn record(&mut self, outcome: LimitWrite) {
        match outcome {
            LimitWrite::Written => self.written += 1,
            LimitWrite::Unchanged => self.unchanged += 1,
            LimitWrite::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PodState {
    name: String,
    status: PodStatus,
    cpu: ResourceState,
    gpu: ResourceState,
    token_reservation: f64,
    token_queue: f64,
    last_update: Option<Instant>,
    update_count: u64,
}

impl PodState {
    pub fn new(name: impl Into<String>, token_reservation: f64) -> Self {
        Self {
            name: name.into(),
            status: PodStatus::Initializing,
            cpu: ResourceState::new(ResourceKind::Cpu),
            gpu: ResourceState::new(ResourceKind::Gpu),
            token_reservation,
            token_queue: 0.0,
            last_update: None,
            update_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> PodStatus {
        self.status
    }

    pub fn token_reservation(&self) -> f64 {
        self.token_reservation
    }

    pub fn token_queue(&self) -> f64 {
        self.token_queue
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn resource(&self, kind: ResourceKind) -> &ResourceState {
        match kind {
            ResourceKind::Cpu => &self.cpu,
            ResourceKind::Gpu => &self.gpu,
        }
    }

    pub fn resource_mut(&mut self, kind: ResourceKind) -> &mut ResourceState {
        match kind {
            ResourceKind::Cpu => &mut self.cpu,
            ResourceKind::Gpu => &mut self.gpu,
        }
    }

    pub fn usage(&self) -> ResourceVector {
        ResourceVector::from_fn(|kind| self.resource(kind).usage())
    }

    pub fn avg_usage(&self) -> ResourceVector {
        ResourceVector::from_fn(|kind| self.resource(kind).avg_usage())
    }

    pub fn weights(&self) -> ResourceVector {
        ResourceVector::from_fn(|kind| self.resource(kind).dynamic_weight())
    }

    pub fn limits(&self) -> ResourceVector {
        ResourceVector::from_fn(|kind| self.resource(kind).limit())
    }

    /// Move forward in the lifecycle; moving back or staying put is an error
    pub fn transition(&mut self, next: PodStatus) -> Result<(), LifecycleError> {
        if next <= self.status {
            return Err(LifecycleError::Regression {
                pod: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn attach(&mut self, paths: PodPaths) {
        self.cpu.attach(paths.cpu);
        self.gpu.attach(paths.gpu);
    }

    /// Handles of every attached resource
    pub fn handles(&self) -> Vec<ResourceHandle> {
        ResourceKind::ALL
            .iter()
            .filter_map(|&kind| self.resource(kind).handle().cloned())
            .collect()
    }

    /// Fold one round of counter reads into the resources
    ///
    /// Returns `false` without touching anything when any source is gone.
    pub fn record_samples(
        &mut self,
        readings: Vec<(ResourceKind, Result<CounterReading, ProbeError>)>,
    ) -> bool {
        if readings
            .iter()
            .any(|(_, r)| matches!(r, Err(e) if e.is_missing()))
        {
            return false;
        }

        readings
            .into_iter()
            .all(|(kind, reading)| self.resource_mut(kind).record_sample(reading))
    }

    /// Replenish by the reservation and deplete by the current limits' cost
    pub fn update_token_queue(&mut self, elapsed_secs: f64, cap: QueueCap) {
        self.token_queue = allocation::update_token_queue(
            self.token_queue,
            self.token_reservation,
            &self.limits(),
            elapsed_secs,
            cap,
        );
    }

    pub fn update_dynamic_weight(&mut self, static_weight: f64) {
        let weights = allocation::dynamic_weights(&self.usage(), &self.avg_usage(), static_weight);
        for (kind, weight) in weights.iter() {
            self.resource_mut(kind).set_dynamic_weight(weight);
        }
    }

    pub fn available_token(&self, remaining_secs: f64, config: &AllocationConfig) -> f64 {
        allocation::available_token(
            self.token_reservation,
            self.token_queue,
            remaining_secs,
            config.carry_over,
        )
    }

    /// Closed-form limits for the remaining period
    pub fn compute_next_limits(&self, remaining_secs: f64, config: &AllocationConfig) -> LimitPlan {
        allocation::next_limits(
            &self.usage(),
            &self.weights(),
            self.available_token(remaining_secs, config),
            remaining_secs,
            config.min_limit,
        )
    }

    /// Write `limits` to every resource without counting it as an update
    pub async fn seed_limits(&mut self, limits: &ResourceVector, io: &NodeIo) -> ApplyReport {
        let mut report = ApplyReport::default();
        for &kind in &ResourceKind::ALL {
            let outcome = self
                .resource_mut(kind)
                .set_limit(limits[kind], io.probe.as_ref(), io.hook.as_ref())
                .await;
            report.record(outcome);
        }
        report
    }

    /// Write `limits`, bump the update counter and stamp the update time
    pub async fn apply_limits(
        &mut self,
        limits: &ResourceVector,
        io: &NodeIo,
        now: Instant,
    ) -> ApplyReport {
        let report = self.seed_limits(limits, io).await;
        self.update_count += 1;
        self.last_update = Some(now);
        report
    }

    pub(crate) fn mark_updated(&mut self, now: Instant) {
        self.last_update = Some(now);
    }

    pub fn snapshot(&self) -> PodSnapshot {
        PodSnapshot {
            name: self.name.clone(),
            status: self.status,
            token_reservation: self.token_reservation,
            token_queue: self.token_queue,
            update_count: self.update_count,
            resources: ResourceKind::ALL
                .iter()
                .map(|&kind| self.resource(kind).snapshot())
                .collect(),
        }
    }
}
