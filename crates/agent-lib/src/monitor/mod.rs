//! The node control loop
//!
//! A single [`Monitor`] owns every pod record. Each cycle it
//! 1. samples the running pods concurrently,
//! 2. moves pods whose resources vanished to the completed set,
//! 3. runs the allocation pass (token queues, weights, limits, capacity
//!    check, joint fallback) and writes the results,
//! 4. promotes not-ready pods whose resources have appeared,
//! 5. publishes a [`NodeSnapshot`] for the exporter.
//!
//! Cycles are driven by a ticker and by activity pulses; admissions and
//! shutdown arrive on their own channels.

mod sampler;

#[cfg(test)]
mod tests;

use crate::allocation::{solve_joint, violated_ceilings, AllocationConfig, JointPod, LimitPlan};
use crate::collector::NodeIo;
use crate::health::{components, HealthRegistry};
use crate::models::{AdmittedPod, NodeSnapshot, PodStatus, ResourceKind, ResourceVector};
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::state::PodState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Share of the period an out-of-band pass always gets to plan over
const MIN_REMAINING_FRACTION: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub node_name: String,
    pub period: Duration,
    /// Observe and report only; never write limits
    pub monitoring_only: bool,
    pub allocation: AllocationConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            node_name: "unknown".to_string(),
            period: Duration::from_secs(1),
            monitoring_only: false,
            allocation: AllocationConfig::default(),
        }
    }
}

/// What started a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Tick,
    Pulse,
}

/// Result of the allocation phase of one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    /// Nothing running, or monitoring-only
    Skipped,
    PerPod,
    Joint { passes: usize },
    /// The joint solve failed; every pod kept its limits
    KeptPrevious,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub completed: Vec<String>,
    pub promoted: Vec<String>,
    pub allocation: AllocationOutcome,
}

pub struct Monitor {
    config: MonitorConfig,
    io: NodeIo,
    not_ready: BTreeMap<String, PodState>,
    running: BTreeMap<String, PodState>,
    completed: BTreeMap<String, PodState>,
    /// When the ticker last fired
    last_expired: Instant,
    /// When limits were last applied
    last_update: Instant,
    snapshot_tx: watch::Sender<NodeSnapshot>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    health: Option<HealthRegistry>,
}

impl Monitor {
    pub fn new(config: MonitorConfig, io: NodeIo) -> (Self, watch::Receiver<NodeSnapshot>) {
        let (snapshot_tx, snapshot_rx) = watch::channel(NodeSnapshot {
            node_name: config.node_name.clone(),
            ..Default::default()
        });
        let now = Instant::now();

        let monitor = Self {
            logger: StructuredLogger::new(config.node_name.clone()),
            config,
            io,
            not_ready: BTreeMap::new(),
            running: BTreeMap::new(),
            completed: BTreeMap::new(),
            last_expired: now,
            last_update: now,
            snapshot_tx,
            metrics: AgentMetrics::new(),
            health: None,
        };
        (monitor, snapshot_rx)
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Look a pod up in whichever lifecycle set holds it
    pub fn pod(&self, name: &str) -> Option<&PodState> {
        self.running
            .get(name)
            .or_else(|| self.not_ready.get(name))
            .or_else(|| self.completed.get(name))
    }

    pub fn running(&self) -> impl Iterator<Item = &PodState> {
        self.running.values()
    }

    /// Start tracking a newly admitted pod
    ///
    /// Returns `false` while the name is still waiting or running. A name
    /// that only completed belongs to a recreated pod and replaces the
    /// completed record.
    pub fn admit(&mut self, admitted: AdmittedPod) -> bool {
        if self.running.contains_key(&admitted.name) || self.not_ready.contains_key(&admitted.name)
        {
            debug!(pod = %admitted.name, "Ignoring duplicate admission");
            return false;
        }
        if self.completed.remove(&admitted.name).is_some() {
            debug!(pod = %admitted.name, "Replacing completed record of recreated pod");
        }

        let mut pod = PodState::new(admitted.name.clone(), admitted.token_reservation);
        if let Err(e) = pod.transition(PodStatus::NotReady) {
            warn!(error = %e, "Unexpected lifecycle state on admission");
        }
        self.logger
            .log_pod_admitted(&admitted.name, admitted.token_reservation);
        self.not_ready.insert(admitted.name, pod);
        true
    }

    /// Seconds the allocation pass plans for
    fn remaining_secs(&self, trigger: Trigger, now: Instant) -> f64 {
        let period = self.config.period;
        match trigger {
            Trigger::Tick => period.as_secs_f64(),
            Trigger::Pulse => {
                let left = period.saturating_sub(now.saturating_duration_since(self.last_expired));
                left.as_secs_f64()
                    .max(period.as_secs_f64() * MIN_REMAINING_FRACTION)
            }
        }
    }

    pub async fn run_cycle(&mut self, trigger: Trigger) -> CycleReport {
        let started = Instant::now();
        let remaining = self.remaining_secs(trigger, started);
        if trigger == Trigger::Tick {
            self.last_expired = started;
        }

        let completed = self.sample_running().await;

        let allocation = if self.config.monitoring_only {
            AllocationOutcome::Skipped
        } else {
            self.allocate(remaining, Instant::now()).await
        };

        let promoted = self.promote_ready().await;

        self.snapshot_tx.send_replace(self.snapshot());
        self.metrics
            .observe_cycle_duration(started.elapsed().as_secs_f64());

        CycleReport {
            completed,
            promoted,
            allocation,
        }
    }

    /// Sample every running pod; returns the pods that completed
    async fn sample_running(&mut self) -> Vec<String> {
        let jobs = self
            .running
            .iter()
            .map(|(name, pod)| (name.clone(), pod.handles()))
            .collect();

        let samples = sampler::sample_all(Arc::clone(&self.io.probe), jobs).await;

        let mut finished = Vec::new();
        for sample in samples {
            if let Some(pod) = self.running.get_mut(&sample.name) {
                if !pod.record_samples(sample.readings) {
                    finished.push(sample.name);
                }
            }
        }

        for name in &finished {
            self.complete(name);
        }
        finished
    }

    fn complete(&mut self, name: &str) {
        let Some(mut pod) = self.running.remove(name) else {
            return;
        };
        if let Err(e) = pod.transition(PodStatus::Completed) {
            warn!(error = %e, "Unexpected lifecycle state on completion");
        }
        self.logger
            .log_pod_completed(name, pod.update_count(), pod.token_queue());
        self.completed.insert(name.to_string(), pod);
    }

    async fn allocate(&mut self, remaining: f64, now: Instant) -> AllocationOutcome {
        if self.running.is_empty() {
            return AllocationOutcome::Skipped;
        }

        let config = &self.config.allocation;
        let fallback_update = self.last_update;

        for pod in self.running.values_mut() {
            let since = pod.last_update().unwrap_or(fallback_update);
            pod.update_token_queue(
                now.saturating_duration_since(since).as_secs_f64(),
                config.queue_cap,
            );
        }
        for pod in self.running.values_mut() {
            pod.update_dynamic_weight(config.static_weight);
        }

        let plans: Vec<LimitPlan> = self
            .running
            .values()
            .map(|pod| pod.compute_next_limits(remaining, config))
            .collect();

        let violated = violated_ceilings(plans.iter().map(|plan| &plan.limits), config);

        let (targets, outcome): (Vec<ResourceVector>, AllocationOutcome) = if violated.is_empty()
        {
            (
                plans.iter().map(|plan| plan.limits).collect(),
                AllocationOutcome::PerPod,
            )
        } else {
            self.metrics.inc_joint_solves();
            let pods: Vec<JointPod> = self
                .running
                .values()
                .zip(&plans)
                .map(|(pod, plan)| JointPod {
                    usage: pod.usage(),
                    weight: pod.weights(),
                    available_token: plan.available_token,
                    budget_rate: plan.budget_rate(remaining),
                })
                .collect();

            match solve_joint(&pods, config) {
                Ok(solution) => {
                    let kinds: Vec<&str> = violated.iter().map(|k| k.as_str()).collect();
                    self.logger
                        .log_joint_solve(pods.len(), &kinds, solution.passes);
                    let passes = solution.passes;
                    (solution.limits, AllocationOutcome::Joint { passes })
                }
                Err(e) => {
                    self.metrics.inc_joint_failures();
                    self.logger.log_joint_failure(pods.len(), &e.to_string());
                    if let Some(health) = &self.health {
                        health
                            .set_degraded(components::MONITOR, format!("joint solve failed: {}", e))
                            .await;
                    }
                    // Previous limits stay in force; the queues already paid for them
                    for pod in self.running.values_mut() {
                        pod.mark_updated(now);
                    }
                    self.last_update = now;
                    return AllocationOutcome::KeptPrevious;
                }
            }
        };

        let joint = matches!(outcome, AllocationOutcome::Joint { .. });
        let mut failed = 0;
        for (pod, limits) in self.running.values_mut().zip(&targets) {
            let report = pod.apply_limits(limits, &self.io, now).await;
            failed += report.failed;
            self.logger.log_limits_applied(
                pod.name(),
                limits[ResourceKind::Cpu],
                limits[ResourceKind::Gpu],
                pod.token_queue(),
                joint,
            );
        }
        self.last_update = now;

        if failed > 0 {
            self.metrics.inc_limit_write_errors(failed as u64);
        }
        if let Some(health) = &self.health {
            health.set_healthy(components::MONITOR).await;
            if failed > 0 {
                health
                    .set_degraded(components::PROBE, format!("{} limit writes failed", failed))
                    .await;
            } else {
                health.set_healthy(components::PROBE).await;
            }
        }

        outcome
    }

    /// Move pods whose resources have appeared into the running set
    async fn promote_ready(&mut self) -> Vec<String> {
        let candidates: Vec<String> = self.not_ready.keys().cloned().collect();
        let mut promoted = Vec::new();

        for name in candidates {
            let Some(paths) = self.io.probe.resolve_paths(&name).await else {
                continue;
            };
            let Some(mut pod) = self.not_ready.remove(&name) else {
                continue;
            };

            pod.attach(paths);
            if !self.config.monitoring_only {
                let initial = self.config.allocation.initial_limits();
                let report = pod.seed_limits(&initial, &self.io).await;
                if report.failed > 0 {
                    self.metrics.inc_limit_write_errors(report.failed as u64);
                }
            }
            for &kind in &ResourceKind::ALL {
                pod.resource_mut(kind)
                    .sample_usage(self.io.probe.as_ref())
                    .await;
            }
            pod.mark_updated(Instant::now());

            if let Err(e) = pod.transition(PodStatus::Running) {
                warn!(error = %e, "Unexpected lifecycle state on promotion");
            }
            let limits = pod.limits();
            self.logger.log_pod_promoted(
                &name,
                limits[ResourceKind::Cpu],
                limits[ResourceKind::Gpu],
            );
            self.running.insert(name.clone(), pod);
            promoted.push(name);
        }

        promoted
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            node_name: self.config.node_name.clone(),
            taken_at: chrono::Utc::now().timestamp(),
            running: self.running.values().map(PodState::snapshot).collect(),
            not_ready: self.not_ready.values().map(PodState::snapshot).collect(),
            completed: self.completed.values().map(PodState::snapshot).collect(),
        }
    }

    /// Drive cycles until shutdown
    ///
    /// A cycle in progress always finishes before shutdown is observed.
    pub async fn run(
        mut self,
        mut admissions: mpsc::Receiver<AdmittedPod>,
        mut pulses: mpsc::Receiver<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(
            period_ms = self.config.period.as_millis() as u64,
            monitoring_only = self.config.monitoring_only,
            "Starting monitor"
        );
        if let Some(health) = &self.health {
            health.register(components::MONITOR).await;
        }

        let mut ticker = interval(self.config.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle(Trigger::Tick).await;
                    debug!(
                        running = self.running.len(),
                        promoted = report.promoted.len(),
                        completed = report.completed.len(),
                        allocation = ?report.allocation,
                        "Cycle complete"
                    );
                }
                Some(pod) = admissions.recv() => {
                    self.admit(pod);
                }
                Some(()) = pulses.recv() => {
                    self.run_cycle(Trigger::Pulse).await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down monitor");
                    break;
                }
            }
        }
    }
}
