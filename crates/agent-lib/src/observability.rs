//! Observability for the autoscaler
//!
//! Provides:
//! - Prometheus metrics: per-pod limits, usage, weights and token state,
//!   plus cycle latency and solver/write failure counters
//! - Structured JSON logging of pod lifecycle and allocation events

use crate::models::NodeSnapshot;
use prometheus::proto::MetricFamily;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_gauge_vec,
    GaugeVec, Histogram, IntCounter, IntGaugeVec,
};
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

const CYCLE_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

const RESOURCE_LABELS: &[&str] = &["pod", "resource", "node"];
const POD_LABELS: &[&str] = &["pod", "node"];

static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    resource_limit: GaugeVec,
    resource_usage: GaugeVec,
    resource_avg_usage: GaugeVec,
    resource_dynamic_weight: GaugeVec,
    pod_update_count: GaugeVec,
    pod_token_reservation: GaugeVec,
    pod_token_queue: GaugeVec,
    pods: IntGaugeVec,
    cycle_duration_seconds: Histogram,
    joint_solves: IntCounter,
    joint_failures: IntCounter,
    limit_write_errors: IntCounter,
    /// Held from the reset of the per-pod series until they are gathered
    publish: Mutex<()>,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            resource_limit: register_gauge_vec!(
                "tokenscale_resource_limit",
                "Current limit of a pod resource in percentage points",
                RESOURCE_LABELS
            )
            .expect("Failed to register resource_limit"),

            resource_usage: register_gauge_vec!(
                "tokenscale_resource_usage",
                "Most recent usage sample of a pod resource",
                RESOURCE_LABELS
            )
            .expect("Failed to register resource_usage"),

            resource_avg_usage: register_gauge_vec!(
                "tokenscale_resource_avg_usage",
                "Smoothed usage of a pod resource",
                RESOURCE_LABELS
            )
            .expect("Failed to register resource_avg_usage"),

            resource_dynamic_weight: register_gauge_vec!(
                "tokenscale_resource_dynamic_weight",
                "Dynamic weight of a pod resource in the allocation objective",
                RESOURCE_LABELS
            )
            .expect("Failed to register resource_dynamic_weight"),

            pod_update_count: register_gauge_vec!(
                "tokenscale_pod_update_count",
                "Number of allocation passes applied to a pod",
                POD_LABELS
            )
            .expect("Failed to register pod_update_count"),

            pod_token_reservation: register_gauge_vec!(
                "tokenscale_pod_token_reservation",
                "Tokens per second reserved for a pod",
                POD_LABELS
            )
            .expect("Failed to register pod_token_reservation"),

            pod_token_queue: register_gauge_vec!(
                "tokenscale_pod_token_queue",
                "Unspent tokens carried by a pod",
                POD_LABELS
            )
            .expect("Failed to register pod_token_queue"),

            pods: register_int_gauge_vec!(
                "tokenscale_pods",
                "Number of tracked pods by lifecycle status",
                &["status"]
            )
            .expect("Failed to register pods"),

            cycle_duration_seconds: register_histogram!(
                "tokenscale_cycle_duration_seconds",
                "Time spent in one sample and allocate cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_duration_seconds"),

            joint_solves: register_int_counter!(
                "tokenscale_joint_solves_total",
                "Allocation passes that needed the node-wide joint solve"
            )
            .expect("Failed to register joint_solves"),

            joint_failures: register_int_counter!(
                "tokenscale_joint_failures_total",
                "Joint solves that failed and kept previous limits"
            )
            .expect("Failed to register joint_failures"),

            limit_write_errors: register_int_counter!(
                "tokenscale_limit_write_errors_total",
                "Failed limit writes"
            )
            .expect("Failed to register limit_write_errors"),

            publish: Mutex::new(()),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same instance
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_cycle_duration(&self, duration_secs: f64) {
        self.inner().cycle_duration_seconds.observe(duration_secs);
    }

    pub fn inc_joint_solves(&self) {
        self.inner().joint_solves.inc();
    }

    pub fn inc_joint_failures(&self) {
        self.inner().joint_failures.inc();
    }

    pub fn inc_limit_write_errors(&self, count: u64) {
        self.inner().limit_write_errors.inc_by(count);
    }

    /// Replace every per-pod series with the contents of `snapshot` and
    /// gather the default registry
    ///
    /// Series of pods that disappeared since the last snapshot are dropped.
    /// Concurrent callers are serialized so no gather sees a half-built set.
    pub fn publish_and_gather(&self, snapshot: &NodeSnapshot) -> Vec<MetricFamily> {
        let inner = self.inner();
        let _publishing = match inner.publish.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.publish_snapshot(snapshot);
        prometheus::gather()
    }

    fn publish_snapshot(&self, snapshot: &NodeSnapshot) {
        let inner = self.inner();
        let node = snapshot.node_name.as_str();

        for vec in [
            &inner.resource_limit,
            &inner.resource_usage,
            &inner.resource_avg_usage,
            &inner.resource_dynamic_weight,
            &inner.pod_update_count,
            &inner.pod_token_reservation,
            &inner.pod_token_queue,
        ] {
            vec.reset();
        }

        for pod in &snapshot.running {
            let name = pod.name.as_str();
            for resource in &pod.resources {
                let labels = [name, resource.kind.as_str(), node];
                inner.resource_limit.with_label_values(&labels).set(resource.limit);
                inner.resource_usage.with_label_values(&labels).set(resource.usage);
                inner
                    .resource_avg_usage
                    .with_label_values(&labels)
                    .set(resource.avg_usage);
                inner
                    .resource_dynamic_weight
                    .with_label_values(&labels)
                    .set(resource.dynamic_weight);
            }

            let labels = [name, node];
            inner
                .pod_update_count
                .with_label_values(&labels)
                .set(pod.update_count as f64);
            inner
                .pod_token_reservation
                .with_label_values(&labels)
                .set(pod.token_reservation);
            inner
                .pod_token_queue
                .with_label_values(&labels)
                .set(pod.token_queue);
        }

        for (status, count) in [
            ("running", snapshot.running.len()),
            ("not_ready", snapshot.not_ready.len()),
            ("completed", snapshot.completed.len()),
        ] {
            inner.pods.with_label_values(&[status]).set(count as i64);
        }
    }
}

/// Structured logger for autoscaler events
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_pod_admitted(&self, pod_name: &str, token_reservation: f64) {
        info!(
            event = "pod_admitted",
            node = %self.node_name,
            pod_name = %pod_name,
            token_reservation = token_reservation,
            "Pod admitted with token reservation"
        );
    }

    pub fn log_pod_promoted(&self, pod_name: &str, cpu_limit: f64, gpu_limit: f64) {
        info!(
            event = "pod_promoted",
            node = %self.node_name,
            pod_name = %pod_name,
            cpu_limit = cpu_limit,
            gpu_limit = gpu_limit,
            "Pod resources materialised, limits seeded"
        );
    }

    pub fn log_pod_completed(&self, pod_name: &str, update_count: u64, token_queue: f64) {
        info!(
            event = "pod_completed",
            node = %self.node_name,
            pod_name = %pod_name,
            update_count = update_count,
            token_queue = token_queue,
            "Pod completed"
        );
    }

    pub fn log_limits_applied(
        &self,
        pod_name: &str,
        cpu_limit: f64,
        gpu_limit: f64,
        token_queue: f64,
        joint: bool,
    ) {
        debug!(
            event = "limits_applied",
            node = %self.node_name,
            pod_name = %pod_name,
            cpu_limit = cpu_limit,
            gpu_limit = gpu_limit,
            token_queue = token_queue,
            joint = joint,
            "Applied new limits"
        );
    }

    pub fn log_joint_solve(&self, pods: usize, violated: &[&str], passes: usize) {
        info!(
            event = "joint_solve",
            node = %self.node_name,
            pods = pods,
            violated = ?violated,
            passes = passes,
            "Per-pod plans exceeded node capacity, solved jointly"
        );
    }

    pub fn log_joint_failure(&self, pods: usize, error: &str) {
        warn!(
            event = "joint_allocation_failed",
            node = %self.node_name,
            pods = pods,
            error = %error,
            "Joint solve failed, keeping previous limits"
        );
    }

    pub fn log_startup(&self, version: &str, monitoring_only: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            monitoring_only = monitoring_only,
            "Tokenscale agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Tokenscale agent shutting down"
        );
    }
}
