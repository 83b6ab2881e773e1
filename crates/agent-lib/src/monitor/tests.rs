use super::*;
use crate::allocation::dynamic_weights;
use crate::health::ComponentStatus;
use crate::testing::FakeNode;

fn admitted(name: &str, reservation: f64) -> AdmittedPod {
    AdmittedPod {
        name: name.to_string(),
        token_reservation: reservation,
    }
}

fn monitor_with(
    node: &Arc<FakeNode>,
    config: MonitorConfig,
) -> (Monitor, watch::Receiver<NodeSnapshot>) {
    Monitor::new(config, NodeIo::new(node.clone(), node.clone()))
}

fn static_config(static_weight: f64) -> MonitorConfig {
    MonitorConfig {
        node_name: "node-a".to_string(),
        allocation: AllocationConfig {
            static_weight,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn total(monitor: &Monitor, kind: ResourceKind) -> f64 {
    monitor.running().map(|pod| pod.limits()[kind]).sum()
}

#[tokio::test]
async fn test_pod_waits_until_ready_then_seeds_limits() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, MonitorConfig::default());

    assert!(monitor.admit(admitted("trainer", 200.0)));
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert!(report.promoted.is_empty());
    assert_eq!(monitor.pod("trainer").map(|p| p.status()), Some(PodStatus::NotReady));
    assert!(node.writes().is_empty());

    node.mark_ready("trainer");
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.promoted, vec!["trainer".to_string()]);

    let pod = monitor.pod("trainer").unwrap();
    assert_eq!(pod.status(), PodStatus::Running);
    assert_eq!(pod.limits(), ResourceVector::new(100.0, 50.0));
    assert!(pod.last_update().is_some());
    assert_eq!(pod.update_count(), 0);
    assert_eq!(
        node.writes_for("trainer"),
        vec![(ResourceKind::Cpu, 100.0), (ResourceKind::Gpu, 50.0)]
    );
    assert_eq!(node.rebalances(), 1);
}

#[tokio::test]
async fn test_duplicate_admission_is_ignored() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, MonitorConfig::default());

    assert!(monitor.admit(admitted("trainer", 200.0)));
    assert!(!monitor.admit(admitted("trainer", 999.0)));
    assert_eq!(monitor.pod("trainer").unwrap().token_reservation(), 200.0);

    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;
    // Still ignored once running
    assert!(!monitor.admit(admitted("trainer", 999.0)));
    assert_eq!(monitor.snapshot().not_ready.len(), 0);
}

#[tokio::test]
async fn test_single_pod_gets_per_pod_limits() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, static_config(1.0));

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;

    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.allocation, AllocationOutcome::PerPod);

    let pod = monitor.pod("trainer").unwrap();
    assert_eq!(pod.update_count(), 1);
    for (_, limit) in pod.limits().iter() {
        assert!(limit >= 10.0);
    }
    // Idle pod, budget-bound: the spend matches the reservation
    assert!(pod.limits().priced_sum() <= 400.0 + 1e-6 + pod.token_queue());
}

#[tokio::test]
async fn test_completed_pod_is_never_written_again() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, static_config(1.0));

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;
    monitor.run_cycle(Trigger::Tick).await;
    let writes_before = node.writes_for("trainer").len();

    node.remove("trainer");
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.completed, vec!["trainer".to_string()]);
    assert_eq!(report.allocation, AllocationOutcome::Skipped);

    let updates = monitor.pod("trainer").unwrap().update_count();
    assert_eq!(monitor.pod("trainer").unwrap().status(), PodStatus::Completed);

    monitor.run_cycle(Trigger::Tick).await;
    monitor.run_cycle(Trigger::Pulse).await;
    assert_eq!(node.writes_for("trainer").len(), writes_before);
    assert_eq!(monitor.pod("trainer").unwrap().update_count(), updates);

    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.completed.len(), 1);
    assert!(snapshot.running.is_empty());
}

#[tokio::test]
async fn test_recreated_pod_is_managed_again() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, static_config(1.0));

    monitor.admit(admitted("web-0", 400.0));
    node.mark_ready("web-0");
    monitor.run_cycle(Trigger::Tick).await;
    monitor.run_cycle(Trigger::Tick).await;
    node.remove("web-0");
    monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(monitor.pod("web-0").map(|p| p.status()), Some(PodStatus::Completed));

    node.recreate("web-0");
    assert!(monitor.admit(admitted("web-0", 200.0)));
    let pod = monitor.pod("web-0").unwrap();
    assert_eq!(pod.status(), PodStatus::NotReady);
    assert_eq!(pod.token_reservation(), 200.0);
    assert!(monitor.snapshot().completed.is_empty());

    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.promoted, vec!["web-0".to_string()]);
    let pod = monitor.pod("web-0").unwrap();
    assert_eq!(pod.status(), PodStatus::Running);
    assert_eq!(pod.update_count(), 0);

    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.allocation, AllocationOutcome::PerPod);
    assert_eq!(monitor.pod("web-0").unwrap().update_count(), 1);
}

#[tokio::test]
async fn test_busy_pod_weights_and_limits_follow_this_cycle_usage() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, MonitorConfig::default());
    node.freeze_clock();

    for name in ["busy", "idle"] {
        monitor.admit(admitted(name, 400.0));
        node.mark_ready(name);
    }
    monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(monitor.running().count(), 2);

    // One second at 50 CPU and 60 GPU
    node.advance_clock(Duration::from_secs(1));
    node.advance("busy", ResourceKind::Cpu, 500_000_000);
    node.advance("busy", ResourceKind::Gpu, 600);
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.allocation, AllocationOutcome::PerPod);

    let busy = monitor.pod("busy").unwrap();
    let idle = monitor.pod("idle").unwrap();
    assert!((busy.usage()[ResourceKind::Cpu] - 50.0).abs() < 1e-9);
    assert!((busy.usage()[ResourceKind::Gpu] - 60.0).abs() < 1e-9);
    assert!((busy.avg_usage()[ResourceKind::Gpu] - 7.5).abs() < 1e-9);
    assert_eq!(idle.usage(), ResourceVector::default());

    let expected = dynamic_weights(&busy.usage(), &busy.avg_usage(), 0.0);
    assert_eq!(busy.weights(), expected);
    assert!(busy.weights()[ResourceKind::Gpu] < idle.weights()[ResourceKind::Gpu]);

    // Unconstrained optimum u + p A / 2w over a one-second period
    let gpu = 60.0 + 3.0 * 400.0 / (2.0 * expected[ResourceKind::Gpu]);
    assert!((busy.limits()[ResourceKind::Gpu] - gpu).abs() < 1e-6);
    assert!(busy.limits()[ResourceKind::Cpu] > 50.0);
    assert_eq!(idle.limits(), ResourceVector::new(10.0, 10.0));
    assert!(total(&monitor, ResourceKind::Gpu) <= 100.0);
    assert_eq!(
        node.writes_for("busy").last(),
        Some(&(ResourceKind::Gpu, busy.limits()[ResourceKind::Gpu]))
    );
}

#[tokio::test]
async fn test_pulse_plans_over_shortened_period() {
    let node = Arc::new(FakeNode::default());
    let config = MonitorConfig {
        period: Duration::from_secs(2),
        ..static_config(5.0)
    };
    let (mut monitor, _rx) = monitor_with(&node, config);

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;

    // w = (5, 15) and 800 tokens over the full period
    monitor.run_cycle(Trigger::Tick).await;
    let pod = monitor.pod("trainer").unwrap();
    assert!((pod.limits()[ResourceKind::Cpu] - 80.0).abs() < 1e-6);
    assert!((pod.limits()[ResourceKind::Gpu] - 80.0).abs() < 1e-6);

    // Three quarters of the period already gone
    let expired = Instant::now()
        .checked_sub(Duration::from_millis(1500))
        .expect("monotonic clock past 1.5s");
    monitor.last_expired = expired;
    let report = monitor.run_cycle(Trigger::Pulse).await;
    assert_eq!(report.allocation, AllocationOutcome::PerPod);
    assert_eq!(monitor.last_expired, expired);

    let pod = monitor.pod("trainer").unwrap();
    assert_eq!(pod.update_count(), 2);
    assert!((pod.limits()[ResourceKind::Cpu] - 20.0).abs() < 0.1);
    assert!((pod.limits()[ResourceKind::Gpu] - 20.0).abs() < 0.1);
}

#[tokio::test]
async fn test_capacity_holds_across_pods() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, _rx) = monitor_with(&node, static_config(0.1));

    for name in ["a", "b", "c"] {
        monitor.admit(admitted(name, 400.0));
        node.mark_ready(name);
    }
    monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(monitor.running().count(), 3);

    // Each idle pod alone would ask for 100 GPU, three times the node
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert!(matches!(report.allocation, AllocationOutcome::Joint { .. }));
    assert!(total(&monitor, ResourceKind::Gpu) <= 100.0 + 1e-3);
    assert!(total(&monitor, ResourceKind::Cpu) <= 600.0 + 1e-3);
    for pod in monitor.running() {
        assert!(pod.limits()[ResourceKind::Gpu] >= 10.0);
        assert_eq!(pod.update_count(), 1);
    }
}

#[tokio::test]
async fn test_joint_failure_keeps_previous_limits() {
    let node = Arc::new(FakeNode::default());
    let health = HealthRegistry::new();
    let (monitor, _rx) = monitor_with(&node, static_config(0.1));
    let mut monitor = monitor.with_health(health.clone());

    // Eleven GPU floors cannot fit under a capacity of 100
    for i in 0..11 {
        let name = format!("pod-{:02}", i);
        monitor.admit(admitted(&name, 400.0));
        node.mark_ready(&name);
    }
    monitor.run_cycle(Trigger::Tick).await;
    let seeded = node.writes().len();
    assert_eq!(seeded, 22);

    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.allocation, AllocationOutcome::KeptPrevious);
    assert_eq!(node.writes().len(), seeded);
    for pod in monitor.running() {
        assert_eq!(pod.limits(), ResourceVector::new(100.0, 50.0));
        assert_eq!(pod.update_count(), 0);
    }

    let response = health.health().await;
    assert_eq!(
        response.components.get(components::MONITOR).map(|c| c.status),
        Some(ComponentStatus::Degraded)
    );
}

#[tokio::test]
async fn test_failed_writes_degrade_probe_health() {
    let node = Arc::new(FakeNode::failing_writes());
    let health = HealthRegistry::new();
    let (monitor, _rx) = monitor_with(&node, static_config(1.0));
    let mut monitor = monitor.with_health(health.clone());

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;
    let report = monitor.run_cycle(Trigger::Tick).await;
    assert_eq!(report.allocation, AllocationOutcome::PerPod);

    let response = health.health().await;
    assert_eq!(
        response.components.get(components::PROBE).map(|c| c.status),
        Some(ComponentStatus::Degraded)
    );
    assert_eq!(node.rebalances(), 0);
}

#[tokio::test]
async fn test_monitoring_only_never_writes() {
    let node = Arc::new(FakeNode::default());
    let config = MonitorConfig {
        monitoring_only: true,
        ..static_config(1.0)
    };
    let (mut monitor, _rx) = monitor_with(&node, config);

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;
    let report = monitor.run_cycle(Trigger::Tick).await;

    assert_eq!(report.allocation, AllocationOutcome::Skipped);
    assert_eq!(monitor.pod("trainer").unwrap().status(), PodStatus::Running);
    assert!(node.writes().is_empty());
    assert_eq!(node.rebalances(), 0);
}

#[test]
fn test_remaining_secs_by_trigger() {
    let node = Arc::new(FakeNode::default());
    let config = MonitorConfig {
        period: Duration::from_secs(2),
        ..Default::default()
    };
    let (mut monitor, _rx) = monitor_with(&node, config);
    let now = Instant::now();
    monitor.last_expired = now;

    assert_eq!(monitor.remaining_secs(Trigger::Tick, now), 2.0);
    let half = now + Duration::from_millis(500);
    assert!((monitor.remaining_secs(Trigger::Pulse, half) - 1.5).abs() < 1e-9);
    // Late pulses still plan over a tenth of the period
    let late = now + Duration::from_secs(5);
    assert!((monitor.remaining_secs(Trigger::Pulse, late) - 0.2).abs() < 1e-9);
}

#[tokio::test]
async fn test_snapshot_published_each_cycle() {
    let node = Arc::new(FakeNode::default());
    let (mut monitor, rx) = monitor_with(&node, static_config(1.0));

    monitor.admit(admitted("trainer", 400.0));
    node.mark_ready("trainer");
    monitor.run_cycle(Trigger::Tick).await;

    let snapshot = rx.borrow().clone();
    assert_eq!(snapshot.node_name, "node-a");
    assert_eq!(snapshot.running.len(), 1);
    assert_eq!(snapshot.running[0].name, "trainer");
    assert_eq!(snapshot.running[0].resources.len(), 2);
}

#[tokio::test]
async fn test_run_loop_admits_and_stops_on_shutdown() {
    let node = Arc::new(FakeNode::default());
    let config = MonitorConfig {
        period: Duration::from_millis(20),
        ..static_config(1.0)
    };
    let (monitor, mut rx) = monitor_with(&node, config);

    let (admit_tx, admit_rx) = mpsc::channel(8);
    let (pulse_tx, pulse_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    node.mark_ready("trainer");
    let handle = tokio::spawn(monitor.run(admit_rx, pulse_rx, shutdown_rx));
    admit_tx.send(admitted("trainer", 400.0)).await.unwrap();

    let running = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            rx.changed().await.unwrap();
            if !rx.borrow().running.is_empty() {
                break;
            }
        }
    })
    .await;
    assert!(running.is_ok());

    pulse_tx.send(()).await.unwrap();
    shutdown_tx.send(()).unwrap();
    let stopped = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(stopped.is_ok());
    assert!(!node.writes_for("trainer").is_empty());
}
