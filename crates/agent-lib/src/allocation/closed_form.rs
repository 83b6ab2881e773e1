//! Per-pod closed-form allocation
//!
//! Unconstrained optimum: `L_k = u_k + p_k * A / (2 w_k)` where `A` is the
//! pod's available token for the period. If that overspends the budget
//! `A / remaining`, the budget equality is made active and the Lagrange
//! solution is
//!
//! ```text
//! up  = A / remaining - sum_j p_j u_j
//! L_k = u_k + p_k * up / (w_k * sum_j p_j^2 / w_j)
//! ```
//!
//! which spends the budget exactly.

use super::QueueCap;
use crate::models::{ResourceKind, ResourceVector};

/// Smallest remaining period accepted, in seconds
const MIN_REMAINING_SECS: f64 = 1e-3;

/// Per-pod allocation result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitPlan {
    /// Limits before flooring
    pub raw: ResourceVector,
    /// Limits after flooring at the configured minimum
    pub limits: ResourceVector,
    /// Tokens available for the period
    pub available_token: f64,
    /// `available_token - remaining * sum(p * L)` for the unconstrained optimum
    pub token_condition: f64,
    /// Whether the budget was binding and the constrained branch was taken
    pub constrained: bool,
}

impl LimitPlan {
    /// Tokens per second the pod may spend over the period
    pub fn budget_rate(&self, remaining_secs: f64) -> f64 {
        self.available_token / remaining_secs.max(MIN_REMAINING_SECS)
    }
}

/// Tokens the pod may spend over `remaining_secs`
pub fn available_token(
    reservation: f64,
    token_queue: f64,
    remaining_secs: f64,
    carry_over: f64,
) -> f64 {
    reservation * remaining_secs + carry_over * token_queue
}

/// Replenish by the reservation, deplete by what the limits cost
///
/// The result never drops below 0.
pub fn update_token_queue(
    queue: f64,
    reservation: f64,
    limits: &ResourceVector,
    elapsed_secs: f64,
    cap: QueueCap,
) -> f64 {
    let next = (queue + reservation * elapsed_secs - limits.priced_sum() * elapsed_secs).max(0.0);
    match cap {
        QueueCap::Unbounded => next,
        QueueCap::Reservation => next.min(reservation),
    }
}

/// Per-kind weights of the allocation objective
///
/// A positive `static_weight` fixes `w_k = p_k * static_weight`. Otherwise
/// weights favour resources whose smoothed usage is small relative to the
/// pod's other resources, scaled up when current usage departs from its
/// average.
pub fn dynamic_weights(
    usage: &ResourceVector,
    avg_usage: &ResourceVector,
    static_weight: f64,
) -> ResourceVector {
    if static_weight > 0.0 {
        return ResourceVector::from_fn(|kind| kind.price() * static_weight);
    }

    let sum_avg: f64 = ResourceKind::ALL.iter().map(|&k| avg_usage[k] + 1.0).sum();
    let burst: f64 = 15.0
        * ResourceKind::ALL
            .iter()
            .map(|&k| (avg_usage[k] + 1.0) / (usage[k] + 1.0))
            .sum::<f64>();

    ResourceVector::from_fn(|kind| burst * kind.price() * sum_avg / (avg_usage[kind] + 1.0))
}

/// Closed-form limits for one pod
pub fn next_limits(
    usage: &ResourceVector,
    weight: &ResourceVector,
    available_token: f64,
    remaining_secs: f64,
    min_limit: f64,
) -> LimitPlan {
    let remaining = remaining_secs.max(MIN_REMAINING_SECS);

    let unconstrained = ResourceVector::from_fn(|kind| {
        usage[kind] + kind.price() * available_token / (2.0 * weight[kind])
    });
    let token_condition = available_token - remaining * unconstrained.priced_sum();

    let (raw, constrained) = if token_condition >= 0.0 {
        (unconstrained, false)
    } else {
        let up = available_token / remaining - usage.priced_sum();
        let below: f64 = ResourceKind::ALL
            .iter()
            .map(|&k| k.price() * k.price() / weight[k])
            .sum();
        let limits = ResourceVector::from_fn(|kind| {
            usage[kind] + kind.price() * up / (weight[kind] * below)
        });
        (limits, true)
    };

    LimitPlan {
        raw,
        limits: ResourceVector::from_fn(|kind| raw[kind].max(min_limit)),
        available_token,
        token_condition,
        constrained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_worked_example_takes_constrained_branch() {
        let usage = ResourceVector::new(40.0, 5.0);
        let weight = ResourceVector::new(10.0, 5.0);

        let plan = next_limits(&usage, &weight, 200.0, 1.0, 10.0);

        assert!((plan.token_condition - -45.0).abs() < EPS);
        assert!(plan.constrained);
        assert!((plan.raw[ResourceKind::Cpu] - (40.0 + 5.0 * 145.0 / 95.0)).abs() < EPS);
        assert!((plan.raw[ResourceKind::Gpu] - (5.0 + 30.0 * 145.0 / 95.0)).abs() < EPS);
        assert!((plan.limits[ResourceKind::Cpu] - 47.63).abs() < 0.01);
        assert!((plan.limits[ResourceKind::Gpu] - 50.79).abs() < 0.01);

        // Budget is spent exactly
        assert!((200.0 - plan.raw.priced_sum()).abs() < 1e-9);
    }

    #[test]
    fn test_slack_budget_keeps_unconstrained_optimum() {
        let usage = ResourceVector::new(10.0, 5.0);
        let weight = ResourceVector::new(100.0, 100.0);

        let plan = next_limits(&usage, &weight, 1000.0, 1.0, 10.0);

        assert!(!plan.constrained);
        assert!(plan.token_condition >= 0.0);
        assert!((plan.raw[ResourceKind::Cpu] - 15.0).abs() < EPS);
        assert!((plan.raw[ResourceKind::Gpu] - 20.0).abs() < EPS);
    }

    #[test]
    fn test_constrained_branch_exhausts_budget_for_any_inputs() {
        let cases = [
            (ResourceVector::new(80.0, 60.0), ResourceVector::new(3.0, 7.0), 150.0, 2.0),
            (ResourceVector::new(0.0, 0.0), ResourceVector::new(1.0, 1.0), 50.0, 1.0),
            (ResourceVector::new(250.0, 90.0), ResourceVector::new(40.0, 2.0), 900.0, 0.5),
        ];

        for (usage, weight, available, remaining) in cases {
            let plan = next_limits(&usage, &weight, available, remaining, 0.0);
            if plan.constrained {
                let condition = available - remaining * plan.raw.priced_sum();
                assert!(condition.abs() < 1e-6, "condition = {}", condition);
            }
        }
    }

    #[test]
    fn test_limits_are_floored() {
        // Budget far below current usage drives the raw limits negative
        let usage = ResourceVector::new(5.0, 2.0);
        let weight = ResourceVector::new(1.0, 1.0);

        let plan = next_limits(&usage, &weight, 0.0, 1.0, 10.0);
        assert!(plan.constrained);
        assert!(plan.raw[ResourceKind::Gpu] < 10.0);
        assert_eq!(plan.limits[ResourceKind::Cpu], 10.0);
        assert_eq!(plan.limits[ResourceKind::Gpu], 10.0);
    }

    #[test]
    fn test_token_queue_floor_and_direction() {
        let limits = ResourceVector::new(20.0, 10.0);
        // Spend 50/s, reserve 100/s: grows
        let grown = update_token_queue(0.0, 100.0, &limits, 1.0, QueueCap::Unbounded);
        assert!((grown - 50.0).abs() < EPS);

        // Spend 50/s, reserve 20/s: shrinks, floored at 0
        let shrunk = update_token_queue(10.0, 20.0, &limits, 1.0, QueueCap::Unbounded);
        assert_eq!(shrunk, 0.0);

        let partly = update_token_queue(100.0, 20.0, &limits, 1.0, QueueCap::Unbounded);
        assert!(partly < 100.0 && partly > 0.0);
    }

    #[test]
    fn test_token_queue_reservation_cap() {
        let limits = ResourceVector::new(10.0, 0.0);
        let queue = update_token_queue(500.0, 100.0, &limits, 2.0, QueueCap::Reservation);
        assert_eq!(queue, 100.0);
    }

    #[test]
    fn test_available_token_carry_over() {
        assert_eq!(available_token(100.0, 40.0, 2.0, 0.0), 200.0);
        assert_eq!(available_token(100.0, 40.0, 2.0, 0.5), 220.0);
    }

    #[test]
    fn test_static_weights() {
        let w = dynamic_weights(
            &ResourceVector::new(50.0, 5.0),
            &ResourceVector::new(40.0, 10.0),
            2.0,
        );
        assert_eq!(w, ResourceVector::new(2.0, 6.0));
    }

    #[test]
    fn test_dynamic_weights_are_positive() {
        let cases = [
            (ResourceVector::new(0.0, 0.0), ResourceVector::new(0.0, 0.0)),
            (ResourceVector::new(400.0, 0.0), ResourceVector::new(10.0, 90.0)),
            (ResourceVector::new(1000.0, 1000.0), ResourceVector::new(1000.0, 1000.0)),
        ];
        for (usage, avg) in cases {
            let w = dynamic_weights(&usage, &avg, 0.0);
            for (_, value) in w.iter() {
                assert!(value > 0.0 && value.is_finite());
            }
        }
    }

    #[test]
    fn test_dynamic_weights_idle_pod() {
        // sum_avg = 2, burst = 15 * 2 = 30
        let w = dynamic_weights(&ResourceVector::default(), &ResourceVector::default(), 0.0);
        assert!((w[ResourceKind::Cpu] - 60.0).abs() < EPS);
        assert!((w[ResourceKind::Gpu] - 180.0).abs() < EPS);
    }
}
