//! Node-wide joint allocation
//!
//! When per-pod limits overflow a node capacity, every pod's limits are
//! re-solved together as one inequality-constrained quadratic program:
//!
//! - minimise `sum w (L - u)^2 - sum_p A_p sum_k p_k L[p][k]`
//! - pod budget `sum_k p_k L[p][k] <= B_p`
//! - capacity ceiling `sum_p L[p][k] <= C_k`
//! - floor `L[p][k] >= min_limit`
//!
//! The search starts with every limit on its floor, which is feasible
//! whenever the floors fit under the capacities. Each pass solves the KKT
//! system of the working set through the linear solver, with one row per
//! `(p, k)` of the form `2 w L + sum_i a_i lambda_i = 2 w u + p_k A_p`, and
//! walks towards that solution until the first constraint outside the
//! working set blocks it. A pass that cannot move drops the working
//! constraint with the most negative multiplier, or stops when none is
//! negative. Every limit stays feasible along the way.

use super::AllocationConfig;
use crate::models::{ResourceKind, ResourceVector};
use crate::solver::{AugmentedMatrix, SolverError};
use thiserror::Error;
use tracing::debug;

const KINDS: usize = ResourceKind::ALL.len();

/// Multipliers above `-MULTIPLIER_TOLERANCE` count as non-negative
const MULTIPLIER_TOLERANCE: f64 = 1e-6;

/// Relative step below which a pass counts as stationary
const STEP_EPSILON: f64 = 1e-9;

/// Slack tolerated on the final capacity check
const CAPACITY_EPSILON: f64 = 1e-3;

#[derive(Debug, Error, PartialEq)]
pub enum JointError {
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error("{kind} limits sum to {total:.3}, above capacity {capacity:.3}")]
    CapacityExceeded {
        kind: ResourceKind,
        total: f64,
        capacity: f64,
    },
    #[error("active set did not settle after {passes} passes")]
    NotConverged { passes: usize },
}

/// One pod's inputs to the joint solve
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JointPod {
    pub usage: ResourceVector,
    pub weight: ResourceVector,
    /// Tokens available for the period
    pub available_token: f64,
    /// Tokens per second the pod may spend
    pub budget_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JointSolution {
    /// Floored limits, in the order the pods were given
    pub limits: Vec<ResourceVector>,
    pub passes: usize,
    pub active_budgets: usize,
    pub active_ceilings: Vec<ResourceKind>,
    pub floor_pins: usize,
}

/// Kinds whose summed limits exceed the node capacity
pub fn violated_ceilings<'a>(
    limits: impl IntoIterator<Item = &'a ResourceVector>,
    config: &AllocationConfig,
) -> Vec<ResourceKind> {
    let mut totals = ResourceVector::default();
    for vector in limits {
        for (kind, value) in vector.iter() {
            totals.set(kind, totals[kind] + value);
        }
    }

    ResourceKind::ALL
        .iter()
        .copied()
        .filter(|&kind| totals[kind] > config.capacity(kind))
        .collect()
}

fn var(pod: usize, kind: ResourceKind) -> usize {
    pod * KINDS + kind.index()
}

/// Spend of a pod sitting on every floor
fn floor_cost(config: &AllocationConfig) -> f64 {
    ResourceKind::ALL
        .iter()
        .map(|k| k.price() * config.min_limit)
        .sum()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Constraint {
    Budget(usize),
    Ceiling(ResourceKind),
    Floor(usize, ResourceKind),
}

impl Constraint {
    /// Every constraint of an `n`-pod problem
    fn all(n: usize) -> Vec<Constraint> {
        let budgets = (0..n).map(Constraint::Budget);
        let ceilings = ResourceKind::ALL.iter().map(|&k| Constraint::Ceiling(k));
        let floors =
            (0..n).flat_map(|p| ResourceKind::ALL.iter().map(move |&k| Constraint::Floor(p, k)));
        budgets.chain(ceilings).chain(floors).collect()
    }

    /// Coefficients and bound in `a . x <= b` form
    ///
    /// A budget below the floor cost is raised to it; the floors win.
    fn row(self, pods: &[JointPod], config: &AllocationConfig) -> (Vec<(usize, f64)>, f64) {
        match self {
            Constraint::Budget(p) => (
                ResourceKind::ALL
                    .iter()
                    .map(|&k| (var(p, k), k.price()))
                    .collect(),
                pods[p].budget_rate.max(floor_cost(config)),
            ),
            Constraint::Ceiling(kind) => (
                (0..pods.len()).map(|p| (var(p, kind), 1.0)).collect(),
                config.capacity(kind),
            ),
            Constraint::Floor(p, kind) => (vec![(var(p, kind), -1.0)], -config.min_limit),
        }
    }
}

fn build_system(
    pods: &[JointPod],
    working: &[Constraint],
    config: &AllocationConfig,
) -> AugmentedMatrix {
    let vars = pods.len() * KINDS;
    let mut system = AugmentedMatrix::zeros(vars + working.len());

    for (p, pod) in pods.iter().enumerate() {
        for &kind in &ResourceKind::ALL {
            let v = var(p, kind);
            let w = pod.weight[kind];
            system.set(v, v, 2.0 * w);
            system.set_rhs(v, 2.0 * w * pod.usage[kind] + kind.price() * pod.available_token);
        }
    }

    for (offset, &constraint) in working.iter().enumerate() {
        let row = vars + offset;
        let (coefficients, bound) = constraint.row(pods, config);
        for (v, coefficient) in coefficients {
            system.set(row, v, coefficient);
            system.set(v, row, coefficient);
        }
        system.set_rhs(row, bound);
    }

    system
}

/// Re-solve all pods together under the node capacities
///
/// Fails only when the floors alone overflow a capacity or the solver
/// breaks down; the caller should then keep every pod's previous limits.
pub fn solve_joint(
    pods: &[JointPod],
    config: &AllocationConfig,
) -> Result<JointSolution, JointError> {
    let vars = pods.len() * KINDS;
    let constraints = Constraint::all(pods.len());
    let max_passes = 4 * (constraints.len() + vars) + 4;

    for &kind in &ResourceKind::ALL {
        let total = pods.len() as f64 * config.min_limit;
        let capacity = config.capacity(kind);
        if total > capacity + CAPACITY_EPSILON {
            return Err(JointError::CapacityExceeded {
                kind,
                total,
                capacity,
            });
        }
    }

    let mut x = vec![config.min_limit; vars];
    let mut working: Vec<Constraint> = Vec::new();

    for pass in 1..=max_passes {
        let target = build_system(pods, &working, config).solve()?;
        let step: Vec<f64> = (0..vars).map(|v| target[v] - x[v]).collect();
        let scale = 1.0 + x.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));

        if step.iter().all(|s| s.abs() <= STEP_EPSILON * scale) {
            let release = working
                .iter()
                .enumerate()
                .map(|(offset, _)| (offset, target[vars + offset]))
                .filter(|&(_, multiplier)| multiplier < -MULTIPLIER_TOLERANCE)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            match release {
                Some((offset, multiplier)) => {
                    let released = working.remove(offset);
                    debug!(
                        pass = pass,
                        constraint = ?released,
                        multiplier = multiplier,
                        "Releasing slack constraint"
                    );
                    continue;
                }
                None => return finish(pods, &x, &working, pass, config),
            }
        }

        let mut alpha = 1.0;
        let mut blocking = None;
        for &constraint in &constraints {
            if working.contains(&constraint) {
                continue;
            }
            let (coefficients, bound) = constraint.row(pods, config);
            let along: f64 = coefficients.iter().map(|&(v, a)| a * step[v]).sum();
            if along <= STEP_EPSILON * scale {
                continue;
            }
            let at: f64 = coefficients.iter().map(|&(v, a)| a * x[v]).sum();
            let ratio = ((bound - at) / along).max(0.0);
            if ratio < alpha {
                alpha = ratio;
                blocking = Some(constraint);
            }
        }

        for (value, delta) in x.iter_mut().zip(&step) {
            *value += alpha * delta;
        }
        if let Some(constraint) = blocking {
            debug!(pass = pass, constraint = ?constraint, step = alpha, "Constraint blocks step");
            working.push(constraint);
        }
    }

    Err(JointError::NotConverged { passes: max_passes })
}

fn finish(
    pods: &[JointPod],
    x: &[f64],
    working: &[Constraint],
    passes: usize,
    config: &AllocationConfig,
) -> Result<JointSolution, JointError> {
    let limits: Vec<ResourceVector> = (0..pods.len())
        .map(|p| ResourceVector::from_fn(|kind| x[var(p, kind)].max(config.min_limit)))
        .collect();

    for &kind in &ResourceKind::ALL {
        let total: f64 = limits.iter().map(|l| l[kind]).sum();
        let capacity = config.capacity(kind);
        if total > capacity + CAPACITY_EPSILON {
            return Err(JointError::CapacityExceeded {
                kind,
                total,
                capacity,
            });
        }
    }

    Ok(JointSolution {
        limits,
        passes,
        active_budgets: working
            .iter()
            .filter(|c| matches!(c, Constraint::Budget(_)))
            .count(),
        active_ceilings: ResourceKind::ALL
            .iter()
            .copied()
            .filter(|&k| working.contains(&Constraint::Ceiling(k)))
            .collect(),
        floor_pins: working
            .iter()
            .filter(|c| matches!(c, Constraint::Floor(..)))
            .count(),
    })
}
