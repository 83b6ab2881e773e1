//! Dense linear solver for the joint allocation fallback
//!
//! Gauss-Jordan style elimination with scaled partial pivoting over an
//! `n x (n+1)` augmented matrix, followed by back-substitution. Columns
//! whose pivot is zero are skipped and resolved during back-substitution:
//! a zero diagonal with a zero residual leaves that unknown at 0, a zero
//! diagonal with a non-zero residual means the system is inconsistent.

use thiserror::Error;
use tracing::debug;

/// Magnitude below which a pivot is treated as zero
const PIVOT_EPSILON: f64 = 1e-12;

/// Magnitude above which a residual on a singular row means "inconsistent"
const RESIDUAL_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum SolverError {
    #[error("row {row} has {actual} columns, expected {expected}")]
    DimensionMismatch {
        row: usize,
        expected: usize,
        actual: usize,
    },
    #[error("linear system has no solution (inconsistent row {row})")]
    NoSolution { row: usize },
}

/// Square system `A x = b` stored as rows of `[A | b]`
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedMatrix {
    size: usize,
    rows: Vec<Vec<f64>>,
}

impl AugmentedMatrix {
    /// Zero-filled system with `size` unknowns
    pub fn zeros(size: usize) -> Self {
        Self {
            size,
            rows: vec![vec![0.0; size + 1]; size],
        }
    }

    /// Build from explicit rows, each of length `rows.len() + 1`
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, SolverError> {
        let size = rows.len();
        for (row, values) in rows.iter().enumerate() {
            if values.len() != size + 1 {
                return Err(SolverError::DimensionMismatch {
                    row,
                    expected: size + 1,
                    actual: values.len(),
                });
            }
        }
        Ok(Self { size, rows })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.rows[row][col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.rows[row][col] = value;
    }

    pub fn rhs(&self, row: usize) -> f64 {
        self.rows[row][self.size]
    }

    pub fn set_rhs(&mut self, row: usize, value: f64) {
        self.rows[row][self.size] = value;
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Solve the system. The input is left untouched.
    pub fn solve(&self) -> Result<Vec<f64>, SolverError> {
        gauss_jordan(self)
    }
}

/// Solve `[A | b]`, returning `x` with `A x = b`
pub fn gauss_jordan(system: &AugmentedMatrix) -> Result<Vec<f64>, SolverError> {
    let n = system.size;
    let rhs_col = n;
    let mut m = system.rows.clone();

    for k in 0..n {
        let pivot_row = select_pivot(&m, k, n);

        if m[pivot_row][k].abs() <= PIVOT_EPSILON {
            // Singular direction, settled during back-substitution
            continue;
        }

        m.swap(k, pivot_row);

        for i in (k + 1)..n {
            let factor = m[i][k] / m[k][k];
            if factor == 0.0 {
                continue;
            }
            for j in (k + 1)..=rhs_col {
                m[i][j] -= factor * m[k][j];
            }
            m[i][k] = 0.0;
        }
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut residual = m[i][rhs_col];
        for j in (i + 1)..n {
            residual -= m[i][j] * x[j];
        }

        if m[i][i].abs() <= PIVOT_EPSILON {
            if residual.abs() > RESIDUAL_EPSILON {
                debug!(row = i, residual = residual, "Inconsistent row in linear system");
                return Err(SolverError::NoSolution { row: i });
            }
            x[i] = 0.0;
            continue;
        }

        x[i] = residual / m[i][i];
    }

    Ok(x)
}

/// Row `i >= k` maximising `|a[i][k]| / max_{j>=k} |a[i][j]|`
fn select_pivot(m: &[Vec<f64>], k: usize, n: usize) -> usize {
    let mut best_row = k;
    let mut best_ratio = -1.0;

    for (i, row) in m.iter().enumerate().take(n).skip(k) {
        let scale = row[k..n].iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if scale == 0.0 {
            continue;
        }
        let ratio = row[k].abs() / scale;
        if ratio > best_ratio {
            best_ratio = ratio;
            best_row = i;
        }
    }

    best_row
}
