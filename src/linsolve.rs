//! Dense simultaneous-equation solver used by every least-squares fit.
//!
//! The system is given as an N x (N+1) augmented matrix: row `i` holds the
//! coefficients of equation `i` followed by its constant term, i.e.
//! `row[0] * x0 + ... + row[N-1] * x(N-1) = row[N]`.

use ndarray::{Array1, Array2, ArrayView2};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinSolveError {
    #[error("augmented matrix must be N x (N+1), got {rows} x {cols}")]
    DimensionMismatch { rows: usize, cols: usize },
}

/// Result of solving an augmented system.
#[derive(Debug, Clone)]
pub struct LinearSolution {
    /// One value per unknown.
    pub values: Array1<f64>,
    /// Unknowns whose pivot column was all zero. Their values are 0.0 and
    /// carry no information; the rest of the solution is consistent with them.
    pub free_variables: Vec<usize>,
}

impl LinearSolution {
    pub fn is_determined(&self) -> bool {
        self.free_variables.is_empty()
    }
}

/// Solve an augmented system by Gaussian elimination with partial pivoting.
///
/// A structurally singular system does not fail: an unknown with no usable
/// pivot is treated as free, pinned to zero and reported in
/// [`LinearSolution::free_variables`]. Callers that need a unique answer
/// must supply enough independent equations themselves.
pub fn solve(augmented: ArrayView2<'_, f64>) -> Result<LinearSolution, LinSolveError> {
    let (rows, cols) = augmented.dim();
    if cols != rows + 1 {
        return Err(LinSolveError::DimensionMismatch { rows, cols });
    }
    let n = rows;
    let mut a: Array2<f64> = augmented.to_owned();

    let scale = a.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let tiny = scale * 1e-13;

    // pivot_of[col] = row holding that column's pivot after elimination.
    let mut pivot_of: Vec<Option<usize>> = vec![None; n];
    let mut next_row = 0;

    for col in 0..n {
        if next_row == n {
            break;
        }

        let mut best = next_row;
        let mut best_abs = a[[next_row, col]].abs();
        for row in (next_row + 1)..n {
            let v = a[[row, col]].abs();
            if v > best_abs {
                best_abs = v;
                best = row;
            }
        }

        if best_abs <= tiny {
            trace!(col, "no usable pivot, treating unknown as free");
            continue;
        }

        if best != next_row {
            for j in 0..=n {
                a.swap([best, j], [next_row, j]);
            }
        }

        let pivot = a[[next_row, col]];
        for j in col..=n {
            a[[next_row, j]] /= pivot;
        }

        for row in (next_row + 1)..n {
            let factor = a[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for j in col..=n {
                a[[row, j]] -= factor * a[[next_row, j]];
            }
        }

        pivot_of[col] = Some(next_row);
        next_row += 1;
    }

    let mut values = Array1::<f64>::zeros(n);
    let mut free_variables = Vec::new();
    for col in (0..n).rev() {
        match pivot_of[col] {
            Some(row) => {
                let mut sum = a[[row, n]];
                for j in (col + 1)..n {
                    sum -= a[[row, j]] * values[j];
                }
                values[col] = sum;
            }
            None => free_variables.push(col),
        }
    }
    free_variables.reverse();

    Ok(LinearSolution {
        values,
        free_variables,
    })
}

/// Accumulates least-squares normal equations for `y ~ c . basis`.
///
/// Each observation contributes `basis * basis^T` to the left-hand side and
/// `basis * y` to the right; [`NormalEquations::solve`] hands the resulting
/// augmented matrix to [`solve`].
#[derive(Debug, Clone)]
pub struct NormalEquations {
    augmented: Array2<f64>,
}

impl NormalEquations {
    pub fn new(unknowns: usize) -> Self {
        Self {
            augmented: Array2::zeros((unknowns, unknowns + 1)),
        }
    }

    pub fn add(&mut self, basis: &[f64], y: f64) {
        let n = self.augmented.nrows();
        debug_assert_eq!(basis.len(), n);
        for i in 0..n {
            for j in 0..n {
                self.augmented[[i, j]] += basis[i] * basis[j];
            }
            self.augmented[[i, n]] += basis[i] * y;
        }
    }

    pub fn solve(&self) -> Result<LinearSolution, LinSolveError> {
        solve(self.augmented.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!(
            (a - b).abs() < tol,
            "expected {a} ~= {b} (diff = {})",
            (a - b).abs()
        );
    }

    #[test]
    fn identity_system() {
        let m = array![[1.0, 0.0, 3.0], [0.0, 1.0, 7.0]];
        let sol = solve(m.view()).unwrap();
        assert!(sol.is_determined());
        assert_close(sol.values[0], 3.0, 1e-12);
        assert_close(sol.values[1], 7.0, 1e-12);
    }

    #[test]
    fn two_by_two() {
        // 2x + y = 5, x + 3y = 7 => x = 8/5, y = 9/5
        let m = array![[2.0, 1.0, 5.0], [1.0, 3.0, 7.0]];
        let sol = solve(m.view()).unwrap();
        assert_close(sol.values[0], 8.0 / 5.0, 1e-12);
        assert_close(sol.values[1], 9.0 / 5.0, 1e-12);
    }

    #[test]
    fn needs_row_swap() {
        // Leading zero in the first row forces a pivot swap.
        let m = array![
            [0.0, 2.0, 1.0, 7.0],
            [1.0, 1.0, 1.0, 6.0],
            [2.0, 1.0, 3.0, 13.0]
        ];
        let sol = solve(m.view()).unwrap();
        assert!(sol.is_determined());
        assert_close(sol.values[0], 1.0, 1e-10);
        assert_close(sol.values[1], 2.0, 1e-10);
        assert_close(sol.values[2], 3.0, 1e-10);
    }

    #[test]
    fn singular_system_does_not_fail() {
        let m = array![[1.0, 2.0, 3.0], [2.0, 4.0, 6.0]];
        let sol = solve(m.view()).unwrap();
        assert_eq!(sol.free_variables, vec![1]);
        assert!(sol.values.iter().all(|v| v.is_finite()));
        // The determined unknown is still consistent with the free one.
        assert_close(sol.values[0] + 2.0 * sol.values[1], 3.0, 1e-12);
    }

    #[test]
    fn all_zero_column() {
        let m = array![[0.0, 1.0, 4.0], [0.0, 2.0, 8.0]];
        let sol = solve(m.view()).unwrap();
        assert_eq!(sol.free_variables, vec![0]);
        assert_close(sol.values[1], 4.0, 1e-12);
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let m = Array2::<f64>::zeros((3, 3));
        assert_eq!(
            solve(m.view()).unwrap_err(),
            LinSolveError::DimensionMismatch { rows: 3, cols: 3 }
        );
    }

    #[test]
    fn empty_system() {
        let m = Array2::<f64>::zeros((0, 1));
        let sol = solve(m.view()).unwrap();
        assert_eq!(sol.values.len(), 0);
    }

    #[test]
    fn normal_equations_fit_a_line() {
        // y = 2x + 1 sampled exactly.
        let mut ne = NormalEquations::new(2);
        for x in [0.0, 1.0, 2.0, 5.0] {
            ne.add(&[x, 1.0], 2.0 * x + 1.0);
        }
        let sol = ne.solve().unwrap();
        assert_close(sol.values[0], 2.0, 1e-10);
        assert_close(sol.values[1], 1.0, 1e-10);
    }
}
