//! Dense linear solves for the M-step.
//!
//! Solves `A·X = B` with Cholesky when A is symmetric positive definite and
//! falls back to LU otherwise. Every solution is checked against the relative
//! residual `‖A·X − B‖ / ‖B‖` before it is returned.

use nalgebra::DMatrix;
use tracing::warn;

use super::types::{CONDITION_WARNING_THRESHOLD, LINEAR_RESIDUAL_TOLERANCE};
use crate::error::Instability;

/// Largest system for which the condition number is computed on failure.
const CONDITION_DIAGNOSTIC_LIMIT: usize = 512;

/// Solve `matrix · X = rhs`.
///
/// # Returns
/// The solution, or an [`Instability`] carrying the residual norm when the
/// system is singular or the solution does not reproduce `rhs`.
pub fn solve_linear(matrix: &DMatrix<f64>, rhs: &DMatrix<f64>) -> Result<DMatrix<f64>, Instability> {
    if !matrix.is_square() || matrix.nrows() != rhs.nrows() {
        return Err(Instability::new(
            format!(
                "linear system shape mismatch: {}x{} matrix, {} right-hand rows",
                matrix.nrows(),
                matrix.ncols(),
                rhs.nrows()
            ),
            f64::NAN,
        ));
    }

    let solution = if is_symmetric(matrix) {
        match matrix.clone().cholesky() {
            Some(chol) => Some(chol.solve(rhs)),
            None => matrix.clone().lu().solve(rhs),
        }
    } else {
        matrix.clone().lu().solve(rhs)
    };

    let Some(solution) = solution else {
        return Err(singular(matrix, "linear system is singular", f64::INFINITY));
    };

    let rhs_norm = rhs.norm().max(f64::MIN_POSITIVE);
    let residual = (matrix * &solution - rhs).norm();
    let relative = residual / rhs_norm;
    if !relative.is_finite() || solution.iter().any(|v| !v.is_finite()) {
        return Err(singular(matrix, "linear solve produced non-finite values", residual));
    }
    if relative > LINEAR_RESIDUAL_TOLERANCE && residual > f64::EPSILON {
        return Err(singular(
            matrix,
            &format!("linear solve residual {relative:.3e} exceeds tolerance"),
            residual,
        ));
    }
    Ok(solution)
}

/// Ratio of the largest to the smallest singular value.
///
/// Returns `f64::INFINITY` when the smallest singular value vanishes.
pub fn condition_number(matrix: &DMatrix<f64>) -> f64 {
    let singular_values = matrix.singular_values();
    if singular_values.is_empty() {
        return f64::INFINITY;
    }
    let max_sv = singular_values.max();
    let min_sv = singular_values.min();
    if min_sv < 1e-15 {
        f64::INFINITY
    } else {
        max_sv / min_sv
    }
}

/// Log when a (small) system is ill-conditioned; returns the condition number.
pub fn check_conditioning(matrix: &DMatrix<f64>, context: &str) -> f64 {
    let cond = condition_number(matrix);
    if cond > CONDITION_WARNING_THRESHOLD {
        warn!("{context}: ill-conditioned system (condition number {cond:.3e})");
    }
    cond
}

fn is_symmetric(matrix: &DMatrix<f64>) -> bool {
    let n = matrix.nrows();
    let scale = matrix.amax().max(1.0);
    for i in 0..n {
        for j in (i + 1)..n {
            if (matrix[(i, j)] - matrix[(j, i)]).abs() > 1e-12 * scale {
                return false;
            }
        }
    }
    true
}

fn singular(matrix: &DMatrix<f64>, reason: &str, residual: f64) -> Instability {
    if matrix.nrows() <= CONDITION_DIAGNOSTIC_LIMIT {
        let cond = condition_number(matrix);
        Instability::new(format!("{reason} (condition number {cond:.3e})"), residual)
    } else {
        Instability::new(reason, residual)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_solve_identity() {
        let a = DMatrix::<f64>::identity(3, 3);
        let b = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let x = solve_linear(&a, &b).unwrap();
        assert_relative_eq!(x, b, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_symmetric_positive_definite() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 2.0]);
        let x = solve_linear(&a, &b).unwrap();
        assert_relative_eq!(&a * &x, b, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_non_symmetric_uses_lu() {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 1.0, 0.0, 0.5, 3.0, 1.0, 0.0, 2.0, 4.0]);
        let b = DMatrix::from_row_slice(3, 1, &[1.0, 0.0, -1.0]);
        let x = solve_linear(&a, &b).unwrap();
        assert_relative_eq!(&a * &x, b, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_system_rejected() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let err = solve_linear(&a, &b).unwrap_err();
        assert!(err.reason.contains("condition number"));
    }

    #[test]
    fn test_condition_number() {
        let a = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![10.0, 1.0, 0.1]));
        assert_relative_eq!(condition_number(&a), 100.0, epsilon = 1e-9);

        let singular = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(condition_number(&singular).is_infinite());
    }
}
