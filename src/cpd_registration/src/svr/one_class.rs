//! One-class SVM density support, solved by sequential minimal optimization.
//!
//! The dual problem
//!
//! ```text
//! min ½ αᵀKα   s.t.  0 ≤ α_i ≤ 1/(νn),  Σ α_i = 1
//! ```
//!
//! with the Gaussian kernel `K_ij = exp(−‖x_i − x_j‖² / (2h²))` selects a
//! sparse, weighted subset of the points (the support vectors) whose kernel
//! density summarizes the cloud. SMO repeatedly picks the maximal violating
//! pair, moves mass between the two coefficients in closed form, and keeps the
//! gradient `K·α` up to date with two kernel columns per step.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::{RegistrationError, Result};

/// Coefficients below this fraction of the upper bound are treated as zero.
const SUPPORT_THRESHOLD: f64 = 1e-8;

/// Smallest curvature used for a pair update.
const MIN_CURVATURE: f64 = 1e-12;

/// Support vectors of one point cloud.
#[derive(Debug, Clone, PartialEq)]
pub struct SupportVectors {
    /// Row indices into the cloud, ascending.
    pub indices: Vec<usize>,
    /// Weights, summing to one.
    pub weights: DVector<f64>,
    /// SMO iterations spent.
    pub iterations: usize,
    /// Final maximal KKT violation.
    pub gap: f64,
}

impl SupportVectors {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Rows of `points` that are support vectors.
    pub fn select(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(self.indices.len(), points.ncols(), |r, c| {
            points[(self.indices[r], c)]
        })
    }
}

/// One-class SVM with a Gaussian kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct OneClassSvm {
    /// Fraction bound ν ∈ (0, 1]: at least ν·n points become support vectors.
    pub nu: f64,
    /// Kernel width h.
    pub kernel_width: f64,
    /// Stop when the maximal violation falls below this.
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl Default for OneClassSvm {
    fn default() -> Self {
        Self {
            nu: 0.1,
            kernel_width: 0.1,
            tolerance: 1e-6,
            max_iterations: 100_000,
        }
    }
}

impl OneClassSvm {
    pub fn new(nu: f64, kernel_width: f64) -> Self {
        Self {
            nu,
            kernel_width,
            ..Default::default()
        }
    }

    fn kernel_column(&self, points: &DMatrix<f64>, j: usize) -> Vec<f64> {
        let inv = 1.0 / (2.0 * self.kernel_width * self.kernel_width);
        let dim = points.ncols();
        (0..points.nrows())
            .into_par_iter()
            .map(|i| {
                let mut sq = 0.0;
                for d in 0..dim {
                    let diff = points[(i, d)] - points[(j, d)];
                    sq += diff * diff;
                }
                (-sq * inv).exp()
            })
            .collect()
    }

    /// Solve the dual for `points` (n×D).
    pub fn fit(&self, points: &DMatrix<f64>) -> Result<SupportVectors> {
        let n = points.nrows();
        if n == 0 {
            return Err(RegistrationError::InvalidInput(
                "cannot fit support vectors to an empty cloud".into(),
            ));
        }
        if !(self.nu > 0.0 && self.nu <= 1.0) {
            return Err(RegistrationError::Configuration(format!(
                "nu must be in (0, 1], got {}",
                self.nu
            )));
        }
        if self.kernel_width <= 0.0 || !self.kernel_width.is_finite() {
            return Err(RegistrationError::Configuration(format!(
                "kernel width must be a positive number, got {}",
                self.kernel_width
            )));
        }

        let upper = 1.0 / (self.nu * n as f64);
        let mut alpha = initial_alpha(n, upper);

        // G = K·α, built from the columns of the initially nonzero coefficients.
        let mut gradient = vec![0.0; n];
        for (j, a) in alpha.iter().enumerate() {
            if *a > 0.0 {
                let column = self.kernel_column(points, j);
                for (g, k) in gradient.iter_mut().zip(&column) {
                    *g += a * k;
                }
            }
        }

        let mut iterations = 0;
        let mut gap = f64::INFINITY;
        while iterations < self.max_iterations {
            let Some((up, low)) = select_pair(&alpha, &gradient, upper) else {
                gap = 0.0;
                break;
            };
            gap = gradient[low] - gradient[up];
            if gap < self.tolerance {
                break;
            }

            let k_up = self.kernel_column(points, up);
            let k_low = self.kernel_column(points, low);
            let curvature = (k_up[up] + k_low[low] - 2.0 * k_up[low]).max(MIN_CURVATURE);
            let step = (gap / curvature)
                .min(upper - alpha[up])
                .min(alpha[low]);

            alpha[up] += step;
            alpha[low] -= step;
            for t in 0..n {
                gradient[t] += step * (k_up[t] - k_low[t]);
            }
            iterations += 1;
        }

        if iterations >= self.max_iterations && gap >= self.tolerance {
            warn!(
                "SMO stopped after {iterations} iterations with violation {gap:.3e} (tolerance {:.1e})",
                self.tolerance
            );
        }

        let threshold = SUPPORT_THRESHOLD * upper;
        let indices: Vec<usize> = (0..n).filter(|&i| alpha[i] > threshold).collect();
        let total: f64 = indices.iter().map(|&i| alpha[i]).sum();
        let weights = DVector::from_iterator(indices.len(), indices.iter().map(|&i| alpha[i] / total));
        debug!(
            "one-class SVM: {} of {n} points are support vectors ({iterations} SMO iterations)",
            indices.len()
        );

        Ok(SupportVectors {
            indices,
            weights,
            iterations,
            gap,
        })
    }
}

/// Feasible start: fill coefficients up to the bound until the mass is one.
fn initial_alpha(n: usize, upper: f64) -> Vec<f64> {
    let mut alpha = vec![0.0; n];
    let mut remaining = 1.0;
    for a in alpha.iter_mut() {
        if remaining <= 0.0 {
            break;
        }
        *a = upper.min(remaining);
        remaining -= *a;
    }
    alpha
}

/// Maximal violating pair: `up` can grow and has the smallest gradient,
/// `low` can shrink and has the largest.
fn select_pair(alpha: &[f64], gradient: &[f64], upper: f64) -> Option<(usize, usize)> {
    let mut up = None;
    let mut low = None;
    let mut min_g = f64::INFINITY;
    let mut max_g = f64::NEG_INFINITY;
    for (t, (&a, &g)) in alpha.iter().zip(gradient).enumerate() {
        if a < upper && g < min_g {
            min_g = g;
            up = Some(t);
        }
        if a > 0.0 && g > max_g {
            max_g = g;
            low = Some(t);
        }
    }
    match (up, low) {
        (Some(u), Some(l)) if u != l => Some((u, l)),
        _ => None,
    }
}
