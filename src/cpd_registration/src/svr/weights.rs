//! Kernel correlation weights between two support vector mixtures.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::correspondence::{
    CorrespondenceMatrix, CorrespondenceStats, Expectation, WeightEstimator,
};
use crate::error::Instability;

/// Weights `q_ij ∝ a_i·b_j·exp(−‖t_i − y_j‖² / (2σ²))` between weighted
/// source and target support vectors.
///
/// The total weight equals the number of source support vectors. The objective
/// is `ln J` with `J = Σ_ij a_i b_j exp(…)`, and σ² follows an annealing
/// schedule instead of the M-step estimate.
#[derive(Debug, Clone)]
pub struct SupportVectorWeights {
    source_weights: DVector<f64>,
    target_weights: DVector<f64>,
    floor_sigma2: f64,
    annealing_rate: Option<f64>,
}

impl SupportVectorWeights {
    /// `kernel_width` is h; the schedule ends at σ² = 2h².
    pub fn new(
        source_weights: DVector<f64>,
        target_weights: DVector<f64>,
        kernel_width: f64,
        annealing_rate: Option<f64>,
    ) -> Self {
        Self {
            source_weights,
            target_weights,
            floor_sigma2: 2.0 * kernel_width * kernel_width,
            annealing_rate,
        }
    }

    /// Final kernel variance 2h².
    pub fn floor_sigma2(&self) -> f64 {
        self.floor_sigma2
    }

    /// Starting σ² for a run whose data-driven estimate is `estimate`.
    pub fn starting_sigma2(&self, estimate: f64) -> f64 {
        match self.annealing_rate {
            Some(_) => estimate.max(self.floor_sigma2),
            None => self.floor_sigma2,
        }
    }
}

struct Column {
    /// `ln Σ_i a_i b_j exp(…)` for this target.
    log_mass: f64,
    /// Unnormalized `exp(log q_ij − shift)` for every source.
    weights: Vec<f64>,
    shift: f64,
}

impl WeightEstimator for SupportVectorWeights {
    fn estimate(
        &self,
        transformed: &DMatrix<f64>,
        target: &DMatrix<f64>,
        sigma2: f64,
        with_matrix: bool,
    ) -> Result<Expectation, Instability> {
        if sigma2 <= 0.0 || !sigma2.is_finite() {
            return Err(Instability::new(
                format!("kernel variance must be positive, got {sigma2:.3e}"),
                sigma2.abs(),
            ));
        }
        let n = transformed.nrows();
        let m = target.nrows();
        let dim = transformed.ncols();
        let inv = 1.0 / (2.0 * sigma2);

        let columns: Vec<Column> = (0..m)
            .into_par_iter()
            .map(|j| {
                let ln_b = self.target_weights[j].ln();
                let logs: Vec<f64> = (0..n)
                    .map(|i| {
                        let mut sq = 0.0;
                        for d in 0..dim {
                            let diff = transformed[(i, d)] - target[(j, d)];
                            sq += diff * diff;
                        }
                        self.source_weights[i].ln() + ln_b - sq * inv
                    })
                    .collect();
                let shift = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let weights: Vec<f64> = logs.iter().map(|l| (l - shift).exp()).collect();
                let log_mass = shift + weights.iter().sum::<f64>().ln();
                Column {
                    log_mass,
                    weights,
                    shift,
                }
            })
            .collect();

        let peak = columns
            .iter()
            .map(|c| c.log_mass)
            .fold(f64::NEG_INFINITY, f64::max);
        let log_total = peak
            + columns
                .iter()
                .map(|c| (c.log_mass - peak).exp())
                .sum::<f64>()
                .ln();
        if !log_total.is_finite() {
            return Err(Instability::new(
                format!("kernel correlation vanished at sigma2 = {sigma2:.3e}"),
                log_total.abs(),
            ));
        }

        let mass = n as f64;
        let mut weights = DMatrix::zeros(n, m);
        for (j, column) in columns.iter().enumerate() {
            let scale = mass * (column.shift - log_total).exp();
            for (i, w) in column.weights.iter().enumerate() {
                weights[(i, j)] = w * scale;
            }
        }

        let stats = CorrespondenceStats::from_weights(&weights, target);
        Ok(Expectation {
            stats,
            log_likelihood: log_total,
            matrix: with_matrix.then_some(CorrespondenceMatrix::Dense(weights)),
        })
    }

    fn next_sigma2(&self, _estimated: f64, current: f64) -> f64 {
        match self.annealing_rate {
            Some(rate) => (current * rate).max(self.floor_sigma2),
            None => self.floor_sigma2,
        }
    }

    fn allows_convergence(&self, sigma2: f64) -> bool {
        sigma2 <= self.floor_sigma2 * (1.0 + 1e-9)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn uniform(n: usize) -> DVector<f64> {
        DVector::from_element(n, 1.0 / n as f64)
    }

    #[test]
    fn test_total_mass_and_objective() {
        let source = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
        let target = DMatrix::from_row_slice(2, 2, &[0.1, 0.0, 1.0, 1.0]);
        let estimator = SupportVectorWeights::new(uniform(3), uniform(2), 0.5, Some(0.5));
        let sigma2 = 0.3;
        let e = estimator.estimate(&source, &target, sigma2, true).unwrap();

        assert_relative_eq!(e.stats.n_p, 3.0, epsilon = 1e-12);

        let mut j_raw = 0.0;
        for i in 0..3 {
            for j in 0..2 {
                let d = (source.row(i) - target.row(j)).norm_squared();
                j_raw += (1.0 / 3.0) * 0.5 * (-d / (2.0 * sigma2)).exp();
            }
        }
        assert_relative_eq!(e.log_likelihood, j_raw.ln(), epsilon = 1e-12);

        let matrix = e.matrix.unwrap();
        assert!(matrix.get(0, 0) > matrix.get(2, 0));
    }

    #[test]
    fn test_annealing_schedule() {
        let estimator = SupportVectorWeights::new(uniform(1), uniform(1), 0.5, Some(0.5));
        assert_relative_eq!(estimator.floor_sigma2(), 0.5);
        assert_relative_eq!(estimator.starting_sigma2(4.0), 4.0);
        assert_relative_eq!(estimator.starting_sigma2(0.1), 0.5);

        let mut sigma2 = estimator.starting_sigma2(4.0);
        let mut steps = 0;
        while !estimator.allows_convergence(sigma2) {
            sigma2 = estimator.next_sigma2(123.0, sigma2);
            steps += 1;
        }
        assert_eq!(steps, 3);
        assert_relative_eq!(sigma2, 0.5);

        let fixed = SupportVectorWeights::new(uniform(1), uniform(1), 0.5, None);
        assert_relative_eq!(fixed.starting_sigma2(4.0), 0.5);
        assert!(fixed.allows_convergence(fixed.next_sigma2(9.0, 0.5)));
    }

    #[test]
    fn test_far_apart_clouds_stay_finite() {
        let source = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        let target = DMatrix::from_row_slice(1, 2, &[1e3, 0.0]);
        let estimator = SupportVectorWeights::new(uniform(1), uniform(1), 0.1, None);
        let e = estimator.estimate(&source, &target, 0.02, false).unwrap();
        assert!(e.log_likelihood.is_finite());
        assert_relative_eq!(e.stats.n_p, 1.0, epsilon = 1e-12);
    }
}
