//! Gaussian mixture posterior (CPD E-step).
//!
//! For target y_j and transformed source t_i:
//!
//! ```text
//! g_ij   = exp(−‖y_j − t_i‖² / (2σ²))
//! c      = (2πσ²)^{D/2} · w/(1−w) · N/M
//! P(i,j) = g_ij / (Σ_k g_kj + c)
//! L      = Σ_j ln((1−w)/N · (2πσ²)^{−D/2} · Σ_i g_ij + w/M)
//! ```
//!
//! Each column is evaluated in the log domain, shifted by its smallest
//! squared distance, so the denominator never underflows however small σ²
//! gets. Targets are processed in batches; the columns of a batch are
//! computed in parallel and folded into the statistics in target order.

use std::f64::consts::PI;

use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::warn;

use super::matrix::{CorrespondenceMatrix, SparseCorrespondence};
use super::search::NeighborIndex;
use super::{CorrespondenceConfig, CorrespondenceStats, Expectation, WeightEstimator};
use crate::error::Instability;

/// Posterior column for one target point.
#[derive(Debug, Clone)]
struct Column {
    /// Source indices of `values`; `None` means every source point in order.
    rows: Option<Vec<usize>>,
    values: Vec<f64>,
    /// This target's log-likelihood term.
    log_term: f64,
}

/// Per-run constants of the mixture.
#[derive(Debug, Clone, Copy)]
struct MixtureTerms {
    /// 1 / (2σ²).
    inv_two_sigma2: f64,
    /// ln c, or −∞ without outliers.
    ln_outlier: f64,
    /// ln((1−w)/N · (2πσ²)^{−D/2}).
    ln_component: f64,
}

impl MixtureTerms {
    fn new(sigma2: f64, outlier_ratio: f64, n: usize, m: usize, dim: usize) -> Self {
        let half_dim = dim as f64 / 2.0;
        let ln_norm = half_dim * (2.0 * PI * sigma2).ln();
        let ln_outlier = if outlier_ratio > 0.0 {
            ln_norm + (outlier_ratio / (1.0 - outlier_ratio)).ln() + (n as f64 / m as f64).ln()
        } else {
            f64::NEG_INFINITY
        };
        Self {
            inv_two_sigma2: 1.0 / (2.0 * sigma2),
            ln_outlier,
            ln_component: ((1.0 - outlier_ratio) / n as f64).ln() - ln_norm,
        }
    }

    /// Posterior weights and log term from the squared distances of one column.
    fn column(&self, sq_dists: &[f64]) -> (Vec<f64>, f64) {
        let min_sq = sq_dists.iter().copied().fold(f64::INFINITY, f64::min);
        if !min_sq.is_finite() {
            // No candidate components: all mass goes to the outlier term.
            return (vec![0.0; sq_dists.len()], self.ln_component + self.ln_outlier);
        }
        let shift = -min_sq * self.inv_two_sigma2;
        let mut values: Vec<f64> = sq_dists
            .iter()
            .map(|d| (-d * self.inv_two_sigma2 - shift).exp())
            .collect();
        let ln_gauss = shift + values.iter().sum::<f64>().ln();
        let ln_denom = log_add_exp(ln_gauss, self.ln_outlier);
        let scale = (shift - ln_denom).exp();
        for v in values.iter_mut() {
            *v *= scale;
        }
        (values, self.ln_component + ln_denom)
    }
}

fn log_add_exp(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a == f64::NEG_INFINITY {
        return b;
    }
    let hi = a.max(b);
    hi + ((a - hi).exp() + (b - hi).exp()).ln()
}

/// Gaussian mixture posterior over the transformed source.
#[derive(Debug, Clone, Default)]
pub struct GmmPosterior {
    config: CorrespondenceConfig,
}

impl GmmPosterior {
    pub fn new(config: CorrespondenceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrespondenceConfig {
        &self.config
    }

    fn dense_column(
        transformed: &DMatrix<f64>,
        query: &[f64],
        terms: &MixtureTerms,
    ) -> Column {
        let sq_dists: Vec<f64> = transformed
            .row_iter()
            .map(|row| {
                row.iter()
                    .zip(query)
                    .map(|(a, b)| (a - b) * (a - b))
                    .sum()
            })
            .collect();
        let (values, log_term) = terms.column(&sq_dists);
        Column {
            rows: None,
            values,
            log_term,
        }
    }

    fn truncated_column(
        index: &NeighborIndex,
        k: usize,
        query: &[f64],
        terms: &MixtureTerms,
    ) -> Column {
        let found = index.nearest(query, k);
        let sq_dists: Vec<f64> = found.iter().map(|(_, d)| *d).collect();
        let (values, log_term) = terms.column(&sq_dists);
        Column {
            rows: Some(found.into_iter().map(|(i, _)| i).collect()),
            values,
            log_term,
        }
    }
}

impl WeightEstimator for GmmPosterior {
    fn estimate(
        &self,
        transformed: &DMatrix<f64>,
        target: &DMatrix<f64>,
        sigma2: f64,
        with_matrix: bool,
    ) -> Result<Expectation, Instability> {
        if sigma2 <= 0.0 || !sigma2.is_finite() {
            return Err(Instability::new(
                format!("E-step needs a positive variance, got {sigma2}"),
                sigma2,
            ));
        }

        let n = transformed.nrows();
        let m = target.nrows();
        let dim = target.ncols();
        let terms = MixtureTerms::new(sigma2, self.config.outlier_ratio, n, m, dim);

        let index = if self.config.use_acceleration {
            let index = NeighborIndex::build(transformed);
            if index.is_none() {
                warn!("truncated E-step unavailable for {dim}-D points, using dense posterior");
            }
            index
        } else {
            None
        };
        let k = self.config.neighbors.min(n).max(1);

        let mut stats = CorrespondenceStats::zeros(n, m, dim);
        let mut log_likelihood = 0.0;
        let mut dense = (with_matrix && index.is_none()).then(|| DMatrix::zeros(n, m));
        let mut sparse = (with_matrix && index.is_some()).then(|| SparseCorrespondence::new(n));

        // Row-major copy so each query is a contiguous slice.
        let queries: Vec<Vec<f64>> = target
            .row_iter()
            .map(|r| r.iter().copied().collect())
            .collect();
        let batch_size = self.config.batch_size.max(1);

        for (batch_idx, batch) in queries.chunks(batch_size).enumerate() {
            let columns: Vec<Column> = batch
                .par_iter()
                .map(|query| match &index {
                    Some(index) => Self::truncated_column(index, k, query, &terms),
                    None => Self::dense_column(transformed, query, &terms),
                })
                .collect();

            for (offset, column) in columns.into_iter().enumerate() {
                let j = batch_idx * batch_size + offset;
                let mut mass = 0.0;
                let mut accumulate = |i: usize, p: f64| {
                    stats.p1[i] += p;
                    for d in 0..dim {
                        stats.px[(i, d)] += p * target[(j, d)];
                    }
                    mass += p;
                };
                match &column.rows {
                    None => {
                        for (i, p) in column.values.iter().enumerate() {
                            accumulate(i, *p);
                        }
                    }
                    Some(rows) => {
                        for (i, p) in rows.iter().zip(&column.values) {
                            accumulate(*i, *p);
                        }
                    }
                }
                stats.pt1[j] = mass;
                log_likelihood += column.log_term;

                if let Some(dense) = dense.as_mut() {
                    for (i, p) in column.values.iter().enumerate() {
                        dense[(i, j)] = *p;
                    }
                }
                if let (Some(sparse), Some(rows)) = (sparse.as_mut(), &column.rows) {
                    let entries: Vec<(usize, f64)> =
                        rows.iter().copied().zip(column.values.iter().copied()).collect();
                    sparse.push_column(&entries);
                }
            }
        }

        stats.n_p = stats.pt1.sum();
        if !log_likelihood.is_finite() {
            return Err(Instability::new(
                format!("log-likelihood is not finite ({log_likelihood})"),
                stats.n_p,
            ));
        }

        let matrix = dense
            .map(CorrespondenceMatrix::Dense)
            .or(sparse.map(CorrespondenceMatrix::Sparse));
        Ok(Expectation {
            stats,
            log_likelihood,
            matrix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_random_cloud;
    use approx::assert_relative_eq;

    fn brute_force(
        transformed: &DMatrix<f64>,
        target: &DMatrix<f64>,
        sigma2: f64,
        w: f64,
    ) -> (DMatrix<f64>, f64) {
        let n = transformed.nrows();
        let m = target.nrows();
        let dim = target.ncols() as f64;
        let c = (2.0 * PI * sigma2).powf(dim / 2.0) * w / (1.0 - w) * n as f64 / m as f64;
        let mut p = DMatrix::zeros(n, m);
        let mut ll = 0.0;
        for j in 0..m {
            let g: Vec<f64> = (0..n)
                .map(|i| {
                    let d = (target.row(j) - transformed.row(i)).norm_squared();
                    (-d / (2.0 * sigma2)).exp()
                })
                .collect();
            let sum: f64 = g.iter().sum();
            for i in 0..n {
                p[(i, j)] = g[i] / (sum + c);
            }
            ll += ((1.0 - w) / n as f64 * (2.0 * PI * sigma2).powf(-dim / 2.0) * sum
                + w / m as f64)
                .ln();
        }
        (p, ll)
    }

    #[test]
    fn test_matches_direct_evaluation() {
        let transformed = make_random_cloud(12, 3, 1.0, 1);
        let target = make_random_cloud(9, 3, 1.0, 2);
        for w in [0.0, 0.3] {
            let posterior = GmmPosterior::new(CorrespondenceConfig {
                outlier_ratio: w,
                batch_size: 4,
                ..Default::default()
            });
            let e = posterior.estimate(&transformed, &target, 0.4, true).unwrap();
            let (expected, ll) = brute_force(&transformed, &target, 0.4, w);

            let matrix = e.matrix.unwrap().to_dense();
            assert_relative_eq!(matrix, expected, epsilon = 1e-12);
            assert_relative_eq!(e.log_likelihood, ll, epsilon = 1e-9);
            assert_relative_eq!(e.stats.px, &expected * &target, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_column_mass_bounds() {
        let transformed = make_random_cloud(20, 2, 1.0, 3);
        let target = make_random_cloud(15, 2, 2.0, 4);
        let posterior = GmmPosterior::new(CorrespondenceConfig {
            outlier_ratio: 0.2,
            ..Default::default()
        });
        let e = posterior.estimate(&transformed, &target, 0.1, true).unwrap();
        let matrix = e.matrix.unwrap();
        for j in 0..matrix.ncols() {
            for i in 0..matrix.nrows() {
                assert!(matrix.get(i, j) >= 0.0);
            }
        }
        for s in matrix.target_sums().iter() {
            assert!((0.0..=1.0 + 1e-12).contains(s));
        }
        // Without outliers every target gives away all of its mass.
        let e = GmmPosterior::default()
            .estimate(&transformed, &target, 0.1, false)
            .unwrap();
        assert_relative_eq!(e.stats.n_p, 15.0, epsilon = 1e-10);
        assert!(e.matrix.is_none());
    }

    #[test]
    fn test_tiny_variance_does_not_underflow() {
        let transformed = DMatrix::from_row_slice(2, 2, &[0.0, 0.0, 10.0, 0.0]);
        let target = DMatrix::from_row_slice(1, 2, &[4.0, 0.0]);
        let e = GmmPosterior::default()
            .estimate(&transformed, &target, 1e-6, true)
            .unwrap();
        let matrix = e.matrix.unwrap();
        assert_relative_eq!(matrix.get(0, 0), 1.0, epsilon = 1e-12);
        assert_relative_eq!(matrix.get(1, 0), 0.0);
        assert!(e.log_likelihood.is_finite());
    }

    #[test]
    fn test_truncated_posterior_is_sparse() {
        let transformed = make_random_cloud(60, 3, 1.0, 5);
        let target = make_random_cloud(40, 3, 1.0, 6);
        let posterior = GmmPosterior::new(CorrespondenceConfig {
            use_acceleration: true,
            neighbors: 8,
            outlier_ratio: 0.1,
            ..Default::default()
        });
        let e = posterior.estimate(&transformed, &target, 0.05, true).unwrap();
        let matrix = e.matrix.unwrap();
        assert!(matrix.is_sparse());
        assert_eq!(matrix.nnz(), 40 * 8);
        for s in matrix.target_sums().iter() {
            assert!((0.0..=1.0 + 1e-12).contains(s));
        }
        assert_relative_eq!(matrix.source_sums(), e.stats.p1.clone(), epsilon = 1e-12);

        // With a small variance the nearest components carry almost all the mass.
        let exact = GmmPosterior::new(CorrespondenceConfig {
            outlier_ratio: 0.1,
            ..Default::default()
        })
        .estimate(&transformed, &target, 0.05, false)
        .unwrap();
        assert_relative_eq!(e.stats.n_p, exact.stats.n_p, epsilon = 5e-2 * exact.stats.n_p);
    }

    #[test]
    fn test_truncated_posterior_on_flat_and_repeated_points() {
        // A 40 x 40 grid on z = 0 followed by 300 copies of the origin.
        let mut rows = Vec::new();
        for i in 0..40 {
            for j in 0..40 {
                rows.extend_from_slice(&[i as f64 * 0.05, j as f64 * 0.05, 0.0]);
            }
        }
        rows.extend(std::iter::repeat(0.0).take(300 * 3));
        let transformed = DMatrix::from_row_slice(1900, 3, &rows);
        let target = transformed.map(|v| v + 0.01);

        let posterior = GmmPosterior::new(CorrespondenceConfig {
            use_acceleration: true,
            neighbors: 8,
            outlier_ratio: 0.1,
            ..Default::default()
        });
        let e = posterior.estimate(&transformed, &target, 0.01, true).unwrap();
        let matrix = e.matrix.unwrap();
        assert!(matrix.is_sparse());
        assert_eq!(matrix.nnz(), 1900 * 8);
        assert!(e.log_likelihood.is_finite());
        for s in matrix.target_sums().iter() {
            assert!(s.is_finite() && (0.0..=1.0 + 1e-12).contains(s));
        }
        assert!(e.stats.p1.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_rejects_non_positive_variance() {
        let pts = DMatrix::from_row_slice(1, 2, &[0.0, 0.0]);
        assert!(GmmPosterior::default().estimate(&pts, &pts, 0.0, false).is_err());
    }
}
