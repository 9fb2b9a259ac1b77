//! Correspondence estimation (E-step).
//!
//! The transformed source points are the centroids of an equal-weight
//! Gaussian mixture with a uniform outlier component of weight w. For every
//! target point the E-step computes the posterior probability of each
//! component and reduces those posteriors to the sufficient statistics the
//! M-step needs:
//! - `p1 = P·1` (N): mass received by each source point
//! - `pt1 = Pᵀ·1` (M): mass given away by each target point (≤ 1)
//! - `px = P·Y` (N×D): posterior-weighted target sums
//! - `n_p = Σ p1`
//!
//! How the weights are obtained is behind the [`WeightEstimator`] trait so the
//! same EM loop also drives support vector registration.

pub mod estep;
pub mod matrix;
pub mod search;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::Instability;

pub use estep::GmmPosterior;
pub use matrix::{CorrespondenceMatrix, SparseCorrespondence};
pub use search::NeighborIndex;

/// E-step settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrespondenceConfig {
    /// Weight w of the uniform outlier component, in [0, 1).
    pub outlier_ratio: f64,

    /// Restrict each target's posterior to its nearest source points.
    pub use_acceleration: bool,

    /// Neighbours per target when accelerated.
    pub neighbors: usize,

    /// Targets per parallel batch.
    pub batch_size: usize,
}

impl Default for CorrespondenceConfig {
    fn default() -> Self {
        Self {
            outlier_ratio: 0.0,
            use_acceleration: false,
            neighbors: 16,
            batch_size: 256,
        }
    }
}

/// Sufficient statistics of one E-step.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrespondenceStats {
    /// Row sums `P·1`, one per source point.
    pub p1: DVector<f64>,
    /// Column sums `Pᵀ·1`, one per target point.
    pub pt1: DVector<f64>,
    /// `P·Y`, N×D.
    pub px: DMatrix<f64>,
    /// Total posterior mass.
    pub n_p: f64,
}

impl CorrespondenceStats {
    pub fn zeros(num_source: usize, num_target: usize, dim: usize) -> Self {
        Self {
            p1: DVector::zeros(num_source),
            pt1: DVector::zeros(num_target),
            px: DMatrix::zeros(num_source, dim),
            n_p: 0.0,
        }
    }

    /// Statistics of a known one-to-one matching `x_i ↔ y_i`.
    pub fn one_to_one(target: &DMatrix<f64>) -> Self {
        let n = target.nrows();
        Self {
            p1: DVector::from_element(n, 1.0),
            pt1: DVector::from_element(n, 1.0),
            px: target.clone(),
            n_p: n as f64,
        }
    }

    /// Statistics of an explicit N×M weight matrix.
    pub fn from_weights(weights: &DMatrix<f64>, target: &DMatrix<f64>) -> Self {
        let p1 = DVector::from_iterator(weights.nrows(), weights.row_iter().map(|r| r.sum()));
        let pt1 =
            DVector::from_iterator(weights.ncols(), weights.column_iter().map(|c| c.sum()));
        let n_p = p1.sum();
        Self {
            p1,
            pt1,
            px: weights * target,
            n_p,
        }
    }

    pub fn source_weights(&self) -> &DVector<f64> {
        &self.p1
    }

    pub fn target_weights(&self) -> &DVector<f64> {
        &self.pt1
    }

    /// `μ_y = Yᵀ·Pt1 / n_p` (equal to `(P·Y)ᵀ·1 / n_p`).
    pub fn weighted_target_centroid(&self) -> DVector<f64> {
        let mut sum = DVector::zeros(self.px.ncols());
        for row in self.px.row_iter() {
            for (d, v) in row.iter().enumerate() {
                sum[d] += v;
            }
        }
        sum / self.n_p
    }

    /// `μ_x = Xᵀ·P1 / n_p`.
    pub fn weighted_source_centroid(&self, source: &DMatrix<f64>) -> DVector<f64> {
        source.transpose() * &self.p1 / self.n_p
    }
}

/// Result of one E-step.
#[derive(Debug, Clone)]
pub struct Expectation {
    pub stats: CorrespondenceStats,
    /// Objective at the parameters the E-step was evaluated for.
    pub log_likelihood: f64,
    /// Full correspondence weights, when requested.
    pub matrix: Option<CorrespondenceMatrix>,
}

/// Produces correspondence weights between a transformed source and the target.
pub trait WeightEstimator: Send + Sync {
    /// Weights, sufficient statistics and objective at the current σ².
    ///
    /// `with_matrix` asks for the full weight matrix in addition to the
    /// statistics.
    fn estimate(
        &self,
        transformed: &DMatrix<f64>,
        target: &DMatrix<f64>,
        sigma2: f64,
        with_matrix: bool,
    ) -> Result<Expectation, Instability>;

    /// σ² for the next iteration given the M-step estimate.
    fn next_sigma2(&self, estimated: f64, _current: f64) -> f64 {
        estimated
    }

    /// Whether a small objective change at this σ² counts as convergence.
    fn allows_convergence(&self, _sigma2: f64) -> bool {
        true
    }
}
