//! Transformation models for the M-step.
//!
//! Every model estimates its parameters from the weighted correspondence
//! statistics of one E-step and reports the updated noise variance:
//! - [`RigidModel`]: weighted Procrustes (rotation, translation, scale)
//! - [`AffineModel`]: weighted least squares for a general linear map
//! - [`NonrigidModel`]: coherent point drift with a Gaussian RBF displacement field
//!
//! Parameters live in the closed [`TransformationParameters`] enum so callers
//! can apply or denormalize a result without knowing which model produced it.

pub mod affine;
pub mod kernel;
pub mod nonrigid;
pub mod rigid;

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::correspondence::CorrespondenceStats;
use crate::error::{Instability, RegistrationError};
use crate::optimization::{NEGATIVE_SIGMA2_TOLERANCE, SIGMA2_FLOOR};
use crate::point_set::Normalization;

pub use affine::{AffineModel, AffineParams};
pub use kernel::gaussian_kernel;
pub use nonrigid::{NonrigidModel, NonrigidParams};
pub use rigid::{RigidModel, RigidParams};

/// Transformation family selected for a registration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformType {
    #[default]
    Rigid,
    Affine,
    Nonrigid,
}

impl TransformType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransformType::Rigid => "rigid",
            TransformType::Affine => "affine",
            TransformType::Nonrigid => "nonrigid",
        }
    }
}

impl fmt::Display for TransformType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransformType {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rigid" => Ok(TransformType::Rigid),
            "affine" => Ok(TransformType::Affine),
            "nonrigid" | "non-rigid" | "non_rigid" => Ok(TransformType::Nonrigid),
            other => Err(RegistrationError::Configuration(format!(
                "unknown transform type '{other}' (expected rigid, affine or nonrigid)"
            ))),
        }
    }
}

/// Estimated transformation, tagged by model.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformationParameters {
    Rigid(RigidParams),
    Affine(AffineParams),
    Nonrigid(NonrigidParams),
}

impl TransformationParameters {
    /// Identity transform of the requested family.
    ///
    /// `source` provides the kernel centers for the nonrigid case.
    pub fn identity(kind: TransformType, source: &DMatrix<f64>, beta: f64) -> Self {
        let dim = source.ncols();
        match kind {
            TransformType::Rigid => TransformationParameters::Rigid(RigidParams::identity(dim)),
            TransformType::Affine => TransformationParameters::Affine(AffineParams::identity(dim)),
            TransformType::Nonrigid => {
                TransformationParameters::Nonrigid(NonrigidParams::identity(source.clone(), beta))
            }
        }
    }

    pub fn transform_type(&self) -> TransformType {
        match self {
            TransformationParameters::Rigid(_) => TransformType::Rigid,
            TransformationParameters::Affine(_) => TransformType::Affine,
            TransformationParameters::Nonrigid(_) => TransformType::Nonrigid,
        }
    }

    /// Transform every row of `points`.
    pub fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            TransformationParameters::Rigid(p) => p.apply(points),
            TransformationParameters::Affine(p) => p.apply(points),
            TransformationParameters::Nonrigid(p) => p.apply(points),
        }
    }

    /// Transform a single point.
    pub fn apply_point(&self, point: &DVector<f64>) -> DVector<f64> {
        let row = DMatrix::from_row_slice(1, point.len(), point.as_slice());
        self.apply(&row).row(0).transpose()
    }

    /// Map a transform estimated between normalized clouds back into the
    /// original source and target frames.
    pub fn denormalize(&self, source: &Normalization, target: &Normalization) -> Self {
        match self {
            TransformationParameters::Rigid(p) => {
                TransformationParameters::Rigid(p.denormalize(source, target))
            }
            TransformationParameters::Affine(p) => {
                TransformationParameters::Affine(p.denormalize(source, target))
            }
            TransformationParameters::Nonrigid(p) => {
                TransformationParameters::Nonrigid(p.denormalize(source, target))
            }
        }
    }

    pub fn as_rigid(&self) -> Option<&RigidParams> {
        match self {
            TransformationParameters::Rigid(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_affine(&self) -> Option<&AffineParams> {
        match self {
            TransformationParameters::Affine(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_nonrigid(&self) -> Option<&NonrigidParams> {
        match self {
            TransformationParameters::Nonrigid(p) => Some(p),
            _ => None,
        }
    }
}

/// Parameters and variance produced by one M-step.
#[derive(Debug, Clone)]
pub struct MaximizationOutput {
    pub params: TransformationParameters,
    pub sigma2: f64,
}

/// A transformation model: estimates parameters from weighted correspondences.
pub trait TransformModel: Send + Sync {
    fn transform_type(&self) -> TransformType;

    /// Parameters the optimization starts from.
    fn initial_parameters(&self, source: &DMatrix<f64>) -> TransformationParameters;

    /// M-step: fit parameters to the E-step statistics.
    ///
    /// `sigma2` is the variance the statistics were computed with.
    fn maximize(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        stats: &CorrespondenceStats,
        sigma2: f64,
    ) -> Result<MaximizationOutput, Instability>;

    /// Transform the registration source with `params`.
    fn transform_source(
        &self,
        source: &DMatrix<f64>,
        params: &TransformationParameters,
    ) -> DMatrix<f64> {
        params.apply(source)
    }

    /// Regularization subtracted from the log-likelihood (zero for parametric models).
    fn penalty(&self, _params: &TransformationParameters) -> f64 {
        0.0
    }
}

/// Weighted centroids and covariances shared by the rigid and affine solves.
#[derive(Debug, Clone)]
pub(crate) struct WeightedMoments {
    /// Weighted target centroid μ_y = Σ P·Y / n_p.
    pub mu_target: DVector<f64>,
    /// Weighted source centroid μ_x = Xᵀ·P1 / n_p.
    pub mu_source: DVector<f64>,
    /// Weighted cross-covariance A = Σ_ij P_ij (y_j − μ_y)(x_i − μ_x)ᵀ.
    pub cross: DMatrix<f64>,
    /// Σ_i P1_i (x_i − μ_x)(x_i − μ_x)ᵀ.
    pub source_scatter: DMatrix<f64>,
    /// Σ_j Pt1_j ‖y_j − μ_y‖².
    pub target_spread: f64,
    pub n_p: f64,
}

impl WeightedMoments {
    pub fn compute(
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        stats: &CorrespondenceStats,
    ) -> Result<Self, Instability> {
        let dim = source.ncols();
        let n_p = matched_mass(stats)?;

        let mu_target = stats.weighted_target_centroid();
        let mu_source = stats.weighted_source_centroid(source);

        let mut cross = DMatrix::zeros(dim, dim);
        let mut source_scatter = DMatrix::zeros(dim, dim);
        for i in 0..source.nrows() {
            let p1 = stats.p1[i];
            if p1 == 0.0 {
                continue;
            }
            for a in 0..dim {
                let y_hat = stats.px[(i, a)] - p1 * mu_target[a];
                let x_a = source[(i, a)] - mu_source[a];
                for b in 0..dim {
                    let x_b = source[(i, b)] - mu_source[b];
                    cross[(a, b)] += y_hat * x_b;
                    source_scatter[(a, b)] += p1 * x_a * x_b;
                }
            }
        }

        let mut target_spread = 0.0;
        for j in 0..target.nrows() {
            let pt1 = stats.pt1[j];
            if pt1 == 0.0 {
                continue;
            }
            let mut sq = 0.0;
            for a in 0..dim {
                let d = target[(j, a)] - mu_target[a];
                sq += d * d;
            }
            target_spread += pt1 * sq;
        }

        Ok(Self {
            mu_target,
            mu_source,
            cross,
            source_scatter,
            target_spread,
            n_p,
        })
    }
}

/// Total posterior mass n_p, rejected when it is too small to divide by.
fn matched_mass(stats: &CorrespondenceStats) -> Result<f64, Instability> {
    let n_p = stats.n_p;
    if n_p <= f64::EPSILON || !n_p.is_finite() {
        return Err(Instability::new(
            format!("correspondence mass vanished (n_p = {n_p:.3e})"),
            n_p,
        ));
    }
    Ok(n_p)
}

/// Weighted mean squared residual `Σ_ij P_ij ‖y_j − t_i‖² / (n_p·D)`.
///
/// Expanded through the sufficient statistics, so the correspondence matrix
/// itself is not needed.
///
/// # Errors
/// [`Instability`] when no posterior mass is matched (`n_p ≈ 0`).
pub fn weighted_residual_variance(
    transformed: &DMatrix<f64>,
    target: &DMatrix<f64>,
    stats: &CorrespondenceStats,
) -> Result<f64, Instability> {
    let n_p = matched_mass(stats)?;
    let (raw, _) = residual_terms(transformed, target, stats);
    Ok(raw / (n_p * transformed.ncols() as f64))
}

/// Raw residual sum and the magnitude of its positive terms (for rounding checks).
pub(crate) fn residual_terms(
    transformed: &DMatrix<f64>,
    target: &DMatrix<f64>,
    stats: &CorrespondenceStats,
) -> (f64, f64) {
    let mut target_term = 0.0;
    for j in 0..target.nrows() {
        target_term += stats.pt1[j] * target.row(j).norm_squared();
    }
    let mut cross_term = 0.0;
    let mut source_term = 0.0;
    for i in 0..transformed.nrows() {
        let t = transformed.row(i);
        cross_term += stats.px.row(i).dot(&t);
        source_term += stats.p1[i] * t.norm_squared();
    }
    (
        target_term - 2.0 * cross_term + source_term,
        target_term + source_term,
    )
}

/// Turn a raw variance estimate into the next σ².
///
/// Non-finite values and values negative beyond rounding error are numerical
/// failures; small values are clamped at [`SIGMA2_FLOOR`].
pub(crate) fn finalize_sigma2(raw: f64, magnitude: f64) -> Result<f64, Instability> {
    if !raw.is_finite() {
        return Err(Instability::new(
            format!("variance update is not finite ({raw})"),
            raw.abs(),
        ));
    }
    if raw < -NEGATIVE_SIGMA2_TOLERANCE * magnitude.max(1.0) {
        return Err(Instability::new(
            format!("variance would become non-positive ({raw:.3e})"),
            raw.abs(),
        ));
    }
    if raw < SIGMA2_FLOOR {
        debug!("sigma2 {raw:.3e} clamped to floor {SIGMA2_FLOOR:.1e}");
        return Ok(SIGMA2_FLOOR);
    }
    Ok(raw)
}

/// Build the model for a transform type.
///
/// The nonrigid model precomputes its Gram matrix over `source`.
pub fn build_model(
    kind: TransformType,
    source: &DMatrix<f64>,
    lambda: f64,
    beta: f64,
    estimate_scale: bool,
) -> Box<dyn TransformModel> {
    match kind {
        TransformType::Rigid => Box::new(RigidModel::new(estimate_scale)),
        TransformType::Affine => Box::new(AffineModel::new()),
        TransformType::Nonrigid => Box::new(NonrigidModel::new(source, lambda, beta)),
    }
}
