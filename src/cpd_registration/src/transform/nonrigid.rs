//! Nonrigid model (coherent point drift).
//!
//! The displacement field is a Gaussian RBF expansion centered on the source
//! points: `T(X) = X + G·W` with `G_ij = exp(−‖x_i − x_j‖² / (2β²))`.
//! Motion coherence is enforced by the penalty `λ/2 · tr(WᵀGW)`; the M-step
//! solves `(d(P1)·G + λσ²·I)·W = P·Y − d(P1)·X`.

use nalgebra::DMatrix;

use super::kernel::gaussian_kernel;
use super::{
    finalize_sigma2, residual_terms, MaximizationOutput, TransformModel, TransformType,
    TransformationParameters,
};
use crate::correspondence::CorrespondenceStats;
use crate::error::Instability;
use crate::optimization::linalg::solve_linear;
use crate::point_set::Normalization;

/// RBF coefficients together with the frames they were estimated in.
#[derive(Debug, Clone, PartialEq)]
pub struct NonrigidParams {
    /// Kernel centers (the source points in the estimation frame), N×D.
    pub control_points: DMatrix<f64>,
    /// Coefficients W, N×D.
    pub coefficients: DMatrix<f64>,
    pub beta: f64,
    /// Maps caller coordinates into the estimation frame before evaluation.
    pub input_frame: Normalization,
    /// Maps estimation-frame results back into caller coordinates.
    pub output_frame: Normalization,
}

impl NonrigidParams {
    /// Zero displacement over `control_points`.
    pub fn identity(control_points: DMatrix<f64>, beta: f64) -> Self {
        let dim = control_points.ncols();
        let coefficients = DMatrix::zeros(control_points.nrows(), dim);
        Self {
            control_points,
            coefficients,
            beta,
            input_frame: Normalization::identity(dim),
            output_frame: Normalization::identity(dim),
        }
    }

    /// Evaluate `out(u + G(u, C)·W)` with `u = in(x)`.
    ///
    /// Works for arbitrary query points, not only the control points.
    pub fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        let u = self.input_frame.apply(points);
        let moved = &u + self.displacement_in_frame(&u);
        self.output_frame.restore(&moved)
    }

    /// `apply(points) − points`, in caller coordinates.
    pub fn displacement(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        self.apply(points) - points
    }

    /// Displacement `G·W` at the control points, in the estimation frame.
    pub fn displacement_field(&self) -> DMatrix<f64> {
        self.displacement_in_frame(&self.control_points)
    }

    fn displacement_in_frame(&self, u: &DMatrix<f64>) -> DMatrix<f64> {
        gaussian_kernel(u, &self.control_points, self.beta) * &self.coefficients
    }

    /// Compose the recorded frames with the source and target normalizations.
    pub fn denormalize(&self, source: &Normalization, target: &Normalization) -> Self {
        let input_frame = Normalization {
            centroid: &source.centroid + &self.input_frame.centroid * source.scale,
            scale: source.scale * self.input_frame.scale,
        };
        let output_frame = Normalization {
            centroid: &target.centroid + &self.output_frame.centroid * target.scale,
            scale: target.scale * self.output_frame.scale,
        };
        Self {
            control_points: self.control_points.clone(),
            coefficients: self.coefficients.clone(),
            beta: self.beta,
            input_frame,
            output_frame,
        }
    }

    /// `tr(WᵀGW)` over the control points.
    pub fn coherence(&self) -> f64 {
        let gram = gaussian_kernel(&self.control_points, &self.control_points, self.beta);
        (self.coefficients.transpose() * gram * &self.coefficients).trace()
    }
}

/// CPD M-step with a precomputed Gram matrix over the source.
#[derive(Debug, Clone)]
pub struct NonrigidModel {
    lambda: f64,
    beta: f64,
    source: DMatrix<f64>,
    gram: DMatrix<f64>,
}

impl NonrigidModel {
    pub fn new(source: &DMatrix<f64>, lambda: f64, beta: f64) -> Self {
        Self {
            lambda,
            beta,
            source: source.clone(),
            gram: gaussian_kernel(source, source, beta),
        }
    }

    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn gram(&self) -> &DMatrix<f64> {
        &self.gram
    }

    /// Solve for the RBF coefficients at a fixed σ².
    pub fn solve_coefficients(
        &self,
        source: &DMatrix<f64>,
        stats: &CorrespondenceStats,
        sigma2: f64,
    ) -> Result<DMatrix<f64>, Instability> {
        let n = source.nrows();
        let mut system = self.gram.clone();
        for i in 0..n {
            let p1 = stats.p1[i];
            for k in 0..n {
                system[(i, k)] *= p1;
            }
            system[(i, i)] += self.lambda * sigma2;
        }

        let mut rhs = stats.px.clone();
        for i in 0..n {
            let p1 = stats.p1[i];
            for d in 0..source.ncols() {
                rhs[(i, d)] -= p1 * source[(i, d)];
            }
        }

        solve_linear(&system, &rhs)
    }
}

impl TransformModel for NonrigidModel {
    fn transform_type(&self) -> TransformType {
        TransformType::Nonrigid
    }

    fn initial_parameters(&self, source: &DMatrix<f64>) -> TransformationParameters {
        TransformationParameters::Nonrigid(NonrigidParams::identity(source.clone(), self.beta))
    }

    fn maximize(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        stats: &CorrespondenceStats,
        sigma2: f64,
    ) -> Result<MaximizationOutput, Instability> {
        let n_p = stats.n_p;
        if n_p <= f64::EPSILON || !n_p.is_finite() {
            return Err(Instability::new(
                format!("correspondence mass vanished (n_p = {n_p:.3e})"),
                n_p,
            ));
        }

        let coefficients = self.solve_coefficients(source, stats, sigma2)?;
        let transformed = source + &self.gram * &coefficients;

        let (raw, magnitude) = residual_terms(&transformed, target, stats);
        let denom = n_p * source.ncols() as f64;
        let sigma2 = finalize_sigma2(raw / denom, magnitude / denom)?;

        let mut params = NonrigidParams::identity(source.clone(), self.beta);
        params.coefficients = coefficients;
        Ok(MaximizationOutput {
            params: TransformationParameters::Nonrigid(params),
            sigma2,
        })
    }

    fn transform_source(
        &self,
        source: &DMatrix<f64>,
        params: &TransformationParameters,
    ) -> DMatrix<f64> {
        match params {
            TransformationParameters::Nonrigid(p)
                if p.input_frame.is_identity()
                    && p.output_frame.is_identity()
                    && *source == self.source =>
            {
                source + &self.gram * &p.coefficients
            }
            other => other.apply(source),
        }
    }

    fn penalty(&self, params: &TransformationParameters) -> f64 {
        match params {
            TransformationParameters::Nonrigid(p) if p.coefficients.nrows() == self.gram.nrows() => {
                let w = &p.coefficients;
                0.5 * self.lambda * (w.transpose() * &self.gram * w).trace()
            }
            _ => 0.0,
        }
    }
}
