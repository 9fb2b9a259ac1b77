//! Affine model: `T(x) = B·x + t`.
//!
//! The M-step is a weighted linear least-squares fit:
//! `B = A·(Σ_i P1_i x̂_i x̂_iᵀ)⁻¹`, `t = μ_y − B·μ_x`,
//! where A is the weighted cross-covariance and x̂ the centered source.

use nalgebra::{DMatrix, DVector};

use super::{
    finalize_sigma2, MaximizationOutput, TransformModel, TransformType,
    TransformationParameters, WeightedMoments,
};
use crate::correspondence::CorrespondenceStats;
use crate::error::Instability;
use crate::optimization::linalg::{check_conditioning, solve_linear};
use crate::point_set::Normalization;

/// General linear map plus translation.
#[derive(Debug, Clone, PartialEq)]
pub struct AffineParams {
    /// D×D linear part B.
    pub matrix: DMatrix<f64>,
    pub translation: DVector<f64>,
}

impl AffineParams {
    pub fn identity(dim: usize) -> Self {
        Self {
            matrix: DMatrix::identity(dim, dim),
            translation: DVector::zeros(dim),
        }
    }

    /// `X·Bᵀ + 1·tᵀ`.
    pub fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = points * self.matrix.transpose();
        for mut row in out.row_iter_mut() {
            for (d, v) in row.iter_mut().enumerate() {
                *v += self.translation[d];
            }
        }
        out
    }

    pub fn denormalize(&self, source: &Normalization, target: &Normalization) -> Self {
        let matrix = &self.matrix * (target.scale / source.scale);
        let translation =
            &self.translation * target.scale + &target.centroid - &matrix * &source.centroid;
        Self {
            matrix,
            translation,
        }
    }
}

/// Weighted least-squares M-step.
#[derive(Debug, Clone, Default)]
pub struct AffineModel;

impl AffineModel {
    pub fn new() -> Self {
        Self
    }
}

impl TransformModel for AffineModel {
    fn transform_type(&self) -> TransformType {
        TransformType::Affine
    }

    fn initial_parameters(&self, source: &DMatrix<f64>) -> TransformationParameters {
        TransformationParameters::Affine(AffineParams::identity(source.ncols()))
    }

    fn maximize(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        stats: &CorrespondenceStats,
        _sigma2: f64,
    ) -> Result<MaximizationOutput, Instability> {
        let dim = source.ncols();
        let moments = WeightedMoments::compute(source, target, stats)?;

        check_conditioning(&moments.source_scatter, "affine update");
        // source_scatter is symmetric: solve scatter·Bᵀ = Aᵀ.
        let matrix_t = solve_linear(&moments.source_scatter, &moments.cross.transpose())?;
        let matrix = matrix_t.transpose();
        let translation = &moments.mu_target - &matrix * &moments.mu_source;

        let explained = (&moments.cross * &matrix_t).trace();
        let denom = moments.n_p * dim as f64;
        let sigma2 = finalize_sigma2(
            (moments.target_spread - explained) / denom,
            moments.target_spread / denom,
        )?;

        Ok(MaximizationOutput {
            params: TransformationParameters::Affine(AffineParams {
                matrix,
                translation,
            }),
            sigma2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::make_random_cloud;
    use approx::assert_relative_eq;

    fn shear() -> AffineParams {
        AffineParams {
            matrix: DMatrix::from_row_slice(3, 3, &[1.2, 0.3, 0.0, -0.1, 0.9, 0.2, 0.0, 0.4, 1.1]),
            translation: DVector::from_vec(vec![0.5, -0.25, 1.0]),
        }
    }

    #[test]
    fn test_least_squares_recovers_affine() {
        let source = make_random_cloud(50, 3, 1.0, 21);
        let truth = shear();
        let target = truth.apply(&source);
        let stats = CorrespondenceStats::one_to_one(&target);

        let out = AffineModel::new()
            .maximize(&source, &target, &stats, 1.0)
            .unwrap();
        let est = out.params.as_affine().unwrap();

        assert_relative_eq!(est.matrix, truth.matrix.clone(), epsilon = 1e-9);
        assert_relative_eq!(est.translation, truth.translation.clone(), epsilon = 1e-9);
        assert!(out.sigma2 <= 1e-6);
    }

    #[test]
    fn test_degenerate_source_is_instability() {
        // Collinear source in 2-D: the weighted scatter is singular.
        let source = DMatrix::from_row_slice(4, 2, &[0.0, 0.0, 1.0, 0.0, 2.0, 0.0, 3.0, 0.0]);
        let target = DMatrix::from_row_slice(4, 2, &[0.0, 1.0, 1.0, 2.0, 2.0, 0.5, 3.0, 1.0]);
        let stats = CorrespondenceStats::one_to_one(&target);
        assert!(AffineModel::new()
            .maximize(&source, &target, &stats, 1.0)
            .is_err());
    }

    #[test]
    fn test_denormalize_maps_original_frame() {
        let source = make_random_cloud(30, 3, 5.0, 4);
        let target = shear().apply(&source);

        let (src_n, sn) = crate::point_set::normalize(&source).unwrap();
        let (tgt_n, tn) = crate::point_set::normalize(&target).unwrap();
        let stats = CorrespondenceStats::one_to_one(&tgt_n);
        let out = AffineModel::new()
            .maximize(&src_n, &tgt_n, &stats, 1.0)
            .unwrap();

        let restored = out.params.denormalize(&sn, &tn);
        assert_relative_eq!(restored.apply(&source), target, epsilon = 1e-8);
    }
}
