//! Rigid (similarity) model: `T(x) = s·R·x + t`.
//!
//! The M-step is a weighted Procrustes solve:
//! 1. Weighted centroids μ_x, μ_y and cross-covariance A
//! 2. SVD A = U·S·Vᵀ
//! 3. R = U·diag(1, …, 1, det(U·Vᵀ))·Vᵀ (reflection corrected, det R = +1)
//! 4. s = tr(AᵀR) / Σ P1_i ‖x_i − μ_x‖²
//! 5. t = μ_y − s·R·μ_x

use nalgebra::{DMatrix, DVector};

use super::{
    finalize_sigma2, MaximizationOutput, TransformModel, TransformType,
    TransformationParameters, WeightedMoments,
};
use crate::correspondence::CorrespondenceStats;
use crate::error::Instability;
use crate::point_set::Normalization;

/// Rotation, translation and isotropic scale.
#[derive(Debug, Clone, PartialEq)]
pub struct RigidParams {
    /// D×D orthonormal rotation with determinant +1.
    pub rotation: DMatrix<f64>,
    pub translation: DVector<f64>,
    /// Isotropic scale (> 0).
    pub scale: f64,
}

impl RigidParams {
    pub fn identity(dim: usize) -> Self {
        Self {
            rotation: DMatrix::identity(dim, dim),
            translation: DVector::zeros(dim),
            scale: 1.0,
        }
    }

    /// `s·X·Rᵀ + 1·tᵀ`.
    pub fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        let mut out = points * self.rotation.transpose() * self.scale;
        for mut row in out.row_iter_mut() {
            for (d, v) in row.iter_mut().enumerate() {
                *v += self.translation[d];
            }
        }
        out
    }

    pub fn denormalize(&self, source: &Normalization, target: &Normalization) -> Self {
        let scale = self.scale * target.scale / source.scale;
        let translation = &self.translation * target.scale + &target.centroid
            - &self.rotation * &source.centroid * scale;
        Self {
            rotation: self.rotation.clone(),
            translation,
            scale,
        }
    }

    /// 4×4 (or (D+1)×(D+1)) homogeneous matrix.
    pub fn to_homogeneous(&self) -> DMatrix<f64> {
        let dim = self.translation.len();
        let mut h = DMatrix::identity(dim + 1, dim + 1);
        h.view_mut((0, 0), (dim, dim))
            .copy_from(&(&self.rotation * self.scale));
        h.view_mut((0, dim), (dim, 1)).copy_from(&self.translation);
        h
    }
}

/// Weighted Procrustes M-step.
#[derive(Debug, Clone)]
pub struct RigidModel {
    estimate_scale: bool,
}

impl RigidModel {
    pub fn new(estimate_scale: bool) -> Self {
        Self { estimate_scale }
    }

    pub fn estimates_scale(&self) -> bool {
        self.estimate_scale
    }
}

impl Default for RigidModel {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TransformModel for RigidModel {
    fn transform_type(&self) -> TransformType {
        TransformType::Rigid
    }

    fn initial_parameters(&self, source: &DMatrix<f64>) -> TransformationParameters {
        TransformationParameters::Rigid(RigidParams::identity(source.ncols()))
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

        let rotation = reflection_corrected_rotation(&moments.cross)?;

        let tr_ar = (moments.cross.transpose() * &rotation).trace();
        let tr_source = moments.source_scatter.trace();

        let scale = if self.estimate_scale {
            if tr_source <= f64::EPSILON {
                return Err(Instability::new(
                    "weighted source variance vanished in scale update",
                    tr_source,
                ));
            }
            let s = tr_ar / tr_source;
            if s <= 0.0 || !s.is_finite() {
                return Err(Instability::new(
                    format!("scale estimate is non-positive ({s:.3e})"),
                    tr_ar.abs(),
                ));
            }
            s
        } else {
            1.0
        };

        let translation = &moments.mu_target - &rotation * &moments.mu_source * scale;

        let raw = (moments.target_spread - 2.0 * scale * tr_ar + scale * scale * tr_source)
            / (moments.n_p * dim as f64);
        let magnitude = (moments.target_spread + scale * scale * tr_source)
            / (moments.n_p * dim as f64);
        let sigma2 = finalize_sigma2(raw, magnitude)?;

        Ok(MaximizationOutput {
            params: TransformationParameters::Rigid(RigidParams {
                rotation,
                translation,
                scale,
            }),
            sigma2,
        })
    }
}

/// Rotation maximizing `tr(AᵀR)` subject to RᵀR = I and det R = +1.
pub fn reflection_corrected_rotation(cross: &DMatrix<f64>) -> Result<DMatrix<f64>, Instability> {
    let dim = cross.nrows();
    let svd = cross
        .clone()
        .try_svd(true, true, f64::EPSILON, 0)
        .ok_or_else(|| Instability::new("SVD of cross-covariance did not converge", f64::NAN))?;
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(Instability::new(
                "SVD of cross-covariance returned no singular vectors",
                f64::NAN,
            ))
        }
    };

    let mut correction = DVector::from_element(dim, 1.0);
    correction[dim - 1] = (&u * &v_t).determinant().signum();
    Ok(&u * DMatrix::from_diagonal(&correction) * &v_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::CorrespondenceStats;
    use crate::test_utils::{rotation_3d, make_random_cloud};
    use approx::assert_relative_eq;

    #[test]
    fn test_apply_identity() {
        let pts = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, -1.0, 0.0, 4.0]);
        let params = RigidParams::identity(3);
        assert_relative_eq!(params.apply(&pts), pts.clone(), epsilon = 1e-12);
    }

    #[test]
    fn test_procrustes_recovers_known_similarity() {
        // One-to-one correspondences: the M-step should recover the transform exactly.
        let source = make_random_cloud(40, 3, 1.0, 7);
        let rotation = rotation_3d(0.3, -0.2, 0.5);
        let truth = RigidParams {
            rotation,
            translation: DVector::from_vec(vec![0.5, -1.0, 2.0]),
            scale: 1.7,
        };
        let target = truth.apply(&source);
        let stats = CorrespondenceStats::one_to_one(&target);

        let out = RigidModel::new(true)
            .maximize(&source, &target, &stats, 1.0)
            .unwrap();
        let est = out.params.as_rigid().unwrap();

        assert_relative_eq!(est.rotation, truth.rotation.clone(), epsilon = 1e-9);
        assert_relative_eq!(est.translation, truth.translation.clone(), epsilon = 1e-9);
        assert_relative_eq!(est.scale, 1.7, epsilon = 1e-9);
        assert_relative_eq!(est.rotation.determinant(), 1.0, epsilon = 1e-9);
        // Perfect fit: variance clamps to the floor.
        assert!(out.sigma2 <= 1e-6);
    }

    #[test]
    fn test_fixed_scale() {
        let source = make_random_cloud(30, 2, 1.0, 3);
        let target = &source * 2.0;
        let stats = CorrespondenceStats::one_to_one(&target);

        let out = RigidModel::new(false)
            .maximize(&source, &target, &stats, 1.0)
            .unwrap();
        let est = out.params.as_rigid().unwrap();
        assert_relative_eq!(est.scale, 1.0);
        assert!(out.sigma2 > 1e-3, "unexplained scale shows up as variance");
    }

    #[test]
    fn test_reflection_is_corrected() {
        // A pure reflection cross-covariance must still yield det R = +1.
        let cross = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0]);
        let r = reflection_corrected_rotation(&cross).unwrap();
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(
            &r * r.transpose(),
            DMatrix::identity(3, 3),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_denormalize_maps_original_frame() {
        let source = make_random_cloud(25, 3, 3.0, 11);
        let truth = RigidParams {
            rotation: rotation_3d(0.1, 0.2, -0.4),
            translation: DVector::from_vec(vec![1.0, 2.0, 3.0]),
            scale: 0.8,
        };
        let target = truth.apply(&source);

        let (src_n, sn) = crate::point_set::normalize(&source).unwrap();
        let (tgt_n, tn) = crate::point_set::normalize(&target).unwrap();
        let stats = CorrespondenceStats::one_to_one(&tgt_n);
        let out = RigidModel::new(true)
            .maximize(&src_n, &tgt_n, &stats, 1.0)
            .unwrap();

        let restored = out.params.denormalize(&sn, &tn);
        let est = restored.as_rigid().unwrap();
        assert_relative_eq!(est.scale, 0.8, epsilon = 1e-9);
        assert_relative_eq!(est.translation, truth.translation.clone(), epsilon = 1e-8);
        assert_relative_eq!(restored.apply(&source), target, epsilon = 1e-8);
    }

    #[test]
    fn test_homogeneous() {
        let params = RigidParams {
            rotation: DMatrix::identity(2, 2),
            translation: DVector::from_vec(vec![3.0, 4.0]),
            scale: 2.0,
        };
        let h = params.to_homogeneous();
        assert_eq!(h.nrows(), 3);
        assert_relative_eq!(h[(0, 0)], 2.0);
        assert_relative_eq!(h[(1, 2)], 4.0);
        assert_relative_eq!(h[(2, 2)], 1.0);
    }
}
