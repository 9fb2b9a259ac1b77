//! Support Vector Registration.
//!
//! Each cloud is first summarized by a one-class SVM: the support vectors and
//! their dual coefficients form a sparse Gaussian mixture. Registration then
//! maximizes the kernel correlation of the two mixtures with the same EM loop
//! and transformation models as CPD; only the weight estimator differs.

pub mod one_class;
pub mod weights;

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::optimization::types::{validate_max_iterations, validate_positive, validate_tolerance};
use crate::transform::TransformType;

pub use one_class::{OneClassSvm, SupportVectors};
pub use weights::SupportVectorWeights;

/// Configuration for support vector registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvrConfig {
    /// Transformation family to estimate.
    pub transform_type: TransformType,

    /// One-class SVM fraction ν in (0, 1].
    pub nu: f64,

    /// Gaussian kernel width h (normalized units when `normalize` is set).
    pub kernel_width: f64,

    /// Convergence threshold on the change of ln J.
    pub tolerance: f64,

    pub max_iterations: usize,

    /// Motion coherence weight λ (nonrigid only).
    pub lambda: f64,

    /// Displacement kernel width β (nonrigid only).
    pub beta: f64,

    /// Estimate isotropic scale in the rigid model.
    pub estimate_scale: bool,

    /// Register zero-mean, unit-RMS copies of the clouds.
    pub normalize: bool,

    /// SMO stopping threshold on the maximal KKT violation.
    pub smo_tolerance: f64,

    pub smo_max_iterations: usize,

    /// Factor applied to σ² per iteration until it reaches 2h².
    /// `None` runs at 2h² from the start.
    pub annealing_rate: Option<f64>,

    /// Keep the final support vector weight matrix in the result.
    pub retain_correspondence: bool,
}

impl Default for SvrConfig {
    fn default() -> Self {
        Self {
            transform_type: TransformType::Rigid,
            nu: 0.1,
            kernel_width: 0.1,
            tolerance: 1e-6,
            max_iterations: 100,
            lambda: 2.0,
            beta: 2.0,
            estimate_scale: true,
            normalize: true,
            smo_tolerance: 1e-6,
            smo_max_iterations: 100_000,
            annealing_rate: Some(0.5),
            retain_correspondence: false,
        }
    }
}

impl SvrConfig {
    pub fn with_transform(transform_type: TransformType) -> Self {
        Self {
            transform_type,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.nu > 0.0 && self.nu <= 1.0) {
            return Err(RegistrationError::Configuration(format!(
                "nu must be in (0, 1], got {}",
                self.nu
            )));
        }
        validate_positive("kernel width", self.kernel_width)?;
        validate_tolerance(self.tolerance)?;
        validate_max_iterations(self.max_iterations)?;
        if self.transform_type == TransformType::Nonrigid {
            validate_positive("lambda", self.lambda)?;
            validate_positive("beta", self.beta)?;
        }
        validate_positive("SMO tolerance", self.smo_tolerance)?;
        if self.smo_max_iterations == 0 {
            return Err(RegistrationError::Configuration(
                "SMO iteration limit must be at least 1".into(),
            ));
        }
        if let Some(rate) = self.annealing_rate {
            if !(rate > 0.0 && rate < 1.0) {
                return Err(RegistrationError::Configuration(format!(
                    "annealing rate must be in (0, 1), got {rate}"
                )));
            }
        }
        Ok(())
    }

    /// Rigid registration with the scale held at 1.
    pub fn fixes_scale(&self) -> bool {
        self.transform_type == TransformType::Rigid && !self.estimate_scale
    }

    /// One-class SVM used for both clouds.
    pub fn one_class_svm(&self) -> OneClassSvm {
        OneClassSvm {
            nu: self.nu,
            kernel_width: self.kernel_width,
            tolerance: self.smo_tolerance,
            max_iterations: self.smo_max_iterations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SvrConfig::default().validate().is_ok());
        assert!(SvrConfig::with_transform(TransformType::Nonrigid)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_invalid_values() {
        let cases = [
            SvrConfig {
                nu: 0.0,
                ..Default::default()
            },
            SvrConfig {
                kernel_width: -1.0,
                ..Default::default()
            },
            SvrConfig {
                tolerance: 0.0,
                ..Default::default()
            },
            SvrConfig {
                annealing_rate: Some(1.0),
                ..Default::default()
            },
            SvrConfig {
                smo_max_iterations: 0,
                ..Default::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(RegistrationError::Configuration(_))),
                "{config:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_defaults() {
        let config: SvrConfig =
            serde_json::from_str(r#"{"transform_type": "affine", "nu": 0.4}"#).unwrap();
        assert_eq!(config.transform_type, TransformType::Affine);
        assert_eq!(config.nu, 0.4);
        assert_eq!(config.annealing_rate, Some(0.5));
    }

    #[test]
    fn test_fixes_scale() {
        assert!(!SvrConfig::default().fixes_scale());
        let config = SvrConfig {
            estimate_scale: false,
            ..Default::default()
        };
        assert!(config.fixes_scale());
        let config = SvrConfig {
            transform_type: TransformType::Affine,
            ..config
        };
        assert!(!config.fixes_scale());
    }
}
