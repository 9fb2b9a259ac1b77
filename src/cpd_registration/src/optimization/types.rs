//! Type definitions for EM registration.

use serde::{Deserialize, Serialize};

use crate::error::{RegistrationError, Result};
use crate::transform::{TransformType, TransformationParameters};

/// Smallest σ² the M-step reports (normalized units).
pub const SIGMA2_FLOOR: f64 = 1e-8;

/// Relative slack for σ² estimates that come out slightly negative from rounding.
pub const NEGATIVE_SIGMA2_TOLERANCE: f64 = 1e-8;

/// Condition number above which a linear solve is logged as ill-conditioned.
pub const CONDITION_WARNING_THRESHOLD: f64 = 1e10;

/// Relative residual `‖A·x − b‖ / ‖b‖` above which a solve is rejected.
pub const LINEAR_RESIDUAL_TOLERANCE: f64 = 1e-6;

/// Configuration for CPD registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    /// Transformation family to estimate.
    pub transform_type: TransformType,

    /// Outlier weight w of the uniform component, in [0, 1).
    pub outlier_ratio: f64,

    /// Convergence threshold on the log-likelihood change.
    /// Iteration stops when |ΔL| < tolerance.
    pub tolerance: f64,

    /// Maximum number of EM iterations.
    pub max_iterations: usize,

    /// Motion coherence weight λ (nonrigid only).
    pub lambda: f64,

    /// Gaussian kernel width β (nonrigid only).
    pub beta: f64,

    /// Starting variance in caller units. `None` derives it from the clouds.
    pub initial_sigma2: Option<f64>,

    /// Truncate each target's posterior to its nearest source points
    /// (k-d tree, 2-D and 3-D only).
    pub use_acceleration: bool,

    /// Number of neighbours kept per target when accelerated.
    pub acceleration_neighbors: usize,

    /// Estimate isotropic scale in the rigid model.
    pub estimate_scale: bool,

    /// Register zero-mean, unit-RMS copies of the clouds.
    pub normalize: bool,

    /// Keep the final correspondence matrix in the result.
    pub retain_correspondence: bool,

    /// Targets processed per parallel E-step batch.
    pub batch_size: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            transform_type: TransformType::Rigid,
            outlier_ratio: 0.0,
            tolerance: 1e-3,
            max_iterations: 50,
            lambda: 2.0,
            beta: 2.0,
            initial_sigma2: None,
            use_acceleration: false,
            acceleration_neighbors: 16,
            estimate_scale: true,
            normalize: true,
            retain_correspondence: true,
            batch_size: 256,
        }
    }
}

impl RegistrationConfig {
    /// Default configuration for the given transformation family.
    pub fn with_transform(transform_type: TransformType) -> Self {
        Self {
            transform_type,
            ..Default::default()
        }
    }

    /// Check every field; errors name the offending value.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.outlier_ratio) {
            return Err(RegistrationError::Configuration(format!(
                "outlier weight must be in [0, 1), got {}",
                self.outlier_ratio
            )));
        }
        validate_tolerance(self.tolerance)?;
        validate_max_iterations(self.max_iterations)?;
        if self.transform_type == TransformType::Nonrigid {
            validate_positive("lambda", self.lambda)?;
            validate_positive("beta", self.beta)?;
        }
        if let Some(sigma2) = self.initial_sigma2 {
            validate_positive("initial sigma2", sigma2)?;
        }
        if self.use_acceleration && self.acceleration_neighbors == 0 {
            return Err(RegistrationError::Configuration(
                "acceleration needs at least one neighbour per target".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(RegistrationError::Configuration(
                "batch size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Rigid registration with the scale held at 1.
    pub fn fixes_scale(&self) -> bool {
        self.transform_type == TransformType::Rigid && !self.estimate_scale
    }
}

pub(crate) fn validate_tolerance(tolerance: f64) -> Result<()> {
    if tolerance <= 0.0 || !tolerance.is_finite() {
        return Err(RegistrationError::Configuration(format!(
            "tolerance must be a positive number, got {tolerance}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_max_iterations(max_iterations: usize) -> Result<()> {
    if max_iterations == 0 {
        return Err(RegistrationError::Configuration(
            "max iterations must be at least 1".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_positive(name: &str, value: f64) -> Result<()> {
    if value <= 0.0 || !value.is_finite() {
        return Err(RegistrationError::Configuration(format!(
            "{name} must be a positive number, got {value}"
        )));
    }
    Ok(())
}

/// Lifecycle of an EM run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    /// Set up, no iteration run yet.
    Initialized,

    /// Inside the EM loop.
    Iterating,

    /// |ΔL| fell below the tolerance.
    Converged,

    /// Iteration budget exhausted; the best state is reported.
    MaxIterReached,

    /// Stopped through a cancel token; the best state is reported.
    Cancelled,

    /// Numerical failure.
    Failed,
}

impl RegistrationStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, RegistrationStatus::Converged)
    }

    /// No further iterations will run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Converged
                | RegistrationStatus::MaxIterReached
                | RegistrationStatus::Cancelled
                | RegistrationStatus::Failed
        )
    }

    /// Parameters can be used (converged or stopped early at a valid state).
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            RegistrationStatus::Converged
                | RegistrationStatus::MaxIterReached
                | RegistrationStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Initialized => "initialized",
            RegistrationStatus::Iterating => "iterating",
            RegistrationStatus::Converged => "converged",
            RegistrationStatus::MaxIterReached => "max_iter_reached",
            RegistrationStatus::Cancelled => "cancelled",
            RegistrationStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the optimization, threaded by value through the loop.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationState {
    /// Current parameters (estimation frame).
    pub params: TransformationParameters,

    /// Variance the next E-step uses.
    pub sigma2: f64,

    /// Objective at `params` (log-likelihood minus regularization).
    pub log_likelihood: f64,

    /// Completed iterations (0 before the first M-step).
    pub iteration: usize,

    pub status: RegistrationStatus,
}

impl OptimizationState {
    pub fn initial(params: TransformationParameters, sigma2: f64, log_likelihood: f64) -> Self {
        Self {
            params,
            sigma2,
            log_likelihood,
            iteration: 0,
            status: RegistrationStatus::Initialized,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RegistrationConfig::default();
        assert_eq!(config.transform_type, TransformType::Rigid);
        assert_eq!(config.max_iterations, 50);
        assert_eq!(config.tolerance, 1e-3);
        assert_eq!(config.outlier_ratio, 0.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_outlier_weight_one_rejected() {
        let config = RegistrationConfig {
            outlier_ratio: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_non_positive_tolerance_rejected() {
        for tolerance in [0.0, -1e-3, f64::NAN] {
            let config = RegistrationConfig {
                tolerance,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "tolerance {tolerance}");
        }
    }

    #[test]
    fn test_nonrigid_parameters_checked() {
        let mut config = RegistrationConfig::with_transform(TransformType::Nonrigid);
        config.beta = 0.0;
        assert!(config.validate().is_err());

        // Kernel parameters are ignored by parametric models.
        config.transform_type = TransformType::Affine;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_fills_defaults() {
        let config: RegistrationConfig =
            serde_json::from_str(r#"{"transform_type": "affine", "outlier_ratio": 0.2}"#).unwrap();
        assert_eq!(config.transform_type, TransformType::Affine);
        assert_eq!(config.outlier_ratio, 0.2);
        assert_eq!(config.max_iterations, 50);
        assert!(config.normalize);
    }

    #[test]
    fn test_status() {
        assert!(RegistrationStatus::Converged.is_converged());
        assert!(!RegistrationStatus::MaxIterReached.is_converged());
        assert!(RegistrationStatus::MaxIterReached.is_usable());
        assert!(!RegistrationStatus::Failed.is_usable());
        assert!(RegistrationStatus::Cancelled.is_terminal());
        assert!(!RegistrationStatus::Iterating.is_terminal());
        assert_eq!(RegistrationStatus::MaxIterReached.to_string(), "max_iter_reached");
    }
}
