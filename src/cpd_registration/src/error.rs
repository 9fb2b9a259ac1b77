//! Error types for point set registration.

use thiserror::Error;

use crate::optimization::OptimizationState;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RegistrationError>;

/// Errors raised by registration setup and optimization.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// Empty point set, mismatched dimensionality, non-finite coordinates,
    /// or a degenerate (zero-scale) cloud. Raised before optimization starts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A configuration value is out of range. Raised at setup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// σ² collapsed or a linear solve was singular beyond tolerance.
    ///
    /// Carries the last valid optimization state so the caller can still
    /// inspect how far the run got.
    #[error(
        "numerical instability at iteration {iteration}: {reason} (residual norm {residual_norm:.3e})"
    )]
    NumericalInstability {
        reason: String,
        iteration: usize,
        residual_norm: f64,
        last_state: Option<Box<OptimizationState>>,
    },

    /// The iteration budget ran out before the tolerance was met.
    #[error("no convergence after {iterations} iterations (last |delta| = {last_delta:.3e})")]
    NonConvergence { iterations: usize, last_delta: f64 },
}

impl RegistrationError {
    /// Last valid optimization state attached to a numerical failure.
    pub fn last_state(&self) -> Option<&OptimizationState> {
        match self {
            RegistrationError::NumericalInstability { last_state, .. } => last_state.as_deref(),
            _ => None,
        }
    }

    pub fn is_numerical(&self) -> bool {
        matches!(self, RegistrationError::NumericalInstability { .. })
    }
}

/// Numerical failure detected inside an M-step or a linear solve.
///
/// Lifted into [`RegistrationError::NumericalInstability`] by the optimizer,
/// which knows the iteration and the last valid state.
#[derive(Debug, Clone, PartialEq)]
pub struct Instability {
    pub reason: String,
    pub residual_norm: f64,
}

impl Instability {
    pub fn new(reason: impl Into<String>, residual_norm: f64) -> Self {
        Self {
            reason: reason.into(),
            residual_norm,
        }
    }

    pub(crate) fn into_error(
        self,
        iteration: usize,
        last_state: Option<OptimizationState>,
    ) -> RegistrationError {
        RegistrationError::NumericalInstability {
            reason: self.reason,
            iteration,
            residual_norm: self.residual_norm,
            last_state: last_state.map(Box::new),
        }
    }
}

impl std::fmt::Display for Instability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (residual norm {:.3e})", self.reason, self.residual_norm)
    }
}
