//! Expectation-maximization loop for probabilistic registration.
//!
//! This module implements the optimization shared by every estimator:
//! 1. Transform source points with the current parameters
//! 2. E-step: correspondence weights and objective
//! 3. M-step: closed-form or regularized parameter fit, σ² update
//! 4. Check |ΔL| < tolerance, cancellation and the iteration budget
//!
//! Based on Myronenko & Song 2010, "Point Set Registration: Coherent Point Drift".

pub mod debug;
pub mod linalg;
pub mod observer;
pub mod solver;
pub mod types;

pub use debug::{IterationRecord, RegistrationHistory};
pub use linalg::{condition_number, solve_linear};
pub use observer::{CancelToken, IterationObserver, NoopObserver};
pub use solver::{EmOptimizer, EmSettings, OptimizationOutcome};
pub use types::{
    OptimizationState, RegistrationConfig, RegistrationStatus, CONDITION_WARNING_THRESHOLD,
    LINEAR_RESIDUAL_TOLERANCE, NEGATIVE_SIGMA2_TOLERANCE, SIGMA2_FLOOR,
};
