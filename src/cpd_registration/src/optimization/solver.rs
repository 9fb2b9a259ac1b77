//! EM optimization loop.
//!
//! This module implements the outer loop shared by CPD and SVR:
//! 1. E-step at the initial parameters (baseline objective)
//! 2. M-step: fit parameters and σ² to the current weights
//! 3. E-step at the new parameters: objective of the fit and the weights
//!    the next M-step consumes
//! 4. Notify the observer and check |ΔL| < tolerance
//!
//! The loop owns its [`OptimizationState`] and threads it by value; nothing
//! outside a single run is mutated.

use std::time::Instant;

use nalgebra::DMatrix;
use tracing::{debug, info, warn};

use super::debug::{IterationRecord, RegistrationHistory};
use super::observer::{CancelToken, IterationObserver};
use super::types::{OptimizationState, RegistrationStatus};
use crate::correspondence::{Expectation, WeightEstimator};
use crate::error::{Instability, Result};
use crate::transform::{TransformModel, TransformationParameters};

/// Loop limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmSettings {
    /// Convergence threshold on |ΔL|.
    pub tolerance: f64,
    /// Maximum number of iterations.
    pub max_iterations: usize,
    /// Compute the full weight matrix for the final state.
    pub retain_matrix: bool,
}

/// Everything a finished run produces (estimation frame).
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Final state: the converged one, or the best one seen when stopped early.
    pub state: OptimizationState,
    /// E-step at the final parameters.
    pub expectation: Expectation,
    /// Source transformed by the final parameters.
    pub transformed: DMatrix<f64>,
    pub history: RegistrationHistory,
}

/// Alternates a weight estimator and a transformation model until convergence.
pub struct EmOptimizer<'a> {
    model: &'a dyn TransformModel,
    estimator: &'a dyn WeightEstimator,
    settings: EmSettings,
}

impl<'a> EmOptimizer<'a> {
    pub fn new(
        model: &'a dyn TransformModel,
        estimator: &'a dyn WeightEstimator,
        settings: EmSettings,
    ) -> Self {
        Self {
            model,
            estimator,
            settings,
        }
    }

    pub fn settings(&self) -> &EmSettings {
        &self.settings
    }

    fn objective(&self, expectation: &Expectation, params: &TransformationParameters) -> f64 {
        expectation.log_likelihood - self.model.penalty(params)
    }

    /// Register `source` onto `target` starting from σ² = `initial_sigma2`.
    ///
    /// # Arguments
    /// * `source` - Moving points (N×D)
    /// * `target` - Fixed points (M×D)
    /// * `initial_sigma2` - Starting variance (> 0)
    /// * `observer` - Called once per completed iteration
    /// * `cancel` - Polled once per iteration
    ///
    /// # Returns
    /// The final state with its E-step and history, or a
    /// `NumericalInstability` error carrying the last valid state.
    pub fn run(
        &self,
        source: &DMatrix<f64>,
        target: &DMatrix<f64>,
        initial_sigma2: f64,
        observer: &mut dyn IterationObserver,
        cancel: Option<&CancelToken>,
    ) -> Result<OptimizationOutcome> {
        let run_start = Instant::now();
        let mut history = RegistrationHistory::new(
            self.model.transform_type().as_str(),
            source.nrows(),
            target.nrows(),
        );

        let params = self.model.initial_parameters(source);
        let mut transformed = self.model.transform_source(source, &params);
        let mut expectation = self
            .estimator
            .estimate(&transformed, target, initial_sigma2, false)
            .map_err(|e| e.into_error(0, None))?;
        let initial_objective = self.objective(&expectation, &params);

        let mut state = OptimizationState::initial(params, initial_sigma2, initial_objective);
        history.initial_sigma2 = initial_sigma2;
        history.initial_log_likelihood = initial_objective;
        let mut best = state.clone();

        state.status = RegistrationStatus::Iterating;
        let mut cancelled = false;

        for iteration in 1..=self.settings.max_iterations {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
                break;
            }

            let m_start = Instant::now();
            let maximized = self
                .model
                .maximize(source, target, &expectation.stats, state.sigma2)
                .map_err(|e| fail(e, iteration, &state))?;
            let maximization_ms = m_start.elapsed().as_secs_f64() * 1000.0;

            let sigma2 = self.estimator.next_sigma2(maximized.sigma2, state.sigma2);
            let next_transformed = self.model.transform_source(source, &maximized.params);

            let e_start = Instant::now();
            let next_expectation = self
                .estimator
                .estimate(&next_transformed, target, sigma2, false)
                .map_err(|e| fail(e, iteration, &state))?;
            let expectation_ms = e_start.elapsed().as_secs_f64() * 1000.0;

            let objective = self.objective(&next_expectation, &maximized.params);
            let delta = objective - state.log_likelihood;

            state = OptimizationState {
                params: maximized.params,
                sigma2,
                log_likelihood: objective,
                iteration,
                status: RegistrationStatus::Iterating,
            };
            transformed = next_transformed;
            expectation = next_expectation;

            debug!(
                "iteration {iteration}: sigma2={sigma2:.6e} objective={objective:.6} delta={delta:.3e}"
            );
            history.push(IterationRecord {
                iteration,
                sigma2,
                log_likelihood: objective,
                delta,
                weight_mass: expectation.stats.n_p,
                expectation_ms,
                maximization_ms,
            });

            // Objectives are only comparable once σ² has settled.
            let settled = self.estimator.allows_convergence(sigma2);
            if !settled || best.iteration == 0 || objective > best.log_likelihood {
                best = state.clone();
            }

            let converged = settled && delta.abs() < self.settings.tolerance;
            if converged {
                state.status = RegistrationStatus::Converged;
            }
            observer.on_iteration(&state);
            if converged {
                break;
            }
        }

        if !state.status.is_terminal() {
            let status = if cancelled {
                RegistrationStatus::Cancelled
            } else {
                RegistrationStatus::MaxIterReached
            };
            if best.iteration != state.iteration {
                debug!(
                    "reverting from iteration {} to best iteration {}",
                    state.iteration, best.iteration
                );
                transformed = self.model.transform_source(source, &best.params);
                expectation = self
                    .estimator
                    .estimate(&transformed, target, best.sigma2, false)
                    .map_err(|e| fail(e, state.iteration, &best))?;
                state = best;
            }
            state.status = status;
            if status == RegistrationStatus::MaxIterReached {
                warn!(
                    "no convergence after {} iterations, keeping iteration {}",
                    self.settings.max_iterations, state.iteration
                );
            }
        }

        if self.settings.retain_matrix {
            expectation = self
                .estimator
                .estimate(&transformed, target, state.sigma2, true)
                .map_err(|e| fail(e, state.iteration, &state))?;
        }

        history.status = state.status.to_string();
        history.total_ms = run_start.elapsed().as_secs_f64() * 1000.0;
        info!(
            "{} registration finished: status={} iterations={} sigma2={:.6e}",
            self.model.transform_type(),
            state.status,
            history.iterations.len(),
            state.sigma2
        );

        Ok(OptimizationOutcome {
            state,
            expectation,
            transformed,
            history,
        })
    }
}

fn fail(
    instability: Instability,
    iteration: usize,
    last_valid: &OptimizationState,
) -> crate::error::RegistrationError {
    warn!("numerical failure at iteration {iteration}: {instability}");
    let mut last = last_valid.clone();
    last.status = RegistrationStatus::Failed;
    instability.into_error(iteration, Some(last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correspondence::{CorrespondenceConfig, GmmPosterior};
    use crate::error::RegistrationError;
    use crate::optimization::observer::NoopObserver;
    use crate::point_set::initial_sigma2;
    use crate::test_utils::{make_helix, rotation_3d, transform_cloud};
    use crate::transform::{AffineModel, RigidModel};

    fn settings(max_iterations: usize) -> EmSettings {
        EmSettings {
            tolerance: 1e-8,
            max_iterations,
            retain_matrix: false,
        }
    }

    fn rotated_helix() -> (DMatrix<f64>, DMatrix<f64>) {
        let source = make_helix(60, 1.0, 0.6, 1.5);
        let target = transform_cloud(&source, &rotation_3d(0.2, -0.1, 0.3), &[0.2, -0.1, 0.05], 1.0);
        (source, target)
    }

    #[test]
    fn test_objective_non_decreasing_rigid_and_affine() {
        let (source, target) = rotated_helix();
        let sigma2 = initial_sigma2(&source, &target);
        let estimator = GmmPosterior::new(CorrespondenceConfig {
            outlier_ratio: 0.1,
            ..Default::default()
        });
        let rigid = RigidModel::new(true);
        let affine = AffineModel::new();
        let models: [&dyn TransformModel; 2] = [&rigid, &affine];

        for model in models {
            let optimizer = EmOptimizer::new(model, &estimator, settings(30));
            let outcome = optimizer
                .run(&source, &target, sigma2, &mut NoopObserver, None)
                .unwrap();
            let values = outcome.history.log_likelihoods();
            for pair in values.windows(2) {
                assert!(
                    pair[1] >= pair[0] - 1e-6 * pair[0].abs().max(1.0),
                    "{}: objective decreased {} -> {}",
                    model.transform_type(),
                    pair[0],
                    pair[1]
                );
            }
        }
    }

    #[test]
    fn test_observer_sees_every_iteration() {
        let (source, target) = rotated_helix();
        let estimator = GmmPosterior::default();
        let model = RigidModel::new(true);
        let optimizer = EmOptimizer::new(&model, &estimator, settings(5));

        let mut iterations = Vec::new();
        let mut observer = |state: &OptimizationState| iterations.push(state.iteration);
        let outcome = optimizer
            .run(&source, &target, 1.0, &mut observer, None)
            .unwrap();
        assert_eq!(iterations, (1..=outcome.history.iterations.len()).collect::<Vec<_>>());
    }

    #[test]
    fn test_max_iterations_reports_best_state() {
        let (source, target) = rotated_helix();
        let estimator = GmmPosterior::default();
        let model = RigidModel::new(true);
        let optimizer = EmOptimizer::new(&model, &estimator, settings(2));
        let outcome = optimizer
            .run(&source, &target, 1.0, &mut NoopObserver, None)
            .unwrap();
        assert_eq!(outcome.state.status, RegistrationStatus::MaxIterReached);
        assert_eq!(outcome.history.iterations.len(), 2);
        let best = outcome
            .history
            .iterations
            .iter()
            .map(|r| r.log_likelihood)
            .fold(f64::NEG_INFINITY, f64::max);
        assert_eq!(outcome.state.log_likelihood, best);
    }

    #[test]
    fn test_cancel_before_first_iteration() {
        let (source, target) = rotated_helix();
        let estimator = GmmPosterior::default();
        let model = RigidModel::new(true);
        let optimizer = EmOptimizer::new(&model, &estimator, settings(50));

        let token = CancelToken::new();
        token.cancel();
        let outcome = optimizer
            .run(&source, &target, 1.0, &mut NoopObserver, Some(&token))
            .unwrap();
        assert_eq!(outcome.state.status, RegistrationStatus::Cancelled);
        assert_eq!(outcome.state.iteration, 0);
        assert!(outcome.history.iterations.is_empty());
    }

    #[test]
    fn test_cancel_from_observer() {
        let (source, target) = rotated_helix();
        let estimator = GmmPosterior::default();
        let model = RigidModel::new(true);
        let optimizer = EmOptimizer::new(&model, &estimator, settings(50));

        let token = CancelToken::new();
        let handle = token.clone();
        let mut observer = move |state: &OptimizationState| {
            if state.iteration == 3 {
                handle.cancel();
            }
        };
        let outcome = optimizer
            .run(&source, &target, 1.0, &mut observer, Some(&token))
            .unwrap();
        assert_eq!(outcome.state.status, RegistrationStatus::Cancelled);
        assert_eq!(outcome.history.iterations.len(), 3);
    }

    #[test]
    fn test_degenerate_affine_surfaces_instability() {
        // All source points on a line: the affine system is singular.
        let source = DMatrix::from_fn(10, 2, |i, d| if d == 0 { i as f64 } else { 0.0 });
        let target = DMatrix::from_fn(10, 2, |i, d| i as f64 * if d == 0 { 1.0 } else { 0.5 });
        let estimator = GmmPosterior::default();
        let model = AffineModel::new();
        let optimizer = EmOptimizer::new(&model, &estimator, settings(10));

        let err = optimizer
            .run(&source, &target, 1.0, &mut NoopObserver, None)
            .unwrap_err();
        match &err {
            RegistrationError::NumericalInstability { iteration, .. } => assert_eq!(*iteration, 1),
            other => panic!("unexpected error {other}"),
        }
        let last = err.last_state().unwrap();
        assert_eq!(last.status, RegistrationStatus::Failed);
        assert_eq!(last.iteration, 0);
    }
}
