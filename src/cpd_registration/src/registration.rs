//! High-level registration API.
//!
//! [`CpdRegistration`] and [`SvrRegistration`] validate their configuration,
//! normalize both clouds, run the shared EM loop and map the result back into
//! the caller's coordinate frames.

use tracing::{debug, info};

use crate::correspondence::{CorrespondenceConfig, CorrespondenceMatrix, GmmPosterior};
use crate::error::{RegistrationError, Result};
use crate::optimization::{
    CancelToken, EmOptimizer, EmSettings, IterationObserver, NoopObserver, OptimizationOutcome,
    RegistrationConfig, RegistrationHistory, RegistrationStatus,
};
use crate::point_set::{initial_sigma2, Normalization, PointSet};
use crate::svr::{SupportVectorWeights, SvrConfig};
use crate::transform::{build_model, TransformType, TransformationParameters};

/// Result of a registration run.
#[derive(Debug, Clone)]
pub struct Registration {
    /// Transform from the original source frame to the original target frame.
    pub transformation: TransformationParameters,
    /// Transform between the normalized clouds.
    pub normalized_transformation: TransformationParameters,
    /// Source points moved by `transformation`.
    pub aligned: PointSet,
    /// Final correspondence weights (sources × targets), when retained.
    pub correspondence: Option<CorrespondenceMatrix>,
    pub status: RegistrationStatus,
    /// Index of the reported iteration.
    pub iterations: usize,
    /// Final variance in target units.
    pub sigma2: f64,
    /// Final objective (normalized frame).
    pub log_likelihood: f64,
    pub history: RegistrationHistory,
}

impl Registration {
    pub fn is_converged(&self) -> bool {
        self.status.is_converged()
    }

    /// Fail with `NonConvergence` unless the run converged.
    pub fn ensure_converged(&self) -> Result<&Self> {
        if self.is_converged() {
            return Ok(self);
        }
        let last_delta = self
            .history
            .last()
            .map(|r| r.delta.abs())
            .unwrap_or(f64::INFINITY);
        Err(RegistrationError::NonConvergence {
            iterations: self.history.iterations.len(),
            last_delta,
        })
    }
}

/// Both clouds in the frame the optimizer works in.
struct Prepared {
    source: PointSet,
    target: PointSet,
    source_frame: Normalization,
    target_frame: Normalization,
}

/// Move both clouds into the optimizer's frame.
///
/// Each cloud loses its own centroid. With `shared_scale` both are divided by
/// the target's RMS radius, so a transform whose scale is pinned to 1 keeps
/// that scale after denormalization.
fn prepare(
    source: &PointSet,
    target: &PointSet,
    normalize: bool,
    shared_scale: bool,
) -> Result<Prepared> {
    source.check_compatible(target)?;
    if normalize {
        let (target_n, target_frame) = target.normalize()?;
        let (source_n, source_frame) = if shared_scale {
            let frame = Normalization {
                centroid: source.centroid(),
                scale: target_frame.scale,
            };
            (PointSet::new(frame.apply(source.as_matrix()))?, frame)
        } else {
            source.normalize()?
        };
        debug!(
            "normalized clouds: source scale {:.4e}, target scale {:.4e}",
            source_frame.scale, target_frame.scale
        );
        Ok(Prepared {
            source: source_n,
            target: target_n,
            source_frame,
            target_frame,
        })
    } else {
        let dim = source.dim();
        Ok(Prepared {
            source: source.clone(),
            target: target.clone(),
            source_frame: Normalization::identity(dim),
            target_frame: Normalization::identity(dim),
        })
    }
}

fn finish(
    outcome: OptimizationOutcome,
    source: &PointSet,
    prepared: &Prepared,
) -> Result<Registration> {
    let normalized_transformation = outcome.state.params;
    let transformation =
        normalized_transformation.denormalize(&prepared.source_frame, &prepared.target_frame);
    let aligned = PointSet::new(transformation.apply(source.as_matrix()))?;
    let target_scale = prepared.target_frame.scale;

    Ok(Registration {
        transformation,
        normalized_transformation,
        aligned,
        correspondence: outcome.expectation.matrix,
        status: outcome.state.status,
        iterations: outcome.state.iteration,
        sigma2: outcome.state.sigma2 * target_scale * target_scale,
        log_likelihood: outcome.state.log_likelihood,
        history: outcome.history,
    })
}

/// Coherent Point Drift registration.
///
/// # Example
///
/// ```
/// use cpd_registration::{CpdRegistration, PointSet, TransformType};
///
/// let target = PointSet::from_points(&[[0.0, 0.0], [1.0, 0.0], [0.0, 2.0], [1.5, 1.0]])?;
/// let source = PointSet::from_points(&[[1.0, 2.0], [2.0, 2.0], [1.0, 4.0], [2.5, 3.0]])?;
///
/// let cpd = CpdRegistration::builder()
///     .transform_type(TransformType::Rigid)
///     .tolerance(1e-8)
///     .build()?;
/// let result = cpd.register(&source, &target)?;
/// assert!(result.status.is_usable());
/// # Ok::<(), cpd_registration::RegistrationError>(())
/// ```
#[derive(Debug, Clone)]
pub struct CpdRegistration {
    config: RegistrationConfig,
}

impl CpdRegistration {
    /// Default configuration for `transform_type`.
    pub fn new(transform_type: TransformType) -> Self {
        Self {
            config: RegistrationConfig::with_transform(transform_type),
        }
    }

    /// Validated custom configuration.
    pub fn with_config(config: RegistrationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn builder() -> CpdRegistrationBuilder {
        CpdRegistrationBuilder::new()
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    /// Register `source` onto `target`.
    pub fn register(&self, source: &PointSet, target: &PointSet) -> Result<Registration> {
        self.register_with(source, target, &mut NoopObserver, None)
    }

    /// Register with a per-iteration observer and an optional cancel token.
    pub fn register_with(
        &self,
        source: &PointSet,
        target: &PointSet,
        observer: &mut dyn IterationObserver,
        cancel: Option<&CancelToken>,
    ) -> Result<Registration> {
        let config = &self.config;
        config.validate()?;
        if config.use_acceleration && !matches!(source.dim(), 2 | 3) {
            return Err(RegistrationError::Configuration(format!(
                "accelerated E-step supports 2-D and 3-D points, got {}-D",
                source.dim()
            )));
        }
        let prepared = prepare(source, target, config.normalize, config.fixes_scale())?;
        let source_n = prepared.source.as_matrix();
        let target_n = prepared.target.as_matrix();

        let target_scale = prepared.target_frame.scale;
        let sigma2 = match config.initial_sigma2 {
            Some(s) => s / (target_scale * target_scale),
            None => initial_sigma2(source_n, target_n),
        };
        if sigma2 <= 0.0 || !sigma2.is_finite() {
            return Err(RegistrationError::InvalidInput(format!(
                "initial sigma2 must be positive, got {sigma2:.3e}"
            )));
        }

        let model = build_model(
            config.transform_type,
            source_n,
            config.lambda,
            config.beta,
            config.estimate_scale,
        );
        let estimator = GmmPosterior::new(CorrespondenceConfig {
            outlier_ratio: config.outlier_ratio,
            use_acceleration: config.use_acceleration,
            neighbors: config.acceleration_neighbors,
            batch_size: config.batch_size,
        });
        info!(
            "CPD {} registration: {} source points, {} target points, {}-D, w={}",
            config.transform_type,
            source.len(),
            target.len(),
            source.dim(),
            config.outlier_ratio
        );

        let optimizer = EmOptimizer::new(
            model.as_ref(),
            &estimator,
            EmSettings {
                tolerance: config.tolerance,
                max_iterations: config.max_iterations,
                retain_matrix: config.retain_correspondence,
            },
        );
        let outcome = optimizer.run(source_n, target_n, sigma2, observer, cancel)?;
        finish(outcome, source, &prepared)
    }
}

impl Default for CpdRegistration {
    fn default() -> Self {
        Self::new(TransformType::Rigid)
    }
}

/// Builder for [`CpdRegistration`].
#[derive(Debug, Clone, Default)]
pub struct CpdRegistrationBuilder {
    config: RegistrationConfig,
}

impl CpdRegistrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform_type(mut self, transform_type: TransformType) -> Self {
        self.config.transform_type = transform_type;
        self
    }

    /// Outlier weight w in [0, 1).
    pub fn outlier_ratio(mut self, w: f64) -> Self {
        self.config.outlier_ratio = w;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn lambda(mut self, lambda: f64) -> Self {
        self.config.lambda = lambda;
        self
    }

    pub fn beta(mut self, beta: f64) -> Self {
        self.config.beta = beta;
        self
    }

    /// Starting variance in target units.
    pub fn initial_sigma2(mut self, sigma2: f64) -> Self {
        self.config.initial_sigma2 = Some(sigma2);
        self
    }

    /// Truncate posteriors to the `neighbors` nearest sources per target.
    pub fn acceleration(mut self, neighbors: usize) -> Self {
        self.config.use_acceleration = true;
        self.config.acceleration_neighbors = neighbors;
        self
    }

    pub fn estimate_scale(mut self, estimate_scale: bool) -> Self {
        self.config.estimate_scale = estimate_scale;
        self
    }

    pub fn normalize(mut self, normalize: bool) -> Self {
        self.config.normalize = normalize;
        self
    }

    pub fn retain_correspondence(mut self, retain: bool) -> Self {
        self.config.retain_correspondence = retain;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn build(self) -> Result<CpdRegistration> {
        CpdRegistration::with_config(self.config)
    }
}

/// Support Vector Registration.
#[derive(Debug, Clone)]
pub struct SvrRegistration {
    config: SvrConfig,
}

impl SvrRegistration {
    pub fn new(transform_type: TransformType) -> Self {
        Self {
            config: SvrConfig::with_transform(transform_type),
        }
    }

    pub fn with_config(config: SvrConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn builder() -> SvrRegistrationBuilder {
        SvrRegistrationBuilder::new()
    }

    pub fn config(&self) -> &SvrConfig {
        &self.config
    }

    pub fn register(&self, source: &PointSet, target: &PointSet) -> Result<Registration> {
        self.register_with(source, target, &mut NoopObserver, None)
    }

    /// Fit support vectors to both clouds, then align their mixtures.
    ///
    /// The correspondence matrix, when retained, is indexed by support
    /// vectors rather than by the original points.
    pub fn register_with(
        &self,
        source: &PointSet,
        target: &PointSet,
        observer: &mut dyn IterationObserver,
        cancel: Option<&CancelToken>,
    ) -> Result<Registration> {
        let config = &self.config;
        config.validate()?;
        let prepared = prepare(source, target, config.normalize, config.fixes_scale())?;
        let dim = source.dim();

        let svm = config.one_class_svm();
        let source_sv = svm.fit(prepared.source.as_matrix())?;
        let target_sv = svm.fit(prepared.target.as_matrix())?;
        for (name, sv) in [("source", &source_sv), ("target", &target_sv)] {
            if sv.len() <= dim {
                return Err(RegistrationError::InvalidInput(format!(
                    "{name} has {} support vectors, need at least {} for {dim}-D registration (raise nu)",
                    sv.len(),
                    dim + 1
                )));
            }
        }
        let source_points = source_sv.select(prepared.source.as_matrix());
        let target_points = target_sv.select(prepared.target.as_matrix());
        info!(
            "SVR {} registration: {} of {} source and {} of {} target points are support vectors",
            config.transform_type,
            source_sv.len(),
            source.len(),
            target_sv.len(),
            target.len()
        );

        let model = build_model(
            config.transform_type,
            &source_points,
            config.lambda,
            config.beta,
            config.estimate_scale,
        );
        let estimator = SupportVectorWeights::new(
            source_sv.weights,
            target_sv.weights,
            config.kernel_width,
            config.annealing_rate,
        );
        let sigma2 = estimator.starting_sigma2(initial_sigma2(&source_points, &target_points));

        let optimizer = EmOptimizer::new(
            model.as_ref(),
            &estimator,
            EmSettings {
                tolerance: config.tolerance,
                max_iterations: config.max_iterations,
                retain_matrix: config.retain_correspondence,
            },
        );
        let outcome = optimizer.run(&source_points, &target_points, sigma2, observer, cancel)?;
        finish(outcome, source, &prepared)
    }
}

impl Default for SvrRegistration {
    fn default() -> Self {
        Self::new(TransformType::Rigid)
    }
}

/// Builder for [`SvrRegistration`].
#[derive(Debug, Clone, Default)]
pub struct SvrRegistrationBuilder {
    config: SvrConfig,
}

impl SvrRegistrationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transform_type(mut self, transform_type: TransformType) -> Self {
        self.config.transform_type = transform_type;
        self
    }

    pub fn nu(mut self, nu: f64) -> Self {
        self.config.nu = nu;
        self
    }

    pub fn kernel_width(mut self, h: f64) -> Self {
        self.config.kernel_width = h;
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn lambda(mut self, lambda: f64) -> Self {
        self.config.lambda = lambda;
        self
    }

    pub fn beta(mut self, beta: f64) -> Self {
        self.config.beta = beta;
        self
    }

    pub fn estimate_scale(mut self, estimate_scale: bool) -> Self {
        self.config.estimate_scale = estimate_scale;
        self
    }

    pub fn normalize(mut self, normalize: bool) -> Self {
        self.config.normalize = normalize;
        self
    }

    pub fn annealing_rate(mut self, rate: Option<f64>) -> Self {
        self.config.annealing_rate = rate;
        self
    }

    pub fn retain_correspondence(mut self, retain: bool) -> Self {
        self.config.retain_correspondence = retain;
        self
    }

    pub fn build(self) -> Result<SvrRegistration> {
        SvrRegistration::with_config(self.config)
    }
}

/// One-shot CPD registration with the given outlier weight and loop limits.
pub fn registration_cpd(
    source: &PointSet,
    target: &PointSet,
    transform_type: TransformType,
    w: f64,
    max_iterations: usize,
    tolerance: f64,
) -> Result<Registration> {
    CpdRegistration::builder()
        .transform_type(transform_type)
        .outlier_ratio(w)
        .max_iterations(max_iterations)
        .tolerance(tolerance)
        .build()?
        .register(source, target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_wave_2d, rotation_2d, transform_cloud};
    use approx::assert_relative_eq;

    #[test]
    fn test_builder_rejects_bad_config() {
        assert!(matches!(
            CpdRegistration::builder().outlier_ratio(1.0).build(),
            Err(RegistrationError::Configuration(_))
        ));
        assert!(matches!(
            SvrRegistration::builder().nu(2.0).build(),
            Err(RegistrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_dimension_mismatch() {
        let a = PointSet::from_points(&[[0.0, 0.0], [1.0, 1.0]]).unwrap();
        let b = PointSet::from_points(&[[0.0, 0.0, 0.0], [1.0, 1.0, 1.0]]).unwrap();
        let err = CpdRegistration::default().register(&a, &b).unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidInput(_)));
    }

    #[test]
    fn test_acceleration_rejects_high_dimension() {
        let a = PointSet::from_rows(&[vec![0.0; 4], vec![1.0; 4]]).unwrap();
        let cpd = CpdRegistration::builder().acceleration(4).build().unwrap();
        assert!(matches!(
            cpd.register(&a, &a),
            Err(RegistrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_rotation_2d_original_frame() {
        let points = make_wave_2d(40, 3.0);
        let target = transform_cloud(&points, &rotation_2d(0.3), &[5.0, -2.0], 10.0);
        let source = PointSet::new(points).unwrap();
        let target = PointSet::new(target).unwrap();

        let result = CpdRegistration::builder()
            .tolerance(1e-10)
            .max_iterations(200)
            .build()
            .unwrap()
            .register(&source, &target)
            .unwrap();
        let rigid = result.transformation.as_rigid().unwrap();
        assert_relative_eq!(rigid.scale, 10.0, epsilon = 1e-3);
        assert_relative_eq!(rigid.rotation, rotation_2d(0.3), epsilon = 1e-4);
        assert_relative_eq!(result.aligned.as_matrix(), target.as_matrix(), epsilon = 1e-2);
    }

    #[test]
    fn test_shared_scale_frames() {
        let points = make_wave_2d(30, 3.0);
        let source = PointSet::new(points.rows(0, 12).into_owned()).unwrap();
        let target = PointSet::new(transform_cloud(&points, &rotation_2d(0.2), &[1.0, 2.0], 1.0))
            .unwrap();

        let separate = prepare(&source, &target, true, false).unwrap();
        assert!(separate.source_frame.scale != separate.target_frame.scale);

        let shared = prepare(&source, &target, true, true).unwrap();
        assert_eq!(shared.source_frame.scale, shared.target_frame.scale);
        assert_relative_eq!(shared.source_frame.centroid, source.centroid(), epsilon = 1e-12);
        assert_relative_eq!(shared.source.centroid().norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_ensure_converged_reports_budget() {
        let points = make_wave_2d(30, 3.0);
        let target = transform_cloud(&points, &rotation_2d(0.4), &[0.5, 0.0], 1.0);
        let result = CpdRegistration::builder()
            .max_iterations(1)
            .tolerance(1e-12)
            .build()
            .unwrap()
            .register(&PointSet::new(points).unwrap(), &PointSet::new(target).unwrap())
            .unwrap();
        assert_eq!(result.status, RegistrationStatus::MaxIterReached);
        assert!(matches!(
            result.ensure_converged(),
            Err(RegistrationError::NonConvergence { iterations: 1, .. })
        ));
    }
}
