//! Probabilistic point set registration.
//!
//! This library aligns a moving (source) point set to a fixed (target) point
//! set with Coherent Point Drift, an expectation-maximization scheme that
//! treats the source points as centroids of a Gaussian mixture, and with
//! Support Vector Registration, which first summarizes each cloud by the
//! support vectors of a one-class SVM.
//!
//! # Architecture
//!
//! Registration is split into phases:
//! - Normalization: both clouds are moved to zero mean and unit RMS radius
//!   (a fixed-scale rigid run divides both by the target's radius)
//! - E-step: posterior correspondence weights (dense, or truncated to nearest
//!   neighbours through a k-d tree)
//! - M-step: rigid, affine or nonrigid parameter update and new σ²
//! - Denormalization of the final transform into the caller's frames
//!
//! # Usage
//!
//! ```
//! use cpd_registration::{CpdRegistration, PointSet, TransformType};
//!
//! let target = PointSet::from_points(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 2.0]])?;
//! let source = PointSet::from_points(&[[1.0, 2.0, 3.0], [2.0, 2.0, 3.0], [1.0, 3.0, 3.0], [1.0, 2.0, 5.0]])?;
//!
//! let result = CpdRegistration::new(TransformType::Rigid).register(&source, &target)?;
//! println!("status: {}, sigma2: {:.3e}", result.status, result.sigma2);
//! # Ok::<(), cpd_registration::RegistrationError>(())
//! ```

pub mod correspondence;
pub mod error;
pub mod optimization;
pub mod point_set;
pub mod registration;
pub mod svr;
pub mod test_utils;
pub mod transform;

pub use correspondence::{
    CorrespondenceConfig, CorrespondenceMatrix, CorrespondenceStats, Expectation, GmmPosterior,
    NeighborIndex, SparseCorrespondence, WeightEstimator,
};
pub use error::{RegistrationError, Result};
pub use optimization::{
    CancelToken, EmOptimizer, EmSettings, IterationObserver, IterationRecord, NoopObserver,
    OptimizationOutcome, OptimizationState, RegistrationConfig, RegistrationHistory,
    RegistrationStatus,
};
pub use point_set::{Normalization, PointSet};
pub use svr::{OneClassSvm, SupportVectorWeights, SupportVectors, SvrConfig};
pub use transform::{
    AffineModel, AffineParams, NonrigidModel, NonrigidParams, RigidModel, RigidParams,
    TransformModel, TransformType, TransformationParameters,
};

// High-level API (recommended for most users)
pub use registration::{
    registration_cpd, CpdRegistration, CpdRegistrationBuilder, Registration, SvrRegistration,
    SvrRegistrationBuilder,
};
