//! Point sets and coordinate normalization.
//!
//! Registration runs on normalized clouds: each cloud is shifted to zero mean
//! and divided by its RMS distance from the centroid, so the optimizer sees
//! well-conditioned coordinates whatever the input units are. The estimated
//! transform is mapped back with
//! [`TransformationParameters::denormalize`](crate::transform::TransformationParameters::denormalize).

use nalgebra::{DMatrix, DVector};

use crate::error::{RegistrationError, Result};

/// Immutable, ordered set of D-dimensional points (one point per row).
#[derive(Debug, Clone, PartialEq)]
pub struct PointSet {
    points: DMatrix<f64>,
}

impl PointSet {
    /// Wrap an N×D matrix.
    ///
    /// Fails on empty sets, zero dimension, or non-finite coordinates.
    pub fn new(points: DMatrix<f64>) -> Result<Self> {
        if points.nrows() == 0 {
            return Err(RegistrationError::InvalidInput("point set is empty".into()));
        }
        if points.ncols() == 0 {
            return Err(RegistrationError::InvalidInput(
                "points must have at least one coordinate".into(),
            ));
        }
        if let Some((idx, _)) = points.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(RegistrationError::InvalidInput(format!(
                "non-finite coordinate in point {}",
                idx % points.nrows()
            )));
        }
        Ok(Self { points })
    }

    /// Build from fixed-size coordinate arrays.
    pub fn from_points<const D: usize>(points: &[[f64; D]]) -> Result<Self> {
        let matrix = DMatrix::from_fn(points.len(), D, |i, j| points[i][j]);
        Self::new(matrix)
    }

    /// Build from variable-length rows; every row must have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(i) = rows.iter().position(|r| r.len() != dim) {
            return Err(RegistrationError::InvalidInput(format!(
                "row {i} has {} coordinates, expected {dim}",
                rows[i].len()
            )));
        }
        Self::new(DMatrix::from_fn(rows.len(), dim, |i, j| rows[i][j]))
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.nrows()
    }

    /// Always false; empty sets are rejected at construction.
    pub fn is_empty(&self) -> bool {
        self.points.nrows() == 0
    }

    /// Dimension of each point.
    pub fn dim(&self) -> usize {
        self.points.ncols()
    }

    /// Coordinates of point `i`.
    pub fn point(&self, i: usize) -> DVector<f64> {
        self.points.row(i).transpose()
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.points
    }

    pub fn into_matrix(self) -> DMatrix<f64> {
        self.points
    }

    /// Mean of all points.
    pub fn centroid(&self) -> DVector<f64> {
        centroid(&self.points)
    }

    /// Shift to zero mean and scale to unit RMS radius.
    pub fn normalize(&self) -> Result<(PointSet, Normalization)> {
        let (scaled, normalization) = normalize(&self.points)?;
        Ok((PointSet { points: scaled }, normalization))
    }

    /// Check that two sets can be registered against each other.
    pub fn check_compatible(&self, other: &PointSet) -> Result<()> {
        if self.dim() != other.dim() {
            return Err(RegistrationError::InvalidInput(format!(
                "dimension mismatch: source has {} coordinates, target has {}",
                self.dim(),
                other.dim()
            )));
        }
        Ok(())
    }
}

/// Centroid and scale removed from a cloud during normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalization {
    pub centroid: DVector<f64>,
    pub scale: f64,
}

impl Normalization {
    /// Normalization that leaves coordinates unchanged.
    pub fn identity(dim: usize) -> Self {
        Self {
            centroid: DVector::zeros(dim),
            scale: 1.0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.centroid.iter().all(|c| *c == 0.0)
    }

    /// Map original coordinates into the normalized frame.
    pub fn apply(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        let inv = 1.0 / self.scale;
        DMatrix::from_fn(points.nrows(), points.ncols(), |i, j| {
            (points[(i, j)] - self.centroid[j]) * inv
        })
    }

    /// Map normalized coordinates back into the original frame.
    pub fn restore(&self, points: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(points.nrows(), points.ncols(), |i, j| {
            points[(i, j)] * self.scale + self.centroid[j]
        })
    }
}

/// Mean of the rows of an N×D matrix.
pub fn centroid(points: &DMatrix<f64>) -> DVector<f64> {
    let mut sum = DVector::zeros(points.ncols());
    for row in points.row_iter() {
        for (d, v) in row.iter().enumerate() {
            sum[d] += v;
        }
    }
    sum / points.nrows().max(1) as f64
}

/// Zero-mean, unit-RMS-radius normalization.
///
/// Returns the scaled points together with the removed centroid and scale.
pub fn normalize(points: &DMatrix<f64>) -> Result<(DMatrix<f64>, Normalization)> {
    if points.nrows() == 0 {
        return Err(RegistrationError::InvalidInput(
            "cannot normalize an empty point set".into(),
        ));
    }
    let center = centroid(points);
    let mut sum_sq = 0.0;
    for row in points.row_iter() {
        for (d, v) in row.iter().enumerate() {
            let diff = v - center[d];
            sum_sq += diff * diff;
        }
    }
    let scale = (sum_sq / points.nrows() as f64).sqrt();
    if scale <= f64::EPSILON || !scale.is_finite() {
        return Err(RegistrationError::InvalidInput(format!(
            "non-positive normalization scale ({scale:.3e}): all points coincide"
        )));
    }
    let normalization = Normalization {
        centroid: center,
        scale,
    };
    Ok((normalization.apply(points), normalization))
}

/// Default initial variance: mean squared distance over all source/target
/// pairs, divided by the dimension.
///
/// Uses `Σ_ij ‖x_i − y_j‖² = M·Σ‖x_i‖² + N·Σ‖y_j‖² − 2·(Σx)·(Σy)`, so the cost
/// is linear in the number of points.
pub fn initial_sigma2(source: &DMatrix<f64>, target: &DMatrix<f64>) -> f64 {
    let n = source.nrows() as f64;
    let m = target.nrows() as f64;
    let dim = source.ncols() as f64;

    let sq_source: f64 = source.iter().map(|v| v * v).sum();
    let sq_target: f64 = target.iter().map(|v| v * v).sum();
    let sum_source = centroid(source) * n;
    let sum_target = centroid(target) * m;

    let total = m * sq_source + n * sq_target - 2.0 * sum_source.dot(&sum_target);
    total.max(0.0) / (dim * n * m)
}
