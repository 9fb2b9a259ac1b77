//! Synthetic point clouds with known ground truth.
//!
//! All generators are seeded so tests are reproducible.

use nalgebra::{DMatrix, Rotation3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// `n` points drawn uniformly from the cube `[-extent, extent]^dim`.
pub fn make_random_cloud(n: usize, dim: usize, extent: f64, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    DMatrix::from_fn(n, dim, |_, _| rng.gen_range(-extent..=extent))
}

/// `n` points drawn from an isotropic Gaussian blob.
pub fn make_gaussian_cloud(n: usize, dim: usize, std_dev: f64, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let Ok(normal) = Normal::new(0.0, std_dev.abs()) else {
        return DMatrix::zeros(n, dim);
    };
    DMatrix::from_fn(n, dim, |_, _| normal.sample(&mut rng))
}

/// Points on a 3-D helix with `turns` turns, a structured shape without symmetries.
pub fn make_helix(n: usize, radius: f64, pitch: f64, turns: f64) -> DMatrix<f64> {
    let steps = n.max(2) - 1;
    DMatrix::from_fn(n, 3, |i, d| {
        let t = turns * std::f64::consts::TAU * i as f64 / steps as f64;
        match d {
            0 => radius * t.cos(),
            1 => radius * t.sin(),
            _ => pitch * t / std::f64::consts::TAU + 0.3 * (2.0 * t).sin(),
        }
    })
}

/// Planar curve `(t, sin t + 0.3·cos 3t)` sampled over `[-span, span]`.
pub fn make_wave_2d(n: usize, span: f64) -> DMatrix<f64> {
    let steps = n.max(2) - 1;
    DMatrix::from_fn(n, 2, |i, d| {
        let t = -span + 2.0 * span * i as f64 / steps as f64;
        match d {
            0 => t,
            _ => t.sin() + 0.3 * (3.0 * t).cos(),
        }
    })
}

/// Rotation by `theta` radians in the plane.
pub fn rotation_2d(theta: f64) -> DMatrix<f64> {
    let (s, c) = theta.sin_cos();
    DMatrix::from_row_slice(2, 2, &[c, -s, s, c])
}

/// Rotation from roll, pitch and yaw (radians).
pub fn rotation_3d(roll: f64, pitch: f64, yaw: f64) -> DMatrix<f64> {
    let r = Rotation3::from_euler_angles(roll, pitch, yaw);
    DMatrix::from_fn(3, 3, |i, j| r[(i, j)])
}

/// `points · Rᵀ · scale + t` for a row-major cloud.
pub fn transform_cloud(
    points: &DMatrix<f64>,
    rotation: &DMatrix<f64>,
    translation: &[f64],
    scale: f64,
) -> DMatrix<f64> {
    let mut out = points * rotation.transpose() * scale;
    for mut row in out.row_iter_mut() {
        for (d, v) in row.iter_mut().enumerate() {
            *v += translation[d];
        }
    }
    out
}

/// Add zero-mean Gaussian noise with standard deviation `std_dev`.
pub fn add_noise(points: &DMatrix<f64>, std_dev: f64, seed: u64) -> DMatrix<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let Ok(normal) = Normal::new(0.0, std_dev.abs()) else {
        return points.clone();
    };
    points.map(|v| v + normal.sample(&mut rng))
}

/// Append `count` uniform outliers drawn from `[-extent, extent]^D`.
pub fn add_outliers(points: &DMatrix<f64>, count: usize, extent: f64, seed: u64) -> DMatrix<f64> {
    let outliers = make_random_cloud(count, points.ncols(), extent, seed);
    let mut out = DMatrix::zeros(points.nrows() + count, points.ncols());
    out.rows_mut(0, points.nrows()).copy_from(points);
    out.rows_mut(points.nrows(), count).copy_from(&outliers);
    out
}

/// Smooth nonrigid deformation: each coordinate is displaced by
/// `amplitude · sin(π·x_next)`, where `x_next` is the following coordinate.
pub fn sine_warp(points: &DMatrix<f64>, amplitude: f64) -> DMatrix<f64> {
    let dim = points.ncols();
    DMatrix::from_fn(points.nrows(), dim, |i, d| {
        let driver = points[(i, (d + 1) % dim)];
        points[(i, d)] + amplitude * (std::f64::consts::PI * driver).sin()
    })
}

/// Largest per-point distance between two equally sized clouds.
pub fn max_point_error(a: &DMatrix<f64>, b: &DMatrix<f64>) -> f64 {
    (a - b)
        .row_iter()
        .map(|r| r.norm())
        .fold(0.0, f64::max)
}
