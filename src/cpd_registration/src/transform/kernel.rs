//! Gaussian kernel matrices.

use nalgebra::DMatrix;
use rayon::prelude::*;

/// `K_ij = exp(−‖a_i − b_j‖² / (2β²))` for the rows of `a` (P×D) and `b` (Q×D).
///
/// Rows are filled in parallel.
pub fn gaussian_kernel(a: &DMatrix<f64>, b: &DMatrix<f64>, beta: f64) -> DMatrix<f64> {
    let rows = a.nrows();
    let cols = b.nrows();
    let dim = a.ncols();
    let inv = 1.0 / (2.0 * beta * beta);

    let mut data = vec![0.0; rows * cols];
    if cols == 0 {
        return DMatrix::zeros(rows, cols);
    }
    data.par_chunks_mut(cols)
        .enumerate()
        .for_each(|(i, out)| {
            for (j, value) in out.iter_mut().enumerate() {
                let mut sq = 0.0;
                for d in 0..dim {
                    let diff = a[(i, d)] - b[(j, d)];
                    sq += diff * diff;
                }
                *value = (-sq * inv).exp();
            }
        });
    DMatrix::from_row_slice(rows, cols, &data)
}
