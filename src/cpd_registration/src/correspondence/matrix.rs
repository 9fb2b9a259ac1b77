//! Correspondence weight matrices.
//!
//! Rows index source points, columns index target points. The dense form
//! is produced by the exact E-step; the truncated E-step produces a
//! column-compressed sparse matrix with at most k entries per column.

use nalgebra::{DMatrix, DVector};

/// Column-compressed sparse correspondence weights.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseCorrespondence {
    nrows: usize,
    ncols: usize,
    /// Start of each column in `row_indices`/`values`; length `ncols + 1`.
    col_offsets: Vec<usize>,
    /// Row index of each stored entry, ascending within a column.
    row_indices: Vec<usize>,
    values: Vec<f64>,
}

impl SparseCorrespondence {
    /// Empty matrix with `nrows` rows and no columns yet.
    pub fn new(nrows: usize) -> Self {
        Self {
            nrows,
            ncols: 0,
            col_offsets: vec![0],
            row_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Append the next column from `(row, value)` pairs in any order.
    pub fn push_column(&mut self, entries: &[(usize, f64)]) {
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|(row, _)| *row);
        for (row, value) in sorted {
            self.row_indices.push(row);
            self.values.push(value);
        }
        self.col_offsets.push(self.row_indices.len());
        self.ncols += 1;
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    /// Number of stored entries.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Stored entries of column `j` as `(row, value)` pairs.
    pub fn column(&self, j: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let range = self.col_offsets[j]..self.col_offsets[j + 1];
        self.row_indices[range.clone()]
            .iter()
            .copied()
            .zip(self.values[range].iter().copied())
    }

    /// Weight at `(i, j)`; zero when not stored.
    pub fn get(&self, i: usize, j: usize) -> f64 {
        if j >= self.ncols {
            return 0.0;
        }
        let range = self.col_offsets[j]..self.col_offsets[j + 1];
        match self.row_indices[range.clone()].binary_search(&i) {
            Ok(pos) => self.values[range.start + pos],
            Err(_) => 0.0,
        }
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let mut dense = DMatrix::zeros(self.nrows, self.ncols);
        for j in 0..self.ncols {
            for (i, v) in self.column(j) {
                dense[(i, j)] = v;
            }
        }
        dense
    }
}

/// Posterior weights between source (rows) and target (columns).
#[derive(Debug, Clone, PartialEq)]
pub enum CorrespondenceMatrix {
    Dense(DMatrix<f64>),
    Sparse(SparseCorrespondence),
}

impl CorrespondenceMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            CorrespondenceMatrix::Dense(m) => m.nrows(),
            CorrespondenceMatrix::Sparse(m) => m.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            CorrespondenceMatrix::Dense(m) => m.ncols(),
            CorrespondenceMatrix::Sparse(m) => m.ncols(),
        }
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        match self {
            CorrespondenceMatrix::Dense(m) => m[(i, j)],
            CorrespondenceMatrix::Sparse(m) => m.get(i, j),
        }
    }

    /// Row sums (mass received by each source point).
    pub fn source_sums(&self) -> DVector<f64> {
        match self {
            CorrespondenceMatrix::Dense(m) => {
                DVector::from_iterator(m.nrows(), m.row_iter().map(|r| r.sum()))
            }
            CorrespondenceMatrix::Sparse(m) => {
                let mut sums = DVector::zeros(m.nrows());
                for j in 0..m.ncols() {
                    for (i, v) in m.column(j) {
                        sums[i] += v;
                    }
                }
                sums
            }
        }
    }

    /// Column sums (matched mass of each target point, ≤ 1).
    pub fn target_sums(&self) -> DVector<f64> {
        match self {
            CorrespondenceMatrix::Dense(m) => {
                DVector::from_iterator(m.ncols(), m.column_iter().map(|c| c.sum()))
            }
            CorrespondenceMatrix::Sparse(m) => DVector::from_iterator(
                m.ncols(),
                (0..m.ncols()).map(|j| m.column(j).map(|(_, v)| v).sum()),
            ),
        }
    }

    /// Stored entries (N·M for dense).
    pub fn nnz(&self) -> usize {
        match self {
            CorrespondenceMatrix::Dense(m) => m.len(),
            CorrespondenceMatrix::Sparse(m) => m.nnz(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, CorrespondenceMatrix::Sparse(_))
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        match self {
            CorrespondenceMatrix::Dense(m) => m.clone(),
            CorrespondenceMatrix::Sparse(m) => m.to_dense(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> SparseCorrespondence {
        let mut sparse = SparseCorrespondence::new(3);
        sparse.push_column(&[(2, 0.25), (0, 0.5)]);
        sparse.push_column(&[]);
        sparse.push_column(&[(1, 0.75)]);
        sparse
    }

    #[test]
    fn test_sparse_get() {
        let sparse = sample();
        assert_eq!(sparse.ncols(), 3);
        assert_eq!(sparse.nnz(), 3);
        assert_relative_eq!(sparse.get(0, 0), 0.5);
        assert_relative_eq!(sparse.get(2, 0), 0.25);
        assert_relative_eq!(sparse.get(1, 0), 0.0);
        assert_relative_eq!(sparse.get(1, 2), 0.75);
        assert_relative_eq!(sparse.get(0, 7), 0.0);
    }

    #[test]
    fn test_sparse_matches_dense() {
        let sparse = CorrespondenceMatrix::Sparse(sample());
        let dense = CorrespondenceMatrix::Dense(sparse.to_dense());

        assert_relative_eq!(sparse.source_sums(), dense.source_sums());
        assert_relative_eq!(sparse.target_sums(), dense.target_sums());
        assert_eq!(dense.nnz(), 9);
        assert!(sparse.is_sparse());
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(sparse.get(i, j), dense.get(i, j));
            }
        }
    }
}
