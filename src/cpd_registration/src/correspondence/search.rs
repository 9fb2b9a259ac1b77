//! K-d tree nearest-neighbour search over transformed source points.
//!
//! Used by the truncated E-step: each target only considers its k nearest
//! mixture components. Only 2-D and 3-D clouds are indexed.

use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::DMatrix;

/// Bucket size for the k-d tree.
const BUCKET_SIZE: usize = 256;

/// Balanced tree built once per E-step.
///
/// The immutable variant tolerates any number of points sharing a
/// coordinate (planar scans, grids, duplicated samples).
type Tree<const K: usize> = ImmutableKdTree<f64, u64, K, BUCKET_SIZE>;

/// Nearest-neighbour index over the rows of a point matrix.
#[derive(Debug)]
pub enum NeighborIndex {
    Planar(Tree<2>),
    Spatial(Tree<3>),
}

impl NeighborIndex {
    /// Index the rows of `points`.
    ///
    /// # Returns
    /// `None` when the dimension is not 2 or 3, or the matrix is empty.
    pub fn build(points: &DMatrix<f64>) -> Option<Self> {
        if points.nrows() == 0 {
            return None;
        }
        match points.ncols() {
            2 => {
                let rows: Vec<[f64; 2]> = points.row_iter().map(|r| [r[0], r[1]]).collect();
                let tree: Tree<2> = (&*rows).into();
                Some(NeighborIndex::Planar(tree))
            }
            3 => {
                let rows: Vec<[f64; 3]> = points
                    .row_iter()
                    .map(|r| [r[0], r[1], r[2]])
                    .collect();
                let tree: Tree<3> = (&*rows).into();
                Some(NeighborIndex::Spatial(tree))
            }
            _ => None,
        }
    }

    /// Whether a cloud of this dimension can be indexed.
    pub fn supports_dim(dim: usize) -> bool {
        matches!(dim, 2 | 3)
    }

    /// The `k` nearest indexed points to `query`.
    ///
    /// # Returns
    /// `(index, squared_distance)` pairs, nearest first.
    pub fn nearest(&self, query: &[f64], k: usize) -> Vec<(usize, f64)> {
        if k == 0 {
            return Vec::new();
        }
        let found = match self {
            NeighborIndex::Planar(tree) => {
                tree.nearest_n::<SquaredEuclidean>(&[query[0], query[1]], k)
            }
            NeighborIndex::Spatial(tree) => {
                tree.nearest_n::<SquaredEuclidean>(&[query[0], query[1], query[2]], k)
            }
        };
        found
            .into_iter()
            .map(|nn| (nn.item as usize, nn.distance))
            .collect()
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        match self {
            NeighborIndex::Planar(tree) => tree.size(),
            NeighborIndex::Spatial(tree) => tree.size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
