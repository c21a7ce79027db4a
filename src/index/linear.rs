use ndarray::{Array2, ArrayView1};

use super::{Checks, IndexParams, KnnResults, NearestNeighborIndex, SearchOutcome};
use crate::squared_distance;

/// Exhaustive scan over every indexed point. The search budget is ignored.
#[derive(Debug, Clone)]
pub struct LinearIndex {
    points: Array2<f32>,
}

impl LinearIndex {
    pub fn new(points: Array2<f32>) -> Self {
        Self { points }
    }
}

impl NearestNeighborIndex for LinearIndex {
    fn params(&self) -> IndexParams {
        IndexParams::Linear
    }

    fn len(&self) -> usize {
        self.points.nrows()
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize, _checks: Checks) -> SearchOutcome {
        let mut results = KnnResults::new(k);
        for (row, point) in self.points.rows().into_iter().enumerate() {
            results.insert(row, squared_distance(query, point));
        }
        SearchOutcome {
            neighbors: results.into_vec(),
            evaluations: self.points.nrows(),
        }
    }

    fn build_evaluations(&self) -> usize {
        0
    }

    fn memory_bytes(&self) -> usize {
        0
    }
}
