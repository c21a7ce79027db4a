//! Nearest-neighbour search over the centroid set.
//!
//! The clustering engine only needs a narrow capability: build an index over a
//! small matrix of points, optionally let it pick its own family and search
//! effort for a target precision, then answer nearest-neighbour queries. That
//! capability is the [`IndexBackend`] trait; [`DefaultIndexBackend`] provides
//! a linear scan, a randomized k-d forest and a hierarchical k-means tree.

use std::cmp::Ordering;
use std::fmt;

use ndarray::{Array2, ArrayView1};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::{CodebookError, Result};

mod autotune;
mod kdtree;
mod kmeans_tree;
mod linear;

pub use autotune::AutotuneSettings;
pub use kdtree::KdForest;
pub use kmeans_tree::KMeansTree;
pub use linear::LinearIndex;

/// Search-effort budget: how many leaf points a query may examine before it
/// stops exploring further branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Checks {
    /// Explore every branch the bounds cannot rule out.
    Unlimited,
    /// Stop after roughly this many points have been examined.
    Bounded(usize),
}

impl Checks {
    pub(crate) fn limit(self) -> usize {
        match self {
            Checks::Unlimited => usize::MAX,
            Checks::Bounded(n) => n,
        }
    }
}

impl fmt::Display for Checks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Checks::Unlimited => write!(f, "unlimited"),
            Checks::Bounded(n) => write!(f, "{n}"),
        }
    }
}

/// Index family together with its build parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "kebab-case")]
pub enum IndexParams {
    /// Exhaustive scan.
    Linear,
    /// Forest of randomized k-d trees searched through one shared queue.
    KdForest { trees: usize },
    /// Hierarchical k-means tree.
    KMeansTree {
        branching: usize,
        iterations: usize,
        /// Weight of a node's spread when ranking unexplored branches.
        cb_index: f32,
    },
}

impl fmt::Display for IndexParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexParams::Linear => write!(f, "linear"),
            IndexParams::KdForest { trees } => write!(f, "kd-forest(trees={trees})"),
            IndexParams::KMeansTree {
                branching,
                iterations,
                cb_index,
            } => write!(
                f,
                "kmeans-tree(branching={branching}, iterations={iterations}, cb_index={cb_index})"
            ),
        }
    }
}

/// A single search hit: the row of the indexed matrix and its squared distance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Hits in ascending distance order plus the number of distance evaluations
/// the search spent.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub neighbors: Vec<Neighbor>,
    pub evaluations: usize,
}

/// Parameters and search effort picked by auto-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TunedIndex {
    pub params: IndexParams,
    pub checks: Checks,
    /// Fraction of tuning queries whose nearest neighbour was found.
    pub precision: f32,
    /// Mean distance evaluations per tuning query.
    pub search_cost: f64,
}

/// A built nearest-neighbour index over a fixed matrix of points.
pub trait NearestNeighborIndex: Send + Sync {
    /// Family and parameters this index was built with.
    fn params(&self) -> IndexParams;

    /// Number of indexed points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `k` closest indexed points to `query`, closest first.
    fn search(&self, query: ArrayView1<'_, f32>, k: usize, checks: Checks) -> SearchOutcome;

    /// Closest indexed point to `query`.
    fn nearest(&self, query: ArrayView1<'_, f32>, checks: Checks) -> Option<Neighbor> {
        self.search(query, 1, checks).neighbors.first().copied()
    }

    /// Distance evaluations spent building the index.
    fn build_evaluations(&self) -> usize;

    /// Bytes held by the index structure on top of the indexed points.
    fn memory_bytes(&self) -> usize;
}

/// Source of nearest-neighbour indices for the clustering engine.
pub trait IndexBackend {
    /// Build an index of the given family over `points`.
    fn build(
        &self,
        points: &Array2<f32>,
        params: &IndexParams,
        rng: &mut ChaCha8Rng,
    ) -> Result<Box<dyn NearestNeighborIndex>>;

    /// Pick a family, its parameters and a search budget that reach
    /// `target_precision`, and return the index built with them.
    fn autotune(
        &self,
        points: &Array2<f32>,
        target_precision: f32,
        settings: &AutotuneSettings,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Box<dyn NearestNeighborIndex>, TunedIndex)>;
}

/// In-crate backend with the linear, k-d forest and k-means tree families.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultIndexBackend;

impl IndexBackend for DefaultIndexBackend {
    fn build(
        &self,
        points: &Array2<f32>,
        params: &IndexParams,
        rng: &mut ChaCha8Rng,
    ) -> Result<Box<dyn NearestNeighborIndex>> {
        build_index(points, params, rng)
    }

    fn autotune(
        &self,
        points: &Array2<f32>,
        target_precision: f32,
        settings: &AutotuneSettings,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Box<dyn NearestNeighborIndex>, TunedIndex)> {
        let tuned = autotune::tune(points, target_precision, settings, rng)?;
        let index = build_index(points, &tuned.params, rng)?;
        Ok((index, tuned))
    }
}

pub(crate) fn build_index(
    points: &Array2<f32>,
    params: &IndexParams,
    rng: &mut ChaCha8Rng,
) -> Result<Box<dyn NearestNeighborIndex>> {
    if points.nrows() == 0 {
        return Err(CodebookError::InvalidArgument(
            "cannot index an empty point set".into(),
        ));
    }
    let index: Box<dyn NearestNeighborIndex> = match *params {
        IndexParams::Linear => Box::new(LinearIndex::new(points.clone())),
        IndexParams::KdForest { trees } => Box::new(KdForest::build(points, trees, rng)?),
        IndexParams::KMeansTree {
            branching,
            iterations,
            cb_index,
        } => Box::new(KMeansTree::build(
            points, branching, iterations, cb_index, rng,
        )?),
    };
    Ok(index)
}

/// Bounded, sorted list of the best hits seen so far.
pub(crate) struct KnnResults {
    k: usize,
    items: Vec<Neighbor>,
}

impl KnnResults {
    pub(crate) fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k + 1),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.k
    }

    /// Distance a new hit has to beat once the list is full.
    pub(crate) fn worst(&self) -> f32 {
        if self.is_full() {
            self.items.last().map_or(f32::INFINITY, |n| n.distance)
        } else {
            f32::INFINITY
        }
    }

    pub(crate) fn insert(&mut self, index: usize, distance: f32) {
        if self.k == 0 || (self.is_full() && distance >= self.worst()) {
            return;
        }
        let at = self.items.partition_point(|n| n.distance <= distance);
        self.items.insert(at, Neighbor { index, distance });
        self.items.truncate(self.k);
    }

    pub(crate) fn into_vec(self) -> Vec<Neighbor> {
        self.items
    }
}

/// Unexplored branch waiting in a best-bin-first queue; the heap pops the
/// lowest priority first.
pub(crate) struct Branch<T> {
    pub(crate) priority: f32,
    pub(crate) node: T,
}

impl<T> PartialEq for Branch<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority.total_cmp(&other.priority) == Ordering::Equal
    }
}

impl<T> Eq for Branch<T> {}

impl<T> PartialOrd for Branch<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Branch<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.total_cmp(&self.priority)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::collections::BinaryHeap;

    #[test]
    fn results_keep_the_k_closest_in_order() {
        let mut results = KnnResults::new(2);
        assert_eq!(results.worst(), f32::INFINITY);
        results.insert(0, 5.0);
        results.insert(1, 3.0);
        assert!(results.is_full());
        results.insert(2, 4.0);
        results.insert(3, 9.0);
        let hits = results.into_vec();
        assert_eq!(
            hits.iter().map(|n| n.index).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn equal_distances_keep_the_first_hit() {
        let mut results = KnnResults::new(1);
        results.insert(4, 2.0);
        results.insert(7, 2.0);
        assert_eq!(results.into_vec()[0].index, 4);
    }

    #[test]
    fn branch_heap_pops_lowest_priority_first() {
        let mut heap = BinaryHeap::new();
        for (priority, node) in [(3.0, 'c'), (1.0, 'a'), (2.0, 'b')] {
            heap.push(Branch { priority, node });
        }
        let order: Vec<char> = std::iter::from_fn(|| heap.pop().map(|b| b.node)).collect();
        assert_eq!(order, vec!['a', 'b', 'c']);
    }

    #[test]
    fn params_serialize_with_an_algorithm_tag() {
        let params = IndexParams::KdForest { trees: 4 };
        let json = serde_json::to_value(params).unwrap();
        assert_eq!(json["algorithm"], "kd-forest");
        assert_eq!(json["trees"], 4);
        assert_eq!(params.to_string(), "kd-forest(trees=4)");
    }

    #[test]
    fn empty_point_sets_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let points = Array2::<f32>::zeros((0, 3));
        let err = DefaultIndexBackend
            .build(&points, &IndexParams::Linear, &mut rng)
            .err()
            .unwrap();
        assert!(matches!(err, CodebookError::InvalidArgument(_)));
    }
}
