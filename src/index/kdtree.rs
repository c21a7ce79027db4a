//! Randomized k-d forest.
//!
//! Every tree splits on a dimension drawn at random among the few with the
//! highest variance, at the sample mean, so the trees of a forest partition
//! the space differently. A query descends every tree once and then keeps
//! popping the closest unexplored branch across all trees until its check
//! budget runs out.

use std::collections::BinaryHeap;

use ndarray::{Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::{Branch, Checks, IndexParams, KnnResults, NearestNeighborIndex, SearchOutcome};
use crate::{squared_distance, CodebookError, Result};

/// Rows used to estimate the mean and variance at each split.
const SAMPLE_MEAN: usize = 100;
/// Split dimension is drawn among this many highest-variance dimensions.
const RAND_DIM: usize = 5;

#[derive(Debug)]
enum KdNode {
    Leaf(usize),
    Split {
        dim: usize,
        value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

#[derive(Debug)]
pub struct KdForest {
    points: Array2<f32>,
    roots: Vec<KdNode>,
    nodes: usize,
    build_evaluations: usize,
}

impl KdForest {
    pub fn build(points: &Array2<f32>, trees: usize, rng: &mut ChaCha8Rng) -> Result<Self> {
        if trees == 0 {
            return Err(CodebookError::InvalidArgument(
                "a k-d forest needs at least one tree".into(),
            ));
        }
        if points.nrows() == 0 {
            return Err(CodebookError::InvalidArgument(
                "cannot index an empty point set".into(),
            ));
        }
        let mut builder = TreeBuilder {
            points,
            nodes: 0,
            evaluations: 0,
        };
        let roots = (0..trees)
            .map(|_| {
                let mut rows: Vec<usize> = (0..points.nrows()).collect();
                rows.shuffle(rng);
                builder.divide(&mut rows, rng)
            })
            .collect();
        Ok(Self {
            points: points.clone(),
            roots,
            nodes: builder.nodes,
            build_evaluations: builder.evaluations,
        })
    }
}

struct TreeBuilder<'a> {
    points: &'a Array2<f32>,
    nodes: usize,
    evaluations: usize,
}

impl TreeBuilder<'_> {
    fn divide(&mut self, rows: &mut [usize], rng: &mut ChaCha8Rng) -> KdNode {
        self.nodes += 1;
        if rows.len() == 1 {
            return KdNode::Leaf(rows[0]);
        }
        let (dim, value) = self.choose_split(rows, rng);
        let split = self.partition(rows, dim, value);
        let (left, right) = rows.split_at_mut(split);
        KdNode::Split {
            dim,
            value,
            left: Box::new(self.divide(left, rng)),
            right: Box::new(self.divide(right, rng)),
        }
    }

    fn choose_split(&mut self, rows: &[usize], rng: &mut ChaCha8Rng) -> (usize, f32) {
        let dims = self.points.ncols();
        let sample = &rows[..rows.len().min(SAMPLE_MEAN)];
        self.evaluations += sample.len();

        let mut mean = vec![0.0f64; dims];
        for &row in sample {
            for (m, &v) in mean.iter_mut().zip(self.points.row(row)) {
                *m += f64::from(v);
            }
        }
        for m in &mut mean {
            *m /= sample.len() as f64;
        }
        let mut variance = vec![0.0f64; dims];
        for &row in sample {
            for ((var, m), &v) in variance.iter_mut().zip(&mean).zip(self.points.row(row)) {
                let diff = f64::from(v) - m;
                *var += diff * diff;
            }
        }

        let mut order: Vec<usize> = (0..dims).collect();
        order.sort_by(|&a, &b| variance[b].total_cmp(&variance[a]));
        let top = &order[..dims.min(RAND_DIM)];
        let dim = top[rng.gen_range(0..top.len())];
        (dim, mean[dim] as f32)
    }

    /// Reorder `rows` into `< value`, `== value`, `> value` along `dim` and
    /// return the index of the first row of the right subtree. Both halves
    /// are always non-empty.
    fn partition(&self, rows: &mut [usize], dim: usize, value: f32) -> usize {
        let at = |row: usize| self.points[(row, dim)];
        let lim1 = partition_in_place(rows, |row| at(row) < value);
        let lim2 = lim1 + partition_in_place(&mut rows[lim1..], |row| at(row) <= value);

        let count = rows.len();
        let half = count / 2;
        if lim1 == count || lim2 == 0 {
            half
        } else if lim1 > half {
            lim1
        } else if lim2 < half {
            lim2
        } else {
            half
        }
    }
}

fn partition_in_place(rows: &mut [usize], keep_left: impl Fn(usize) -> bool) -> usize {
    let mut boundary = 0;
    for i in 0..rows.len() {
        if keep_left(rows[i]) {
            rows.swap(boundary, i);
            boundary += 1;
        }
    }
    boundary
}

struct KdSearch<'a> {
    forest: &'a KdForest,
    query: ArrayView1<'a, f32>,
    results: KnnResults,
    heap: BinaryHeap<Branch<&'a KdNode>>,
    checked: Vec<bool>,
    checks: usize,
    limit: usize,
    evaluations: usize,
}

impl<'a> KdSearch<'a> {
    fn exhausted(&self) -> bool {
        self.checks >= self.limit && self.results.is_full()
    }

    fn visit(&mut self, node: &'a KdNode, min_dist: f32) {
        if self.results.is_full() && min_dist > self.results.worst() {
            return;
        }
        match node {
            KdNode::Leaf(row) => {
                if self.exhausted() || self.checked[*row] {
                    return;
                }
                self.checked[*row] = true;
                self.checks += 1;
                self.evaluations += 1;
                let distance = squared_distance(self.query, self.forest.points.row(*row));
                self.results.insert(*row, distance);
            }
            KdNode::Split {
                dim,
                value,
                left,
                right,
            } => {
                let diff = self.query[*dim] - value;
                let (best, other) = if diff < 0.0 {
                    (left, right)
                } else {
                    (right, left)
                };
                let other_dist = min_dist + diff * diff;
                if !self.results.is_full() || other_dist < self.results.worst() {
                    self.heap.push(Branch {
                        priority: other_dist,
                        node: &**other,
                    });
                }
                self.visit(&**best, min_dist);
            }
        }
    }
}

impl NearestNeighborIndex for KdForest {
    fn params(&self) -> IndexParams {
        IndexParams::KdForest {
            trees: self.roots.len(),
        }
    }

    fn len(&self) -> usize {
        self.points.nrows()
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize, checks: Checks) -> SearchOutcome {
        let mut search = KdSearch {
            forest: self,
            query: query.reborrow(),
            results: KnnResults::new(k),
            heap: BinaryHeap::new(),
            checked: vec![false; self.points.nrows()],
            checks: 0,
            limit: checks.limit(),
            evaluations: 0,
        };
        for root in &self.roots {
            search.visit(root, 0.0);
        }
        while let Some(branch) = search.heap.pop() {
            if search.exhausted() {
                break;
            }
            search.visit(branch.node, branch.priority);
        }
        SearchOutcome {
            neighbors: search.results.into_vec(),
            evaluations: search.evaluations,
        }
    }

    fn build_evaluations(&self) -> usize {
        self.build_evaluations
    }

    fn memory_bytes(&self) -> usize {
        self.nodes * std::mem::size_of::<KdNode>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::uniform_points;
    use crate::index::LinearIndex;
    use ndarray::arr2;
    use rand::SeedableRng;

    #[test]
    fn every_row_lands_in_exactly_one_leaf_per_tree() {
        let mut rng = ChaCha8Rng::seed_from_u64(21);
        let points = uniform_points(257, 6, &mut rng);
        let forest = KdForest::build(&points, 3, &mut rng).unwrap();

        fn collect(node: &KdNode, out: &mut Vec<usize>) {
            match node {
                KdNode::Leaf(row) => out.push(*row),
                KdNode::Split { left, right, .. } => {
                    collect(left, out);
                    collect(right, out);
                }
            }
        }
        for root in &forest.roots {
            let mut rows = Vec::new();
            collect(root, &mut rows);
            rows.sort_unstable();
            assert_eq!(rows, (0..257).collect::<Vec<_>>());
        }
        assert_eq!(forest.params(), IndexParams::KdForest { trees: 3 });
    }

    #[test]
    fn duplicate_points_still_split() {
        let mut rng = ChaCha8Rng::seed_from_u64(22);
        let points = arr2(&[[1.0f32, 1.0]; 9]);
        let forest = KdForest::build(&points, 1, &mut rng).unwrap();
        let outcome = forest.search(points.row(0), 3, Checks::Unlimited);
        assert_eq!(outcome.neighbors.len(), 3);
        assert!(outcome.neighbors.iter().all(|n| n.distance == 0.0));
    }

    #[test]
    fn unlimited_search_agrees_with_linear_scan() {
        let mut rng = ChaCha8Rng::seed_from_u64(23);
        let points = uniform_points(300, 4, &mut rng);
        let queries = uniform_points(200, 4, &mut rng);
        let forest = KdForest::build(&points, 4, &mut rng).unwrap();
        let linear = LinearIndex::new(points.clone());

        let agree = queries
            .rows()
            .into_iter()
            .filter(|q| {
                let a = forest.nearest(*q, Checks::Unlimited).unwrap();
                let b = linear.nearest(*q, Checks::Unlimited).unwrap();
                a.distance == b.distance
            })
            .count();
        assert!(agree >= 190, "only {agree} of 200 queries matched");
    }

    #[test]
    fn larger_budgets_spend_more_evaluations() {
        let mut rng = ChaCha8Rng::seed_from_u64(24);
        let points = uniform_points(500, 8, &mut rng);
        let queries = uniform_points(1, 8, &mut rng);
        let forest = KdForest::build(&points, 4, &mut rng).unwrap();
        let query = queries.row(0);

        let small = forest.search(query, 1, Checks::Bounded(1));
        let large = forest.search(query, 1, Checks::Bounded(200));
        assert_eq!(small.evaluations, 1);
        assert!(large.evaluations > small.evaluations);
        assert!(large.evaluations <= 500);
        assert!(large.neighbors[0].distance <= small.neighbors[0].distance);
    }

    #[test]
    fn an_indexed_point_is_its_own_nearest_neighbour() {
        let mut rng = ChaCha8Rng::seed_from_u64(26);
        let points = uniform_points(400, 5, &mut rng);
        let forest = KdForest::build(&points, 2, &mut rng).unwrap();
        for row in [0, 57, 399] {
            let hit = forest.nearest(points.row(row), Checks::Bounded(1)).unwrap();
            assert_eq!(hit.index, row);
            assert_eq!(hit.distance, 0.0);
        }
    }

    #[test]
    fn zero_trees_is_an_error() {
        let mut rng = ChaCha8Rng::seed_from_u64(25);
        let points = arr2(&[[0.0f32, 1.0]]);
        assert!(KdForest::build(&points, 0, &mut rng).is_err());
    }
}
