//! Hierarchical k-means tree.
//!
//! Each inner node splits its points into at most `branching` groups with a
//! few Lloyd rounds. Nodes remember their mean, radius and variance; queries
//! descend toward the closest child, queue the others by a variance-adjusted
//! distance, and prune whole balls that cannot hold a better hit.

use std::collections::BinaryHeap;

use ndarray::{Array1, Array2, ArrayView1};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

use super::{Branch, Checks, IndexParams, KnnResults, NearestNeighborIndex, SearchOutcome};
use crate::{squared_distance, CodebookError, Result};

#[derive(Debug)]
struct KMeansNode {
    pivot: Array1<f32>,
    /// Largest squared distance from the pivot to a member.
    radius: f32,
    /// Mean squared distance from the pivot to the members.
    variance: f32,
    size: usize,
    content: NodeContent,
}

#[derive(Debug)]
enum NodeContent {
    Leaf(Vec<usize>),
    Inner(Vec<KMeansNode>),
}

#[derive(Debug)]
pub struct KMeansTree {
    points: Array2<f32>,
    root: KMeansNode,
    branching: usize,
    iterations: usize,
    cb_index: f32,
    nodes: usize,
    build_evaluations: usize,
}

impl KMeansTree {
    pub fn build(
        points: &Array2<f32>,
        branching: usize,
        iterations: usize,
        cb_index: f32,
        rng: &mut ChaCha8Rng,
    ) -> Result<Self> {
        if branching < 2 {
            return Err(CodebookError::InvalidArgument(format!(
                "k-means tree branching must be at least 2 (got {branching})"
            )));
        }
        if points.nrows() == 0 {
            return Err(CodebookError::InvalidArgument(
                "cannot index an empty point set".into(),
            ));
        }
        let mut builder = NodeBuilder {
            points,
            branching,
            iterations: iterations.max(1),
            nodes: 0,
            evaluations: 0,
        };
        let root = builder.node((0..points.nrows()).collect(), rng);
        Ok(Self {
            points: points.clone(),
            root,
            branching,
            iterations,
            cb_index,
            nodes: builder.nodes,
            build_evaluations: builder.evaluations,
        })
    }
}

struct NodeBuilder<'a> {
    points: &'a Array2<f32>,
    branching: usize,
    iterations: usize,
    nodes: usize,
    evaluations: usize,
}

impl NodeBuilder<'_> {
    fn node(&mut self, rows: Vec<usize>, rng: &mut ChaCha8Rng) -> KMeansNode {
        self.nodes += 1;
        let pivot = self.mean(&rows);
        let mut radius = 0.0f32;
        let mut total = 0.0f64;
        for &row in &rows {
            let d = squared_distance(self.points.row(row), pivot.view());
            radius = radius.max(d);
            total += f64::from(d);
        }
        self.evaluations += rows.len();
        let size = rows.len();
        let variance = (total / size as f64) as f32;

        let content = if size < self.branching {
            NodeContent::Leaf(rows)
        } else {
            let groups = self.split(&rows, rng);
            if groups.len() < 2 {
                NodeContent::Leaf(rows)
            } else {
                NodeContent::Inner(groups.into_iter().map(|g| self.node(g, rng)).collect())
            }
        };
        KMeansNode {
            pivot,
            radius,
            variance,
            size,
            content,
        }
    }

    /// Lloyd rounds from `branching` random members; empty groups are dropped.
    fn split(&mut self, rows: &[usize], rng: &mut ChaCha8Rng) -> Vec<Vec<usize>> {
        let dims = self.points.ncols();
        let mut centers = Array2::<f32>::zeros((self.branching, dims));
        for (slot, pick) in sample(rng, rows.len(), self.branching).into_iter().enumerate() {
            centers.row_mut(slot).assign(&self.points.row(rows[pick]));
        }

        for _ in 0..self.iterations {
            let groups = self.assign(rows, &centers);
            for (slot, group) in groups.iter().enumerate() {
                if !group.is_empty() {
                    centers.row_mut(slot).assign(&self.mean(group));
                }
            }
        }
        self.assign(rows, &centers)
            .into_iter()
            .filter(|g| !g.is_empty())
            .collect()
    }

    fn assign(&mut self, rows: &[usize], centers: &Array2<f32>) -> Vec<Vec<usize>> {
        let mut groups = vec![Vec::new(); centers.nrows()];
        for &row in rows {
            let point = self.points.row(row);
            let mut best = 0;
            let mut best_distance = f32::INFINITY;
            for (slot, center) in centers.rows().into_iter().enumerate() {
                let d = squared_distance(point, center);
                if d < best_distance {
                    best_distance = d;
                    best = slot;
                }
            }
            groups[best].push(row);
        }
        self.evaluations += rows.len() * centers.nrows();
        groups
    }

    fn mean(&self, rows: &[usize]) -> Array1<f32> {
        let mut sum = Array1::<f64>::zeros(self.points.ncols());
        for &row in rows {
            sum.zip_mut_with(&self.points.row(row), |s, &v| *s += f64::from(v));
        }
        sum.mapv(|s| (s / rows.len() as f64) as f32)
    }
}

struct TreeSearch<'a> {
    tree: &'a KMeansTree,
    query: ArrayView1<'a, f32>,
    results: KnnResults,
    heap: BinaryHeap<Branch<&'a KMeansNode>>,
    checks: usize,
    limit: usize,
    evaluations: usize,
}

impl<'a> TreeSearch<'a> {
    fn exhausted(&self) -> bool {
        self.checks >= self.limit && self.results.is_full()
    }

    fn visit(&mut self, node: &'a KMeansNode) {
        if self.results.is_full() {
            let to_pivot = squared_distance(self.query, node.pivot.view());
            self.evaluations += 1;
            let gap = to_pivot.sqrt() - node.radius.sqrt();
            if gap > 0.0 && gap * gap > self.results.worst() {
                return;
            }
        }
        match &node.content {
            NodeContent::Leaf(rows) => {
                if self.exhausted() {
                    return;
                }
                self.checks += node.size;
                for &row in rows {
                    let d = squared_distance(self.query, self.tree.points.row(row));
                    self.results.insert(row, d);
                }
                self.evaluations += rows.len();
            }
            NodeContent::Inner(children) => {
                let distances: Vec<f32> = children
                    .iter()
                    .map(|child| squared_distance(self.query, child.pivot.view()))
                    .collect();
                self.evaluations += children.len();

                let mut best = 0;
                for (i, &d) in distances.iter().enumerate() {
                    if d < distances[best] {
                        best = i;
                    }
                }
                for (i, child) in children.iter().enumerate() {
                    if i != best {
                        self.heap.push(Branch {
                            priority: distances[i] - self.tree.cb_index * child.variance,
                            node: child,
                        });
                    }
                }
                self.visit(&children[best]);
            }
        }
    }
}

impl NearestNeighborIndex for KMeansTree {
    fn params(&self) -> IndexParams {
        IndexParams::KMeansTree {
            branching: self.branching,
            iterations: self.iterations,
            cb_index: self.cb_index,
        }
    }

    fn len(&self) -> usize {
        self.points.nrows()
    }

    fn search(&self, query: ArrayView1<'_, f32>, k: usize, checks: Checks) -> SearchOutcome {
        let mut search = TreeSearch {
            tree: self,
            query: query.reborrow(),
            results: KnnResults::new(k),
            heap: BinaryHeap::new(),
            checks: 0,
            limit: checks.limit(),
            evaluations: 0,
        };
        search.visit(&self.root);
        while let Some(branch) = search.heap.pop() {
            if search.exhausted() {
                break;
            }
            search.visit(branch.node);
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
        let pivots = self.nodes * self.points.ncols() * std::mem::size_of::<f32>();
        let leaves = self.points.nrows() * std::mem::size_of::<usize>();
        self.nodes * std::mem::size_of::<KMeansNode>() + pivots + leaves
    }
}
