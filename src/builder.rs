//! The codebook builder: descriptor accumulation plus exact and approximate
//! k-means over the accumulated rows.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::dictionary::Dictionary;
use crate::index::{
    AutotuneSettings, Checks, DefaultIndexBackend, IndexBackend, NearestNeighborIndex, Neighbor,
    TunedIndex,
};
use crate::init::{seed_centroids, Initialization};
use crate::store::{Descriptor, FeatureStore};
use crate::{squared_distance, CodebookError, Result};

/// Notified once the initial centroids have been seeded, before refinement.
pub trait Checkpoint {
    fn initialization_complete(&self) -> Result<()>;
}

/// Checkpoint that creates (or truncates) a file.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn initialization_complete(&self) -> Result<()> {
        File::create(&self.path)?;
        tracing::debug!(path = ?self.path, "touched initialization checkpoint");
        Ok(())
    }
}

/// What to do with a centroid that received no rows in an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyClusterPolicy {
    /// Leave the centroid where it was; the count is still reported.
    #[default]
    Keep,
    /// Move the centroid onto a random member of the largest cluster.
    ReseedFromLargest,
}

/// Optional outputs computed after the final iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnostics {
    /// Sum of squared distances from every row to its nearest centroid.
    pub metric: bool,
    /// Final per-cluster row counts, largest first.
    pub sizes: bool,
}

impl Diagnostics {
    pub const NONE: Diagnostics = Diagnostics {
        metric: false,
        sizes: false,
    };
    pub const ALL: Diagnostics = Diagnostics {
        metric: true,
        sizes: true,
    };
}

/// Summary of one clustering call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_sizes: Option<Vec<usize>>,
    /// Centroids left without rows by the final iteration.
    pub empty_clusters: usize,
    /// Index chosen by auto-tuning; `None` on the exact path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tuned: Option<TunedIndex>,
}

/// Everything a clustering run needs besides the data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of centroids.
    pub k: usize,
    /// Refinement rounds.
    pub iterations: usize,
    /// Target precision of the assignment index; 1.0 means exact k-means.
    pub accuracy: f32,
    pub initialization: Initialization,
    /// Reseed the builder's generator before clustering.
    pub seed: Option<u64>,
    /// File touched once seeding completes.
    pub checkpoint: Option<PathBuf>,
    pub empty_clusters: EmptyClusterPolicy,
    pub autotune: AutotuneSettings,
    pub diagnostics: Diagnostics,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            k: 1,
            iterations: 11,
            accuracy: 1.0,
            initialization: Initialization::default(),
            seed: None,
            checkpoint: None,
            empty_clusters: EmptyClusterPolicy::default(),
            autotune: AutotuneSettings::default(),
            diagnostics: Diagnostics::NONE,
        }
    }
}

impl ClusterConfig {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_request(self.k, self.iterations, self.accuracy)?;
        self.autotune.validate()
    }
}

fn validate_request(k: usize, iterations: usize, accuracy: f32) -> Result<()> {
    if k == 0 {
        return Err(CodebookError::InvalidArgument(
            "number of clusters must be greater than zero".into(),
        ));
    }
    if iterations == 0 {
        return Err(CodebookError::InvalidArgument(
            "iterations must be greater than zero".into(),
        ));
    }
    if !(accuracy > 0.0 && accuracy <= 1.0) {
        return Err(CodebookError::InvalidArgument(format!(
            "accuracy must be in (0, 1], got {accuracy}"
        )));
    }
    Ok(())
}

/// Accumulates descriptors and clusters them into a codebook.
///
/// Appends must all happen before clustering; a builder is meant for a single
/// owner. Each clustering call replaces the previous centroids only once it
/// has completed.
pub struct CodebookBuilder<B: IndexBackend = DefaultIndexBackend> {
    store: FeatureStore,
    centroids: Option<Array2<f32>>,
    rng: ChaCha8Rng,
    backend: B,
    checkpoint: Option<Box<dyn Checkpoint + Send>>,
    empty_clusters: EmptyClusterPolicy,
    autotune: AutotuneSettings,
}

impl CodebookBuilder<DefaultIndexBackend> {
    /// Builder seeded from OS entropy.
    pub fn new() -> Self {
        Self::from_rng(ChaCha8Rng::from_entropy())
    }

    /// Builder with a reproducible random stream.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn from_rng(rng: ChaCha8Rng) -> Self {
        Self {
            store: FeatureStore::new(),
            centroids: None,
            rng,
            backend: DefaultIndexBackend,
            checkpoint: None,
            empty_clusters: EmptyClusterPolicy::default(),
            autotune: AutotuneSettings::default(),
        }
    }
}

impl Default for CodebookBuilder<DefaultIndexBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: IndexBackend> CodebookBuilder<B> {
    /// Swap the nearest-neighbour backend used by approximate clustering.
    pub fn with_backend<C: IndexBackend>(self, backend: C) -> CodebookBuilder<C> {
        CodebookBuilder {
            store: self.store,
            centroids: self.centroids,
            rng: self.rng,
            backend,
            checkpoint: self.checkpoint,
            empty_clusters: self.empty_clusters,
            autotune: self.autotune,
        }
    }

    pub fn with_checkpoint<C: Checkpoint + Send + 'static>(mut self, checkpoint: C) -> Self {
        self.checkpoint = Some(Box::new(checkpoint));
        self
    }

    pub fn with_empty_cluster_policy(mut self, policy: EmptyClusterPolicy) -> Self {
        self.empty_clusters = policy;
        self
    }

    pub fn with_autotune_settings(mut self, settings: AutotuneSettings) -> Self {
        self.autotune = settings;
        self
    }

    /// Restart the random stream from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
    }

    /// Add the rows of `batch` that survive a per-row trial with probability
    /// `keep_probability`. A positive `location_weight` stores the scaled
    /// location as two extra columns. Returns the number of rows kept.
    pub fn append(
        &mut self,
        batch: &[Descriptor],
        keep_probability: f32,
        location_weight: f32,
    ) -> Result<usize> {
        self.store
            .append(batch, keep_probability, location_weight, &mut self.rng)
    }

    /// Rows accumulated so far.
    pub fn data_size(&self) -> usize {
        self.store.rows()
    }

    /// Width of the stored rows, 0 before the first non-empty append.
    pub fn dims(&self) -> usize {
        self.store.dims()
    }

    /// Exact k-means: every row is assigned to its true nearest centroid in
    /// every one of `iterations` rounds, starting from k-means++ seeds.
    pub fn cluster(&mut self, k: usize, iterations: usize) -> Result<()> {
        self.cluster_exact(k, iterations, Diagnostics::NONE)?;
        Ok(())
    }

    /// Approximate k-means. Rows are assigned through a nearest-neighbour
    /// index over the centroids whose family and search budget are tuned once
    /// for `accuracy`, then rebuilt with the same settings every iteration.
    /// `accuracy == 1.0` runs [`cluster`](Self::cluster) instead.
    pub fn cluster_approximately(
        &mut self,
        k: usize,
        iterations: usize,
        accuracy: f32,
        initialization: Initialization,
        diagnostics: Diagnostics,
    ) -> Result<ClusterReport> {
        validate_request(k, iterations, accuracy)?;
        if accuracy >= 1.0 {
            return self.cluster_exact(k, iterations, diagnostics);
        }
        self.prepare(k)?;
        tracing::info!(
            k,
            iterations,
            accuracy,
            %initialization,
            rows = self.store.rows(),
            dims = self.store.dims(),
            "starting approximate k-means"
        );

        let mut centroids = seed_centroids(&self.store, k, initialization, &mut self.rng)?;
        tracing::info!(k, "initialization complete");
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.initialization_complete()?;
        }

        let mut tuned: Option<TunedIndex> = None;
        let mut report = ClusterReport::default();
        for iteration in 0..iterations {
            tracing::info!(iteration, "starting iteration");
            let index = match tuned {
                None => {
                    let (index, selected) = self.backend.autotune(
                        &centroids,
                        accuracy,
                        &self.autotune,
                        &mut self.rng,
                    )?;
                    tuned = Some(selected);
                    index
                }
                Some(selected) => {
                    tracing::debug!(iteration, params = %selected.params, "rebuilding index");
                    self.backend
                        .build(&centroids, &selected.params, &mut self.rng)?
                }
            };
            let checks = tuned.map_or(Checks::Unlimited, |t| t.checks);

            let assignments = assign_rows(&self.store, index.as_ref(), checks)?;
            let counts = self.update_centroids(&mut centroids, &assignments);
            report.empty_clusters = count_empty(&counts, iteration);

            if iteration + 1 == iterations {
                if diagnostics.metric {
                    let params = tuned.map_or(index.params(), |t| t.params);
                    let index = self.backend.build(&centroids, &params, &mut self.rng)?;
                    let metric: f64 = assign_rows(&self.store, index.as_ref(), checks)?
                        .iter()
                        .map(|hit| f64::from(hit.distance))
                        .sum();
                    tracing::info!(metric, "computed clustering metric");
                    report.metric = Some(metric);
                }
                if diagnostics.sizes {
                    report.cluster_sizes = Some(sorted_sizes(counts));
                }
            }
        }

        report.tuned = tuned;
        self.install(centroids, k)?;
        tracing::info!(k, empty_clusters = report.empty_clusters, "approximate k-means finished");
        Ok(report)
    }

    /// Run the clustering described by `config`.
    pub fn run(&mut self, config: &ClusterConfig) -> Result<ClusterReport> {
        config.validate()?;
        if let Some(seed) = config.seed {
            self.reseed(seed);
        }
        if let Some(path) = &config.checkpoint {
            self.checkpoint = Some(Box::new(FileCheckpoint::new(path.clone())));
        }
        self.empty_clusters = config.empty_clusters;
        self.autotune = config.autotune;
        self.cluster_approximately(
            config.k,
            config.iterations,
            config.accuracy,
            config.initialization,
            config.diagnostics,
        )
    }

    /// Current codebook; empty until a clustering call has succeeded.
    pub fn dictionary(&self) -> Dictionary {
        match &self.centroids {
            Some(centroids) => Dictionary::from_matrix(centroids, self.store.location_weight()),
            None => Dictionary {
                centroids: Vec::new(),
                location_weighting: self.store.location_weight(),
            },
        }
    }

    pub fn centroids(&self) -> Option<&Array2<f32>> {
        self.centroids.as_ref()
    }

    fn prepare(&mut self, k: usize) -> Result<()> {
        if self.store.is_empty() {
            return Err(CodebookError::EmptyDataset);
        }
        if k > self.store.rows() {
            return Err(CodebookError::InvalidArgument(format!(
                "cannot form {k} clusters from {} rows",
                self.store.rows()
            )));
        }
        self.store.truncate();
        Ok(())
    }

    fn cluster_exact(
        &mut self,
        k: usize,
        iterations: usize,
        diagnostics: Diagnostics,
    ) -> Result<ClusterReport> {
        validate_request(k, iterations, 1.0)?;
        self.prepare(k)?;
        tracing::info!(
            k,
            iterations,
            rows = self.store.rows(),
            dims = self.store.dims(),
            "starting exact k-means"
        );

        let mut centroids =
            seed_centroids(&self.store, k, Initialization::KMeansPlusPlus, &mut self.rng)?;
        let mut report = ClusterReport::default();
        for iteration in 0..iterations {
            tracing::debug!(iteration, "starting iteration");
            let assignments = nearest_centroids(&self.store, &centroids);
            let counts = self.update_centroids(&mut centroids, &assignments);
            report.empty_clusters = count_empty(&counts, iteration);

            if iteration + 1 == iterations {
                if diagnostics.metric {
                    let metric: f64 = nearest_centroids(&self.store, &centroids)
                        .iter()
                        .map(|hit| f64::from(hit.distance))
                        .sum();
                    tracing::info!(metric, "computed clustering metric");
                    report.metric = Some(metric);
                }
                if diagnostics.sizes {
                    report.cluster_sizes = Some(sorted_sizes(counts));
                }
            }
        }

        self.install(centroids, k)?;
        tracing::info!(k, empty_clusters = report.empty_clusters, "exact k-means finished");
        Ok(report)
    }

    fn install(&mut self, centroids: Array2<f32>, k: usize) -> Result<()> {
        if centroids.nrows() != k {
            return Err(CodebookError::ClusterCountMismatch {
                requested: k,
                produced: centroids.nrows(),
            });
        }
        self.centroids = Some(centroids);
        Ok(())
    }

    /// Move every centroid to the mean of its rows and return the row counts.
    fn update_centroids(
        &mut self,
        centroids: &mut Array2<f32>,
        assignments: &[Neighbor],
    ) -> Vec<usize> {
        let (k, dims) = centroids.dim();
        let mut sums = vec![0.0f64; k * dims];
        let mut counts = vec![0usize; k];
        for (row, hit) in self.store.iter_rows().zip(assignments) {
            let sum = &mut sums[hit.index * dims..(hit.index + 1) * dims];
            for (s, &v) in sum.iter_mut().zip(row.iter()) {
                *s += f64::from(v);
            }
            counts[hit.index] += 1;
        }
        for (cid, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let sum = &sums[cid * dims..(cid + 1) * dims];
            for (dst, &s) in centroids.row_mut(cid).iter_mut().zip(sum) {
                *dst = (s / count as f64) as f32;
            }
        }
        if self.empty_clusters == EmptyClusterPolicy::ReseedFromLargest {
            reseed_empty(&self.store, centroids, &counts, assignments, &mut self.rng);
        }
        counts
    }
}

/// Nearest centroid of every row through `index`.
fn assign_rows(
    store: &FeatureStore,
    index: &dyn NearestNeighborIndex,
    checks: Checks,
) -> Result<Vec<Neighbor>> {
    store
        .par_rows()
        .map(|row| index.nearest(row, checks).ok_or(CodebookError::NoNeighbor))
        .collect()
}

/// Exact nearest centroid of every row.
fn nearest_centroids(store: &FeatureStore, centroids: &Array2<f32>) -> Vec<Neighbor> {
    store
        .par_rows()
        .map(|row| {
            let mut best = Neighbor {
                index: 0,
                distance: f32::INFINITY,
            };
            for (cid, centroid) in centroids.rows().into_iter().enumerate() {
                let distance = squared_distance(row, centroid);
                if distance < best.distance {
                    best = Neighbor {
                        index: cid,
                        distance,
                    };
                }
            }
            best
        })
        .collect()
}

fn count_empty(counts: &[usize], iteration: usize) -> usize {
    let empty = counts.iter().filter(|&&c| c == 0).count();
    tracing::debug!(iteration, empty_clusters = empty, "iteration finished");
    if empty > 0 {
        tracing::warn!(iteration, empty_clusters = empty, "iteration left clusters empty");
    }
    empty
}

fn sorted_sizes(mut counts: Vec<usize>) -> Vec<usize> {
    counts.sort_unstable_by(|a, b| b.cmp(a));
    counts
}

/// Give every empty centroid a distinct random row of the currently largest
/// cluster. `counts` stays the real assignment count of this iteration.
fn reseed_empty<R: Rng + ?Sized>(
    store: &FeatureStore,
    centroids: &mut Array2<f32>,
    counts: &[usize],
    assignments: &[Neighbor],
    rng: &mut R,
) {
    let mut remaining = counts.to_vec();
    let mut taken = HashSet::new();
    for empty in 0..counts.len() {
        if counts[empty] != 0 {
            continue;
        }
        let Some(largest) =
            (0..remaining.len()).max_by_key(|&cid| (remaining[cid], usize::MAX - cid))
        else {
            return;
        };
        if remaining[largest] < 2 {
            return;
        }
        let members: Vec<usize> = assignments
            .iter()
            .enumerate()
            .filter(|(row, hit)| hit.index == largest && !taken.contains(row))
            .map(|(row, _)| row)
            .collect();
        if members.is_empty() {
            return;
        }
        let row = members[rng.gen_range(0..members.len())];
        taken.insert(row);
        centroids.row_mut(empty).assign(&store.row(row));
        remaining[largest] -= 1;
        remaining[empty] = 1;
        tracing::debug!(cluster = empty, donor = largest, row, "reseeded empty cluster");
    }
}
