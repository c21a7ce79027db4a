//! Centroid seeding strategies run before the k-means refinement loop.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use ndarray::{Array2, ArrayView1};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::FeatureStore;
use crate::{squared_distance_bounded, CodebookError, Result};

/// Fraction of the data used as the candidate pool by
/// [`Initialization::SubsampledKMeansPlusPlus`].
pub const SUBSAMPLE_FRACTION: f64 = 0.1;

/// Strategy used to seed initial centroids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Initialization {
    /// Distinct rows drawn uniformly at random.
    Random,
    /// K-Means++ over every stored row.
    #[default]
    #[serde(alias = "kmeans++", alias = "k-means++")]
    KMeansPlusPlus,
    /// K-Means++ over a uniform 10% subsample of the stored rows.
    #[serde(alias = "subsampled-kmeans++")]
    SubsampledKMeansPlusPlus,
}

impl fmt::Display for Initialization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Initialization::Random => write!(f, "random"),
            Initialization::KMeansPlusPlus => write!(f, "kmeans++"),
            Initialization::SubsampledKMeansPlusPlus => write!(f, "subsampled-kmeans++"),
        }
    }
}

impl std::str::FromStr for Initialization {
    type Err = CodebookError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "random" | "kmeans-random" => Ok(Self::Random),
            "kmeans++" | "k-means++" | "kmeanspp" | "kmeans-pp" => Ok(Self::KMeansPlusPlus),
            "subsampled-kmeans++" | "subsampled-k-means++" | "subsampled-kmeanspp" => {
                Ok(Self::SubsampledKMeansPlusPlus)
            }
            _ => Err(CodebookError::UnsupportedInitialization(s.to_string())),
        }
    }
}

impl Initialization {
    /// Size of the candidate pool this strategy draws seeds from.
    pub fn pool_size(&self, rows: usize) -> usize {
        match self {
            Initialization::SubsampledKMeansPlusPlus => subsample_size(rows),
            Initialization::Random | Initialization::KMeansPlusPlus => rows,
        }
    }
}

fn subsample_size(rows: usize) -> usize {
    (rows as f64 * SUBSAMPLE_FRACTION).round() as usize
}

/// Seed `k` centroids from `store` with the chosen strategy.
pub fn seed_centroids<R: Rng + ?Sized>(
    store: &FeatureStore,
    k: usize,
    strategy: Initialization,
    rng: &mut R,
) -> Result<Array2<f32>> {
    let n = store.rows();
    if n == 0 {
        return Err(CodebookError::EmptyDataset);
    }
    let pool_size = strategy.pool_size(n);
    if k == 0 || k > pool_size {
        return Err(CodebookError::InvalidArgument(format!(
            "{strategy} initialisation needs 0 < k <= {pool_size} (k = {k}, rows = {n})"
        )));
    }
    tracing::info!(%strategy, k, rows = n, "seeding centroids");
    let centroids = match strategy {
        Initialization::Random => random_init(store, k, rng),
        Initialization::KMeansPlusPlus => kmeans_pp_init(store, k, (0..n).collect(), rng),
        Initialization::SubsampledKMeansPlusPlus => {
            let pool = subsample_rows(n, pool_size, rng);
            kmeans_pp_init(store, k, pool, rng)
        }
    };
    Ok(centroids)
}

/// Draw `k` distinct rows by rejection sampling.
fn random_init<R: Rng + ?Sized>(store: &FeatureStore, k: usize, rng: &mut R) -> Array2<f32> {
    let n = store.rows();
    let mut centroids = Array2::zeros((k, store.dims()));
    let mut selected = HashSet::with_capacity(k);
    for cid in 0..k {
        let mut row = rng.gen_range(0..n);
        while !selected.insert(row) {
            row = rng.gen_range(0..n);
        }
        centroids.row_mut(cid).assign(&store.row(row));
        if cid % 100 == 0 {
            tracing::debug!(center = cid, "placed center");
        }
    }
    centroids
}

/// Uniform sample of `size` distinct row ids, returned in ascending order.
fn subsample_rows<R: Rng + ?Sized>(n: usize, size: usize, rng: &mut R) -> Vec<usize> {
    let mut rows = BTreeSet::new();
    while rows.len() < size {
        rows.insert(rng.gen_range(0..n));
    }
    rows.into_iter().collect()
}

/// K-Means++ seeding over the candidate rows in `pool`.
///
/// Each candidate keeps its squared distance to the nearest chosen centre;
/// the next centre is the first candidate, in pool order, at which a uniform
/// draw over the total weight is exhausted.
fn kmeans_pp_init<R: Rng + ?Sized>(
    store: &FeatureStore,
    k: usize,
    pool: Vec<usize>,
    rng: &mut R,
) -> Array2<f32> {
    let mut centroids = Array2::zeros((k, store.dims()));

    let first = pool[rng.gen_range(0..pool.len())];
    centroids.row_mut(0).assign(&store.row(first));
    tracing::debug!(center = 0, row = first, "placed center");

    let mut weights: Vec<f64> = pool
        .iter()
        .map(|&row| squared_distance_bounded(store.row(row), centroids.row(0), f64::INFINITY))
        .collect();
    let mut total: f64 = weights.iter().sum();

    for cid in 1..k {
        let pick = if total > 0.0 {
            rng.gen_range(0.0..total)
        } else {
            0.0
        };
        let chosen = pool[pick_weighted(&weights, pick)];
        centroids.row_mut(cid).assign(&store.row(chosen));
        if cid % 100 == 0 {
            tracing::debug!(center = cid, row = chosen, "placed center");
        }
        total = tighten_weights(store, &pool, &mut weights, centroids.row(cid));
    }
    centroids
}

/// First slot at which `pick` is used up by the running weights, scanning in
/// order; the last slot when rounding leaves `pick` unspent.
fn pick_weighted(weights: &[f64], mut pick: f64) -> usize {
    for (slot, &weight) in weights.iter().enumerate() {
        if pick <= weight {
            return slot;
        }
        pick -= weight;
    }
    weights.len().saturating_sub(1)
}

/// Lower every weight to the squared distance to `centre` where closer, and
/// return the new total.
fn tighten_weights(
    store: &FeatureStore,
    pool: &[usize],
    weights: &mut [f64],
    centre: ArrayView1<'_, f32>,
) -> f64 {
    let mut total = 0.0;
    for (weight, &row) in weights.iter_mut().zip(pool) {
        let distance = squared_distance_bounded(store.row(row), centre, *weight);
        if distance < *weight {
            *weight = distance;
        }
        total += *weight;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Descriptor;
    use crate::squared_distance;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn store_with(rows: &[Vec<f32>]) -> FeatureStore {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut store = FeatureStore::new();
        let batch: Vec<Descriptor> = rows.iter().cloned().map(Descriptor::new).collect();
        store.append(&batch, 1.0, 0.0, &mut rng).unwrap();
        store
    }

    fn line(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32, (i * 2) as f32]).collect()
    }

    #[test]
    fn parses_every_spelling() {
        assert_eq!("random".parse::<Initialization>().unwrap(), Initialization::Random);
        assert_eq!(
            "KMEANSPP".parse::<Initialization>().unwrap(),
            Initialization::KMeansPlusPlus
        );
        assert_eq!(
            "k-means++".parse::<Initialization>().unwrap(),
            Initialization::KMeansPlusPlus
        );
        assert_eq!(
            "SUBSAMPLED_KMEANSPP".parse::<Initialization>().unwrap(),
            Initialization::SubsampledKMeansPlusPlus
        );
        let err = "gonzales".parse::<Initialization>().unwrap_err();
        assert!(matches!(
            err,
            CodebookError::UnsupportedInitialization(name) if name == "gonzales"
        ));
    }

    #[test]
    fn random_init_picks_distinct_rows() {
        let store = store_with(&line(20));
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let centroids = seed_centroids(&store, 20, Initialization::Random, &mut rng).unwrap();
        let mut firsts: Vec<i64> = centroids.rows().into_iter().map(|r| r[0] as i64).collect();
        firsts.sort_unstable();
        assert_eq!(firsts, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn kmeanspp_spreads_seeds_across_separated_groups() {
        let mut rows = Vec::new();
        for group in 0..4 {
            for i in 0..50 {
                rows.push(vec![group as f32 * 1000.0 + (i % 5) as f32, (i / 5) as f32]);
            }
        }
        let store = store_with(&rows);
        let mut rng = ChaCha8Rng::seed_from_u64(12);
        let centroids =
            seed_centroids(&store, 4, Initialization::KMeansPlusPlus, &mut rng).unwrap();
        let mut groups: Vec<i64> = centroids
            .rows()
            .into_iter()
            .map(|r| (r[0] / 1000.0).round() as i64)
            .collect();
        groups.sort_unstable();
        assert_eq!(groups, vec![0, 1, 2, 3]);
    }

    #[test]
    fn kmeanspp_never_reseeds_a_chosen_row_when_distinct_rows_remain() {
        let store = store_with(&line(30));
        let mut rng = ChaCha8Rng::seed_from_u64(13);
        let centroids =
            seed_centroids(&store, 10, Initialization::KMeansPlusPlus, &mut rng).unwrap();
        for a in 0..10 {
            for b in (a + 1)..10 {
                assert!(squared_distance(centroids.row(a), centroids.row(b)) > 0.0);
            }
        }
    }

    #[test]
    fn subsampled_pool_is_a_tenth_of_the_data() {
        assert_eq!(Initialization::SubsampledKMeansPlusPlus.pool_size(1000), 100);
        assert_eq!(Initialization::SubsampledKMeansPlusPlus.pool_size(15), 2);
        assert_eq!(Initialization::KMeansPlusPlus.pool_size(15), 15);

        let store = store_with(&line(200));
        let mut rng = ChaCha8Rng::seed_from_u64(14);
        let centroids =
            seed_centroids(&store, 5, Initialization::SubsampledKMeansPlusPlus, &mut rng)
                .unwrap();
        assert_eq!(centroids.dim(), (5, 2));

        let err = seed_centroids(&store, 21, Initialization::SubsampledKMeansPlusPlus, &mut rng)
            .unwrap_err();
        assert!(matches!(err, CodebookError::InvalidArgument(_)));
    }

    #[test]
    fn subsample_rows_are_sorted_and_distinct() {
        let mut rng = ChaCha8Rng::seed_from_u64(15);
        let rows = subsample_rows(500, 50, &mut rng);
        assert_eq!(rows.len(), 50);
        assert!(rows.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn identical_rows_do_not_stall_kmeanspp() {
        let store = store_with(&vec![vec![7.0, 7.0]; 12]);
        let mut rng = ChaCha8Rng::seed_from_u64(16);
        let centroids =
            seed_centroids(&store, 3, Initialization::KMeansPlusPlus, &mut rng).unwrap();
        assert!(centroids.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn same_seed_gives_same_centroids() {
        let store = store_with(&line(100));
        let a = seed_centroids(
            &store,
            6,
            Initialization::KMeansPlusPlus,
            &mut ChaCha8Rng::seed_from_u64(17),
        )
        .unwrap();
        let b = seed_centroids(
            &store,
            6,
            Initialization::KMeansPlusPlus,
            &mut ChaCha8Rng::seed_from_u64(17),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn weighted_pick_takes_the_first_slot_that_absorbs_the_draw() {
        let weights = [2.0, 0.0, 3.0, 5.0];
        assert_eq!(pick_weighted(&weights, 0.0), 0);
        assert_eq!(pick_weighted(&weights, 1.5), 0);
        // an exact tie stays on the earlier slot
        assert_eq!(pick_weighted(&weights, 2.0), 0);
        assert_eq!(pick_weighted(&weights, 2.5), 2);
        assert_eq!(pick_weighted(&weights, 5.0), 2);
        assert_eq!(pick_weighted(&weights, 5.5), 3);
        assert_eq!(pick_weighted(&weights, 10.0), 3);
        assert_eq!(pick_weighted(&weights, 10.5), 3);
    }

    #[test]
    fn early_exit_update_matches_full_distances() {
        let mut rng = ChaCha8Rng::seed_from_u64(19);
        let rows: Vec<Vec<f32>> = (0..60)
            .map(|_| (0..8).map(|_| rng.gen_range(0.0f32..50.0)).collect())
            .collect();
        let store = store_with(&rows);
        let pool: Vec<usize> = (0..60).collect();
        let first = store.row(3);
        let second = store.row(41);

        let mut weights: Vec<f64> = pool
            .iter()
            .map(|&row| squared_distance_bounded(store.row(row), first, f64::INFINITY))
            .collect();
        let total = tighten_weights(&store, &pool, &mut weights, second);

        let full: Vec<f64> = pool
            .iter()
            .map(|&row| {
                let to_first = squared_distance_bounded(store.row(row), first, f64::INFINITY);
                let to_second = squared_distance_bounded(store.row(row), second, f64::INFINITY);
                to_first.min(to_second)
            })
            .collect();
        assert_eq!(weights, full);
        assert_eq!(total, full.iter().sum::<f64>());
        assert_eq!(weights[3], 0.0);
        assert_eq!(weights[41], 0.0);
    }

    #[test]
    fn empty_store_is_rejected() {
        let store = FeatureStore::new();
        let mut rng = ChaCha8Rng::seed_from_u64(18);
        let err = seed_centroids(&store, 2, Initialization::Random, &mut rng).unwrap_err();
        assert!(matches!(err, CodebookError::EmptyDataset));
    }
}
