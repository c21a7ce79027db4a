//! Precision-driven selection of an index family and search budget.
//!
//! A sample of the indexed points doubles as the query set: each test query
//! must find its closest *other* sample point. Every candidate configuration
//! is built over the sample, given the smallest check budget that reaches the
//! target precision, and scored by the distance evaluations it spends.

use ndarray::{Array2, Axis};
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::{
    Checks, IndexParams, KMeansTree, KdForest, LinearIndex, NearestNeighborIndex, TunedIndex,
};
use crate::{CodebookError, Result};

const KD_TREE_COUNTS: [usize; 5] = [1, 4, 8, 16, 32];
const KMEANS_BRANCHINGS: [usize; 5] = [16, 32, 64, 128, 256];
const KMEANS_ITERATIONS: [usize; 4] = [1, 5, 10, 15];
const CB_INDEX: f32 = 0.2;
const MAX_TEST_QUERIES: usize = 1000;
const MIN_TEST_QUERIES: usize = 10;

/// Cost weighting used while auto-tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneSettings {
    /// Importance of build cost relative to search cost.
    pub build_weight: f32,
    /// Importance of index memory relative to search cost.
    pub memory_weight: f32,
    /// Fraction of the points used for tuning, in `(0, 1]`.
    pub sample_fraction: f32,
}

impl Default for AutotuneSettings {
    fn default() -> Self {
        Self {
            build_weight: 0.0,
            memory_weight: 0.0,
            sample_fraction: 1.0,
        }
    }
}

impl AutotuneSettings {
    pub fn validate(&self) -> Result<()> {
        if !(self.build_weight >= 0.0 && self.build_weight.is_finite()) {
            return Err(CodebookError::InvalidArgument(
                "autotune.build_weight must be a finite value >= 0".into(),
            ));
        }
        if !(self.memory_weight >= 0.0 && self.memory_weight.is_finite()) {
            return Err(CodebookError::InvalidArgument(
                "autotune.memory_weight must be a finite value >= 0".into(),
            ));
        }
        if !(self.sample_fraction > 0.0 && self.sample_fraction <= 1.0) {
            return Err(CodebookError::InvalidArgument(
                "autotune.sample_fraction must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    params: IndexParams,
    checks: Checks,
    precision: f32,
    /// Mean distance evaluations per test query.
    search_cost: f64,
    build_cost: f64,
    memory_bytes: usize,
}

/// The tuning queries with the squared distance to their closest other point.
struct TestSet<'a> {
    data: &'a Array2<f32>,
    rows: Vec<usize>,
    truth: Vec<f32>,
}

impl<'a> TestSet<'a> {
    fn new(data: &'a Array2<f32>, rows: Vec<usize>) -> Self {
        let linear = LinearIndex::new(data.clone());
        let truth = rows
            .iter()
            .map(|&row| {
                linear
                    .search(data.row(row), 2, Checks::Unlimited)
                    .neighbors
                    .iter()
                    .find(|n| n.index != row)
                    .map_or(f32::INFINITY, |n| n.distance)
            })
            .collect();
        Self { data, rows, truth }
    }

    /// Fraction of queries answered correctly and mean evaluations per query.
    fn precision(&self, index: &dyn NearestNeighborIndex, checks: Checks) -> (f32, f64) {
        let mut correct = 0usize;
        let mut evaluations = 0usize;
        for (&row, &expected) in self.rows.iter().zip(&self.truth) {
            let outcome = index.search(self.data.row(row), 2, checks);
            evaluations += outcome.evaluations;
            let found = outcome
                .neighbors
                .iter()
                .find(|n| n.index != row)
                .map_or(false, |n| n.distance <= expected);
            if found {
                correct += 1;
            }
        }
        let queries = self.rows.len() as f64;
        ((correct as f64 / queries) as f32, evaluations as f64 / queries)
    }

    /// Smallest check budget reaching `target`: double until it passes, then
    /// bisect between the last failing and the first passing budget.
    fn tune_checks(
        &self,
        index: &dyn NearestNeighborIndex,
        target: f32,
    ) -> (Checks, f32, f64) {
        let ceiling = 4 * index.len() + 4;
        let (mut precision, mut cost) = self.precision(index, Checks::Bounded(1));
        if precision >= target {
            return (Checks::Bounded(1), precision, cost);
        }
        let mut low = 1;
        let mut high = 1;
        while precision < target {
            if high >= ceiling {
                let (precision, cost) = self.precision(index, Checks::Unlimited);
                return (Checks::Unlimited, precision, cost);
            }
            low = high;
            high *= 2;
            (precision, cost) = self.precision(index, Checks::Bounded(high));
        }
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            let (p, c) = self.precision(index, Checks::Bounded(mid));
            if p >= target {
                high = mid;
                precision = p;
                cost = c;
            } else {
                low = mid;
            }
        }
        (Checks::Bounded(high), precision, cost)
    }

    fn evaluate(&self, index: &dyn NearestNeighborIndex, target: f32) -> Candidate {
        let (checks, precision, search_cost) = self.tune_checks(index, target);
        let candidate = Candidate {
            params: index.params(),
            checks,
            precision,
            search_cost,
            build_cost: index.build_evaluations() as f64,
            memory_bytes: index.memory_bytes(),
        };
        tracing::debug!(
            params = %candidate.params,
            checks = %candidate.checks,
            precision = candidate.precision,
            search_cost = candidate.search_cost,
            "evaluated index candidate"
        );
        candidate
    }
}

/// Choose the index family, parameters and check budget for `points`.
pub(crate) fn tune(
    points: &Array2<f32>,
    target_precision: f32,
    settings: &AutotuneSettings,
    rng: &mut ChaCha8Rng,
) -> Result<TunedIndex> {
    if !(target_precision > 0.0 && target_precision <= 1.0) {
        return Err(CodebookError::InvalidArgument(format!(
            "target precision must be in (0, 1] (got {target_precision})"
        )));
    }
    settings.validate()?;
    let n = points.nrows();
    if n == 0 {
        return Err(CodebookError::InvalidArgument(
            "cannot tune an index over an empty point set".into(),
        ));
    }

    let sample_size = if settings.sample_fraction >= 1.0 {
        n
    } else {
        ((n as f64 * f64::from(settings.sample_fraction)).round() as usize).clamp(1, n)
    };
    let data = if sample_size == n {
        points.clone()
    } else {
        let mut rows = sample(rng, n, sample_size).into_vec();
        rows.sort_unstable();
        points.select(Axis(0), &rows)
    };

    let test_size = (sample_size / 10).min(MAX_TEST_QUERIES);
    if test_size < MIN_TEST_QUERIES {
        tracing::info!(points = n, "too few points to tune; using a linear scan");
        return Ok(TunedIndex {
            params: IndexParams::Linear,
            checks: Checks::Unlimited,
            precision: 1.0,
            search_cost: n as f64,
        });
    }
    let tests = TestSet::new(&data, sample(rng, sample_size, test_size).into_vec());

    let mut candidates = Vec::new();
    for trees in KD_TREE_COUNTS {
        let index = KdForest::build(&data, trees, rng)?;
        candidates.push(tests.evaluate(&index, target_precision));
    }
    for branching in KMEANS_BRANCHINGS {
        if branching >= sample_size {
            continue;
        }
        for iterations in KMEANS_ITERATIONS {
            let index = KMeansTree::build(&data, branching, iterations, CB_INDEX, rng)?;
            candidates.push(tests.evaluate(&index, target_precision));
        }
    }
    candidates.push(Candidate {
        params: IndexParams::Linear,
        checks: Checks::Unlimited,
        precision: 1.0,
        search_cost: sample_size as f64,
        build_cost: 0.0,
        memory_bytes: 0,
    });

    let best = select(&candidates, settings, target_precision, data.len()).ok_or_else(|| {
        CodebookError::InvalidArgument("no index configuration reached the target precision".into())
    })?;
    tracing::info!(
        params = %best.params,
        checks = %best.checks,
        precision = best.precision,
        search_cost = best.search_cost,
        candidates = candidates.len(),
        "selected nearest-neighbour index"
    );
    Ok(TunedIndex {
        params: best.params,
        checks: best.checks,
        precision: best.precision,
        search_cost: best.search_cost,
    })
}

/// Lowest weighted cost among the candidates that reach the target. Ties go
/// to the earlier candidate.
fn select<'c>(
    candidates: &'c [Candidate],
    settings: &AutotuneSettings,
    target: f32,
    data_values: usize,
) -> Option<&'c Candidate> {
    let eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.precision >= target)
        .collect();
    let time = |c: &Candidate| c.search_cost + f64::from(settings.build_weight) * c.build_cost;
    let fastest = eligible
        .iter()
        .map(|c| time(c))
        .fold(f64::INFINITY, f64::min)
        .max(f64::MIN_POSITIVE);
    let data_bytes = (data_values * std::mem::size_of::<f32>()).max(1) as f64;
    let score = |c: &Candidate| {
        time(c) / fastest
            + f64::from(settings.memory_weight) * (c.memory_bytes as f64 + data_bytes) / data_bytes
    };

    let mut best: Option<(&Candidate, f64)> = None;
    for candidate in eligible {
        let s = score(candidate);
        if best.map_or(true, |(_, best_score)| s < best_score) {
            best = Some((candidate, s));
        }
    }
    best.map(|(candidate, _)| candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::uniform_points;
    use crate::index::{DefaultIndexBackend, IndexBackend};
    use rand::SeedableRng;

    #[test]
    fn small_point_sets_fall_back_to_linear_scan() {
        let mut rng = ChaCha8Rng::seed_from_u64(41);
        let points = uniform_points(60, 3, &mut rng);
        let tuned = tune(&points, 0.9, &AutotuneSettings::default(), &mut rng).unwrap();
        assert_eq!(tuned.params, IndexParams::Linear);
        assert_eq!(tuned.checks, Checks::Unlimited);
    }

    #[test]
    fn tuned_index_reaches_the_target_precision() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let points = uniform_points(1000, 4, &mut rng);
        let (index, tuned) = DefaultIndexBackend
            .autotune(&points, 0.9, &AutotuneSettings::default(), &mut rng)
            .unwrap();
        assert!(tuned.precision >= 0.9);
        assert_ne!(tuned.params, IndexParams::Linear);
        assert!(tuned.search_cost < 1000.0);
        assert_eq!(index.params(), tuned.params);
        assert_eq!(index.len(), 1000);
    }

    #[test]
    fn a_low_target_needs_no_more_checks_than_a_high_one() {
        let points = uniform_points(800, 6, &mut ChaCha8Rng::seed_from_u64(43));
        let index = KdForest::build(&points, 4, &mut ChaCha8Rng::seed_from_u64(44)).unwrap();
        let rows = sample(&mut ChaCha8Rng::seed_from_u64(45), 800, 80).into_vec();
        let tests = TestSet::new(&points, rows);

        let (low, low_precision, _) = tests.tune_checks(&index, 0.3);
        let (high, high_precision, _) = tests.tune_checks(&index, 0.9);
        assert!(low_precision >= 0.3);
        assert!(high_precision >= 0.9);
        assert!(low.limit() <= high.limit());
    }

    #[test]
    fn sampling_a_fraction_still_tunes() {
        let mut rng = ChaCha8Rng::seed_from_u64(46);
        let points = uniform_points(2000, 3, &mut rng);
        let settings = AutotuneSettings {
            sample_fraction: 0.25,
            ..AutotuneSettings::default()
        };
        let tuned = tune(&points, 0.8, &settings, &mut rng).unwrap();
        assert!(tuned.precision >= 0.8);
    }

    #[test]
    fn invalid_targets_and_settings_are_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(47);
        let points = uniform_points(200, 2, &mut rng);
        for target in [0.0, -0.5, 1.5] {
            let err = tune(&points, target, &AutotuneSettings::default(), &mut rng).unwrap_err();
            assert!(matches!(err, CodebookError::InvalidArgument(_)));
        }
        let settings = AutotuneSettings {
            sample_fraction: 0.0,
            ..AutotuneSettings::default()
        };
        assert!(tune(&points, 0.5, &settings, &mut rng).is_err());
    }

    #[test]
    fn memory_weight_prefers_lean_indices() {
        let heavy = Candidate {
            params: IndexParams::KdForest { trees: 32 },
            checks: Checks::Bounded(4),
            precision: 0.95,
            search_cost: 10.0,
            build_cost: 0.0,
            memory_bytes: 1_000_000,
        };
        let lean = Candidate {
            params: IndexParams::Linear,
            checks: Checks::Unlimited,
            precision: 1.0,
            search_cost: 20.0,
            build_cost: 0.0,
            memory_bytes: 0,
        };
        let candidates = vec![heavy, lean];
        let by_speed = select(&candidates, &AutotuneSettings::default(), 0.9, 1000).unwrap();
        assert_eq!(by_speed.params, IndexParams::KdForest { trees: 32 });

        let settings = AutotuneSettings {
            memory_weight: 1.0,
            ..AutotuneSettings::default()
        };
        let by_memory = select(&candidates, &settings, 0.9, 1000).unwrap();
        assert_eq!(by_memory.params, IndexParams::Linear);
    }
}
