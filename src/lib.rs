//! Visual codebook construction for bag-of-words image classification.
//!
//! A [`CodebookBuilder`] accumulates local image descriptors (appearance bins,
//! optionally augmented with a weighted spatial location) and clusters them
//! into a fixed number of centroids with either exact k-means or an
//! approximate variant that assigns points through an auto-tuned
//! nearest-neighbour index over the centroids.

use ndarray::ArrayView1;
use ndarray_rand::rand_distr::{Distribution, Uniform};
use rand::Rng;
use thiserror::Error;

pub mod builder;
pub mod dictionary;
pub mod index;
pub mod init;
pub mod loader;
pub mod store;

pub use builder::{
    Checkpoint, ClusterConfig, ClusterReport, CodebookBuilder, Diagnostics, EmptyClusterPolicy,
    FileCheckpoint,
};
pub use dictionary::{Centroid, Dictionary};
pub use index::{
    AutotuneSettings, Checks, DefaultIndexBackend, IndexBackend, IndexParams,
    NearestNeighborIndex, Neighbor, TunedIndex,
};
pub use init::Initialization;
pub use loader::DescriptorLoader;
pub use store::{Descriptor, FeatureStore, LOCATION_SCALE};

/// Error type used by operations in this crate.
#[derive(Debug, Error)]
pub enum CodebookError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("dimension mismatch: expected {expected} columns, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("no descriptors have been added; nothing to cluster")]
    EmptyDataset,
    #[error("requested {requested} clusters but clustering produced {produced}")]
    ClusterCountMismatch { requested: usize, produced: usize },
    #[error("unsupported initialization '{0}'")]
    UnsupportedInitialization(String),
    #[error("nearest-neighbour index returned no match")]
    NoNeighbor,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Convenient alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, CodebookError>;

/// Squared Euclidean distance between two rows.
pub(crate) fn squared_distance(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Squared distance accumulated in `f64` that stops as soon as the partial
/// sum exceeds `bound`. The returned value is exact whenever it is `<= bound`.
pub(crate) fn squared_distance_bounded(
    a: ArrayView1<'_, f32>,
    b: ArrayView1<'_, f32>,
    bound: f64,
) -> f64 {
    let mut sum = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let diff = f64::from(*x) - f64::from(*y);
        sum += diff * diff;
        if sum > bound {
            break;
        }
    }
    sum
}

/// Generate descriptors scattered uniformly in a square of half-width
/// `spread` around each centre, with bins rounded to the nearest integer the
/// way quantised descriptor files store them.
pub fn generate_descriptors<R: Rng + ?Sized>(
    centres: &[Vec<f32>],
    per_centre: usize,
    spread: f32,
    rng: &mut R,
) -> Vec<Descriptor> {
    let offset = Uniform::new_inclusive(-spread, spread);
    let mut descriptors = Vec::with_capacity(centres.len() * per_centre);
    for centre in centres {
        for _ in 0..per_centre {
            let bins = centre
                .iter()
                .map(|&c| (c + offset.sample(rng) + 0.5).floor())
                .collect();
            descriptors.push(Descriptor::new(bins));
        }
    }
    descriptors
}

/// Like [`generate_descriptors`], but every descriptor also carries a location
/// drawn within `location_spread` of the matching entry of `locations`.
pub fn generate_located_descriptors<R: Rng + ?Sized>(
    centres: &[Vec<f32>],
    locations: &[(f32, f32)],
    per_centre: usize,
    spread: f32,
    location_spread: f32,
    rng: &mut R,
) -> Vec<Descriptor> {
    let offset = Uniform::new_inclusive(-spread, spread);
    let shift = Uniform::new_inclusive(-location_spread, location_spread);
    let mut descriptors = Vec::with_capacity(centres.len() * per_centre);
    for (centre, &(x, y)) in centres.iter().zip(locations) {
        for _ in 0..per_centre {
            let bins = centre
                .iter()
                .map(|&c| (c + offset.sample(rng) + 0.5).floor())
                .collect();
            let location = (x + shift.sample(rng), y + shift.sample(rng));
            descriptors.push(Descriptor::with_location(bins, location.0, location.1));
        }
    }
    descriptors
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn bounded_distance_matches_full_distance_below_bound() {
        let a = arr1(&[1.0f32, 2.0, 3.0]);
        let b = arr1(&[4.0f32, 6.0, 3.0]);
        let full = squared_distance(a.view(), b.view());
        assert_eq!(full, 25.0);
        assert_eq!(squared_distance_bounded(a.view(), b.view(), 100.0), 25.0);
        assert!(squared_distance_bounded(a.view(), b.view(), 4.0) > 4.0);
    }

    #[test]
    fn generated_descriptors_stay_near_their_centre() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let centres = vec![vec![10.0f32, 20.0], vec![50.0, 60.0]];
        let descriptors = generate_descriptors(&centres, 50, 3.0, &mut rng);
        assert_eq!(descriptors.len(), 100);
        for (i, descriptor) in descriptors.iter().enumerate() {
            let centre = &centres[i / 50];
            for (bin, c) in descriptor.bins.iter().zip(centre) {
                assert!((bin - c).abs() <= 3.5);
                assert_eq!(bin.fract(), 0.0);
            }
            assert!(descriptor.location.is_none());
        }
    }
}
