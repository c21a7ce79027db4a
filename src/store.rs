//! Growable feature store that accumulates descriptor rows before clustering.

use ndarray::ArrayView1;
use rand::Rng;
use rayon::prelude::*;

use crate::{CodebookError, Result};

/// Multiplier applied to fractional `[0, 1]` locations so that they live on
/// the same `[0, 127]` scale as quantised appearance bins.
pub const LOCATION_SCALE: f32 = 127.0;

/// A local image descriptor: appearance bins plus an optional fractional
/// location in `[0, 1] x [0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub bins: Vec<f32>,
    pub location: Option<(f32, f32)>,
}

impl Descriptor {
    pub fn new(bins: Vec<f32>) -> Self {
        Self {
            bins,
            location: None,
        }
    }

    pub fn with_location(bins: Vec<f32>, x: f32, y: f32) -> Self {
        Self {
            bins,
            location: Some((x, y)),
        }
    }
}

/// Row layout fixed by the first non-empty append.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Layout {
    appearance: usize,
    location_weight: f32,
}

impl Layout {
    fn has_location(&self) -> bool {
        self.location_weight > 0.0
    }

    fn dims(&self) -> usize {
        if self.has_location() {
            self.appearance + 2
        } else {
            self.appearance
        }
    }
}

/// Dense row-major `rows x dims` matrix of `f32` feature rows.
///
/// Physical capacity grows by doubling and only shrinks through
/// [`FeatureStore::truncate`].
#[derive(Debug, Clone, Default)]
pub struct FeatureStore {
    values: Vec<f32>,
    rows: usize,
    capacity_rows: usize,
    layout: Option<Layout>,
}

impl FeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical number of stored rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Row width, or 0 before the first non-empty append.
    pub fn dims(&self) -> usize {
        self.layout.map_or(0, |layout| layout.dims())
    }

    /// Number of rows the store can hold before it has to grow again.
    pub fn capacity(&self) -> usize {
        self.capacity_rows
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Location weighting fixed at the first append (0 when rows carry no
    /// spatial dimensions).
    pub fn location_weight(&self) -> f32 {
        self.layout.map_or(0.0, |layout| layout.location_weight)
    }

    /// Borrow row `i`.
    pub fn row(&self, i: usize) -> ArrayView1<'_, f32> {
        let dims = self.dims();
        ArrayView1::from(&self.values[i * dims..(i + 1) * dims])
    }

    /// Iterate over all logical rows in insertion order.
    pub fn iter_rows(&self) -> impl Iterator<Item = ArrayView1<'_, f32>> + '_ {
        let dims = self.dims().max(1);
        self.values[..self.rows * self.dims()]
            .chunks_exact(dims)
            .map(ArrayView1::from)
    }

    /// Parallel iterator over all logical rows, preserving row order on collect.
    pub fn par_rows(&self) -> impl IndexedParallelIterator<Item = ArrayView1<'_, f32>> + '_ {
        let dims = self.dims().max(1);
        self.values[..self.rows * self.dims()]
            .par_chunks_exact(dims)
            .map(ArrayView1::from)
    }

    /// Append the rows of `batch` that survive an independent Bernoulli trial
    /// with probability `keep_probability`, returning how many were kept.
    ///
    /// With `location_weight > 0` each stored row gains two trailing columns
    /// holding `x * 127 * location_weight` and `y * 127 * location_weight`.
    /// An empty batch is a no-op. The whole batch is validated before any row
    /// is stored.
    pub fn append<R: Rng + ?Sized>(
        &mut self,
        batch: &[Descriptor],
        keep_probability: f32,
        location_weight: f32,
        rng: &mut R,
    ) -> Result<usize> {
        let Some(first) = batch.first() else {
            return Ok(0);
        };
        if !(0.0..=1.0).contains(&keep_probability) {
            return Err(CodebookError::InvalidArgument(format!(
                "keep probability must be within [0, 1], got {keep_probability}"
            )));
        }
        if !location_weight.is_finite() || location_weight < 0.0 {
            return Err(CodebookError::InvalidArgument(format!(
                "location weighting must be finite and non-negative, got {location_weight}"
            )));
        }

        let layout = Layout {
            appearance: first.bins.len(),
            location_weight,
        };
        if layout.dims() == 0 {
            return Err(CodebookError::InvalidArgument(
                "descriptors must carry at least one dimension".into(),
            ));
        }
        self.check_layout(layout)?;
        for descriptor in batch {
            if descriptor.bins.len() != layout.appearance {
                return Err(CodebookError::DimensionMismatch {
                    expected: layout.appearance,
                    actual: descriptor.bins.len(),
                });
            }
            if layout.has_location() && descriptor.location.is_none() {
                return Err(CodebookError::InvalidArgument(
                    "location weighting is enabled but a descriptor has no location".into(),
                ));
            }
        }

        self.layout = Some(layout);
        self.reserve_rows(self.rows + batch.len());

        let scale = LOCATION_SCALE * location_weight;
        let mut kept = 0usize;
        for descriptor in batch {
            if rng.gen::<f32>() >= keep_probability {
                continue;
            }
            self.values.extend_from_slice(&descriptor.bins);
            if let (true, Some((x, y))) = (layout.has_location(), descriptor.location) {
                self.values.push(x * scale);
                self.values.push(y * scale);
            }
            kept += 1;
        }
        self.rows += kept;
        tracing::trace!(
            offered = batch.len(),
            kept,
            rows = self.rows,
            capacity = self.capacity_rows,
            "appended descriptor batch"
        );
        Ok(kept)
    }

    /// Release any capacity beyond the logical row count.
    pub fn truncate(&mut self) {
        self.values.truncate(self.rows * self.dims());
        self.values.shrink_to_fit();
        self.capacity_rows = self.rows;
    }

    fn check_layout(&self, layout: Layout) -> Result<()> {
        let Some(existing) = self.layout else {
            return Ok(());
        };
        if existing != layout {
            tracing::debug!(
                fixed_weight = existing.location_weight,
                offered_weight = layout.location_weight,
                "rejected batch with a different layout"
            );
            return Err(CodebookError::DimensionMismatch {
                expected: existing.dims(),
                actual: layout.dims(),
            });
        }
        Ok(())
    }

    /// Grow to hold `required` rows: the first allocation is exact, later ones
    /// double until large enough.
    fn reserve_rows(&mut self, required: usize) {
        if required <= self.capacity_rows {
            return;
        }
        let mut capacity = if self.capacity_rows == 0 {
            required
        } else {
            self.capacity_rows
        };
        while capacity < required {
            capacity *= 2;
        }
        let dims = self.dims();
        self.values
            .reserve_exact(capacity * dims - self.values.len());
        tracing::debug!(
            from = self.capacity_rows,
            to = capacity,
            "grew feature store"
        );
        self.capacity_rows = capacity;
    }
}
