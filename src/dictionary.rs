//! Codebook output records.

use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{CodebookError, Result};

/// Number of trailing spatial dimensions when location weighting is on.
pub const SPATIAL_DIMENSIONS: usize = 2;

/// One codeword: the mean of the descriptors assigned to it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Centroid {
    pub bins: Vec<f32>,
}

/// Ordered list of centroids plus the weighting applied to the trailing
/// location dimensions (0 when the descriptors carried no location).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dictionary {
    pub centroids: Vec<Centroid>,
    pub location_weighting: f32,
}

impl Dictionary {
    /// Build a dictionary from centroid rows.
    pub fn from_matrix(centroids: &Array2<f32>, location_weighting: f32) -> Self {
        Self {
            centroids: centroids
                .rows()
                .into_iter()
                .map(|row| Centroid { bins: row.to_vec() })
                .collect(),
            location_weighting,
        }
    }

    pub fn len(&self) -> usize {
        self.centroids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centroids.is_empty()
    }

    /// Width of every centroid, 0 for an empty dictionary.
    pub fn dimensions(&self) -> usize {
        self.centroids.first().map_or(0, |c| c.bins.len())
    }

    /// How many trailing dimensions of each centroid are spatial.
    pub fn spatial_dimensions(&self) -> usize {
        if self.location_weighting > 0.0 {
            SPATIAL_DIMENSIONS
        } else {
            0
        }
    }

    /// Centroids as a `k x dims` matrix; fails if the rows are ragged.
    pub fn to_matrix(&self) -> Result<Array2<f32>> {
        let dims = self.dimensions();
        let mut matrix = Array2::zeros((self.len(), dims));
        for (mut row, centroid) in matrix.rows_mut().into_iter().zip(&self.centroids) {
            if centroid.bins.len() != dims {
                return Err(CodebookError::DimensionMismatch {
                    expected: dims,
                    actual: centroid.bins.len(),
                });
            }
            for (dst, &src) in row.iter_mut().zip(&centroid.bins) {
                *dst = src;
            }
        }
        Ok(matrix)
    }

    /// Persist the dictionary as pretty-printed JSON.
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;

    #[test]
    fn matrix_rows_become_centroids_in_order() {
        let dictionary = Dictionary::from_matrix(&arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]), 1.5);
        assert_eq!(dictionary.len(), 2);
        assert_eq!(dictionary.dimensions(), 3);
        assert_eq!(dictionary.spatial_dimensions(), 2);
        assert_eq!(dictionary.centroids[1].bins, vec![4.0, 5.0, 6.0]);
        assert_eq!(
            dictionary.to_matrix().unwrap(),
            arr2(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]])
        );
    }

    #[test]
    fn ragged_centroids_cannot_become_a_matrix() {
        let dictionary = Dictionary {
            centroids: vec![
                Centroid { bins: vec![1.0, 2.0] },
                Centroid { bins: vec![3.0] },
            ],
            location_weighting: 0.0,
        };
        assert_eq!(dictionary.spatial_dimensions(), 0);
        let err = dictionary.to_matrix().unwrap_err();
        assert!(matches!(
            err,
            CodebookError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dictionary.json");
        let dictionary = Dictionary::from_matrix(&arr2(&[[0.5, 127.0]]), 0.0);
        dictionary.save_json(&path).unwrap();
        assert_eq!(Dictionary::load_json(&path).unwrap(), dictionary);
        assert!(Dictionary::default().is_empty());
    }
}
