//! Descriptor-set loading for the command-line tool.
//!
//! Descriptor files are CSV (with a header) or Parquet. Columns named `x` and
//! `y` hold the fractional location; every other column is an appearance bin.

use std::fs::File;
use std::path::{Path, PathBuf};

use csv::ReaderBuilder;
use parquet::file::reader::{FileReader, SerializedFileReader};
use parquet::record::{Field, Row};

use crate::store::Descriptor;
use crate::{CodebookError, Result};

/// Where the descriptor files come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    /// A text file listing one descriptor file per line.
    List(PathBuf),
    /// A single descriptor file.
    File(PathBuf),
}

impl InputSource {
    /// Parse `list:<path>`, `file:<path>` or a bare path (treated as `file:`).
    pub fn parse(raw: &str) -> Self {
        if let Some(path) = raw.strip_prefix("list:") {
            InputSource::List(expand_home(path.trim()))
        } else if let Some(path) = raw.strip_prefix("file:") {
            InputSource::File(expand_home(path.trim()))
        } else {
            InputSource::File(expand_home(raw.trim()))
        }
    }

    /// Descriptor files named by this source.
    pub fn files(&self) -> Result<Vec<PathBuf>> {
        match self {
            InputSource::File(path) => Ok(vec![path.clone()]),
            InputSource::List(path) => DescriptorLoader::read_list(path),
        }
    }
}

/// Replace a leading `~` with `$HOME`.
fn expand_home(raw: &str) -> PathBuf {
    match (raw.strip_prefix('~'), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => {
            let mut path = PathBuf::from(home);
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() {
                path.push(rest);
            }
            path
        }
        _ => PathBuf::from(raw),
    }
}

/// Columns of a descriptor file split into bins and location.
struct ColumnLayout {
    bins: Vec<usize>,
    location: Option<(usize, usize)>,
}

impl ColumnLayout {
    fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut bins = Vec::new();
        let (mut x, mut y) = (None, None);
        for (col, name) in names.into_iter().enumerate() {
            match name.trim().to_ascii_lowercase().as_str() {
                "x" => x = Some(col),
                "y" => y = Some(col),
                _ => bins.push(col),
            }
        }
        let location = match (x, y) {
            (Some(x), Some(y)) => Some((x, y)),
            (None, None) => None,
            _ => {
                return Err(CodebookError::InvalidArgument(
                    "descriptor files need both an x and a y column, or neither".into(),
                ))
            }
        };
        Ok(Self { bins, location })
    }

    fn descriptor(&self, values: &[f32]) -> Descriptor {
        let bins = self.bins.iter().map(|&col| values[col]).collect();
        match self.location {
            Some((x, y)) => Descriptor::with_location(bins, values[x], values[y]),
            None => Descriptor::new(bins),
        }
    }
}

/// Loads descriptor files into [`Descriptor`] batches.
pub struct DescriptorLoader;

impl DescriptorLoader {
    /// Load a descriptor file, picking the format from its extension.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Descriptor>> {
        let path = path.as_ref();
        let is_parquet = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "parquet" | "pq"))
            .unwrap_or(false);
        let descriptors = if is_parquet {
            Self::load_parquet(path)?
        } else {
            Self::load_csv(path)?
        };
        tracing::debug!(path = ?path, descriptors = descriptors.len(), "loaded descriptor file");
        Ok(descriptors)
    }

    /// Load a CSV file with a header row and numeric columns.
    pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Descriptor>> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_path(path)?;
        let layout = ColumnLayout::from_names(rdr.headers()?.iter())?;
        let mut descriptors = Vec::new();
        let mut values = Vec::new();
        for record in rdr.records() {
            let record = record?;
            values.clear();
            for field in record.iter() {
                values.push(field.trim().parse::<f32>()?);
            }
            descriptors.push(layout.descriptor(&values));
        }
        Ok(descriptors)
    }

    /// Load a Parquet file containing only numeric columns.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Vec<Descriptor>> {
        let file = File::open(path)?;
        let reader = SerializedFileReader::new(file)?;
        let rows: Vec<Row> = reader
            .get_row_iter(None)?
            .collect::<std::result::Result<_, _>>()?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let layout = ColumnLayout::from_names(first.get_column_iter().map(|(name, _)| name.as_str()))?;
        let width = first.len();

        let mut descriptors = Vec::with_capacity(rows.len());
        let mut values = Vec::with_capacity(width);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(CodebookError::DimensionMismatch {
                    expected: width,
                    actual: row.len(),
                });
            }
            values.clear();
            for (j, (_, field)) in row.get_column_iter().enumerate() {
                let value = match field {
                    Field::Float(v) => *v,
                    Field::Double(v) => *v as f32,
                    Field::Int(v) => *v as f32,
                    Field::Long(v) => *v as f32,
                    Field::Short(v) => *v as f32,
                    Field::Byte(v) => *v as f32,
                    Field::UInt(v) => *v as f32,
                    Field::ULong(v) => *v as f32,
                    Field::UShort(v) => *v as f32,
                    Field::UByte(v) => *v as f32,
                    Field::Null => {
                        return Err(CodebookError::InvalidArgument(format!(
                            "row {i} column {j} is NULL"
                        )))
                    }
                    other => {
                        return Err(CodebookError::InvalidArgument(format!(
                            "unsupported parquet field at row {i} column {j}: {other:?}"
                        )))
                    }
                };
                values.push(value);
            }
            descriptors.push(layout.descriptor(&values));
        }
        Ok(descriptors)
    }

    /// Read a list file: one descriptor file per line, blank lines skipped.
    pub fn read_list<P: AsRef<Path>>(path: P) -> Result<Vec<PathBuf>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(expand_home)
            .collect())
    }
}
