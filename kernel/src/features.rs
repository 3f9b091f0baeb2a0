//! Feature access: index-based reads of per-element vectors
//!
//! The engine never needs the whole matrix resident. A chunk asks for the
//! handful of rows it touches through [`FeatureStore::feature_vectors`];
//! [`MmapFeatures`] serves those straight out of a mapped file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::Mmap;
use ndarray::{Array1, Array2, Axis};

use crate::error::{PairwiseError, Result};

/// Read-only random access to fixed-length feature vectors.
pub trait FeatureStore: Send + Sync {
    /// Number of stored vectors.
    fn len(&self) -> usize;

    /// Length of each vector.
    fn dim(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn feature_vector(&self, index: usize) -> Result<Array1<f32>>;

    /// Batched read, one output row per requested index.
    fn feature_vectors(&self, indices: &[usize]) -> Result<Array2<f32>> {
        let mut out = Array2::zeros((indices.len(), self.dim()));
        for (slot, &index) in indices.iter().enumerate() {
            out.row_mut(slot).assign(&self.feature_vector(index)?);
        }
        Ok(out)
    }
}

fn unavailable(index: usize, len: usize) -> PairwiseError {
    PairwiseError::FeatureUnavailable {
        index,
        reason: format!("index out of bounds for {} vectors", len),
    }
}

/// In-memory row-major feature matrix.
#[derive(Debug, Clone)]
pub struct DenseFeatures {
    data: Array2<f32>,
}

impl DenseFeatures {
    pub fn new(data: Array2<f32>) -> Self {
        Self { data }
    }

    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let len = rows.len();
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        if let Some(bad) = rows.iter().position(|r| r.len() != dim) {
            return Err(PairwiseError::InvalidConfig(format!(
                "row {} has {} features, expected {}",
                bad,
                rows[bad].len(),
                dim
            )));
        }
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let data = Array2::from_shape_vec((len, dim), flat)
            .map_err(|e| PairwiseError::InvalidConfig(e.to_string()))?;
        Ok(Self { data })
    }

    /// Center and scale every row so dot products become Pearson correlations.
    pub fn standardized(mut self) -> Self {
        standardize_rows(&mut self.data);
        self
    }

    pub fn matrix(&self) -> &Array2<f32> {
        &self.data
    }
}

impl FeatureStore for DenseFeatures {
    fn len(&self) -> usize {
        self.data.nrows()
    }

    fn dim(&self) -> usize {
        self.data.ncols()
    }

    fn feature_vector(&self, index: usize) -> Result<Array1<f32>> {
        if index >= self.data.nrows() {
            return Err(unavailable(index, self.data.nrows()));
        }
        Ok(self.data.row(index).to_owned())
    }

    fn feature_vectors(&self, indices: &[usize]) -> Result<Array2<f32>> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.data.nrows()) {
            return Err(unavailable(bad, self.data.nrows()));
        }
        Ok(self.data.select(Axis(0), indices))
    }
}

/// Subtract each row's mean and divide by its centered L2 norm.
/// Constant rows become all zeros.
pub fn standardize_rows(data: &mut Array2<f32>) {
    for mut row in data.rows_mut() {
        let n = row.len();
        if n == 0 {
            continue;
        }
        let mean = row.sum() / n as f32;
        row.mapv_inplace(|x| x - mean);
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|x| x / norm);
        } else {
            row.fill(0.0);
        }
    }
}

const MAGIC: &[u8; 8] = b"PWFEAT01";
const HEADER_LEN: usize = 24;

/// Memory-mapped feature file.
///
/// Layout:
/// - Header: `[8 bytes magic][u64 rows][u64 dim]`, little-endian
/// - Data: `rows * dim` little-endian f32, row-major
pub struct MmapFeatures {
    mmap: Mmap,
    rows: usize,
    dim: usize,
    path: PathBuf,
}

impl MmapFeatures {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let corrupt = |msg: &str| {
            PairwiseError::InvalidConfig(format!(
                "{}: {}",
                path.as_ref().display(),
                msg
            ))
        };

        if mmap.len() < HEADER_LEN || &mmap[..8] != MAGIC {
            return Err(corrupt("not a feature file"));
        }
        let mut header = &mmap[MAGIC.len()..HEADER_LEN];
        let rows = header.read_u64::<LittleEndian>()? as usize;
        let dim = header.read_u64::<LittleEndian>()? as usize;
        let expected = rows
            .checked_mul(dim)
            .and_then(|v| v.checked_mul(4))
            .and_then(|v| v.checked_add(HEADER_LEN))
            .ok_or_else(|| corrupt("header overflows"))?;
        if mmap.len() != expected {
            return Err(corrupt("size does not match header"));
        }

        Ok(Self {
            mmap,
            rows,
            dim,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row_bytes(&self, index: usize) -> Result<&[u8]> {
        if index >= self.rows {
            return Err(unavailable(index, self.rows));
        }
        let start = HEADER_LEN + index * self.dim * 4;
        Ok(&self.mmap[start..start + self.dim * 4])
    }
}

impl FeatureStore for MmapFeatures {
    fn len(&self) -> usize {
        self.rows
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn feature_vector(&self, index: usize) -> Result<Array1<f32>> {
        let mut row = vec![0f32; self.dim];
        LittleEndian::read_f32_into(self.row_bytes(index)?, &mut row);
        Ok(Array1::from_vec(row))
    }

    fn feature_vectors(&self, indices: &[usize]) -> Result<Array2<f32>> {
        let mut flat = vec![0f32; indices.len() * self.dim];
        for (slot, &index) in indices.iter().enumerate() {
            let dst = &mut flat[slot * self.dim..(slot + 1) * self.dim];
            LittleEndian::read_f32_into(self.row_bytes(index)?, dst);
        }
        Array2::from_shape_vec((indices.len(), self.dim), flat)
            .map_err(|e| PairwiseError::InvalidConfig(e.to_string()))
    }
}

/// Write a matrix in the [`MmapFeatures`] layout.
pub fn write_features<P: AsRef<Path>>(path: P, data: &Array2<f32>) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(MAGIC)?;
    out.write_u64::<LittleEndian>(data.nrows() as u64)?;
    out.write_u64::<LittleEndian>(data.ncols() as u64)?;
    for &v in data.iter() {
        out.write_f32::<LittleEndian>(v)?;
    }
    out.flush()?;
    Ok(())
}
