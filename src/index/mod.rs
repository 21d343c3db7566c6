//! Vector index seam and backends.
//!
//! The rest of the system talks to the index through two methods, `insert`
//! and `search`, so backends can be swapped without touching the write path:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │        VectorIndex (enum)        │
//! └──────────┬───────────────────────┘
//!            │
//!    ┌───────┴────────┐
//!    │                │
//! FlatIndex       HnswIndex
//! (exact scan)    (graph ANN)
//! ```
//!
//! Neither backend is crash-safe on its own; durability belongs to the WAL,
//! and both indexes are rebuilt from it on recovery.

mod flat;
mod hnsw;

pub use flat::FlatIndex;
pub use hnsw::HnswIndex;

use roaring::RoaringBitmap;
use thiserror::Error;

use crate::model::{HnswIndexOption, IndexKind, MetricType};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("data and labels length mismatch: {rows} rows, {labels} labels")]
    LabelMismatch { rows: usize, labels: usize },

    #[error("hnsw index requires construction parameters")]
    MissingHnswParams,
}

/// A batch of vectors to insert: `rows * cols` floats in row-major order
/// with one label per row. Labels are `i64` for interoperability with the
/// usual ANN library convention; ids handed out by the coordinator always
/// fit the positive range.
pub struct InsertBatch<'a> {
    pub rows: usize,
    pub cols: usize,
    pub data: &'a [f32],
    pub labels: &'a [i64],
}

/// A k-NN search request against the index.
pub struct SearchQuery<'a> {
    pub vector: &'a [f32],
    /// Restriction set of candidate labels. An empty bitmap behaves like no
    /// restriction at all. Honored during the scan/traversal, never by
    /// post-filtering, so a tight restriction cannot starve the result count.
    pub restriction: Option<&'a RoaringBitmap>,
    /// Beam width override for HNSW search; ignored by the flat backend.
    pub ef_search: Option<usize>,
}

impl<'a> SearchQuery<'a> {
    pub fn new(vector: &'a [f32]) -> Self {
        Self {
            vector,
            restriction: None,
            ef_search: None,
        }
    }
}

/// Search results: parallel distance/label lists, best first. For `l2` the
/// distances are squared Euclidean ascending; for `ip` they are inner
/// products descending.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub distances: Vec<f32>,
    pub labels: Vec<i64>,
}

impl SearchOutcome {
    fn empty() -> Self {
        Self {
            distances: Vec::new(),
            labels: Vec::new(),
        }
    }
}

/// Checks a restriction bitmap, treating an empty one as "allow all".
fn admits(restriction: Option<&RoaringBitmap>, label: i64) -> bool {
    match restriction {
        Some(bitmap) if !bitmap.is_empty() => label >= 0 && bitmap.contains(label as u32),
        _ => true,
    }
}

/// Tagged dispatch over the available backends.
pub enum VectorIndex {
    Flat(FlatIndex),
    Hnsw(HnswIndex),
}

impl VectorIndex {
    pub fn new(
        kind: IndexKind,
        dim: usize,
        metric: MetricType,
        hnsw_params: Option<&HnswIndexOption>,
    ) -> Result<Self, IndexError> {
        match kind {
            IndexKind::Flat => Ok(VectorIndex::Flat(FlatIndex::new(dim, metric))),
            IndexKind::Hnsw => {
                let params = hnsw_params.ok_or(IndexError::MissingHnswParams)?;
                Ok(VectorIndex::Hnsw(HnswIndex::new(dim, metric, params)))
            }
        }
    }

    /// Insert a batch of vectors. One call, atomic from the caller's view.
    pub fn insert(&mut self, batch: &InsertBatch<'_>) -> Result<(), IndexError> {
        validate_batch(batch, self.dim())?;
        match self {
            VectorIndex::Flat(index) => index.insert(batch),
            VectorIndex::Hnsw(index) => index.insert(batch),
        }
        Ok(())
    }

    /// Search for the `k` nearest neighbors. `k` is capped to the number of
    /// indexed vectors; an empty index yields an empty outcome.
    pub fn search(&self, query: &SearchQuery<'_>, k: usize) -> Result<SearchOutcome, IndexError> {
        if query.vector.len() != self.dim() {
            return Err(IndexError::DimensionMismatch {
                expected: self.dim(),
                actual: query.vector.len(),
            });
        }
        let k = k.min(self.ntotal());
        if k == 0 {
            return Ok(SearchOutcome::empty());
        }
        Ok(match self {
            VectorIndex::Flat(index) => index.search(query, k),
            VectorIndex::Hnsw(index) => index.search(query, k),
        })
    }

    pub fn ntotal(&self) -> usize {
        match self {
            VectorIndex::Flat(index) => index.ntotal(),
            VectorIndex::Hnsw(index) => index.ntotal(),
        }
    }

    fn dim(&self) -> usize {
        match self {
            VectorIndex::Flat(index) => index.dim(),
            VectorIndex::Hnsw(index) => index.dim(),
        }
    }
}

fn validate_batch(batch: &InsertBatch<'_>, dim: usize) -> Result<(), IndexError> {
    if batch.cols != dim {
        return Err(IndexError::DimensionMismatch {
            expected: dim,
            actual: batch.cols,
        });
    }
    if batch.rows != batch.labels.len() {
        return Err(IndexError::LabelMismatch {
            rows: batch.rows,
            labels: batch.labels.len(),
        });
    }
    if batch.rows * batch.cols != batch.data.len() {
        return Err(IndexError::DimensionMismatch {
            expected: batch.rows * batch.cols,
            actual: batch.data.len(),
        });
    }
    Ok(())
}
