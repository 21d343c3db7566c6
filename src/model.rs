//! Public parameter and request types.
//!
//! Everything here is serde-deserializable so an embedding layer (HTTP or
//! otherwise) can feed JSON straight into the database API. Documents and
//! attribute maps are kept as raw `serde_json` maps and passed through
//! unchanged; only the filter index imposes a type on attribute values, at
//! commit time.

use std::path::PathBuf;

use serde::Deserialize;

/// A document or attribute map: arbitrary string keys, arbitrary JSON values.
pub type DocMap = serde_json::Map<String, serde_json::Value>;

/// Distance metric used by the vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Squared Euclidean distance, ascending.
    L2,
    /// Inner product, descending.
    Ip,
}

/// Vector index backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Flat,
    Hnsw,
}

/// WAL record encoding. Anything other than `"text"` selects the binary
/// encoder, which is the canonical on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderKind {
    Text,
    #[default]
    #[serde(other)]
    Binary,
}

/// HNSW construction parameters. Required when `index_type` is `hnsw`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HnswIndexOption {
    pub m: usize,
    pub ef_construction: usize,
}

/// Per-query HNSW search parameters.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HnswSearchOption {
    pub ef_search: usize,
}

fn default_flush_interval_secs() -> u64 {
    5
}

/// Database construction parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseParams {
    /// Directory holding the scalar store and the WAL.
    pub file_path: PathBuf,
    pub dim: usize,
    pub metric_type: MetricType,
    pub index_type: IndexKind,
    #[serde(default)]
    pub encoder_type: EncoderKind,
    #[serde(default)]
    pub hnsw_params: Option<HnswIndexOption>,
    /// Opaque version string tagged into every WAL record.
    pub version: String,
    /// Background flush cadence. The default matches the historical 5s.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
}

/// A dense row-major batch of vectors.
///
/// Deserializes from the nested form `[[1.0, 2.0], [3.0, 4.0]]`; ragged rows
/// are rejected at the boundary so everything downstream can assume
/// `data.len() == rows * cols`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Vec<Vec<f32>>")]
pub struct VectorBatch {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl VectorBatch {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, String> {
        if rows * cols != data.len() {
            return Err(format!(
                "expected {} values for a {}x{} batch, got {}",
                rows * cols,
                rows,
                cols,
                data.len()
            ));
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn raw_data(&self) -> &[f32] {
        &self.data
    }
}

impl TryFrom<Vec<Vec<f32>>> for VectorBatch {
    type Error = String;

    fn try_from(rows: Vec<Vec<f32>>) -> Result<Self, Self::Error> {
        if rows.is_empty() {
            return Ok(Self {
                rows: 0,
                cols: 0,
                data: Vec::new(),
            });
        }
        let cols = rows[0].len();
        let mut data = Vec::with_capacity(rows.len() * cols);
        for (i, row) in rows.iter().enumerate() {
            if row.len() != cols {
                return Err(format!(
                    "inconsistent row length at row {}: expected {}, got {}",
                    i,
                    cols,
                    row.len()
                ));
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            rows: rows.len(),
            cols,
            data,
        })
    }
}

/// Arguments for [`Database::upsert`](crate::db::Database::upsert).
///
/// `docs` and `attributes` are either empty or one entry per vector row.
#[derive(Debug, Clone, Deserialize)]
pub struct UpsertRequest {
    pub vectors: VectorBatch,
    #[serde(default)]
    pub docs: Vec<DocMap>,
    #[serde(default)]
    pub attributes: Vec<DocMap>,
}

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equal,
    NotEqual,
}

/// A single integer attribute filter.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterInput {
    pub field: String,
    pub op: FilterOp,
    pub target: i64,
}

/// Arguments for [`Database::query`](crate::db::Database::query).
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub query: Vec<f32>,
    pub k: usize,
    #[serde(default)]
    pub filter_inputs: Vec<FilterInput>,
    #[serde(default)]
    pub hnsw_params: Option<HnswSearchOption>,
}
