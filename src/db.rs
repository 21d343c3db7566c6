//! Database coordinator.
//!
//! The public face of the crate: validates inputs, allocates ids, drives WAL
//! writes, schedules commits, and serves queries.
//!
//! Two locks, always taken in this order:
//! - the index `RwLock` guards the filter and vector indexes, i.e. the state
//!   queries observe;
//! - the WAL's internal mutex serializes log mutations and commits.
//!
//! Writers hold the index lock exclusively for a whole upsert. Readers take
//! it shared; when pending records exist a reader upgrades by
//! release-and-reacquire, re-checking after the upgrade, so a query only
//! proceeds once it has observed an empty pending queue under a read lock.
//! That is what makes writes read-your-own.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use thiserror::Error;

use crate::encoder::encoder_for;
use crate::filter::IntFilterIndex;
use crate::index::{IndexError, SearchQuery, VectorIndex};
use crate::model::{DatabaseParams, DocMap, QueryRequest, UpsertRequest};
use crate::scalar::{RedbScalarStore, ScalarError, ScalarStore, NAMESPACE_DOCS, NAMESPACE_WALS};
use crate::wal::{CommitSinks, Wal, WalError};

/// Scalar store file inside the database directory.
const SCALAR_DB_FILE: &str = "scalar.db";

/// WAL file inside the database directory.
const WAL_FILE: &str = "vdb.log";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("invalid database parameters: {0}")]
    InvalidParams(&'static str),

    #[error("vector dimension {actual} does not match database dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unexpected length of field {field}: {got}, expected {expected}")]
    Validation {
        field: &'static str,
        got: usize,
        expected: usize,
    },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Scalar(#[from] ScalarError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct Indexes {
    filter: IntFilterIndex,
    vector: VectorIndex,
}

struct Shared {
    params: DatabaseParams,
    scalar: RedbScalarStore,
    wal: Wal,
    indexes: RwLock<Indexes>,
}

impl Shared {
    /// Commit pending WAL records into the indexes behind `guard`.
    fn commit_pending(&self, guard: &mut Indexes) -> Result<(), WalError> {
        let Indexes { filter, vector } = guard;
        self.wal.commit(CommitSinks {
            scalar: &self.scalar,
            filter,
            vector,
            dim: self.params.dim,
        })
    }
}

struct Flusher {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// An embeddable vector database: durable upserts, filtered approximate
/// nearest-neighbor queries.
pub struct Database {
    shared: Arc<Shared>,
    flusher: Option<Flusher>,
}

impl Database {
    /// Open (or create) a database under `params.file_path`, replay any WAL
    /// left behind by an unclean shutdown, and start the background flusher.
    pub fn open(params: DatabaseParams) -> Result<Self, DbError> {
        if params.dim == 0 {
            return Err(DbError::InvalidParams("dim must be positive"));
        }

        std::fs::create_dir_all(&params.file_path)?;

        let scalar = RedbScalarStore::open(
            &params.file_path.join(SCALAR_DB_FILE),
            &[NAMESPACE_DOCS, NAMESPACE_WALS],
        )?;
        let vector = VectorIndex::new(
            params.index_type,
            params.dim,
            params.metric_type,
            params.hnsw_params.as_ref(),
        )?;
        let wal = Wal::open(
            &params.file_path.join(WAL_FILE),
            &params.version,
            encoder_for(params.encoder_type, &params.version),
        )?;

        let shared = Arc::new(Shared {
            params,
            scalar,
            wal,
            indexes: RwLock::new(Indexes {
                filter: IntFilterIndex::new(),
                vector,
            }),
        });

        {
            let mut indexes = shared.indexes.write();
            if let Err(err) = {
                let Indexes { filter, vector } = &mut *indexes;
                shared.wal.restore(CommitSinks {
                    scalar: &shared.scalar,
                    filter,
                    vector,
                    dim: shared.params.dim,
                })
            } {
                // The WAL stays on disk for a retry at the next open.
                tracing::warn!(error = %err, "WAL restore failed, continuing with replayed prefix");
            }
        }

        let flusher = spawn_flusher(Arc::clone(&shared));
        Ok(Self {
            shared,
            flusher: Some(flusher),
        })
    }

    /// Insert a batch of vectors with optional documents and attributes.
    ///
    /// Each row is assigned the next id, written to the WAL, and committed
    /// eagerly, so a returned error means earlier rows of the batch are
    /// already applied and later ones were not attempted.
    pub fn upsert(&self, request: UpsertRequest) -> Result<(), DbError> {
        let mut indexes = self.shared.indexes.write();

        let rows = request.vectors.rows();
        let dim = self.shared.params.dim;
        if request.vectors.cols() != dim && rows > 0 {
            return Err(DbError::DimensionMismatch {
                expected: dim,
                actual: request.vectors.cols(),
            });
        }
        if !request.docs.is_empty() && request.docs.len() != rows {
            return Err(DbError::Validation {
                field: "docs",
                got: request.docs.len(),
                expected: rows,
            });
        }
        if !request.attributes.is_empty() && request.attributes.len() != rows {
            return Err(DbError::Validation {
                field: "attributes",
                got: request.attributes.len(),
                expected: rows,
            });
        }

        let ids = self.shared.scalar.alloc_ids(NAMESPACE_DOCS, rows)?;
        tracing::info!(?ids, "upserting vector data");

        for (i, &id) in ids.iter().enumerate() {
            let doc = request.docs.get(i).cloned().unwrap_or_default();
            let attributes = request.attributes.get(i).cloned().unwrap_or_default();
            let Indexes { filter, vector } = &mut *indexes;
            self.shared.wal.write(
                id,
                request.vectors.row(i).to_vec(),
                doc,
                attributes,
                Some(CommitSinks {
                    scalar: &self.shared.scalar,
                    filter,
                    vector,
                    dim,
                }),
            )?;
        }
        Ok(())
    }

    /// k-nearest-neighbor query with optional attribute filters.
    ///
    /// Returns the stored documents (each carrying `id` and `attributes`) in
    /// nearest-first order. Records still pending in the WAL are committed
    /// before the search runs.
    pub fn query(&self, request: QueryRequest) -> Result<Vec<DocMap>, DbError> {
        let indexes = loop {
            let guard = self.shared.indexes.read();
            if self.shared.wal.pending_count() == 0 {
                break guard;
            }
            drop(guard);

            let mut write_guard = self.shared.indexes.write();
            // Another reader may have won the upgrade race and committed.
            if self.shared.wal.pending_count() > 0 {
                self.shared.commit_pending(&mut write_guard)?;
            }
        };

        let dim = self.shared.params.dim;
        if request.query.len() != dim {
            return Err(DbError::DimensionMismatch {
                expected: dim,
                actual: request.query.len(),
            });
        }

        // Filters accumulate into one restriction set (see
        // `IntFilterIndex::apply` for the OR composition).
        let restriction = if request.filter_inputs.is_empty() {
            None
        } else {
            let mut bitmap = RoaringBitmap::new();
            for input in &request.filter_inputs {
                bitmap = indexes.filter.apply(input, &bitmap);
            }
            Some(bitmap)
        };

        let outcome = indexes.vector.search(
            &SearchQuery {
                vector: &request.query,
                restriction: restriction.as_ref(),
                ef_search: request.hnsw_params.map(|option| option.ef_search),
            },
            request.k,
        )?;

        // Backends may pad with negative labels when k exceeds the
        // candidate count; those are dropped here, not by the index.
        let ids: Vec<u64> = outcome
            .labels
            .iter()
            .filter(|&&label| label >= 0)
            .map(|&label| label as u64)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self.shared.scalar.multi_get_docs(NAMESPACE_DOCS, &ids)?)
    }

    /// Stop the flusher, run its final commit, and flush the WAL to disk.
    pub fn close(mut self) -> Result<(), DbError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), DbError> {
        let Some(flusher) = self.flusher.take() else {
            return Ok(());
        };
        let _ = flusher.stop_tx.send(());
        if flusher.handle.join().is_err() {
            tracing::error!("background flusher panicked");
        }

        let _guard = self.shared.indexes.write();
        self.shared.wal.close()?;
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(error = %err, "error while closing database");
        }
    }
}

/// Wake every `flush_interval_secs`, commit whatever is pending, and once
/// more on the stop signal. Commit errors are logged, never fatal here:
/// the records stay queued and durable.
fn spawn_flusher(shared: Arc<Shared>) -> Flusher {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = Duration::from_secs(shared.params.flush_interval_secs.max(1));

    let handle = std::thread::spawn(move || {
        let ticker = tick(interval);
        loop {
            select! {
                recv(ticker) -> _ => flush_pending(&shared),
                recv(stop_rx) -> _ => {
                    flush_pending(&shared);
                    return;
                }
            }
        }
    });

    Flusher { stop_tx, handle }
}

fn flush_pending(shared: &Shared) {
    if shared.wal.pending_count() == 0 {
        return;
    }
    let mut indexes = shared.indexes.write();
    if shared.wal.pending_count() == 0 {
        return;
    }
    match shared.commit_pending(&mut indexes) {
        Ok(()) => tracing::debug!("background flush committed pending records"),
        Err(err) => tracing::error!(error = %err, "background flush failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        EncoderKind, FilterInput, FilterOp, HnswIndexOption, IndexKind, MetricType, VectorBatch,
    };
    use tempfile::{tempdir, TempDir};

    fn params(dir: &TempDir, metric: MetricType, kind: IndexKind) -> DatabaseParams {
        DatabaseParams {
            file_path: dir.path().to_path_buf(),
            dim: 3,
            metric_type: metric,
            index_type: kind,
            encoder_type: EncoderKind::Binary,
            hnsw_params: match kind {
                IndexKind::Hnsw => Some(HnswIndexOption {
                    m: 16,
                    ef_construction: 200,
                }),
                IndexKind::Flat => None,
            },
            version: "0.1.0".into(),
            flush_interval_secs: 5,
        }
    }

    fn all_combinations() -> Vec<(MetricType, IndexKind)> {
        vec![
            (MetricType::L2, IndexKind::Flat),
            (MetricType::L2, IndexKind::Hnsw),
            (MetricType::Ip, IndexKind::Flat),
            (MetricType::Ip, IndexKind::Hnsw),
        ]
    }

    fn batch(rows: &[[f32; 3]]) -> VectorBatch {
        VectorBatch::new(rows.len(), 3, rows.concat()).unwrap()
    }

    fn docs(names: &[&str]) -> Vec<DocMap> {
        names
            .iter()
            .map(|name| {
                let mut doc = DocMap::new();
                doc.insert("name".into(), serde_json::json!(name));
                doc
            })
            .collect()
    }

    fn attrs(categories: &[i64]) -> Vec<DocMap> {
        categories
            .iter()
            .map(|&category| {
                let mut map = DocMap::new();
                map.insert("cat".into(), serde_json::json!(category));
                map
            })
            .collect()
    }

    fn category_of(doc: &DocMap) -> i64 {
        doc.get("attributes")
            .and_then(|attrs| attrs.get("cat"))
            .and_then(|value| value.as_i64())
            .expect("document should carry its category attribute")
    }

    #[test]
    fn test_open_and_close_all_combinations() {
        for (metric, kind) in all_combinations() {
            let dir = tempdir().unwrap();
            let db = Database::open(params(&dir, metric, kind)).unwrap();
            db.close().unwrap();
        }
    }

    #[test]
    fn test_basic_upsert_and_query() {
        // dim=3, L2, flat: nearest of two vectors to an exact match.
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        db.upsert(UpsertRequest {
            vectors: batch(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]),
            docs: docs(&["a", "b"]),
            attributes: attrs(&[1, 2]),
        })
        .unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 2,
                filter_inputs: vec![],
                hnsw_params: None,
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].get("name"), Some(&serde_json::json!("a")));
        assert_eq!(results[0].get("id"), Some(&serde_json::json!(1)));
        assert_eq!(results[1].get("name"), Some(&serde_json::json!("b")));
    }

    #[test]
    fn test_query_returns_merged_documents_everywhere() {
        for (metric, kind) in all_combinations() {
            let dir = tempdir().unwrap();
            let db = Database::open(params(&dir, metric, kind)).unwrap();

            db.upsert(UpsertRequest {
                vectors: batch(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]]),
                docs: docs(&["doc1", "doc2", "doc3"]),
                attributes: attrs(&[1, 2, 1]),
            })
            .unwrap();

            let results = db
                .query(QueryRequest {
                    query: vec![1.0, 2.0, 3.0],
                    k: 2,
                    filter_inputs: vec![],
                    hnsw_params: None,
                })
                .unwrap();

            assert!(!results.is_empty());
            assert!(results.len() <= 2);
            for doc in &results {
                assert!(doc.contains_key("id"));
                assert!(doc.contains_key("name"));
                assert!(doc.contains_key("attributes"));
            }
        }
    }

    #[test]
    fn test_filter_equal_restricts_results() {
        for (metric, kind) in all_combinations() {
            let dir = tempdir().unwrap();
            let db = Database::open(params(&dir, metric, kind)).unwrap();

            db.upsert(UpsertRequest {
                vectors: batch(&[
                    [1.0, 2.0, 3.0],
                    [4.0, 5.0, 6.0],
                    [7.0, 8.0, 9.0],
                    [10.0, 11.0, 12.0],
                ]),
                docs: docs(&["doc1", "doc2", "doc3", "doc4"]),
                attributes: attrs(&[1, 2, 1, 3]),
            })
            .unwrap();

            let results = db
                .query(QueryRequest {
                    query: vec![1.0, 2.0, 3.0],
                    k: 10,
                    filter_inputs: vec![FilterInput {
                        field: "cat".into(),
                        op: FilterOp::Equal,
                        target: 1,
                    }],
                    hnsw_params: None,
                })
                .unwrap();

            assert_eq!(results.len(), 2);
            for doc in &results {
                assert_eq!(category_of(doc), 1);
            }
        }
    }

    #[test]
    fn test_filter_not_equal_excludes_target() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        db.upsert(UpsertRequest {
            vectors: batch(&[
                [1.0, 2.0, 3.0],
                [4.0, 5.0, 6.0],
                [7.0, 8.0, 9.0],
                [10.0, 11.0, 12.0],
            ]),
            docs: docs(&["doc1", "doc2", "doc3", "doc4"]),
            attributes: attrs(&[1, 2, 1, 3]),
        })
        .unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 10,
                filter_inputs: vec![FilterInput {
                    field: "cat".into(),
                    op: FilterOp::NotEqual,
                    target: 2,
                }],
                hnsw_params: None,
            })
            .unwrap();

        assert_eq!(results.len(), 3);
        for doc in &results {
            assert_ne!(category_of(doc), 2);
        }
    }

    #[test]
    fn test_wrong_dimension_writes_nothing() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        let err = db
            .upsert(UpsertRequest {
                vectors: VectorBatch::new(1, 2, vec![1.0, 2.0]).unwrap(),
                docs: docs(&["doc1"]),
                attributes: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));

        // No WAL record may exist for the rejected batch.
        let wal_len = std::fs::metadata(dir.path().join(WAL_FILE)).unwrap().len();
        assert_eq!(wal_len, 0);
    }

    #[test]
    fn test_mismatched_docs_length_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        let err = db
            .upsert(UpsertRequest {
                vectors: batch(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]),
                docs: docs(&["only-one"]),
                attributes: vec![],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::Validation { field: "docs", .. }
        ));
    }

    #[test]
    fn test_query_on_empty_database() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 5,
                filter_inputs: vec![],
                hnsw_params: None,
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_query_wrong_dimension_is_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        let err = db
            .query(QueryRequest {
                query: vec![1.0, 2.0],
                k: 1,
                filter_inputs: vec![],
                hnsw_params: None,
            })
            .unwrap_err();
        assert!(matches!(err, DbError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_upsert_without_docs_or_attributes() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        db.upsert(UpsertRequest {
            vectors: batch(&[[1.0, 2.0, 3.0]]),
            docs: vec![],
            attributes: vec![],
        })
        .unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 1,
                filter_inputs: vec![],
                hnsw_params: None,
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].get("id"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_filter_on_unknown_field_is_unrestricted() {
        // An unknown field leaves the accumulator empty, and an empty
        // restriction searches unrestricted.
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        db.upsert(UpsertRequest {
            vectors: batch(&[[1.0, 2.0, 3.0]]),
            docs: docs(&["doc1"]),
            attributes: attrs(&[1]),
        })
        .unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 1,
                filter_inputs: vec![FilterInput {
                    field: "nonexistent".into(),
                    op: FilterOp::Equal,
                    target: 7,
                }],
                hnsw_params: None,
            })
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_hnsw_honors_ef_search_override() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Hnsw)).unwrap();

        let rows: Vec<[f32; 3]> = (0..50)
            .map(|i| {
                let x = i as f32;
                [x, x * 0.5, -x]
            })
            .collect();
        db.upsert(UpsertRequest {
            vectors: batch(&rows),
            docs: vec![],
            attributes: vec![],
        })
        .unwrap();

        let results = db
            .query(QueryRequest {
                query: vec![0.0, 0.0, 0.0],
                k: 5,
                filter_inputs: vec![],
                hnsw_params: Some(crate::model::HnswSearchOption { ef_search: 64 }),
            })
            .unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].get("id"), Some(&serde_json::json!(1)));
    }

    #[test]
    fn test_attribute_rollback_surfaces_error() {
        let dir = tempdir().unwrap();
        let db = Database::open(params(&dir, MetricType::L2, IndexKind::Flat)).unwrap();

        let mut bad_attrs = DocMap::new();
        bad_attrs.insert("cat".into(), serde_json::json!("not-a-number"));

        let err = db
            .upsert(UpsertRequest {
                vectors: batch(&[[1.0, 2.0, 3.0]]),
                docs: docs(&["doc1"]),
                attributes: vec![bad_attrs],
            })
            .unwrap_err();
        assert!(matches!(err, DbError::Wal(WalError::AttributeType { .. })));

        // The rejected record stays out of query results.
        let results = db
            .query(QueryRequest {
                query: vec![1.0, 2.0, 3.0],
                k: 1,
                filter_inputs: vec![],
                hnsw_params: None,
            });
        // The pending record fails again at query-time commit.
        assert!(results.is_err());
    }
}
