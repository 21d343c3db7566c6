//! Write-ahead log and the commit pipeline.
//!
//! Every mutation is encoded into an append-only log file before it touches
//! any index. Records accumulate in a pending queue until a commit applies
//! them, in order, to the three sinks:
//!
//! ```text
//!   fsync WAL ──► scalar store ──► filter index ──► vector index
//!                 (phase A)        (phase B)        (phase C)
//! ```
//!
//! Phases A and B are try-with-best-effort-undo; phase C is a single insert
//! call performed last because the vector index is the costliest to unwind.
//! A crash mid-pipeline leaves stale in-memory indexes but a valid WAL: on
//! the next open, [`Wal::restore`] replays the durable prefix into freshly
//! built indexes and truncates the file.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::encoder::{EncoderError, WalEncoder, WalOp, WalRecord};
use crate::filter::IntFilterIndex;
use crate::index::{IndexError, InsertBatch, VectorIndex};
use crate::model::DocMap;
use crate::scalar::{encode_id, ScalarError, ScalarStore, NAMESPACE_DOCS};

#[derive(Error, Debug)]
pub enum WalError {
    #[error("WAL IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL record error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("failed to serialize document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("scalar phase failed: {0}")]
    Scalar(#[from] ScalarError),

    #[error("unsupported attribute value for field {field}: {value}")]
    AttributeType {
        field: String,
        value: serde_json::Value,
    },

    #[error("vector index phase failed: {0}")]
    Index(#[from] IndexError),
}

/// The three index targets a commit applies pending records to, plus the
/// database dimension for assembling the vector batch.
pub struct CommitSinks<'a> {
    pub scalar: &'a dyn ScalarStore,
    pub filter: &'a mut IntFilterIndex,
    pub vector: &'a mut VectorIndex,
    pub dim: usize,
}

struct WalInner {
    writer: BufWriter<File>,
    pending: Vec<WalRecord>,
}

/// Append-only durable log of mutation records.
pub struct Wal {
    path: PathBuf,
    version: String,
    encoder: Box<dyn WalEncoder>,
    log_id: AtomicU64,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open the log at `path`, creating it if absent, and initialize the
    /// log-id counter from the highest id already on disk. Records observed
    /// by this scan are *not* queued; replaying them is [`restore`]'s job.
    ///
    /// [`restore`]: Wal::restore
    pub fn open(path: &Path, version: &str, encoder: Box<dyn WalEncoder>) -> Result<Self, WalError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut max_log_id = 0u64;
        if file.metadata()?.len() > 0 {
            let mut reader = BufReader::new(File::open(path)?);
            loop {
                let offset = reader.stream_position().unwrap_or_default();
                match encoder.decode(&mut reader) {
                    Ok(Some(record)) => max_log_id = max_log_id.max(record.log_id),
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(offset, error = %err, "WAL scan stopped at unreadable record");
                        break;
                    }
                }
            }
        }
        tracing::info!(path = %path.display(), max_log_id, encoder = encoder.name(), "opened WAL");

        Ok(Self {
            path: path.to_path_buf(),
            version: version.to_string(),
            encoder,
            log_id: AtomicU64::new(max_log_id),
            inner: Mutex::new(WalInner {
                writer: BufWriter::new(file),
                pending: Vec::with_capacity(100),
            }),
        })
    }

    /// Append one insert record. With `commit_to` set (eager mode) the
    /// pending queue (this record and any earlier stragglers) is committed
    /// before returning.
    pub fn write(
        &self,
        vector_id: u64,
        vector: Vec<f32>,
        doc: DocMap,
        attributes: DocMap,
        commit_to: Option<CommitSinks<'_>>,
    ) -> Result<(), WalError> {
        let mut inner = self.inner.lock();

        let record = WalRecord {
            log_id: self.log_id.fetch_add(1, Ordering::SeqCst) + 1,
            version: self.version.clone(),
            op: WalOp::Insert,
            vector_id,
            vector,
            doc,
            attributes,
        };

        self.encoder.encode(&mut inner.writer, &record)?;
        inner.pending.push(record);

        if let Some(mut sinks) = commit_to {
            self.commit_locked(&mut inner, &mut sinks)?;
        }
        Ok(())
    }

    /// Flush the buffered writer and fsync the file.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        flush_and_sync(&mut inner.writer)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Apply every pending record to the sinks. No-op when nothing is
    /// pending. On failure the pending queue is left intact for retry.
    pub fn commit(&self, mut sinks: CommitSinks<'_>) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        self.commit_locked(&mut inner, &mut sinks)
    }

    /// Replay the valid prefix of the on-disk log through the commit
    /// pipeline, then truncate the file. Decoding stops at the first corrupt
    /// record; everything before it is applied. An empty file, or a file
    /// whose very first record is corrupt, applies nothing and is left
    /// untouched. A failed commit also leaves the file intact so a later
    /// open can retry.
    pub fn restore(&self, mut sinks: CommitSinks<'_>) -> Result<(), WalError> {
        let mut inner = self.inner.lock();

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        loop {
            let offset = reader.stream_position().unwrap_or_default();
            match self.encoder.decode(&mut reader) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(offset, error = %err, "WAL replay stopped at corrupt record");
                    break;
                }
            }
        }

        if records.is_empty() {
            tracing::info!(path = %self.path.display(), "no WAL records to restore");
            return Ok(());
        }

        tracing::info!(count = records.len(), "restoring WAL records");
        inner.pending = records;
        self.commit_locked(&mut inner, &mut sinks)?;
        self.truncate_locked(&mut inner)?;
        Ok(())
    }

    /// Flush and fsync. The file handle itself is released on drop.
    pub fn close(&self) -> Result<(), WalError> {
        self.flush()
    }

    /// The three-phase pipeline. Called with the queue lock held.
    fn commit_locked(
        &self,
        inner: &mut WalInner,
        sinks: &mut CommitSinks<'_>,
    ) -> Result<(), WalError> {
        if inner.pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = inner.pending.len(), "committing WAL records");

        // Durability first: anything applied below must already be on disk.
        flush_and_sync(&mut inner.writer)?;

        // Phase A: scalar store.
        let mut applied_scalar: Vec<u64> = Vec::with_capacity(inner.pending.len());
        for record in inner.pending.iter().filter(|r| r.op == WalOp::Insert) {
            let mut doc = record.doc.clone();
            doc.insert("id".into(), serde_json::Value::from(record.vector_id));
            doc.insert(
                "attributes".into(),
                serde_json::Value::Object(record.attributes.clone()),
            );

            let result = serde_json::to_vec(&doc).map_err(WalError::from).and_then(|bytes| {
                sinks
                    .scalar
                    .put(NAMESPACE_DOCS, &encode_id(record.vector_id), &bytes)
                    .map_err(WalError::from)
            });
            if let Err(err) = result {
                rollback_scalar(sinks.scalar, &applied_scalar);
                return Err(err);
            }
            applied_scalar.push(record.vector_id);
        }

        // Phase B: filter index. A record's attributes are all coerced
        // before any posting is written, so a bad value cannot leave the
        // record half-indexed.
        let mut applied_filter: Vec<(u64, Vec<(String, i64)>)> = Vec::new();
        for record in inner.pending.iter().filter(|r| r.op == WalOp::Insert) {
            if record.attributes.is_empty() {
                continue;
            }
            let mut coerced = Vec::with_capacity(record.attributes.len());
            for (field, value) in &record.attributes {
                match coerce_to_i64(value) {
                    Some(int_value) => coerced.push((field.clone(), int_value)),
                    None => {
                        rollback_scalar(sinks.scalar, &applied_scalar);
                        rollback_filter(sinks.filter, &applied_filter);
                        return Err(WalError::AttributeType {
                            field: field.clone(),
                            value: value.clone(),
                        });
                    }
                }
            }
            for (field, int_value) in &coerced {
                sinks.filter.upsert(field, *int_value, record.vector_id);
            }
            applied_filter.push((record.vector_id, coerced));
        }

        // Phase C: vector index, one batched insert, last because it cannot
        // be rolled back.
        let inserts: Vec<&WalRecord> = inner
            .pending
            .iter()
            .filter(|r| r.op == WalOp::Insert)
            .collect();
        if !inserts.is_empty() {
            let mut data = Vec::with_capacity(inserts.len() * sinks.dim);
            let mut labels = Vec::with_capacity(inserts.len());
            for record in &inserts {
                data.extend_from_slice(&record.vector);
                labels.push(record.vector_id as i64);
            }
            let batch = InsertBatch {
                rows: inserts.len(),
                cols: sinks.dim,
                data: &data,
                labels: &labels,
            };
            if let Err(err) = sinks.vector.insert(&batch) {
                rollback_scalar(sinks.scalar, &applied_scalar);
                rollback_filter(sinks.filter, &applied_filter);
                return Err(err.into());
            }
        }

        inner.pending.clear();
        Ok(())
    }

    /// Truncate the log to zero bytes and swap in a fresh append handle.
    fn truncate_locked(&self, inner: &mut WalInner) -> Result<(), WalError> {
        inner.writer.flush()?;
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.set_len(0)?;
        inner.writer = BufWriter::new(file);
        Ok(())
    }
}

fn flush_and_sync(writer: &mut BufWriter<File>) -> Result<(), WalError> {
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Accept integers outright and floats that are whole and within `i64`;
/// JSON decoding hands back whole numbers as floats often enough that
/// rejecting them would break round-tripped attributes.
fn coerce_to_i64(value: &serde_json::Value) -> Option<i64> {
    let serde_json::Value::Number(number) = value else {
        return None;
    };
    if let Some(int_value) = number.as_i64() {
        return Some(int_value);
    }
    let float_value = number.as_f64()?;
    if float_value == float_value.trunc()
        && float_value >= i64::MIN as f64
        && float_value <= i64::MAX as f64
    {
        return Some(float_value as i64);
    }
    None
}

/// Best-effort undo of phase A. Failures are logged and dropped: the WAL on
/// disk stays authoritative either way.
fn rollback_scalar(scalar: &dyn ScalarStore, applied: &[u64]) {
    tracing::warn!(count = applied.len(), "rolling back scalar store changes");
    for &id in applied {
        if let Err(err) = scalar.delete(NAMESPACE_DOCS, &encode_id(id)) {
            tracing::warn!(id, error = %err, "scalar rollback delete failed");
        }
    }
}

/// Best-effort undo of phase B.
fn rollback_filter(filter: &mut IntFilterIndex, applied: &[(u64, Vec<(String, i64)>)]) {
    tracing::warn!(count = applied.len(), "rolling back filter index changes");
    for (id, postings) in applied {
        for (field, value) in postings {
            filter.remove(field, *value, *id);
        }
    }
}
