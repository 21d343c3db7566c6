//! Quiver-DB: an embeddable vector database with a durable write path
//!
//! Ingests `(vector, document, attributes)` tuples, persists them through a
//! write-ahead log, and serves approximate k-nearest-neighbor queries with
//! optional integer attribute filters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Database (coordinator)                    │
//! │        upsert · query · background flusher · locks          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               WAL  +  three-phase commit                    │
//! │     encode → fsync → scalar KV → filter idx → vector idx    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                    │
//!          ▼                   ▼                    ▼
//! ┌────────────────┐ ┌──────────────────┐ ┌──────────────────────┐
//! │  Scalar store  │ │   Filter index   │ │     Vector index     │
//! │  (redb, docs)  │ │ (roaring bitmap) │ │    (flat | HNSW)     │
//! └────────────────┘ └──────────────────┘ └──────────────────────┘
//! ```
//!
//! A record becomes *durable* once its WAL bytes are fsynced, and
//! *queryable* once the commit pipeline has applied it to all three stores.
//! Queries force a commit of anything still pending first, so a writer
//! always reads its own writes.

pub mod db;
pub mod encoder;
pub mod filter;
pub mod index;
pub mod model;
pub mod scalar;
pub mod simd;
pub mod wal;

pub use db::{Database, DbError};
pub use encoder::{encoder_for, WalEncoder, WalOp, WalRecord};
pub use filter::IntFilterIndex;
pub use index::{SearchOutcome, SearchQuery, VectorIndex};
pub use model::{
    DatabaseParams, DocMap, EncoderKind, FilterInput, FilterOp, HnswIndexOption, HnswSearchOption,
    IndexKind, MetricType, QueryRequest, UpsertRequest, VectorBatch,
};
pub use scalar::{RedbScalarStore, ScalarStore};
pub use wal::{CommitSinks, Wal};
