//! Namespaced scalar key/value storage.
//!
//! Backed by `redb`: one table per namespace inside a single database file,
//! with ACID transactions. Document values are JSON; document keys are the
//! record id as 8 big-endian bytes, which keeps iteration order identical to
//! insertion order. Each namespace reserves the key `__id_max__` for the
//! monotonic id allocator.

use redb::{ReadableTable, TableDefinition};
use thiserror::Error;

use crate::model::DocMap;

/// Namespace holding document records.
pub const NAMESPACE_DOCS: &str = "docs";

/// Reserved namespace for WAL bookkeeping.
pub const NAMESPACE_WALS: &str = "wals";

/// Reserved key holding the current id ceiling for a namespace.
const KEY_ID_MAX: &[u8] = b"__id_max__";

#[derive(Error, Debug)]
pub enum ScalarError {
    #[error("failed to open scalar store: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("corrupt document for id {id}: {source}")]
    Document {
        id: u64,
        source: serde_json::Error,
    },
}

/// Encode a record id to its 8-byte big-endian storage key.
pub fn encode_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Decode an 8-byte storage key back to a record id. Short keys decode to 0.
pub fn decode_id(key: &[u8]) -> u64 {
    match <[u8; 8]>::try_from(key) {
        Ok(bytes) => u64::from_be_bytes(bytes),
        Err(_) => 0,
    }
}

/// Storage contract the rest of the system depends on.
///
/// `get` distinguishes not-found (`Ok(None)`) from failure. `multi_get_docs`
/// preserves input order and substitutes an empty map for missing ids.
pub trait ScalarStore: Send + Sync {
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), ScalarError>;

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ScalarError>;

    /// Remove a key. Removing an absent key is not an error. Used by commit
    /// rollback.
    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), ScalarError>;

    fn get_doc(&self, namespace: &str, id: u64) -> Result<Option<DocMap>, ScalarError>;

    fn multi_get_docs(&self, namespace: &str, ids: &[u64]) -> Result<Vec<DocMap>, ScalarError>;

    /// Atomically reserve `count` ids, returning the contiguous range
    /// `prev+1 ..= prev+count`.
    fn alloc_ids(&self, namespace: &str, count: usize) -> Result<Vec<u64>, ScalarError>;

    /// Snapshot of every key/value pair in the namespace, in key order.
    fn iter(&self, namespace: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ScalarError>;
}

fn table(namespace: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(namespace)
}

/// `redb`-backed [`ScalarStore`].
pub struct RedbScalarStore {
    db: redb::Database,
}

impl RedbScalarStore {
    /// Open (creating if absent) the store at `path` and make sure every
    /// listed namespace table exists.
    pub fn open(path: &std::path::Path, namespaces: &[&str]) -> Result<Self, ScalarError> {
        let db = redb::Database::create(path)?;

        let txn = db.begin_write()?;
        for namespace in namespaces {
            txn.open_table(table(namespace))?;
        }
        txn.commit()?;

        Ok(Self { db })
    }
}

impl ScalarStore for RedbScalarStore {
    fn put(&self, namespace: &str, key: &[u8], value: &[u8]) -> Result<(), ScalarError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table(namespace))?;
            t.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Vec<u8>>, ScalarError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table(namespace))?;
        Ok(t.get(key)?.map(|guard| guard.value().to_vec()))
    }

    fn delete(&self, namespace: &str, key: &[u8]) -> Result<(), ScalarError> {
        let txn = self.db.begin_write()?;
        {
            let mut t = txn.open_table(table(namespace))?;
            t.remove(key)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn get_doc(&self, namespace: &str, id: u64) -> Result<Option<DocMap>, ScalarError> {
        match self.get(namespace, &encode_id(id))? {
            Some(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|source| ScalarError::Document { id, source })?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn multi_get_docs(&self, namespace: &str, ids: &[u64]) -> Result<Vec<DocMap>, ScalarError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table(namespace))?;

        let mut results = Vec::with_capacity(ids.len());
        for &id in ids {
            match t.get(encode_id(id).as_slice())? {
                Some(guard) => {
                    let doc = serde_json::from_slice(guard.value())
                        .map_err(|source| ScalarError::Document { id, source })?;
                    results.push(doc);
                }
                None => results.push(DocMap::new()),
            }
        }
        Ok(results)
    }

    fn alloc_ids(&self, namespace: &str, count: usize) -> Result<Vec<u64>, ScalarError> {
        let txn = self.db.begin_write()?;
        let ids;
        {
            let mut t = txn.open_table(table(namespace))?;
            let prev = match t.get(KEY_ID_MAX)? {
                Some(guard) => decode_id(guard.value()),
                None => 0,
            };
            let next = prev + count as u64;
            t.insert(KEY_ID_MAX, next.to_be_bytes().as_slice())?;
            ids = (prev + 1..=next).collect();
        }
        txn.commit()?;
        Ok(ids)
    }

    fn iter(&self, namespace: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ScalarError> {
        let txn = self.db.begin_read()?;
        let t = txn.open_table(table(namespace))?;

        let mut pairs = Vec::new();
        for entry in t.iter()? {
            let (key, value) = entry?;
            pairs.push((key.value().to_vec(), value.value().to_vec()));
        }
        Ok(pairs)
    }
}
