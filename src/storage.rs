//! The persistence boundary: a sorted key-value store with namespaced
//! sublevels and atomic multi-sublevel batches, backed by `redb`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{DepGraphError, Result};

/// The namespaced regions of per-schema-hash storage (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sublevel {
    /// Materialized node values, JSON-encoded.
    Values,
    /// Per-node freshness tags.
    Freshness,
    /// Per-node list of the concrete input keys used at last materialization.
    Inputs,
    /// Reverse-dependency edges, keyed `"{input}\x1f{dependent}"`.
    RevDeps,
}

impl Sublevel {
    fn name(self) -> &'static str {
        match self {
            Sublevel::Values => "values",
            Sublevel::Freshness => "freshness",
            Sublevel::Inputs => "inputs",
            Sublevel::RevDeps => "revdeps",
        }
    }
}

/// One write to apply as part of an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    /// Insert or overwrite a key within a sublevel.
    Put {
        /// Target sublevel.
        sublevel: Sublevel,
        /// Key within the sublevel.
        key: String,
        /// Raw value bytes.
        value: Vec<u8>,
    },
    /// Remove a key from a sublevel, if present.
    Del {
        /// Target sublevel.
        sublevel: Sublevel,
        /// Key within the sublevel.
        key: String,
    },
}

/// A sorted key-value store, namespaced per schema hash and sublevel, with
/// an atomic multi-sublevel batch primitive.
///
/// Every mutation the evaluator makes to a node's state travels through a
/// single [`Store::batch`] call, never a sequence of independent writes —
/// this is what makes "invalidation fans out in one atomic step" true of
/// any backend implementing this trait (spec §5).
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single key from a sublevel.
    async fn get(&self, schema_hash: &str, sublevel: Sublevel, key: &str) -> Result<Option<Vec<u8>>>;

    /// List every key currently present in a sublevel.
    async fn keys(&self, schema_hash: &str, sublevel: Sublevel) -> Result<Vec<String>>;

    /// Apply a batch of puts/deletes across one or more sublevels atomically.
    async fn batch(&self, schema_hash: &str, ops: Vec<BatchOp>) -> Result<()>;
}

fn table_name(schema_hash: &str, sublevel: Sublevel) -> String {
    format!("{schema_hash}:{}", sublevel.name())
}

/// `redb`-backed [`Store`]. `redb` is a single-file, transactional, sorted
/// key-value engine; each `(schema_hash, sublevel)` pair maps to its own
/// table, and a batch is one `redb` write transaction spanning every table
/// it touches, committed once.
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (creating if absent) a `redb` database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path.as_ref()).map_err(DepGraphError::storage)?;
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl Store for RedbStore {
    async fn get(&self, schema_hash: &str, sublevel: Sublevel, key: &str) -> Result<Option<Vec<u8>>> {
        let db = Arc::clone(&self.db);
        let table = table_name(schema_hash, sublevel);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read().map_err(DepGraphError::storage)?;
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&table);
            let table = match txn.open_table(def) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(DepGraphError::storage(e)),
            };
            let value = table
                .get(key.as_str())
                .map_err(DepGraphError::storage)?
                .map(|v| v.value().to_vec());
            Ok(value)
        })
        .await
        .map_err(DepGraphError::storage)?
    }

    async fn keys(&self, schema_hash: &str, sublevel: Sublevel) -> Result<Vec<String>> {
        let db = Arc::clone(&self.db);
        let table = table_name(schema_hash, sublevel);
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let txn = db.begin_read().map_err(DepGraphError::storage)?;
            let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&table);
            let table = match txn.open_table(def) {
                Ok(t) => t,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
                Err(e) => return Err(DepGraphError::storage(e)),
            };
            let mut out = Vec::new();
            for entry in table.iter().map_err(DepGraphError::storage)? {
                let (k, _v) = entry.map_err(DepGraphError::storage)?;
                out.push(k.value().to_string());
            }
            Ok(out)
        })
        .await
        .map_err(DepGraphError::storage)?
    }

    async fn batch(&self, schema_hash: &str, ops: Vec<BatchOp>) -> Result<()> {
        let db = Arc::clone(&self.db);
        let schema_hash = schema_hash.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write().map_err(DepGraphError::storage)?;
            for op in ops {
                match op {
                    BatchOp::Put { sublevel, key, value } => {
                        let table = table_name(&schema_hash, sublevel);
                        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&table);
                        let mut table = txn.open_table(def).map_err(DepGraphError::storage)?;
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(DepGraphError::storage)?;
                    }
                    BatchOp::Del { sublevel, key } => {
                        let table = table_name(&schema_hash, sublevel);
                        let def: TableDefinition<&str, &[u8]> = TableDefinition::new(&table);
                        let mut table = txn.open_table(def).map_err(DepGraphError::storage)?;
                        table.remove(key.as_str()).map_err(DepGraphError::storage)?;
                    }
                }
            }
            txn.commit().map_err(DepGraphError::storage)?;
            Ok(())
        })
        .await
        .map_err(DepGraphError::storage)?
    }
}

/// A [`Store`] decorator that counts how many `batch` calls its inner store
/// received. Used to verify that a single `set` or `pull` drives exactly one
/// atomic batch, never a sequence of separate writes (spec §8, property 4).
pub struct CountingStore<S> {
    inner: S,
    batch_calls: AtomicUsize,
}

impl<S: Store> CountingStore<S> {
    /// Wrap an existing store, starting the call counter at zero.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            batch_calls: AtomicUsize::new(0),
        }
    }

    /// Number of `batch` calls observed so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: Store> Store for CountingStore<S> {
    async fn get(&self, schema_hash: &str, sublevel: Sublevel, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(schema_hash, sublevel, key).await
    }

    async fn keys(&self, schema_hash: &str, sublevel: Sublevel) -> Result<Vec<String>> {
        self.inner.keys(schema_hash, sublevel).await
    }

    async fn batch(&self, schema_hash: &str, ops: Vec<BatchOp>) -> Result<()> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.batch(schema_hash, ops).await
    }
}

/// An in-memory [`Store`] for tests that don't need to exercise real
/// persistence. Not crash-durable; mirrors `redb`'s sublevel/batch
/// semantics exactly.
#[derive(Default)]
pub struct MemStore {
    tables: std::sync::Mutex<HashMap<(String, &'static str), HashMap<String, Vec<u8>>>>,
}

impl MemStore {
    /// Construct an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, schema_hash: &str, sublevel: Sublevel, key: &str) -> Result<Option<Vec<u8>>> {
        let tables = self.tables.lock().expect("lock poisoned");
        Ok(tables
            .get(&(schema_hash.to_string(), sublevel.name()))
            .and_then(|t| t.get(key))
            .cloned())
    }

    async fn keys(&self, schema_hash: &str, sublevel: Sublevel) -> Result<Vec<String>> {
        let tables = self.tables.lock().expect("lock poisoned");
        Ok(tables
            .get(&(schema_hash.to_string(), sublevel.name()))
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn batch(&self, schema_hash: &str, ops: Vec<BatchOp>) -> Result<()> {
        let mut tables = self.tables.lock().expect("lock poisoned");
        for op in ops {
            match op {
                BatchOp::Put { sublevel, key, value } => {
                    tables
                        .entry((schema_hash.to_string(), sublevel.name()))
                        .or_default()
                        .insert(key, value);
                }
                BatchOp::Del { sublevel, key } => {
                    if let Some(t) = tables.get_mut(&(schema_hash.to_string(), sublevel.name())) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_store_round_trips_a_value() {
        let store = MemStore::new();
        store
            .batch(
                "hash1",
                vec![BatchOp::Put {
                    sublevel: Sublevel::Values,
                    key: "a".to_string(),
                    value: b"42".to_vec(),
                }],
            )
            .await
            .unwrap();
        let got = store.get("hash1", Sublevel::Values, "a").await.unwrap();
        assert_eq!(got, Some(b"42".to_vec()));
    }

    #[tokio::test]
    async fn mem_store_namespaces_by_schema_hash() {
        let store = MemStore::new();
        store
            .batch(
                "hash1",
                vec![BatchOp::Put {
                    sublevel: Sublevel::Values,
                    key: "a".to_string(),
                    value: b"1".to_vec(),
                }],
            )
            .await
            .unwrap();
        let got = store.get("hash2", Sublevel::Values, "a").await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn del_removes_a_key() {
        let store = MemStore::new();
        store
            .batch(
                "h",
                vec![BatchOp::Put {
                    sublevel: Sublevel::Freshness,
                    key: "a".to_string(),
                    value: b"up-to-date".to_vec(),
                }],
            )
            .await
            .unwrap();
        store
            .batch(
                "h",
                vec![BatchOp::Del {
                    sublevel: Sublevel::Freshness,
                    key: "a".to_string(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(store.get("h", Sublevel::Freshness, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counting_store_counts_batch_calls() {
        let counting = CountingStore::new(MemStore::new());
        assert_eq!(counting.batch_calls(), 0);
        counting.batch("h", vec![]).await.unwrap();
        counting.batch("h", vec![]).await.unwrap();
        assert_eq!(counting.batch_calls(), 2);
    }

    #[tokio::test]
    async fn redb_store_round_trips_across_sublevels() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("graph.redb")).unwrap();
        store
            .batch(
                "h",
                vec![
                    BatchOp::Put {
                        sublevel: Sublevel::Values,
                        key: "a".to_string(),
                        value: b"1".to_vec(),
                    },
                    BatchOp::Put {
                        sublevel: Sublevel::Freshness,
                        key: "a".to_string(),
                        value: b"up-to-date".to_vec(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(
            store.get("h", Sublevel::Values, "a").await.unwrap(),
            Some(b"1".to_vec())
        );
        assert_eq!(
            store.get("h", Sublevel::Freshness, "a").await.unwrap(),
            Some(b"up-to-date".to_vec())
        );
        assert_eq!(store.keys("h", Sublevel::Values).await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn redb_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store
                .batch(
                    "h",
                    vec![BatchOp::Put {
                        sublevel: Sublevel::Values,
                        key: "a".to_string(),
                        value: b"1".to_vec(),
                    }],
                )
                .await
                .unwrap();
        }
        let reopened = RedbStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("h", Sublevel::Values, "a").await.unwrap(),
            Some(b"1".to_vec())
        );
    }
}
