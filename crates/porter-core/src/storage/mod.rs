//! # Document Storage
//!
//! A small document-store contract over JSON documents keyed by `_id`.
//!
//! Backends implement four primitives (`scan`, `apply`, `ensure_index`,
//! `indexes`); finding, counting, aggregation, updates and removal are
//! provided on top of them so every backend answers queries identically.
//!
//! - `MemoryStore`: in-process maps, for tests and `storage = "memory"`
//! - `RedbStore`: one redb table per collection, the default
//! - `MigratingStore`: wraps another store and upgrades legacy documents on read

pub mod memory;
pub mod migration;
pub mod query;
pub mod redb_store;

use crate::types::{PorterError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

pub use memory::MemoryStore;
pub use migration::MigratingStore;
pub use query::{Filter, FindOptions, ID_FIELD, Index, Stage, document_id};
pub use redb_store::RedbStore;

// =============================================================================
// WRITES
// =============================================================================

/// A single write, applied atomically with the rest of its batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Fails if a document with the same `_id` exists.
    Insert(JsonValue),
    /// Fails with `NotFound` if no document has the `_id`.
    Update(JsonValue),
    /// Inserts or replaces.
    Upsert(JsonValue),
    /// Removes the document with this `_id`, if present.
    Delete(String),
}

/// Mutable view of one collection inside a backend transaction.
pub(crate) trait DocTable {
    fn get(&self, id: &str) -> Result<Option<JsonValue>>;
    fn put(&mut self, id: &str, doc: &JsonValue) -> Result<()>;
    fn delete(&mut self, id: &str) -> Result<()>;
    fn all(&self) -> Result<Vec<JsonValue>>;
}

/// Apply a batch to a table, enforcing unique indexes.
pub(crate) fn apply_ops<T: DocTable>(
    collection: &str,
    table: &mut T,
    indexes: &[Index],
    ops: Vec<WriteOp>,
) -> Result<()> {
    let has_unique = indexes.iter().any(|i| i.unique);
    let mut current: BTreeMap<String, JsonValue> = if has_unique {
        table
            .all()?
            .into_iter()
            .filter_map(|d| document_id(&d).ok().map(|id| (id, d)))
            .collect()
    } else {
        BTreeMap::new()
    };

    for op in ops {
        match op {
            WriteOp::Delete(id) => {
                table.delete(&id)?;
                current.remove(&id);
            }
            WriteOp::Insert(doc) | WriteOp::Update(doc) | WriteOp::Upsert(doc)
                if !doc.is_object() =>
            {
                return Err(PorterError::Storage(format!(
                    "cannot write non-object document to {collection}"
                )));
            }
            WriteOp::Insert(doc) => {
                let id = document_id(&doc)?;
                if table.get(&id)?.is_some() {
                    return Err(PorterError::Storage(format!(
                        "duplicate key in {collection}: {ID_FIELD} {id} already exists"
                    )));
                }
                put_checked(collection, table, indexes, &mut current, has_unique, id, doc)?;
            }
            WriteOp::Update(doc) => {
                let id = document_id(&doc)?;
                if table.get(&id)?.is_none() {
                    return Err(PorterError::not_found(collection, id));
                }
                put_checked(collection, table, indexes, &mut current, has_unique, id, doc)?;
            }
            WriteOp::Upsert(doc) => {
                let id = document_id(&doc)?;
                put_checked(collection, table, indexes, &mut current, has_unique, id, doc)?;
            }
        }
    }
    Ok(())
}

fn put_checked<T: DocTable>(
    collection: &str,
    table: &mut T,
    indexes: &[Index],
    current: &mut BTreeMap<String, JsonValue>,
    has_unique: bool,
    id: String,
    doc: JsonValue,
) -> Result<()> {
    if has_unique {
        query::check_unique(collection, indexes, current.values(), &doc)?;
    }
    table.put(&id, &doc)?;
    if has_unique {
        current.insert(id, doc);
    }
    Ok(())
}

// =============================================================================
// STORE CONTRACT
// =============================================================================

/// A pluggable document database.
pub trait Store: Send + Sync {
    /// Every document of a collection in `_id` order. A missing collection is empty.
    fn scan(&self, collection: &str) -> Result<Vec<JsonValue>>;

    /// Apply a batch of writes atomically.
    fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<()>;

    /// Record an index. Idempotent.
    fn ensure_index(&self, collection: &str, index: Index) -> Result<()>;

    fn indexes(&self, collection: &str) -> Result<Vec<Index>>;

    fn find(&self, collection: &str, opts: &FindOptions) -> Result<Vec<JsonValue>> {
        Ok(query::apply_find(self.scan(collection)?, opts))
    }

    /// The first match, or `NotFound`.
    fn find_one(&self, collection: &str, opts: &FindOptions) -> Result<JsonValue> {
        let mut opts = opts.clone();
        opts.limit = 1;
        self.find(collection, &opts)?
            .into_iter()
            .next()
            .ok_or_else(|| PorterError::not_found(collection, filter_description(&opts.filter)))
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self
            .scan(collection)?
            .iter()
            .filter(|d| filter.matches(d))
            .count())
    }

    fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<Vec<JsonValue>> {
        Ok(query::run_pipeline(self.scan(collection)?, pipeline))
    }

    fn insert(&self, collection: &str, docs: Vec<JsonValue>) -> Result<()> {
        self.apply(collection, docs.into_iter().map(WriteOp::Insert).collect())
    }

    /// Replace the document with the same `_id`; with `upsert`, insert when absent.
    fn update(&self, collection: &str, doc: JsonValue, upsert: bool) -> Result<()> {
        let op = if upsert {
            WriteOp::Upsert(doc)
        } else {
            WriteOp::Update(doc)
        };
        self.apply(collection, vec![op])
    }

    /// Remove the first match, or every match with `all`. Returns the count removed.
    fn remove(&self, collection: &str, filter: &Filter, all: bool) -> Result<usize> {
        let mut ids: Vec<String> = self
            .scan(collection)?
            .iter()
            .filter(|d| filter.matches(d))
            .filter_map(|d| document_id(d).ok())
            .collect();
        if !all {
            ids.truncate(1);
        }
        let removed = ids.len();
        if removed > 0 {
            self.apply(collection, ids.into_iter().map(WriteOp::Delete).collect())?;
        }
        Ok(removed)
    }
}

fn filter_description(filter: &Filter) -> String {
    JsonValue::Object(filter.0.clone()).to_string()
}

// =============================================================================
// TYPED HELPERS
// =============================================================================

/// Serialize a record into a document.
pub fn to_document<T: Serialize>(value: &T) -> Result<JsonValue> {
    serde_json::to_value(value)
        .map_err(|e| PorterError::Serialization(format!("unable to encode document: {e}")))
}

/// Decode a document into a record.
pub fn from_document<T: DeserializeOwned>(collection: &str, doc: JsonValue) -> Result<T> {
    serde_json::from_value(doc).map_err(|e| {
        PorterError::Serialization(format!("unable to decode document from {collection}: {e}"))
    })
}

pub(crate) fn storage_err(e: impl std::fmt::Display) -> PorterError {
    PorterError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Contract checks run against every backend.
    pub(crate) fn exercise_store(store: &dyn Store) {
        store
            .ensure_index("installations", Index::unique(&["namespace", "name"]))
            .expect("index");
        store
            .insert(
                "installations",
                vec![
                    json!({"_id": "01A", "namespace": "", "name": "mybun"}),
                    json!({"_id": "01B", "namespace": "dev", "name": "mybun"}),
                ],
            )
            .expect("insert");

        let dup = store.insert(
            "installations",
            vec![json!({"_id": "01C", "namespace": "dev", "name": "mybun"})],
        );
        assert!(matches!(dup, Err(PorterError::Storage(_))));

        let found = store
            .find_one(
                "installations",
                &FindOptions::new(Filter::all().with("namespace", "dev")),
            )
            .expect("find_one");
        assert_eq!(found["_id"], "01B");

        let missing = store.update(
            "installations",
            json!({"_id": "zzz", "namespace": "x", "name": "y"}),
            false,
        );
        assert!(missing.expect_err("update missing").is_not_found());
        store
            .update(
                "installations",
                json!({"_id": "zzz", "namespace": "x", "name": "y"}),
                true,
            )
            .expect("upsert");
        assert_eq!(store.count("installations", &Filter::all()).expect("count"), 3);

        let removed = store
            .remove("installations", &Filter::all().with("name", "mybun"), true)
            .expect("remove");
        assert_eq!(removed, 2);
        assert_eq!(store.scan("installations").expect("scan").len(), 1);
        assert!(store.scan("never-written").expect("scan").is_empty());
        assert_eq!(store.indexes("installations").expect("indexes").len(), 1);
    }

    #[test]
    fn memory_store_contract() {
        exercise_store(&MemoryStore::new());
    }

    #[test]
    fn redb_store_contract() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let store = RedbStore::open(dir.path().join("porter.db")).expect("open");
        exercise_store(&store);
    }
}
