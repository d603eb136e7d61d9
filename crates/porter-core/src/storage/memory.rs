//! In-memory document store.

use super::query::{ID_FIELD, Index};
use super::{DocTable, Store, WriteOp, apply_ops, storage_err};
use crate::types::Result;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Mutex;

type Collection = BTreeMap<String, JsonValue>;

#[derive(Debug, Default)]
struct Inner {
    collections: BTreeMap<String, Collection>,
    indexes: BTreeMap<String, Vec<Index>>,
}

/// A store held in process memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocTable for Collection {
    fn get(&self, id: &str) -> Result<Option<JsonValue>> {
        Ok(BTreeMap::get(self, id).cloned())
    }

    fn put(&mut self, id: &str, doc: &JsonValue) -> Result<()> {
        self.insert(id.to_string(), doc.clone());
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.remove(id);
        Ok(())
    }

    fn all(&self) -> Result<Vec<JsonValue>> {
        Ok(self.values().cloned().collect())
    }
}

impl Store for MemoryStore {
    fn scan(&self, collection: &str) -> Result<Vec<JsonValue>> {
        let inner = self.inner.lock().map_err(storage_err)?;
        Ok(inner
            .collections
            .get(collection)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(storage_err)?;
        let indexes = inner.indexes.get(collection).cloned().unwrap_or_default();
        // Work on a copy so a failed batch leaves the collection untouched.
        let mut staged = inner.collections.get(collection).cloned().unwrap_or_default();
        apply_ops(collection, &mut staged, &indexes, ops)?;
        inner.collections.insert(collection.to_string(), staged);
        Ok(())
    }

    fn ensure_index(&self, collection: &str, index: Index) -> Result<()> {
        let mut inner = self.inner.lock().map_err(storage_err)?;
        let list = inner.indexes.entry(collection.to_string()).or_default();
        if !list.contains(&index) {
            list.push(index);
        }
        Ok(())
    }

    fn indexes(&self, collection: &str) -> Result<Vec<Index>> {
        let inner = self.inner.lock().map_err(storage_err)?;
        Ok(inner.indexes.get(collection).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_batch_is_not_applied() {
        let store = MemoryStore::new();
        let result = store.apply(
            "runs",
            vec![
                WriteOp::Insert(json!({ID_FIELD: "1"})),
                WriteOp::Insert(json!({ID_FIELD: "1"})),
            ],
        );
        assert!(result.is_err());
        assert!(store.scan("runs").expect("scan").is_empty());
    }
}
