//! # redb-backed Document Store
//!
//! A disk-backed document store using the redb embedded database.
//!
//! Each collection is its own table (`doc:<collection>`) mapping `_id` to the
//! JSON-encoded document. Index definitions live in a metadata table and are
//! enforced inside the write transaction, so a unique-index check and the
//! write it guards commit together.
//!
//! redb gives us:
//! - ACID transactions (a failed batch leaves nothing behind)
//! - Crash safety (copy-on-write B-trees)
//! - MVCC (concurrent readers, single writer)

use super::query::Index;
use super::{DocTable, Store, WriteOp, apply_ops, storage_err};
use crate::types::{PorterError, Result};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, TableError};
use serde_json::Value as JsonValue;
use std::path::Path;
use tracing::debug;

/// Table for index metadata: collection -> JSON list of indexes
const INDEXES: TableDefinition<&str, &[u8]> = TableDefinition::new("indexes");

type DocDefinition<'a> = TableDefinition<'a, &'static str, &'static [u8]>;

fn table_name(collection: &str) -> String {
    format!("doc:{collection}")
}

/// A document store persisted in a single redb file.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage_err)?;

        // Initialize the metadata table if it doesn't exist
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            let _ = write_txn.open_table(INDEXES).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }

        debug!(path = %path.display(), "opened document store");
        Ok(Self { db })
    }
}

/// A collection table borrowed from an open write transaction.
struct RedbDocs<'a, 'txn> {
    table: &'a mut Table<'txn, &'static str, &'static [u8]>,
}

fn decode(bytes: &[u8]) -> Result<JsonValue> {
    serde_json::from_slice(bytes)
        .map_err(|e| PorterError::Storage(format!("corrupt document: {e}")))
}

impl DocTable for RedbDocs<'_, '_> {
    fn get(&self, id: &str) -> Result<Option<JsonValue>> {
        match self.table.get(id).map_err(storage_err)? {
            Some(v) => decode(v.value()).map(Some),
            None => Ok(None),
        }
    }

    fn put(&mut self, id: &str, doc: &JsonValue) -> Result<()> {
        let bytes = serde_json::to_vec(doc)?;
        self.table
            .insert(id, bytes.as_slice())
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<()> {
        self.table.remove(id).map_err(storage_err)?;
        Ok(())
    }

    fn all(&self) -> Result<Vec<JsonValue>> {
        let mut docs = Vec::new();
        for entry in self.table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            docs.push(decode(value.value())?);
        }
        Ok(docs)
    }
}

impl Store for RedbStore {
    fn scan(&self, collection: &str) -> Result<Vec<JsonValue>> {
        let name = table_name(collection);
        let def: DocDefinition<'_> = TableDefinition::new(&name);
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = match read_txn.open_table(def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(e)),
        };
        let mut docs = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            docs.push(decode(value.value())?);
        }
        Ok(docs)
    }

    fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<()> {
        let name = table_name(collection);
        let def: DocDefinition<'_> = TableDefinition::new(&name);
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let indexes = read_indexes(&write_txn, collection)?;
            let mut table = write_txn.open_table(def).map_err(storage_err)?;
            let mut docs = RedbDocs { table: &mut table };
            // An error here drops the transaction uncommitted.
            apply_ops(collection, &mut docs, &indexes, ops)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn ensure_index(&self, collection: &str, index: Index) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut indexes = read_indexes(&write_txn, collection)?;
            if indexes.contains(&index) {
                return Ok(());
            }
            indexes.push(index);
            let bytes = serde_json::to_vec(&indexes)?;
            let mut table = write_txn.open_table(INDEXES).map_err(storage_err)?;
            table
                .insert(collection, bytes.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn indexes(&self, collection: &str) -> Result<Vec<Index>> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(INDEXES).map_err(storage_err)?;
        match table.get(collection).map_err(storage_err)? {
            Some(v) => Ok(serde_json::from_slice(v.value())?),
            None => Ok(Vec::new()),
        }
    }
}

fn read_indexes(write_txn: &redb::WriteTransaction, collection: &str) -> Result<Vec<Index>> {
    let table = write_txn.open_table(INDEXES).map_err(storage_err)?;
    match table.get(collection).map_err(storage_err)? {
        Some(v) => Ok(serde_json::from_slice(v.value())?),
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Filter, FindOptions};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("porter.db");
        {
            let store = RedbStore::open(&path).expect("open");
            store
                .ensure_index("outputs", Index::unique(&["resultId", "name"]))
                .expect("index");
            store
                .insert("outputs", vec![json!({"_id": "r1-a", "resultId": "r1", "name": "a"})])
                .expect("insert");
        }
        let store = RedbStore::open(&path).expect("reopen");
        let doc = store
            .find_one("outputs", &FindOptions::new(Filter::by_id("r1-a")))
            .expect("find");
        assert_eq!(doc["name"], "a");
        assert_eq!(store.indexes("outputs").expect("indexes").len(), 1);
    }

    #[test]
    fn unique_violation_rolls_back_batch() {
        let dir = TempDir::new().expect("tempdir");
        let store = RedbStore::open(dir.path().join("porter.db")).expect("open");
        store
            .ensure_index("outputs", Index::unique(&["resultId", "name"]))
            .expect("index");
        let result = store.apply(
            "outputs",
            vec![
                WriteOp::Insert(json!({"_id": "x1", "resultId": "r1", "name": "a"})),
                WriteOp::Insert(json!({"_id": "x2", "resultId": "r1", "name": "a"})),
            ],
        );
        assert!(result.is_err());
        assert!(store.scan("outputs").expect("scan").is_empty());
    }
}
