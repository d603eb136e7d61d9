//! # Legacy Record Migration
//!
//! Older releases stored each claim as a single document whose installation
//! name lived in a top-level `name` field, with no `installation` field and no
//! `schemaVersion`. `MigratingStore` upgrades such documents as they are read
//! and writes the upgraded form back under the same `_id`.
//!
//! A failed migration never fails the read. The original document is returned
//! and the failure is logged, so one broken record cannot halt a listing.

use super::query::{Index, lookup};
use super::{Store, WriteOp};
use crate::primitives::INSTALLATION_SCHEMA_VERSION;
use crate::types::{PorterError, Result};
use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A store wrapper that migrates legacy documents on read.
pub struct MigratingStore {
    inner: Arc<dyn Store>,
    collections: BTreeSet<String>,
}

impl std::fmt::Debug for MigratingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigratingStore")
            .field("collections", &self.collections)
            .finish_non_exhaustive()
    }
}

impl MigratingStore {
    /// Migrate documents read from `collections`.
    pub fn new(inner: Arc<dyn Store>, collections: &[&str]) -> Self {
        Self {
            inner,
            collections: collections.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    fn migrate(&self, collection: &str, doc: JsonValue) -> JsonValue {
        if !needs_migration(&doc) {
            return doc;
        }
        let migrated = match migrate_document(&doc) {
            Ok(m) => m,
            Err(e) => {
                warn!(collection, error = %e, "unable to migrate legacy document");
                return doc;
            }
        };
        match self
            .inner
            .apply(collection, vec![WriteOp::Update(migrated.clone())])
        {
            Ok(()) => {
                debug!(collection, id = ?lookup(&migrated, "_id"), "migrated legacy document");
                migrated
            }
            Err(e) => {
                warn!(collection, error = %e, "unable to save migrated legacy document");
                doc
            }
        }
    }
}

/// A legacy document has `name`, but neither `installation` nor `schemaVersion`.
pub fn needs_migration(doc: &JsonValue) -> bool {
    let Some(map) = doc.as_object() else {
        return false;
    };
    map.contains_key("name")
        && !map.contains_key("installation")
        && !map.contains_key("schemaVersion")
}

/// Build the current form of a legacy document.
///
/// Only absent fields are added; nothing already present is overwritten.
pub fn migrate_document(doc: &JsonValue) -> Result<JsonValue> {
    let map = doc
        .as_object()
        .ok_or_else(|| PorterError::Serialization("legacy document is not an object".into()))?;
    let name = match map.get("name") {
        Some(JsonValue::String(n)) if !n.is_empty() => n.clone(),
        _ => {
            return Err(PorterError::Serialization(
                "legacy document has no usable name".into(),
            ));
        }
    };

    let now = JsonValue::String(Utc::now().to_rfc3339());
    let mut migrated: Map<String, JsonValue> = map.clone();
    let defaults = [
        ("installation", JsonValue::String(name)),
        (
            "schemaVersion",
            JsonValue::String(INSTALLATION_SCHEMA_VERSION.to_string()),
        ),
        ("namespace", JsonValue::String(String::new())),
        ("created", now.clone()),
        ("modified", now),
    ];
    for (key, value) in defaults {
        migrated.entry(key).or_insert(value);
    }
    Ok(JsonValue::Object(migrated))
}

impl Store for MigratingStore {
    fn scan(&self, collection: &str) -> Result<Vec<JsonValue>> {
        let docs = self.inner.scan(collection)?;
        if !self.collections.contains(collection) {
            return Ok(docs);
        }
        Ok(docs
            .into_iter()
            .map(|d| self.migrate(collection, d))
            .collect())
    }

    fn apply(&self, collection: &str, ops: Vec<WriteOp>) -> Result<()> {
        self.inner.apply(collection, ops)
    }

    fn ensure_index(&self, collection: &str, index: Index) -> Result<()> {
        self.inner.ensure_index(collection, index)
    }

    fn indexes(&self, collection: &str) -> Result<Vec<Index>> {
        self.inner.indexes(collection)
    }
}
