//! # Installation Store
//!
//! Typed access to the installation, run, result and output collections,
//! plus credential and parameter sets.
//!
//! Every read and write path first checks the store's schema document. A
//! store written by an older schema yields `MigrationRequired` until it is
//! migrated; nothing is read or written in the meantime.

use super::{Installation, Output, ResultStatus, Run, RunResult, StrategySet};
use crate::primitives::{
    COLLECTION_CONFIG, COLLECTION_CREDENTIALS, COLLECTION_INSTALLATIONS, COLLECTION_OUTPUTS,
    COLLECTION_PARAMETERS, COLLECTION_RESULTS, COLLECTION_RUNS, OUTPUT_INVOCATION_IMAGE_LOGS,
    SCHEMA_DOCUMENT_ID, STORE_SCHEMA_VERSION,
};
use crate::reference::parse_semver;
use crate::storage::{
    Filter, FindOptions, ID_FIELD, Index, MigratingStore, Stage, Store, from_document,
    to_document,
};
use crate::types::{PorterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

/// The `config/schema` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
    #[serde(rename = "_id")]
    pub id: String,
    pub installations: String,
}

/// Filters for listing installations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// `None` lists every namespace; `Some("")` is the global namespace.
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub skip: usize,
    pub limit: usize,
}

impl ListOptions {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    fn filter(&self) -> Filter {
        let mut f = Filter::all();
        if let Some(ns) = &self.namespace {
            f = f.with("namespace", ns.as_str());
        }
        if let Some(name) = &self.name {
            f = f.with("name", name.as_str());
        }
        for (k, v) in &self.labels {
            f = f.with(&format!("labels.{k}"), v.as_str());
        }
        f
    }
}

/// Typed installation records over a document store.
pub struct InstallationStore {
    store: Arc<dyn Store>,
    verified: OnceLock<()>,
}

impl std::fmt::Debug for InstallationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationStore")
            .field("verified", &self.verified.get().is_some())
            .finish_non_exhaustive()
    }
}

fn installation_filter(namespace: &str, installation: &str) -> Filter {
    Filter::all()
        .with("namespace", namespace)
        .with("installation", installation)
}

impl InstallationStore {
    /// Legacy installation documents are migrated as they are read.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store: Arc::new(MigratingStore::new(store, &[COLLECTION_INSTALLATIONS])),
            verified: OnceLock::new(),
        }
    }

    /// The underlying document store.
    pub fn documents(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // Schema
    // -------------------------------------------------------------------------

    /// Create indexes and the schema document on first use, then verify the
    /// recorded schema version.
    pub fn initialize(&self) -> Result<()> {
        if self.verified.get().is_some() {
            return Ok(());
        }
        let schema = match self.store.find_one(
            COLLECTION_CONFIG,
            &FindOptions::new(Filter::by_id(SCHEMA_DOCUMENT_ID)),
        ) {
            Ok(doc) => Some(from_document::<StoreSchema>(COLLECTION_CONFIG, doc)?),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("unable to read the store schema")),
        };

        match schema {
            None => {
                self.ensure_indexes()?;
                let doc = to_document(&StoreSchema {
                    id: SCHEMA_DOCUMENT_ID.to_string(),
                    installations: STORE_SCHEMA_VERSION.to_string(),
                })?;
                self.store.update(COLLECTION_CONFIG, doc, true)?;
                info!(version = STORE_SCHEMA_VERSION, "initialized installation store");
            }
            Some(schema) => {
                check_schema_version(&schema.installations)?;
                self.ensure_indexes()?;
            }
        }
        self.verified.get_or_init(|| ());
        Ok(())
    }

    fn ensure_indexes(&self) -> Result<()> {
        let indexes = [
            (COLLECTION_INSTALLATIONS, Index::unique(&["namespace", "name"])),
            (COLLECTION_RUNS, Index::new(&["namespace", "installation"])),
            (COLLECTION_RESULTS, Index::new(&["namespace", "installation"])),
            (COLLECTION_RESULTS, Index::new(&["runId"])),
            (COLLECTION_OUTPUTS, Index::unique(&["resultId", "name"])),
            (
                COLLECTION_OUTPUTS,
                Index::new(&["namespace", "installation", "name", "-resultId"]),
            ),
            (
                COLLECTION_OUTPUTS,
                Index::new(&["namespace", "installation", "-resultId"]),
            ),
            (COLLECTION_CREDENTIALS, Index::unique(&["namespace", "name"])),
            (COLLECTION_PARAMETERS, Index::unique(&["namespace", "name"])),
        ];
        for (collection, index) in indexes {
            self.store.ensure_index(collection, index)?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Installations
    // -------------------------------------------------------------------------

    pub fn list_installations(&self, opts: &ListOptions) -> Result<Vec<Installation>> {
        self.initialize()?;
        let find = FindOptions::new(opts.filter())
            .sorted(&["namespace", "name"])
            .page(opts.skip, opts.limit);
        let docs = self.store.find(COLLECTION_INSTALLATIONS, &find)?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            match from_document::<Installation>(COLLECTION_INSTALLATIONS, doc) {
                Ok(i) => out.push(i),
                Err(e) => warn!(error = %e, "skipping unreadable installation record"),
            }
        }
        Ok(out)
    }

    pub fn get_installation(&self, namespace: &str, name: &str) -> Result<Installation> {
        self.initialize()?;
        let filter = Filter::all().with("namespace", namespace).with("name", name);
        let doc = self
            .store
            .find_one(COLLECTION_INSTALLATIONS, &FindOptions::new(filter))
            .map_err(|e| {
                if e.is_not_found() {
                    PorterError::not_found("installation", format!("{namespace}/{name}"))
                } else {
                    e
                }
            })?;
        from_document(COLLECTION_INSTALLATIONS, doc)
    }

    pub fn insert_installation(&self, installation: &Installation) -> Result<()> {
        self.initialize()?;
        installation.validate()?;
        self.store
            .insert(COLLECTION_INSTALLATIONS, vec![to_document(installation)?])
            .map_err(|e| {
                e.context(format!(
                    "unable to insert installation {}",
                    installation.installation_ref()
                ))
            })
    }

    pub fn update_installation(&self, installation: &Installation) -> Result<()> {
        self.initialize()?;
        installation.validate()?;
        self.store
            .update(COLLECTION_INSTALLATIONS, to_document(installation)?, false)
    }

    pub fn upsert_installation(&self, installation: &Installation) -> Result<()> {
        self.initialize()?;
        installation.validate()?;
        self.store
            .update(COLLECTION_INSTALLATIONS, to_document(installation)?, true)
    }

    /// Delete an installation and everything it owns.
    ///
    /// The installation goes first so readers never see children without
    /// their parent.
    pub fn remove_installation(&self, namespace: &str, name: &str) -> Result<()> {
        self.initialize()?;
        let filter = Filter::all().with("namespace", namespace).with("name", name);
        let removed = self.store.remove(COLLECTION_INSTALLATIONS, &filter, false)?;
        if removed == 0 {
            return Err(PorterError::not_found(
                "installation",
                format!("{namespace}/{name}"),
            ));
        }
        let children = installation_filter(namespace, name);
        for collection in [COLLECTION_RUNS, COLLECTION_RESULTS, COLLECTION_OUTPUTS] {
            let n = self.store.remove(collection, &children, true)?;
            debug!(collection, removed = n, "removed installation records");
        }
        info!(namespace, name, "removed installation");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Runs
    // -------------------------------------------------------------------------

    pub fn insert_run(&self, run: &Run) -> Result<()> {
        self.initialize()?;
        self.store.insert(COLLECTION_RUNS, vec![to_document(run)?])
    }

    pub fn upsert_run(&self, run: &Run) -> Result<()> {
        self.initialize()?;
        self.store.update(COLLECTION_RUNS, to_document(run)?, true)
    }

    pub fn get_run(&self, id: &str) -> Result<Run> {
        self.initialize()?;
        let doc = self
            .store
            .find_one(COLLECTION_RUNS, &FindOptions::new(Filter::by_id(id)))
            .map_err(|e| if e.is_not_found() { PorterError::not_found("run", id) } else { e })?;
        from_document(COLLECTION_RUNS, doc)
    }

    /// Runs of an installation, oldest first.
    pub fn list_runs(&self, namespace: &str, installation: &str) -> Result<Vec<Run>> {
        self.initialize()?;
        let find = FindOptions::new(installation_filter(namespace, installation)).sorted(&[ID_FIELD]);
        self.store
            .find(COLLECTION_RUNS, &find)?
            .into_iter()
            .map(|d| from_document(COLLECTION_RUNS, d))
            .collect()
    }

    pub fn get_last_run(&self, namespace: &str, installation: &str) -> Result<Run> {
        self.initialize()?;
        let find = FindOptions::new(installation_filter(namespace, installation))
            .sorted(&["-_id"]);
        let doc = self.store.find_one(COLLECTION_RUNS, &find).map_err(|e| {
            if e.is_not_found() {
                PorterError::not_found("run", format!("last run of {namespace}/{installation}"))
            } else {
                e
            }
        })?;
        from_document(COLLECTION_RUNS, doc)
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    pub fn insert_result(&self, result: &RunResult) -> Result<()> {
        self.initialize()?;
        self.store.insert(COLLECTION_RESULTS, vec![to_document(result)?])
    }

    pub fn get_result(&self, id: &str) -> Result<RunResult> {
        self.initialize()?;
        let doc = self
            .store
            .find_one(COLLECTION_RESULTS, &FindOptions::new(Filter::by_id(id)))
            .map_err(|e| if e.is_not_found() { PorterError::not_found("result", id) } else { e })?;
        from_document(COLLECTION_RESULTS, doc)
    }

    /// Results of a run, oldest first.
    pub fn list_results(&self, run_id: &str) -> Result<Vec<RunResult>> {
        self.initialize()?;
        let find = FindOptions::new(Filter::all().with("runId", run_id)).sorted(&[ID_FIELD]);
        self.store
            .find(COLLECTION_RESULTS, &find)?
            .into_iter()
            .map(|d| from_document(COLLECTION_RESULTS, d))
            .collect()
    }

    /// The status of the run's most recent result.
    pub fn run_status(&self, run_id: &str) -> Result<ResultStatus> {
        Ok(self
            .list_results(run_id)?
            .last()
            .map(|r| r.status)
            .unwrap_or_default())
    }

    // -------------------------------------------------------------------------
    // Outputs
    // -------------------------------------------------------------------------

    pub fn insert_output(&self, output: &Output) -> Result<()> {
        self.initialize()?;
        self.store.insert(COLLECTION_OUTPUTS, vec![to_document(output)?])
    }

    pub fn list_outputs(&self, result_id: &str) -> Result<Vec<Output>> {
        self.initialize()?;
        let find = FindOptions::new(Filter::all().with("resultId", result_id)).sorted(&["name"]);
        self.store
            .find(COLLECTION_OUTPUTS, &find)?
            .into_iter()
            .map(|d| from_document(COLLECTION_OUTPUTS, d))
            .collect()
    }

    /// The most recent value of a named output.
    pub fn get_last_output(&self, namespace: &str, installation: &str, name: &str) -> Result<Output> {
        self.initialize()?;
        let find = FindOptions::new(installation_filter(namespace, installation).with("name", name))
            .sorted(&["-resultId"]);
        let doc = self.store.find_one(COLLECTION_OUTPUTS, &find).map_err(|e| {
            if e.is_not_found() {
                PorterError::not_found("output", format!("{name} on {namespace}/{installation}"))
            } else {
                e
            }
        })?;
        from_document(COLLECTION_OUTPUTS, doc)
    }

    /// The most recent value of every output of an installation, sorted by name.
    pub fn get_last_outputs(&self, namespace: &str, installation: &str) -> Result<Vec<Output>> {
        self.initialize()?;
        let pipeline = [
            Stage::Match(installation_filter(namespace, installation)),
            Stage::Sort(vec!["name".into(), "-resultId".into()]),
            Stage::GroupFirst("name".into()),
        ];
        self.store
            .aggregate(COLLECTION_OUTPUTS, &pipeline)?
            .into_iter()
            .map(|d| from_document(COLLECTION_OUTPUTS, d))
            .collect()
    }

    /// Logs captured from the most recent run that recorded any.
    pub fn get_logs(&self, namespace: &str, installation: &str) -> Result<Option<String>> {
        match self.get_last_output(namespace, installation, OUTPUT_INVOCATION_IMAGE_LOGS) {
            Ok(o) => Ok(Some(o.value_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // -------------------------------------------------------------------------
    // Credential & parameter sets
    // -------------------------------------------------------------------------

    fn set_collection(kind: SetKind) -> &'static str {
        match kind {
            SetKind::Credentials => COLLECTION_CREDENTIALS,
            SetKind::Parameters => COLLECTION_PARAMETERS,
        }
    }

    /// Insert or replace a set, keyed by `(namespace, name)`.
    pub fn apply_set(&self, kind: SetKind, set: &StrategySet) -> Result<StrategySet> {
        self.initialize()?;
        set.validate()?;
        let collection = Self::set_collection(kind);
        let mut set = set.clone();
        match self.get_set(kind, &set.namespace, &set.name) {
            Ok(existing) => {
                set.id = existing.id;
                set.created = existing.created;
            }
            Err(e) if e.is_not_found() => {
                if set.id.is_empty() {
                    set.id = super::new_ulid();
                }
            }
            Err(e) => return Err(e),
        }
        set.modified = chrono::Utc::now();
        self.store.update(collection, to_document(&set)?, true)?;
        Ok(set)
    }

    pub fn get_set(&self, kind: SetKind, namespace: &str, name: &str) -> Result<StrategySet> {
        self.initialize()?;
        let collection = Self::set_collection(kind);
        let filter = Filter::all().with("namespace", namespace).with("name", name);
        let doc = self
            .store
            .find_one(collection, &FindOptions::new(filter))
            .map_err(|e| {
                if e.is_not_found() {
                    PorterError::not_found(kind.label(), format!("{namespace}/{name}"))
                } else {
                    e
                }
            })?;
        from_document(collection, doc)
    }

    pub fn list_sets(&self, kind: SetKind, namespace: Option<&str>) -> Result<Vec<StrategySet>> {
        self.initialize()?;
        let collection = Self::set_collection(kind);
        let filter = match namespace {
            Some(ns) => Filter::all().with("namespace", ns),
            None => Filter::all(),
        };
        self.store
            .find(collection, &FindOptions::new(filter).sorted(&["namespace", "name"]))?
            .into_iter()
            .map(|d| from_document(collection, d))
            .collect()
    }

    /// Remove a set; returns false if it did not exist.
    pub fn remove_set(&self, kind: SetKind, namespace: &str, name: &str) -> Result<bool> {
        self.initialize()?;
        let filter = Filter::all().with("namespace", namespace).with("name", name);
        Ok(self.store.remove(Self::set_collection(kind), &filter, false)? > 0)
    }
}

/// Which set collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetKind {
    Credentials,
    Parameters,
}

impl SetKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Credentials => "credential set",
            Self::Parameters => "parameter set",
        }
    }
}

fn check_schema_version(found: &str) -> Result<()> {
    let required = parse_semver(STORE_SCHEMA_VERSION);
    let current = parse_semver(found);
    match (current, required) {
        (Some(c), Some(r)) if c < r => Err(PorterError::MigrationRequired {
            found: found.to_string(),
            required: STORE_SCHEMA_VERSION.to_string(),
        }),
        (Some(_), Some(_)) => Ok(()),
        _ => Err(PorterError::MigrationRequired {
            found: format!("{found:?}"),
            required: STORE_SCHEMA_VERSION.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn store() -> InstallationStore {
        InstallationStore::new(Arc::new(MemoryStore::new()))
    }

    fn seed_run(s: &InstallationStore, inst: &Installation, outputs: &[(&str, &str)]) -> (Run, RunResult) {
        let run = inst.new_run("install", sample_bundle());
        s.insert_run(&run).expect("run");
        let result = run.new_result(ResultStatus::Succeeded);
        s.insert_result(&result).expect("result");
        for (name, value) in outputs {
            s.insert_output(&result.new_output(*name, value.as_bytes().to_vec()))
                .expect("output");
        }
        (run, result)
    }

    #[test]
    fn installation_round_trip() {
        let s = store();
        let mut inst = Installation::new("dev", "mybun");
        inst.labels.insert("team".into(), "red".into());
        s.insert_installation(&inst).expect("insert");
        assert_eq!(s.get_installation("dev", "mybun").expect("get"), inst);
        assert!(s.get_installation("", "mybun").expect_err("other ns").is_not_found());
    }

    #[test]
    fn installation_name_is_unique_per_namespace() {
        let s = store();
        s.insert_installation(&Installation::new("", "mybun")).expect("first");
        assert!(s.insert_installation(&Installation::new("", "mybun")).is_err());
        s.insert_installation(&Installation::new("dev", "mybun")).expect("other ns");
    }

    #[test]
    fn list_filters_by_namespace_and_labels() {
        let s = store();
        let mut a = Installation::new("", "a");
        a.labels.insert("env".into(), "prod".into());
        s.insert_installation(&a).expect("a");
        s.insert_installation(&Installation::new("", "b")).expect("b");
        s.insert_installation(&Installation::new("dev", "c")).expect("c");

        assert_eq!(s.list_installations(&ListOptions::default()).expect("all").len(), 3);
        assert_eq!(s.list_installations(&ListOptions::in_namespace("")).expect("global").len(), 2);
        let mut opts = ListOptions::in_namespace("");
        opts.labels.insert("env".into(), "prod".into());
        let found = s.list_installations(&opts).expect("labels");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "a");
    }

    #[test]
    fn last_outputs_pick_latest_result() {
        let s = store();
        let inst = Installation::new("", "mybun");
        s.insert_installation(&inst).expect("insert");
        seed_run(&s, &inst, &[("host", "old"), ("port", "3306")]);
        let (_, latest) = seed_run(&s, &inst, &[("host", "new")]);

        let host = s.get_last_output("", "mybun", "host").expect("host");
        assert_eq!(host.value_string(), "new");
        assert_eq!(host.result_id, latest.id);

        let all = s.get_last_outputs("", "mybun").expect("outputs");
        let values: Vec<(String, String)> =
            all.iter().map(|o| (o.name.clone(), o.value_string())).collect();
        assert_eq!(
            values,
            vec![("host".into(), "new".into()), ("port".into(), "3306".into())]
        );
    }

    #[test]
    fn run_status_is_latest_result() {
        let s = store();
        let inst = Installation::new("", "mybun");
        let run = inst.new_run("install", sample_bundle());
        s.insert_run(&run).expect("run");
        s.insert_result(&run.new_result(ResultStatus::Running)).expect("running");
        s.insert_result(&run.new_result(ResultStatus::Failed)).expect("failed");
        assert_eq!(s.run_status(&run.id).expect("status"), ResultStatus::Failed);
    }

    #[test]
    fn remove_cascades() {
        let s = store();
        let inst = Installation::new("", "mybun");
        s.insert_installation(&inst).expect("insert");
        let other = Installation::new("", "other");
        s.insert_installation(&other).expect("insert");
        seed_run(&s, &inst, &[("host", "a")]);
        let (other_run, _) = seed_run(&s, &other, &[("host", "b")]);

        s.remove_installation("", "mybun").expect("remove");
        assert!(s.get_installation("", "mybun").expect_err("gone").is_not_found());
        assert!(s.list_runs("", "mybun").expect("runs").is_empty());
        assert!(s.get_last_outputs("", "mybun").expect("outputs").is_empty());
        assert_eq!(s.list_runs("", "other").expect("runs")[0].id, other_run.id);
        assert!(s.remove_installation("", "mybun").expect_err("twice").is_not_found());
    }

    #[test]
    fn initialize_writes_schema_once() {
        let docs: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let s = InstallationStore::new(docs.clone());
        s.initialize().expect("first");
        let doc = docs
            .find_one(COLLECTION_CONFIG, &FindOptions::new(Filter::by_id(SCHEMA_DOCUMENT_ID)))
            .expect("schema document");
        let schema: StoreSchema = from_document(COLLECTION_CONFIG, doc).expect("schema");
        assert_eq!(schema.installations, STORE_SCHEMA_VERSION);

        // Later calls trust the verified schema without reading it again.
        docs.update(
            COLLECTION_CONFIG,
            json!({"_id": SCHEMA_DOCUMENT_ID, "installations": "1.0.0"}),
            true,
        )
        .expect("overwrite schema");
        s.initialize().expect("second");
        assert!(s.list_installations(&ListOptions::default()).expect("list").is_empty());
    }

    #[test]
    fn old_schema_requires_migration() {
        let docs: Arc<dyn Store> = Arc::new(MemoryStore::new());
        docs.update(
            COLLECTION_CONFIG,
            json!({"_id": SCHEMA_DOCUMENT_ID, "installations": "1.0.0"}),
            true,
        )
        .expect("seed schema");
        let s = InstallationStore::new(docs);
        let err = s.list_installations(&ListOptions::default()).expect_err("old schema");
        assert!(matches!(err, PorterError::MigrationRequired { .. }));
        assert!(s.insert_installation(&Installation::new("", "x")).is_err());
    }

    #[test]
    fn legacy_records_are_listed() {
        let docs: Arc<dyn Store> = Arc::new(MemoryStore::new());
        docs.insert(COLLECTION_INSTALLATIONS, vec![json!({"_id": "01LEGACY", "name": "mybun"})])
            .expect("seed");
        let s = InstallationStore::new(docs);
        let found = s.list_installations(&ListOptions::in_namespace("")).expect("list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "mybun");
        assert_eq!(found[0].schema_version, crate::primitives::INSTALLATION_SCHEMA_VERSION);
    }

    #[test]
    fn undecodable_records_are_skipped() {
        let docs: Arc<dyn Store> = Arc::new(MemoryStore::new());
        docs.insert(
            COLLECTION_INSTALLATIONS,
            vec![json!({"_id": "01BAD", "name": "broken", "schemaVersion": "1.0.2", "namespace": ""})],
        )
        .expect("seed");
        let s = InstallationStore::new(docs);
        s.insert_installation(&Installation::new("", "good")).expect("insert");
        let found = s.list_installations(&ListOptions::default()).expect("list");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "good");
    }

    #[test]
    fn sets_are_upserted_by_name() {
        let s = store();
        let mut set = StrategySet::new("", "mycreds");
        set.entries.push(crate::secrets::Strategy::literal("token", "a"));
        let first = s.apply_set(SetKind::Credentials, &set).expect("apply");
        set.entries[0] = crate::secrets::Strategy::literal("token", "b");
        set.id = String::new();
        let second = s.apply_set(SetKind::Credentials, &set).expect("reapply");
        assert_eq!(first.id, second.id);
        assert_eq!(s.list_sets(SetKind::Credentials, None).expect("list").len(), 1);
        assert!(s.list_sets(SetKind::Parameters, None).expect("list").is_empty());
        assert!(s.remove_set(SetKind::Credentials, "", "mycreds").expect("remove"));
    }
}
