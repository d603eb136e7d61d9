//! # Installation Records
//!
//! The documents that track every bundle action:
//!
//! ```text
//! Installation ──owns──▶ Run ──owns──▶ RunResult ──owns──▶ Output
//! ```
//!
//! Ids are ULIDs, so lexical order is creation order. The store relies on
//! this to find "the last output with this name" with a descending scan.

pub mod store;

use crate::bundle::ExtendedBundle;
use crate::primitives::{
    ACTION_INSTALL, ACTION_UNINSTALL, CLAIM_SCHEMA_VERSION, INSTALLATION_SCHEMA_VERSION,
    SET_SCHEMA_VERSION,
};
use crate::reference::OCIReference;
use crate::secrets::Strategy;
use crate::types::{InstallationRef, PorterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};
use ulid::{Generator, Ulid};

pub use store::InstallationStore;

// =============================================================================
// IDS
// =============================================================================

static ID_GENERATOR: OnceLock<Mutex<Generator>> = OnceLock::new();

/// A new ULID, strictly greater than every id previously issued by this process.
pub fn new_ulid() -> String {
    let generator = ID_GENERATOR.get_or_init(|| Mutex::new(Generator::new()));
    match generator.lock() {
        Ok(mut g) => g.generate().unwrap_or_else(|_| Ulid::new()).to_string(),
        Err(_) => Ulid::new().to_string(),
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
    Pending,
    #[default]
    Unknown,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Pending => "pending",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// INSTALLATION
// =============================================================================

/// The bundle currently bound to an installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BundleBinding {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl BundleBinding {
    /// The bound reference, if a repository is recorded.
    pub fn reference(&self) -> Result<Option<OCIReference>> {
        if self.repository.is_empty() {
            return Ok(None);
        }
        let mut r = OCIReference::parse(&self.repository)?;
        if !self.digest.is_empty() {
            r = r.with_digest(&self.digest)?;
        } else if !self.tag.is_empty() {
            r = r.with_tag(&self.tag)?;
        } else if !self.version.is_empty() {
            r = r.with_version(&self.version)?;
        }
        Ok(Some(r))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallationStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_status: Option<ResultStatus>,
    /// Set on the first successful install and never cleared.
    #[serde(default)]
    pub installation_completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstalled: Option<DateTime<Utc>>,
}

/// Long-lived record of a bundle applied to an environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    #[serde(rename = "_id")]
    pub id: String,
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub uninstalled: bool,
    #[serde(default)]
    pub bundle: BundleBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_sets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_sets: Vec<String>,
    /// User-supplied parameter overrides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Strategy>,
    #[serde(default)]
    pub status: InstallationStatus,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl Installation {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_ulid(),
            schema_version: INSTALLATION_SCHEMA_VERSION.to_string(),
            name: name.into(),
            namespace: namespace.into(),
            uninstalled: false,
            bundle: BundleBinding::default(),
            custom: None,
            labels: BTreeMap::new(),
            credential_sets: Vec::new(),
            parameter_sets: Vec::new(),
            parameters: Vec::new(),
            status: InstallationStatus::default(),
            created: now,
            modified: now,
        }
    }

    pub fn installation_ref(&self) -> InstallationRef {
        InstallationRef::new(&self.namespace, &self.name)
    }

    /// Bind the installation to a bundle reference.
    pub fn track_bundle(&mut self, reference: &OCIReference) {
        self.bundle = BundleBinding {
            repository: reference.repository(),
            version: reference.version().map(|v| v.to_string()).unwrap_or_default(),
            digest: reference.digest().unwrap_or_default().to_string(),
            tag: reference.tag().unwrap_or_default().to_string(),
        };
    }

    /// Fold a run's result into the status.
    ///
    /// `installation_completed` only ever moves from false to true.
    pub fn apply_result(&mut self, run: &Run, result: &RunResult) {
        self.status.run_id.clone_from(&run.id);
        self.status.action.clone_from(&run.action);
        self.status.result_id.clone_from(&result.id);
        self.status.result_status = Some(result.status);
        self.modified = result.created;

        if result.status != ResultStatus::Succeeded {
            return;
        }
        match run.action.as_str() {
            ACTION_INSTALL => {
                if !self.status.installation_completed {
                    self.status.installation_completed = true;
                    self.status.installed = Some(result.created);
                }
                self.uninstalled = false;
            }
            ACTION_UNINSTALL => {
                self.uninstalled = true;
                self.status.uninstalled = Some(result.created);
            }
            _ => {}
        }
    }

    pub fn is_installed(&self) -> bool {
        self.status.installation_completed && !self.uninstalled
    }

    pub fn is_uninstalled(&self) -> bool {
        self.uninstalled
    }

    /// Build a run of `action` against this installation.
    pub fn new_run(&self, action: &str, bundle: ExtendedBundle) -> Run {
        Run {
            id: new_ulid(),
            revision: new_ulid(),
            schema_version: CLAIM_SCHEMA_VERSION.to_string(),
            created: Utc::now(),
            namespace: self.namespace.clone(),
            installation: self.name.clone(),
            action: action.to_string(),
            bundle,
            bundle_reference: String::new(),
            bundle_digest: String::new(),
            parameter_overrides: self.parameters.clone(),
            credential_sets: self.credential_sets.clone(),
            parameter_sets: self.parameter_sets.clone(),
            parameters: Vec::new(),
            custom: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PorterError::Validation("installation name is required".into()));
        }
        validate_schema_version("installation", &self.schema_version, INSTALLATION_SCHEMA_VERSION)
    }

    /// Replace or add a parameter override.
    pub fn set_parameter(&mut self, strategy: Strategy) {
        match self.parameters.iter_mut().find(|p| p.name == strategy.name) {
            Some(existing) => *existing = strategy,
            None => self.parameters.push(strategy),
        }
        self.parameters.sort_by(|a, b| a.name.cmp(&b.name));
    }
}

/// Reject documents written with a different major schema version.
fn validate_schema_version(kind: &str, found: &str, supported: &str) -> Result<()> {
    let major = |v: &str| v.split('.').next().map(str::to_string).unwrap_or_default();
    if found.is_empty() || major(found) != major(supported) {
        return Err(PorterError::Validation(format!(
            "invalid {kind} schemaVersion {found:?}, expected {supported}"
        )));
    }
    Ok(())
}

// =============================================================================
// RUN
// =============================================================================

/// One execution of one action against one installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    #[serde(rename = "_id")]
    pub id: String,
    /// Identifies the logical attempt; retries share a revision.
    pub revision: String,
    pub schema_version: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub namespace: String,
    pub installation: String,
    pub action: String,
    pub bundle: ExtendedBundle,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle_digest: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_overrides: Vec<Strategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credential_sets: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameter_sets: Vec<String>,
    /// Resolved parameters. Sensitive entries are secret references once stored.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<JsonValue>,
}

impl Run {
    pub fn should_record(&self) -> bool {
        self.bundle.should_record(&self.action)
    }

    pub fn new_result(&self, status: ResultStatus) -> RunResult {
        RunResult {
            id: new_ulid(),
            schema_version: CLAIM_SCHEMA_VERSION.to_string(),
            namespace: self.namespace.clone(),
            installation: self.installation.clone(),
            run_id: self.id.clone(),
            created: Utc::now(),
            status,
            message: String::new(),
            output_metadata: BTreeMap::new(),
        }
    }

    /// Resolved parameter values converted to the types their definitions declare.
    pub fn typed_parameter_values(&self) -> Result<BTreeMap<String, JsonValue>> {
        let mut values = BTreeMap::new();
        for p in &self.parameters {
            let v = self.bundle.convert_parameter_value(&p.name, &p.value)?;
            values.insert(p.name.clone(), v);
        }
        Ok(values)
    }

    pub fn installation_ref(&self) -> InstallationRef {
        InstallationRef::new(&self.namespace, &self.installation)
    }
}

// =============================================================================
// RESULT
// =============================================================================

/// Outcome of a run. A run may accumulate several while it progresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    #[serde(rename = "_id")]
    pub id: String,
    pub schema_version: String,
    #[serde(default)]
    pub namespace: String,
    pub installation: String,
    pub run_id: String,
    pub created: DateTime<Utc>,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Per-output metadata, e.g. content digests.
    #[serde(default, rename = "outputs", skip_serializing_if = "BTreeMap::is_empty")]
    pub output_metadata: BTreeMap<String, BTreeMap<String, String>>,
}

impl RunResult {
    pub fn new_output(&self, name: impl Into<String>, value: Vec<u8>) -> Output {
        let name = name.into();
        Output {
            id: Output::make_id(&self.id, &name),
            schema_version: CLAIM_SCHEMA_VERSION.to_string(),
            name,
            namespace: self.namespace.clone(),
            installation: self.installation.clone(),
            run_id: self.run_id.clone(),
            result_id: self.id.clone(),
            value,
            key: String::new(),
        }
    }
}

// =============================================================================
// OUTPUT
// =============================================================================

/// A single output value.
///
/// After sanitization exactly one of `value` or `key` is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Output {
    #[serde(rename = "_id")]
    pub id: String,
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub installation: String,
    pub run_id: String,
    pub result_id: String,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub value: Vec<u8>,
    /// Secret store key holding the value when the output is sensitive.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
}

impl Output {
    pub fn make_id(result_id: &str, name: &str) -> String {
        format!("{result_id}-{name}")
    }

    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// CREDENTIAL & PARAMETER SETS
// =============================================================================

/// A named, reusable list of strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySet {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default = "default_set_schema")]
    pub schema_version: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, alias = "credentials", alias = "parameters")]
    pub entries: Vec<Strategy>,
    #[serde(default = "Utc::now")]
    pub created: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub modified: DateTime<Utc>,
}

fn default_set_schema() -> String {
    SET_SCHEMA_VERSION.to_string()
}

impl StrategySet {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_ulid(),
            schema_version: default_set_schema(),
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            entries: Vec::new(),
            created: now,
            modified: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PorterError::Validation("set name is required".into()));
        }
        validate_schema_version("set", &self.schema_version, SET_SCHEMA_VERSION)?;
        let mut seen = std::collections::BTreeSet::new();
        for s in &self.entries {
            if !seen.insert(&s.name) {
                return Err(PorterError::Validation(format!(
                    "{} is defined more than once in set {}",
                    s.name, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Credential set: strategies for a bundle's credentials.
pub type CredentialSet = StrategySet;
/// Parameter set: strategies for a bundle's parameters.
pub type ParameterSet = StrategySet;
