//! # Dependency Declarations
//!
//! The two dependency wire formats a bundle may carry:
//!
//! - **v1** (`io.cnab.dependencies`): `sequence` + `requires`, each entry a
//!   bundle reference with an optional version range.
//! - **v2** (`org.getporter.dependencies@v2`): interfaces, installation
//!   selectors, sharing modes and structured parameter/credential wiring.
//!
//! When a bundle carries both, v2 wins.

use crate::reference::cached_regex;
use crate::types::{PorterError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::OnceLock;

// =============================================================================
// V1
// =============================================================================

/// A semver constraint on a v1 dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyVersion {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<String>,
    #[serde(default)]
    pub prereleases: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyV1 {
    /// Filled from the `requires` map key.
    #[serde(skip)]
    pub name: String,
    pub bundle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<DependencyVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependenciesV1 {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequence: Vec<String>,
    #[serde(default)]
    pub requires: BTreeMap<String, DependencyV1>,
}

impl DependenciesV1 {
    /// Copy each map key into the entry's `name`.
    pub fn with_names(mut self) -> Self {
        for (name, dep) in &mut self.requires {
            dep.name.clone_from(name);
        }
        self
    }

    /// Aliases in execution order.
    ///
    /// A `sequence` covering every entry dictates the order; otherwise the
    /// sorted keys are returned and ordering is left to the graph.
    pub fn ordered_names(&self) -> Vec<String> {
        if !self.sequence.is_empty() && self.sequence.len() == self.requires.len() {
            return self.sequence.clone();
        }
        self.requires.keys().cloned().collect()
    }

    /// True when `sequence` overrides the topological order.
    pub fn has_sequence_override(&self) -> bool {
        !self.sequence.is_empty() && self.sequence.len() == self.requires.len()
    }
}

// =============================================================================
// V2
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SharingMode {
    #[default]
    None,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SharingGroup {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SharingCriteria {
    #[serde(default)]
    pub mode: SharingMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<SharingGroup>,
}

impl SharingCriteria {
    /// The sharing group name, present only in `group` mode.
    pub fn group_name(&self) -> Option<&str> {
        match self.mode {
            SharingMode::Group => self.group.as_ref().map(|g| g.name.as_str()),
            SharingMode::None => None,
        }
    }
}

/// The interface a dependency must satisfy.
///
/// `reference` points at a bundle whose declarations form the interface;
/// `document` lists the names directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyInterface {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<InterfaceDocument>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct InterfaceDocument {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<String>,
}

impl InterfaceDocument {
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.parameters.is_empty() && self.credentials.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstallationCriteria {
    #[serde(default)]
    pub match_interface: bool,
    #[serde(default)]
    pub match_namespace: bool,
    #[serde(default)]
    pub ignore_labels: bool,
}

/// Selects an existing installation to satisfy a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyInstallation {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criteria: Option<InstallationCriteria>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyV2 {
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bundle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<DependencyInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installation: Option<DependencyInstallation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<SharingCriteria>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, DependencySource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, DependencySource>,
}

impl DependencyV2 {
    /// True when the dependency names no way to find a bundle or installation.
    pub fn has_no_selectors(&self) -> bool {
        self.bundle.is_empty() && self.interface.is_none() && self.installation.is_none()
    }

    pub fn sharing_group(&self) -> Option<&str> {
        self.sharing.as_ref().and_then(SharingCriteria::group_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependenciesV2 {
    #[serde(default)]
    pub requires: BTreeMap<String, DependencyV2>,
}

impl DependenciesV2 {
    pub fn with_names(mut self) -> Self {
        for (name, dep) in &mut self.requires {
            dep.name.clone_from(name);
        }
        self
    }
}

impl From<&DependenciesV1> for DependenciesV2 {
    /// Lift v1 entries into the v2 shape the dependency engine walks.
    fn from(v1: &DependenciesV1) -> Self {
        let requires = v1
            .requires
            .iter()
            .map(|(name, dep)| {
                let version = dep
                    .version
                    .as_ref()
                    .filter(|v| !v.ranges.is_empty())
                    .map(|v| v.ranges.join(" || "));
                let converted = DependencyV2 {
                    name: name.clone(),
                    bundle: dep.bundle.clone(),
                    version,
                    ..DependencyV2::default()
                };
                (name.clone(), converted)
            })
            .collect();
        Self { requires }
    }
}

/// The dependency declarations in effect for a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclaredDependencies {
    V1(DependenciesV1),
    V2(DependenciesV2),
}

impl DeclaredDependencies {
    /// The declarations in v2 shape.
    pub fn as_v2(&self) -> DependenciesV2 {
        match self {
            Self::V1(v1) => DependenciesV2::from(v1),
            Self::V2(v2) => v2.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::V1(v1) => v1.requires.is_empty(),
            Self::V2(v2) => v2.requires.is_empty(),
        }
    }

    /// v1 prerelease allowance for `alias`; v2 has none.
    pub fn allows_prereleases(&self, alias: &str) -> bool {
        match self {
            Self::V1(v1) => v1
                .requires
                .get(alias)
                .and_then(|d| d.version.as_ref())
                .is_some_and(|v| v.prereleases),
            Self::V2(_) => false,
        }
    }
}

// =============================================================================
// DEPENDENCY SOURCES
// =============================================================================

/// Where a dependency parameter or credential gets its value.
///
/// Exactly one form is populated: a literal `value`, or a reference to a
/// root parameter/credential, or a reference to another dependency's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencySource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dependency: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

static SOURCE_REGEX: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();

fn source_regex() -> Result<&'static Regex> {
    cached_regex(
        &SOURCE_REGEX,
        r"^(\s*\$\{\s*)?bundle(\.dependencies\.([^.]+))?\.([^.]+)\.([^\s\}]+)(\s*\}\s*)?$",
    )
}

/// Parse a wiring string such as `${ bundle.parameters.port }` or
/// `bundle.dependencies.mysql.outputs.host`.
///
/// Anything that does not look like a wiring reference is a literal value.
pub fn parse_dependency_source(value: &str) -> Result<DependencySource> {
    let Some(caps) = source_regex()?.captures(value) else {
        return Ok(DependencySource {
            value: Some(value.to_string()),
            ..DependencySource::default()
        });
    };

    let dependency = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
    let kind = caps.get(4).map(|m| m.as_str()).unwrap_or_default();
    let name = caps.get(5).map(|m| m.as_str()).unwrap_or_default().to_string();

    let mut source = DependencySource {
        dependency: dependency.to_string(),
        ..DependencySource::default()
    };
    match kind {
        "parameters" if dependency.is_empty() => source.parameter = name,
        "credentials" if dependency.is_empty() => source.credential = name,
        "outputs" if dependency.is_empty() => {
            return Err(PorterError::Validation(format!(
                "invalid dependency source {value:?}: cannot pass the root bundle output to a dependency"
            )));
        }
        "outputs" => source.output = name,
        "parameters" | "credentials" => {
            return Err(PorterError::Validation(format!(
                "invalid dependency source {value:?}: only outputs can be read from another dependency"
            )));
        }
        other => {
            return Err(PorterError::Validation(format!(
                "invalid dependency source {value:?}: unsupported section {other}"
            )));
        }
    }
    Ok(source)
}

impl DependencySource {
    pub fn literal(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    /// The wiring string in plain path form, or the literal value.
    pub fn as_bundle_wiring(&self) -> String {
        if let Some(v) = &self.value {
            return v.clone();
        }
        if !self.output.is_empty() {
            return format!("bundle.dependencies.{}.outputs.{}", self.dependency, self.output);
        }
        if !self.credential.is_empty() {
            return format!("bundle.credentials.{}", self.credential);
        }
        format!("bundle.parameters.{}", self.parameter)
    }

    /// True when the value is produced by another dependency.
    pub fn is_dependency_output(&self) -> bool {
        !self.dependency.is_empty() && !self.output.is_empty()
    }

    /// Resolve against the root run's values.
    ///
    /// Dependency outputs are looked up in `outputs`, keyed by the producing
    /// dependency alias; an absent output yields `None`.
    pub fn resolve(
        &self,
        parameters: &BTreeMap<String, JsonValue>,
        credentials: &BTreeMap<String, String>,
        outputs: &BTreeMap<String, BTreeMap<String, String>>,
    ) -> Option<String> {
        if let Some(v) = &self.value {
            return Some(v.clone());
        }
        if self.is_dependency_output() {
            return outputs
                .get(&self.dependency)
                .and_then(|o| o.get(&self.output))
                .cloned();
        }
        if !self.credential.is_empty() {
            return credentials.get(&self.credential).cloned();
        }
        parameters.get(&self.parameter).map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_template_and_plain_forms() {
        let templated = parse_dependency_source("${ bundle.parameters.port }").expect("parse");
        assert_eq!(templated.parameter, "port");
        assert!(templated.dependency.is_empty());

        let plain = parse_dependency_source("bundle.dependencies.mysql.outputs.host").expect("parse");
        assert_eq!(plain.dependency, "mysql");
        assert_eq!(plain.output, "host");

        let cred = parse_dependency_source("${bundle.credentials.kubeconfig}").expect("parse");
        assert_eq!(cred.credential, "kubeconfig");
    }

    #[test]
    fn literal_when_not_wiring() {
        let s = parse_dependency_source("mydb").expect("parse");
        assert_eq!(s, DependencySource::literal("mydb"));
    }

    #[test]
    fn rejects_root_outputs() {
        let err = parse_dependency_source("bundle.outputs.conn").expect_err("root output");
        assert!(err.to_string().contains("cannot pass the root bundle output"));
    }

    #[test]
    fn wiring_round_trips() {
        for wiring in [
            "bundle.parameters.port",
            "bundle.credentials.token",
            "bundle.dependencies.mysql.outputs.host",
        ] {
            let s = parse_dependency_source(wiring).expect("parse");
            assert_eq!(s.as_bundle_wiring(), wiring);
        }
    }

    #[test]
    fn v1_sequence_override() {
        let mut v1 = DependenciesV1::default();
        for name in ["b", "a"] {
            v1.requires.insert(name.into(), DependencyV1::default());
        }
        v1.sequence = vec!["b".into(), "a".into()];
        assert!(v1.has_sequence_override());
        assert_eq!(v1.ordered_names(), vec!["b", "a"]);

        v1.sequence = vec!["b".into()];
        assert!(!v1.has_sequence_override());
        assert_eq!(v1.ordered_names(), vec!["a", "b"]);
    }

    #[test]
    fn v1_lifts_to_v2() {
        let raw = serde_json::json!({
            "requires": {"mysql": {"bundle": "getporter/mysql", "version": {"ranges": ["5.x"], "prereleases": true}}}
        });
        let v1: DependenciesV1 = serde_json::from_value::<DependenciesV1>(raw)
            .expect("v1")
            .with_names();
        let declared = DeclaredDependencies::V1(v1);
        let v2 = declared.as_v2();
        let mysql = v2.requires.get("mysql").expect("mysql");
        assert_eq!(mysql.name, "mysql");
        assert_eq!(mysql.version.as_deref(), Some("5.x"));
        assert!(declared.allows_prereleases("mysql"));
    }

    #[test]
    fn sharing_group_only_in_group_mode() {
        let mut dep = DependencyV2 {
            sharing: Some(SharingCriteria {
                mode: SharingMode::None,
                group: Some(SharingGroup { name: "g".into() }),
            }),
            ..DependencyV2::default()
        };
        assert_eq!(dep.sharing_group(), None);
        if let Some(s) = dep.sharing.as_mut() {
            s.mode = SharingMode::Group;
        }
        assert_eq!(dep.sharing_group(), Some("g"));
    }
}
