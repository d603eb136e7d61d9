//! # Required Extensions
//!
//! The table of bundle extensions Porter recognises and the readers that
//! turn each `custom` entry into a typed value.
//!
//! Matching accepts the full key or the legacy shorthand: older bundles
//! list `dependencies` instead of `io.cnab.dependencies`.

use super::ExtendedBundle;
use super::dependencies::{DeclaredDependencies, DependenciesV1, DependenciesV2};
use crate::types::{PorterError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

// =============================================================================
// KEYS
// =============================================================================

pub const DEPENDENCIES_V1_SHORTHAND: &str = "dependencies";
pub const DEPENDENCIES_V1_KEY: &str = "io.cnab.dependencies";

pub const DEPENDENCIES_V2_SHORTHAND: &str = "dependencies@v2";
pub const DEPENDENCIES_V2_KEY: &str = "org.getporter.dependencies@v2";

pub const PARAMETER_SOURCES_SHORTHAND: &str = "parameter-sources";
pub const PARAMETER_SOURCES_KEY: &str = "io.cnab.parameter-sources";

pub const DOCKER_SHORTHAND: &str = "docker";
pub const DOCKER_KEY: &str = "io.cnab.docker";

pub const FILE_PARAMETERS_SHORTHAND: &str = "file-parameters";
pub const FILE_PARAMETERS_KEY: &str = "sh.porter.file-parameters";

pub const DIRECTORY_PARAMETER_SHORTHAND: &str = "directory-parameter";
pub const DIRECTORY_PARAMETER_KEY: &str = "sh.porter.directory-parameter";

// =============================================================================
// EXTENSION PAYLOADS
// =============================================================================

/// Host access requested by the docker extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Docker {
    #[serde(default)]
    pub privileged: bool,
}

/// A bind mount backing a directory parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MountSource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DirectoryDetails {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub writeable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountSource>,
}

/// One way a parameter can be filled at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParameterSourceDefinition {
    /// The last value of an output on the same installation.
    Output { name: String },
    /// An output of a dependency installation.
    DependencyOutput { dependency: String, name: String },
}

impl ParameterSourceDefinition {
    pub const OUTPUT: &'static str = "output";
    pub const DEPENDENCY_OUTPUT: &'static str = "dependencies.output";

    fn key(&self) -> &'static str {
        match self {
            Self::Output { .. } => Self::OUTPUT,
            Self::DependencyOutput { .. } => Self::DEPENDENCY_OUTPUT,
        }
    }

    fn decode(key: &str, raw: JsonValue) -> std::result::Result<Self, String> {
        #[derive(Deserialize)]
        struct OutputRaw {
            name: String,
        }
        #[derive(Deserialize)]
        struct DependencyOutputRaw {
            dependency: String,
            name: String,
        }
        match key {
            Self::OUTPUT => serde_json::from_value::<OutputRaw>(raw)
                .map(|o| Self::Output { name: o.name })
                .map_err(|e| e.to_string()),
            Self::DEPENDENCY_OUTPUT => serde_json::from_value::<DependencyOutputRaw>(raw)
                .map(|o| Self::DependencyOutput {
                    dependency: o.dependency,
                    name: o.name,
                })
                .map_err(|e| e.to_string()),
            other => Err(format!("unsupported parameter source key {other}")),
        }
    }

    fn encode(&self) -> JsonValue {
        match self {
            Self::Output { name } => serde_json::json!({ "name": name }),
            Self::DependencyOutput { dependency, name } => {
                serde_json::json!({ "dependency": dependency, "name": name })
            }
        }
    }
}

/// The sources a single parameter can draw from, with their priority.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterSource {
    pub priority: Vec<String>,
    pub sources: BTreeMap<String, ParameterSourceDefinition>,
}

impl ParameterSource {
    /// Add a source, appending its kind to the priority list.
    pub fn add(&mut self, source: ParameterSourceDefinition) {
        let key = source.key().to_string();
        if !self.priority.contains(&key) {
            self.priority.push(key.clone());
        }
        self.sources.insert(key, source);
    }

    /// Sources in priority order; kinds missing from `priority` follow.
    pub fn list_by_priority(&self) -> Vec<&ParameterSourceDefinition> {
        let mut out: Vec<&ParameterSourceDefinition> = self
            .priority
            .iter()
            .filter_map(|k| self.sources.get(k))
            .collect();
        for (key, source) in &self.sources {
            if !self.priority.contains(key) {
                out.push(source);
            }
        }
        out
    }
}

impl Serialize for ParameterSource {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            priority: &'a [String],
            sources: BTreeMap<&'a str, JsonValue>,
        }
        let sources = self
            .sources
            .iter()
            .map(|(k, v)| (k.as_str(), v.encode()))
            .collect();
        Wire {
            priority: &self.priority,
            sources,
        }
        .serialize(s)
    }
}

impl<'de> Deserialize<'de> for ParameterSource {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Wire {
            #[serde(default)]
            priority: Vec<String>,
            #[serde(default)]
            sources: BTreeMap<String, JsonValue>,
        }
        let wire = Wire::deserialize(d)?;
        let mut sources = BTreeMap::new();
        for (key, raw) in wire.sources {
            let def =
                ParameterSourceDefinition::decode(&key, raw).map_err(serde::de::Error::custom)?;
            sources.insert(key, def);
        }
        Ok(Self {
            priority: wire.priority,
            sources,
        })
    }
}

/// Parameter name to its sources.
pub type ParameterSources = BTreeMap<String, ParameterSource>;

// =============================================================================
// EXTENSION TABLE
// =============================================================================

/// The typed value a reader produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionData {
    DependenciesV1(DependenciesV1),
    DependenciesV2(DependenciesV2),
    ParameterSources(ParameterSources),
    Docker(Docker),
    FileParameters,
    DirectoryParameters(Vec<DirectoryDetails>),
}

/// An entry in the supported-extension table.
#[derive(Debug, Clone, Copy)]
pub struct RequiredExtension {
    pub shorthand: &'static str,
    pub key: &'static str,
    pub reader: fn(&ExtendedBundle) -> Result<ExtensionData>,
}

impl RequiredExtension {
    pub fn matches(&self, name: &str) -> bool {
        name == self.key || name == self.shorthand
    }
}

static SUPPORTED: [RequiredExtension; 6] = [
    RequiredExtension {
        shorthand: DEPENDENCIES_V1_SHORTHAND,
        key: DEPENDENCIES_V1_KEY,
        reader: |b| b.read_dependencies_v1().map(ExtensionData::DependenciesV1),
    },
    RequiredExtension {
        shorthand: DEPENDENCIES_V2_SHORTHAND,
        key: DEPENDENCIES_V2_KEY,
        reader: |b| b.read_dependencies_v2().map(ExtensionData::DependenciesV2),
    },
    RequiredExtension {
        shorthand: PARAMETER_SOURCES_SHORTHAND,
        key: PARAMETER_SOURCES_KEY,
        reader: |b| b.read_parameter_sources().map(ExtensionData::ParameterSources),
    },
    RequiredExtension {
        shorthand: DOCKER_SHORTHAND,
        key: DOCKER_KEY,
        reader: |b| b.read_docker().map(ExtensionData::Docker),
    },
    RequiredExtension {
        shorthand: FILE_PARAMETERS_SHORTHAND,
        key: FILE_PARAMETERS_KEY,
        reader: |_| Ok(ExtensionData::FileParameters),
    },
    RequiredExtension {
        shorthand: DIRECTORY_PARAMETER_SHORTHAND,
        key: DIRECTORY_PARAMETER_KEY,
        reader: |b| b.read_directory_parameters().map(ExtensionData::DirectoryParameters),
    },
];

/// Every extension this build understands.
pub fn supported_extensions() -> &'static [RequiredExtension] {
    &SUPPORTED
}

/// Look up an extension by full key or shorthand.
pub fn get_supported_extension(name: &str) -> Result<&'static RequiredExtension> {
    SUPPORTED
        .iter()
        .find(|e| e.matches(name))
        .ok_or_else(|| PorterError::UnsupportedExtension(name.to_string()))
}

/// Typed extension values keyed by canonical extension key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedExtensions(pub BTreeMap<String, ExtensionData>);

impl ProcessedExtensions {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn docker(&self) -> Option<Docker> {
        match self.0.get(DOCKER_KEY) {
            Some(ExtensionData::Docker(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn parameter_sources(&self) -> Option<&ParameterSources> {
        match self.0.get(PARAMETER_SOURCES_KEY) {
            Some(ExtensionData::ParameterSources(p)) => Some(p),
            _ => None,
        }
    }

    pub fn file_parameter_support(&self) -> bool {
        self.contains(FILE_PARAMETERS_KEY)
    }

    pub fn directory_parameter_support(&self) -> bool {
        self.contains(DIRECTORY_PARAMETER_KEY)
    }
}

// =============================================================================
// READERS
// =============================================================================

impl ExtendedBundle {
    /// True when `key` (or its shorthand) is listed as required.
    pub fn supports_extension(&self, key: &str) -> bool {
        let wanted = SUPPORTED.iter().find(|e| e.matches(key));
        self.required_extensions.iter().any(|ext| match wanted {
            Some(e) => e.matches(ext),
            None => ext == key,
        })
    }

    /// Run the reader of every required extension.
    ///
    /// Fails on the first unrecognised or unreadable extension.
    pub fn process_required_extensions(&self) -> Result<ProcessedExtensions> {
        let mut processed = BTreeMap::new();
        for name in &self.required_extensions {
            let ext = get_supported_extension(name)?;
            let data = (ext.reader)(self).map_err(|e| {
                PorterError::Validation(format!("unable to process extension: {}: {e}", ext.key))
            })?;
            processed.insert(ext.key.to_string(), data);
        }
        Ok(ProcessedExtensions(processed))
    }

    fn read_custom<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let raw = self
            .custom
            .get(key)
            .ok_or_else(|| PorterError::ExtensionNotPresent(key.to_string()))?;
        serde_json::from_value(raw.clone()).map_err(|e| {
            PorterError::Serialization(format!("could not unmarshal the {key} extension: {e}"))
        })
    }

    pub fn read_dependencies_v1(&self) -> Result<DependenciesV1> {
        self.read_custom::<DependenciesV1>(DEPENDENCIES_V1_KEY)
            .map(DependenciesV1::with_names)
    }

    pub fn read_dependencies_v2(&self) -> Result<DependenciesV2> {
        self.read_custom::<DependenciesV2>(DEPENDENCIES_V2_KEY)
            .map(DependenciesV2::with_names)
    }

    pub fn read_parameter_sources(&self) -> Result<ParameterSources> {
        self.read_custom(PARAMETER_SOURCES_KEY)
    }

    pub fn read_docker(&self) -> Result<Docker> {
        match self.custom.get(DOCKER_KEY) {
            None => Err(PorterError::ExtensionNotPresent(format!(
                "{DOCKER_KEY}: no custom extension configuration found"
            ))),
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                PorterError::Serialization(format!("could not unmarshal the {DOCKER_KEY} extension: {e}"))
            }),
        }
    }

    /// Directory parameters sorted by parameter name.
    pub fn read_directory_parameters(&self) -> Result<Vec<DirectoryDetails>> {
        match self.custom.get(DIRECTORY_PARAMETER_KEY) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(raw) => {
                let dirs: BTreeMap<String, DirectoryDetails> =
                    serde_json::from_value(raw.clone()).map_err(|e| {
                        PorterError::Serialization(format!(
                            "could not unmarshal the {DIRECTORY_PARAMETER_KEY} extension: {e}"
                        ))
                    })?;
                Ok(dirs.into_values().collect())
            }
        }
    }

    pub fn has_dependencies_v1(&self) -> bool {
        self.custom.contains_key(DEPENDENCIES_V1_KEY)
    }

    pub fn has_dependencies_v2(&self) -> bool {
        self.custom.contains_key(DEPENDENCIES_V2_KEY)
    }

    /// The dependency declarations in effect. v2 wins when both are present.
    pub fn dependencies(&self) -> Result<Option<DeclaredDependencies>> {
        if self.has_dependencies_v2() {
            return self.read_dependencies_v2().map(|d| Some(DeclaredDependencies::V2(d)));
        }
        if self.has_dependencies_v1() {
            return self.read_dependencies_v1().map(|d| Some(DeclaredDependencies::V1(d)));
        }
        Ok(None)
    }

    /// Parameter sources, or an empty map when the bundle declares none.
    pub fn parameter_sources(&self) -> Result<ParameterSources> {
        if !self.custom.contains_key(PARAMETER_SOURCES_KEY) {
            return Ok(ParameterSources::new());
        }
        self.read_parameter_sources()
    }
}
