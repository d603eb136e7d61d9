//! # Bundle Model
//!
//! The CNAB bundle descriptor (`bundle.json`) and the `ExtendedBundle`
//! wrapper that adds typed access to the extensions Porter understands.
//!
//! The descriptor is consumed as given. Fields Porter does not interpret are
//! kept in `custom` or the schema `extra` map so a load/save cycle preserves
//! them.

pub mod dependencies;
pub mod extensions;

use crate::primitives::{
    ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE, PORTER_CUSTOM_KEY, PORTER_INTERNAL,
    is_builtin_action,
};
use crate::reference::OCIReference;
use crate::types::{PorterError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::Path;

pub use dependencies::{
    DeclaredDependencies, DependenciesV1, DependenciesV2, DependencyInstallation,
    DependencyInterface, DependencySource, DependencyV1, DependencyV2, DependencyVersion,
    InstallationCriteria, InterfaceDocument, SharingCriteria, SharingGroup, SharingMode, parse_dependency_source,
};
pub use extensions::{
    DirectoryDetails, Docker, ExtensionData, ParameterSource, ParameterSourceDefinition,
    ParameterSources, ProcessedExtensions, RequiredExtension, supported_extensions,
};

// =============================================================================
// DESCRIPTOR
// =============================================================================

/// A container image referenced by the bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(default)]
    pub image_type: String,
    pub image: String,
    #[serde(default, rename = "contentDigest", skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Where a parameter or credential is injected into the invocation image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Location {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<Location>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl ParameterDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDefinition {
    #[serde(flatten)]
    pub location: Location,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
}

impl CredentialDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutputDefinition {
    pub definition: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

impl OutputDefinition {
    pub fn applies_to(&self, action: &str) -> bool {
        applies_to(&self.apply_to, action)
    }
}

/// Metadata for a custom action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ActionDefinition {
    #[serde(default)]
    pub modifies: bool,
    #[serde(default)]
    pub stateless: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A JSON schema fragment from the `definitions` section.
///
/// Only the keywords Porter acts on are typed; the rest are carried in
/// `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    #[serde(default, rename = "$comment", skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Schema {
    pub fn of_type(schema_type: &str) -> Self {
        Self {
            schema_type: Some(schema_type.to_string()),
            ..Self::default()
        }
    }

    pub fn is_write_only(&self) -> bool {
        self.write_only.unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Maintainer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// The raw CNAB bundle descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub schema_version: String,
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Maintainer>,
    #[serde(default)]
    pub invocation_images: Vec<Image>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, Image>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub actions: BTreeMap<String, ActionDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, ParameterDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, CredentialDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputDefinition>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub definitions: BTreeMap<String, Schema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, JsonValue>,
}

fn applies_to(apply_to: &[String], action: &str) -> bool {
    apply_to.is_empty() || apply_to.iter().any(|a| a == action)
}

// =============================================================================
// PORTER STAMP
// =============================================================================

/// The `sh.porter` custom section written by the manifest converter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PorterStamp {
    #[serde(default)]
    pub manifest_digest: String,
    /// Base64-encoded source manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

// =============================================================================
// EXTENDED BUNDLE
// =============================================================================

/// A bundle descriptor with typed extension accessors.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedBundle {
    pub bundle: Bundle,
}

impl Deref for ExtendedBundle {
    type Target = Bundle;

    fn deref(&self) -> &Bundle {
        &self.bundle
    }
}

impl From<Bundle> for ExtendedBundle {
    fn from(bundle: Bundle) -> Self {
        Self { bundle }
    }
}

impl Serialize for ExtendedBundle {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        self.bundle.serialize(s)
    }
}

impl<'de> Deserialize<'de> for ExtendedBundle {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        Bundle::deserialize(d).map(Self::from)
    }
}

impl ExtendedBundle {
    pub fn new(bundle: Bundle) -> Self {
        Self { bundle }
    }

    /// Decode a descriptor from JSON bytes.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let bundle: Bundle = serde_json::from_slice(data)
            .map_err(|e| PorterError::Serialization(format!("invalid bundle descriptor: {e}")))?;
        Ok(Self { bundle })
    }

    /// Load a descriptor from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| PorterError::Io(format!("unable to read {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    /// Encode the descriptor as pretty JSON.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.bundle)?)
    }

    /// Check the invariants a runnable bundle must hold.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(PorterError::Validation("bundle name is required".into()));
        }
        if self.schema_version.is_empty() {
            return Err(PorterError::Validation(format!(
                "bundle {} does not declare a schemaVersion",
                self.name
            )));
        }
        if crate::reference::parse_semver(&self.version).is_none() {
            return Err(PorterError::Validation(format!(
                "bundle {} version {:?} is not a semantic version",
                self.name, self.version
            )));
        }
        for (name, param) in &self.parameters {
            if !self.definitions.contains_key(&param.definition) {
                return Err(PorterError::Validation(format!(
                    "parameter {name} references undefined definition {}",
                    param.definition
                )));
            }
        }
        for (name, output) in &self.outputs {
            if !self.definitions.contains_key(&output.definition) {
                return Err(PorterError::Validation(format!(
                    "output {name} references undefined definition {}",
                    output.definition
                )));
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// Whether the bundle can run `action`.
    pub fn has_action(&self, action: &str) -> bool {
        is_builtin_action(action) || self.actions.contains_key(action)
    }

    /// Whether running `action` changes the installation.
    ///
    /// Built-in actions always modify.
    pub fn action_modifies(&self, action: &str) -> bool {
        match action {
            ACTION_INSTALL | ACTION_UPGRADE | ACTION_UNINSTALL => true,
            _ => self.actions.get(action).is_some_and(|a| a.modifies),
        }
    }

    pub fn action_is_stateless(&self, action: &str) -> bool {
        !is_builtin_action(action) && self.actions.get(action).is_some_and(|a| a.stateless)
    }

    /// False only when `action` is declared both non-modifying and stateless.
    pub fn should_record(&self, action: &str) -> bool {
        self.action_modifies(action) || !self.action_is_stateless(action)
    }

    // -------------------------------------------------------------------------
    // Sensitivity
    // -------------------------------------------------------------------------

    fn definition_of_parameter(&self, name: &str) -> Option<&Schema> {
        self.parameters
            .get(name)
            .and_then(|p| self.definitions.get(&p.definition))
    }

    pub fn is_sensitive_parameter(&self, name: &str) -> bool {
        self.definition_of_parameter(name)
            .is_some_and(Schema::is_write_only)
    }

    pub fn is_output_sensitive(&self, name: &str) -> bool {
        self.outputs
            .get(name)
            .and_then(|o| self.definitions.get(&o.definition))
            .is_some_and(Schema::is_write_only)
    }

    /// True for parameters Porter generated for its own bookkeeping.
    pub fn is_internal_parameter(&self, name: &str) -> bool {
        self.definition_of_parameter(name)
            .is_some_and(|d| d.comment.as_deref() == Some(PORTER_INTERNAL))
    }

    /// True when the definition describes a base64-encoded file parameter.
    pub fn is_file_type(&self, def: &Schema) -> bool {
        self.supports_extension(extensions::FILE_PARAMETERS_KEY)
            && def.schema_type.as_deref() == Some("string")
            && def.content_encoding.as_deref() == Some("base64")
    }

    /// True when the definition describes a directory parameter.
    pub fn is_dir_type(&self, def: &Schema) -> bool {
        self.supports_extension(extensions::DIRECTORY_PARAMETER_KEY)
            && def.schema_type.as_deref() == Some("string")
            && def.comment.as_deref() == Some(extensions::DIRECTORY_PARAMETER_KEY)
    }

    // -------------------------------------------------------------------------
    // Parameter values
    // -------------------------------------------------------------------------

    /// The default value of a parameter, if its definition declares one.
    pub fn parameter_default(&self, name: &str) -> Option<&JsonValue> {
        self.definition_of_parameter(name)
            .and_then(|d| d.default.as_ref())
    }

    /// Render a parameter value as the string handed to the invocation image.
    ///
    /// Strings pass through unchanged; every other value is JSON encoded.
    pub fn write_parameter_to_string(&self, name: &str, value: &JsonValue) -> Result<String> {
        match value {
            JsonValue::String(s) => Ok(s.clone()),
            other => serde_json::to_string(other).map_err(|e| {
                PorterError::Serialization(format!("unable to encode parameter {name}: {e}"))
            }),
        }
    }

    /// Convert a string value to the JSON type its definition declares.
    pub fn convert_parameter_value(&self, name: &str, value: &str) -> Result<JsonValue> {
        let Some(def) = self.definition_of_parameter(name) else {
            return Err(PorterError::Validation(format!(
                "parameter {name} is not defined in bundle {}",
                self.name
            )));
        };
        let invalid = |kind: &str| {
            PorterError::Validation(format!(
                "unable to convert parameter {name} value {value:?} to {kind}"
            ))
        };
        match def.schema_type.as_deref().unwrap_or("string") {
            "string" => Ok(JsonValue::String(value.to_string())),
            "boolean" => value
                .parse::<bool>()
                .map(JsonValue::Bool)
                .map_err(|_| invalid("boolean")),
            "integer" => value
                .trim()
                .parse::<i64>()
                .map(JsonValue::from)
                .map_err(|_| invalid("integer")),
            "number" => serde_json::from_str::<serde_json::Number>(value.trim())
                .map(JsonValue::Number)
                .map_err(|_| invalid("number")),
            "object" | "array" => serde_json::from_str(value).map_err(|_| invalid("json")),
            other => Err(invalid(other)),
        }
    }

    // -------------------------------------------------------------------------
    // Images & dependencies
    // -------------------------------------------------------------------------

    /// Every registry the bundle pulls images from, sorted and deduplicated.
    pub fn get_referenced_registries(&self) -> Result<Vec<String>> {
        let mut registries = BTreeSet::new();
        for image in self.invocation_images.iter().chain(self.images.values()) {
            let r = OCIReference::parse(&image.image)
                .map_err(|e| e.context(format!("invalid image in bundle {}", self.name)))?;
            registries.insert(r.registry().to_string());
        }
        Ok(registries.into_iter().collect())
    }

    /// Name of the installation created for a dependency of `parent`.
    pub fn build_prerequisite_installation_name(parent: &str, alias: &str) -> String {
        format!("{parent}-{alias}")
    }

    // -------------------------------------------------------------------------
    // Porter stamp
    // -------------------------------------------------------------------------

    /// The `sh.porter` section, if the bundle was built by Porter.
    pub fn porter_stamp(&self) -> Result<Option<PorterStamp>> {
        match self.custom.get(PORTER_CUSTOM_KEY) {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone()).map(Some).map_err(|e| {
                PorterError::Serialization(format!("invalid {PORTER_CUSTOM_KEY} section: {e}"))
            }),
        }
    }

    /// The decoded source manifest embedded by the converter.
    pub fn embedded_manifest(&self) -> Result<Option<Vec<u8>>> {
        let Some(stamp) = self.porter_stamp()? else {
            return Ok(None);
        };
        match stamp.manifest {
            None => Ok(None),
            Some(encoded) if encoded.is_empty() => Ok(None),
            Some(encoded) => BASE64.decode(encoded.as_bytes()).map(Some).map_err(|e| {
                PorterError::Serialization(format!("unable to decode embedded manifest: {e}"))
            }),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A bundle with one sensitive and one plain parameter.
    pub(crate) fn sample_bundle() -> ExtendedBundle {
        let raw = json!({
            "schemaVersion": "1.2.0",
            "name": "mybun",
            "version": "0.1.0",
            "invocationImages": [{"imageType": "docker", "image": "localhost:5000/mybun:porter-abc"}],
            "images": {"app": {"imageType": "docker", "image": "ghcr.io/getporter/app:v1"}},
            "actions": {
                "status": {"modifies": false, "stateless": true},
                "logs": {"modifies": false}
            },
            "parameters": {
                "password": {"definition": "password-parameter"},
                "region": {"definition": "region-parameter"},
                "replicas": {"definition": "replicas-parameter"},
                "porter-state": {"definition": "porter-state"}
            },
            "outputs": {
                "token": {"definition": "token-output"},
                "endpoint": {"definition": "endpoint-output"}
            },
            "definitions": {
                "password-parameter": {"type": "string", "writeOnly": true},
                "region-parameter": {"type": "string", "default": "us"},
                "replicas-parameter": {"type": "integer", "default": 1},
                "porter-state": {"type": "string", "$comment": "porter-internal"},
                "token-output": {"type": "string", "writeOnly": true},
                "endpoint-output": {"type": "string"}
            }
        });
        serde_json::from_value(raw).expect("sample bundle")
    }

    #[test]
    fn sensitivity() {
        let b = sample_bundle();
        assert!(b.is_sensitive_parameter("password"));
        assert!(!b.is_sensitive_parameter("region"));
        assert!(!b.is_sensitive_parameter("missing"));
        assert!(b.is_output_sensitive("token"));
        assert!(!b.is_output_sensitive("endpoint"));
        assert!(b.is_internal_parameter("porter-state"));
    }

    #[test]
    fn should_record() {
        let b = sample_bundle();
        assert!(b.should_record("install"));
        assert!(b.should_record("logs"));
        assert!(!b.should_record("status"));
    }

    #[test]
    fn parameter_conversion() {
        let b = sample_bundle();
        assert_eq!(
            b.convert_parameter_value("replicas", "3").expect("int"),
            json!(3)
        );
        assert!(b.convert_parameter_value("replicas", "three").is_err());
        assert_eq!(
            b.write_parameter_to_string("replicas", &json!(3)).expect("str"),
            "3"
        );
        assert_eq!(
            b.write_parameter_to_string("region", &json!("eu")).expect("str"),
            "eu"
        );
    }

    #[test]
    fn referenced_registries() {
        let b = sample_bundle();
        assert_eq!(
            b.get_referenced_registries().expect("registries"),
            vec!["ghcr.io".to_string(), "localhost:5000".to_string()]
        );
    }

    #[test]
    fn validate_rejects_dangling_definition() {
        let mut b = sample_bundle();
        b.bundle.parameters.insert(
            "ghost".into(),
            ParameterDefinition {
                definition: "nope".into(),
                ..ParameterDefinition::default()
            },
        );
        assert!(matches!(b.validate(), Err(PorterError::Validation(_))));
    }

    #[test]
    fn embedded_manifest_decodes() {
        let mut b = sample_bundle();
        b.bundle.custom.insert(
            PORTER_CUSTOM_KEY.into(),
            json!({"manifestDigest": "abc", "manifest": BASE64.encode("name: mybun\n")}),
        );
        assert_eq!(
            b.embedded_manifest().expect("decode"),
            Some(b"name: mybun\n".to_vec())
        );
    }
}
