//! # Manifest
//!
//! The `porter.yaml` authoring format and its validation rules.
//!
//! A manifest is parsed leniently: deprecated keys are dropped with a
//! warning and any top-level key that is not part of the model is read as a
//! custom action holding a list of steps.
//!
//! ```text
//! porter.yaml ──parse──▶ Manifest ──set_defaults──▶ reference + installer image
//!                              │
//!                              └──convert──▶ ExtendedBundle (bundle.json)
//! ```
//!
//! Steps are opaque to this module beyond their shape: each is a single-key
//! map from mixin name to an instruction body the mixin interprets.

pub mod convert;
pub mod resolver;

use crate::bundle::{ActionDefinition, Maintainer, Schema, SharingCriteria};
use crate::primitives::{
    ACTION_INSTALL, ACTION_UNINSTALL, ACTION_UPGRADE, MANIFEST_SCHEMA_VERSION,
    RESERVED_PARAMETER_PREFIX, SUPPORTED_MANIFEST_SCHEMA_VERSIONS,
};
use crate::reference::{OCIReference, VersionRanges, parse_semver};
use crate::types::{PorterError, Result};
use md5::{Digest, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

pub use convert::ManifestConverter;
pub use resolver::{RuntimeContext, StepResolver};

/// Directory the bundle's files live in inside the invocation image.
pub const BUNDLE_DIR: &str = "/cnab/app";

/// Default manifest file name.
pub const MANIFEST_FILE: &str = "porter.yaml";

/// Directory outputs are collected from inside the invocation image.
pub const BUNDLE_OUTPUTS_DIR: &str = "/cnab/app/outputs";

/// Keys older manifests carried that are now computed.
const DEPRECATED_KEYS: [&str; 2] = ["invocationImage", "tag"];

// =============================================================================
// NAMED DECLARATIONS
// =============================================================================

/// A name with optional configuration.
///
/// Written either as a bare string (`- exec`) or as a single-key map
/// (`- helm3: {clientVersion: v3.8.0}`). Used for mixins and required
/// extensions.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Declaration {
    pub name: String,
    pub config: Option<JsonValue>,
}

pub type MixinDeclaration = Declaration;
pub type ExtensionDeclaration = Declaration;

impl Declaration {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
        }
    }
}

impl Serialize for Declaration {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match &self.config {
            None => s.serialize_str(&self.name),
            Some(config) => {
                let mut map = BTreeMap::new();
                map.insert(self.name.as_str(), config);
                map.serialize(s)
            }
        }
    }
}

impl<'de> Deserialize<'de> for Declaration {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error;
        match JsonValue::deserialize(d)? {
            JsonValue::String(name) => Ok(Self::named(name)),
            JsonValue::Object(map) => {
                if map.len() != 1 {
                    return Err(D::Error::custom(format!(
                        "a declaration must have exactly one name, found {}",
                        map.len()
                    )));
                }
                let Some((name, config)) = map.into_iter().next() else {
                    return Err(D::Error::custom("empty declaration"));
                };
                let config = (!config.is_null()).then_some(config);
                Ok(Self { name, config })
            }
            other => Err(D::Error::custom(format!(
                "a declaration must be a string or a map, found {other}"
            ))),
        }
    }
}

// =============================================================================
// PARAMETERS, CREDENTIALS, OUTPUTS
// =============================================================================

/// Wires a parameter to an output of this bundle or of a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ParameterSourceDeclaration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dependency: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDeclaration {
    pub name: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ParameterSourceDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
    #[serde(flatten)]
    pub schema: Schema,
}

impl ParameterDeclaration {
    fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();
        if self.name.is_empty() {
            errs.push("parameter name is required".to_string());
        }
        if self.name.starts_with(RESERVED_PARAMETER_PREFIX) {
            errs.push(format!(
                "parameter {} uses the reserved prefix {RESERVED_PARAMETER_PREFIX}",
                self.name
            ));
        }
        if self.schema.schema_type.as_deref() == Some("file") && self.path.is_empty() {
            errs.push(format!("no destination path supplied for parameter {}", self.name));
        }
        if let Some(source) = &self.source
            && source.output.is_empty()
        {
            errs.push(format!("parameter {} has a source without an output", self.name));
        }
        errs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OutputDeclaration {
    pub name: String,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apply_to: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(flatten)]
    pub schema: Schema,
}

impl OutputDeclaration {
    fn validate(&self) -> Vec<String> {
        if self.name.is_empty() {
            return vec!["output name is required".to_string()];
        }
        if self.schema.schema_type.as_deref() == Some("file") && self.path.is_empty() {
            return vec![format!("no path supplied for output {}", self.name)];
        }
        Vec::new()
    }
}

// =============================================================================
// IMAGES & DEPENDENCIES
// =============================================================================

/// An image the bundle uses, referenced from steps as `bundle.images.<alias>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MappedImage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image_type: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl MappedImage {
    /// The full image reference: digest wins over tag, `latest` by default.
    pub fn image_reference(&self) -> String {
        if !self.digest.is_empty() {
            format!("{}@{}", self.repository, self.digest)
        } else if !self.tag.is_empty() {
            format!("{}:{}", self.repository, self.tag)
        } else {
            format!("{}:latest", self.repository)
        }
    }

    fn validate(&self, alias: &str) -> Vec<String> {
        if self.repository.is_empty() {
            return vec![format!("image {alias} must declare a repository")];
        }
        match OCIReference::parse(&self.image_reference()) {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("image {alias}: {e}")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BundleCriteria {
    pub reference: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DependencyDeclaration {
    pub name: String,
    pub bundle: BundleCriteria,
    /// Dependency parameter to a literal or a wiring string.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub credentials: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<SharingCriteria>,
}

impl DependencyDeclaration {
    fn validate(&self) -> Option<String> {
        if self.name.is_empty() {
            return Some("dependency name is required".to_string());
        }
        if self.bundle.reference.is_empty() {
            return Some(format!("reference is required for dependency {:?}", self.name));
        }
        if self.bundle.reference.contains(':') && !self.bundle.version.is_empty() {
            return Some(format!(
                "reference for dependency {:?} can only specify REGISTRY/NAME when version ranges are specified",
                self.name
            ));
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Dependencies {
    #[serde(default)]
    pub requires: Vec<DependencyDeclaration>,
}

// =============================================================================
// STEPS
// =============================================================================

/// A declarative output a mixin step produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepOutput {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path: Option<String>,
}

/// One step: `{ <mixin>: <instruction body> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Step(pub BTreeMap<String, YamlValue>);

impl Step {
    /// The mixin that runs the step.
    pub fn mixin_name(&self) -> Result<&str> {
        let mut keys = self.0.keys();
        match (keys.next(), keys.next()) {
            (Some(name), None) => Ok(name),
            (None, _) => Err(PorterError::Validation("no mixin specified".into())),
            (Some(_), Some(_)) => Err(PorterError::Validation("more than one mixin specified".into())),
        }
    }

    fn body(&self) -> Option<&YamlValue> {
        self.0.values().next()
    }

    pub fn description(&self) -> Result<Option<String>> {
        match self.body().and_then(|b| b.get("description")) {
            None => Ok(None),
            Some(YamlValue::String(d)) => Ok(Some(d.clone())),
            Some(_) => Err(PorterError::Validation("invalid description type".into())),
        }
    }

    /// Outputs declared on the instruction body.
    pub fn outputs(&self) -> Result<Vec<StepOutput>> {
        match self.body().and_then(|b| b.get("outputs")) {
            None | Some(YamlValue::Null) => Ok(Vec::new()),
            Some(raw) => serde_yaml::from_value(raw.clone()).map_err(|e| {
                PorterError::Validation(format!("invalid outputs on step: {e}"))
            }),
        }
    }

    /// The step as the YAML document handed to the mixin on stdin.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.0)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map(Self)
            .map_err(|e| PorterError::Template(format!("rendered step is not valid YAML: {e}")))
    }

    fn validate(&self, manifest: &Manifest) -> Result<()> {
        let mixin = self.mixin_name()?;
        if !manifest.mixins.iter().any(|m| m.name == mixin) {
            return Err(PorterError::Validation(format!(
                "mixin ({mixin}) was not declared"
            )));
        }
        self.description()?;
        self.outputs()?;
        Ok(())
    }
}

pub type Steps = Vec<Step>;

// =============================================================================
// MANIFEST
// =============================================================================

/// The parsed `porter.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Maintainer>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    /// Installer image, computed by `set_defaults`.
    #[serde(skip)]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dockerfile: String,
    #[serde(default)]
    pub mixins: Vec<MixinDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Steps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<Steps>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<Steps>,
    /// Metadata for custom actions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_actions: BTreeMap<String, ActionDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub credentials: Vec<CredentialDeclaration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputDeclaration>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub images: BTreeMap<String, MappedImage>,
    #[serde(default)]
    pub dependencies: Dependencies,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<ExtensionDeclaration>,
    /// Steps of every custom action, keyed by action name.
    #[serde(flatten)]
    pub actions: BTreeMap<String, Steps>,
}

impl Manifest {
    /// Parse manifest text, dropping deprecated keys.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        let raw: YamlValue = serde_yaml::from_slice(data)
            .map_err(|e| PorterError::Validation(format!("unable to parse manifest: {e}")))?;
        let YamlValue::Mapping(mut map) = raw else {
            return Err(PorterError::Validation("the manifest must be a YAML map".into()));
        };
        for key in DEPRECATED_KEYS {
            if map.remove(key).is_some() {
                warn!(key, "ignoring deprecated manifest field");
            }
        }
        serde_yaml::from_value(YamlValue::Mapping(map))
            .map_err(|e| PorterError::Validation(format!("unable to load manifest: {e}")))
    }

    /// Read and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            PorterError::Io(format!(
                "the specified porter configuration file {} could not be read: {e}",
                path.display()
            ))
        })?;
        Self::from_yaml(&data).map_err(|e| e.context(path.display()))
    }

    /// Hex md5 of the serialized manifest, used to stamp the bundle.
    pub fn digest(&self) -> Result<String> {
        let text = serde_yaml::to_string(self)?;
        Ok(hex::encode(Md5::digest(text.as_bytes())))
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    /// Steps of `action`, built-in or custom.
    pub fn steps_for(&self, action: &str) -> Result<&Steps> {
        let steps = match action {
            ACTION_INSTALL => self.install.as_ref(),
            ACTION_UPGRADE => self.upgrade.as_ref(),
            ACTION_UNINSTALL => self.uninstall.as_ref(),
            custom => self.actions.get(custom),
        };
        steps.ok_or_else(|| {
            let defined: Vec<&str> = self.actions.keys().map(String::as_str).collect();
            PorterError::Validation(format!(
                "unsupported action {action:?}, custom actions are defined for: {}",
                defined.join(", ")
            ))
        })
    }

    /// Names of every custom action with steps.
    pub fn custom_action_names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn parameter(&self, name: &str) -> Option<&ParameterDeclaration> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputDeclaration> {
        self.outputs.iter().find(|o| o.name == name)
    }

    pub fn dependency(&self, name: &str) -> Option<&DependencyDeclaration> {
        self.dependencies.requires.iter().find(|d| d.name == name)
    }

    // -------------------------------------------------------------------------
    // Validation
    // -------------------------------------------------------------------------

    /// Check the manifest and compute its defaults.
    ///
    /// Every problem found is reported together in one `Validation` error.
    pub fn validate(&mut self) -> Result<()> {
        self.validate_metadata()?;
        self.set_defaults()?;

        if self.dockerfile.eq_ignore_ascii_case("dockerfile") {
            return Err(PorterError::Validation(
                "Dockerfile template cannot be named 'Dockerfile' because that is the filename generated during porter build".into(),
            ));
        }

        let mut errs = Vec::new();
        if self.mixins.is_empty() {
            errs.push("no mixins declared".to_string());
        }
        for (action, steps) in [
            (ACTION_INSTALL, &self.install),
            (ACTION_UNINSTALL, &self.uninstall),
        ] {
            if steps.is_none() {
                errs.push(format!("no {action} action defined"));
            }
        }
        let all_steps = [
            (ACTION_INSTALL, self.install.as_ref()),
            (ACTION_UPGRADE, self.upgrade.as_ref()),
            (ACTION_UNINSTALL, self.uninstall.as_ref()),
        ]
        .into_iter()
        .chain(self.actions.iter().map(|(a, s)| (a.as_str(), Some(s))));
        for (action, steps) in all_steps {
            for step in steps.into_iter().flatten() {
                if let Err(e) = step.validate(self) {
                    errs.push(format!("validation of action \"{action}\" failed: {e}"));
                }
            }
        }
        errs.extend(self.dependencies.requires.iter().filter_map(DependencyDeclaration::validate));
        errs.extend(self.outputs.iter().flat_map(OutputDeclaration::validate));
        errs.extend(self.parameters.iter().flat_map(ParameterDeclaration::validate));
        for (alias, image) in &self.images {
            errs.extend(image.validate(alias));
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(PorterError::Validation(errs.join("; ")))
        }
    }

    fn validate_metadata(&self) -> Result<()> {
        if self.schema_version.is_empty() {
            warn!(
                default = MANIFEST_SCHEMA_VERSION,
                "the manifest does not declare a schemaVersion"
            );
        } else {
            let supported = VersionRanges::parse(SUPPORTED_MANIFEST_SCHEMA_VERSIONS)?;
            let ok = parse_semver(&self.schema_version)
                .is_some_and(|v| supported.matches(&v, supported.mentions_prerelease()));
            if !ok {
                return Err(PorterError::Validation(format!(
                    "the schema version is {} but the supported schema version is {SUPPORTED_MANIFEST_SCHEMA_VERSIONS}",
                    self.schema_version
                )));
            }
        }
        if self.name.is_empty() {
            return Err(PorterError::Validation("bundle name must be set".into()));
        }
        if self.registry.is_empty() && self.reference.is_empty() {
            return Err(PorterError::Validation(
                "a registry or reference value must be provided".into(),
            ));
        }
        if !self.reference.is_empty() && !self.registry.is_empty() {
            warn!(
                reference = %self.reference,
                "both registry and reference were provided; using the reference"
            );
        }
        if parse_semver(&self.version).is_none() {
            return Err(PorterError::Validation(format!(
                "version {:?} is not a valid semantic version",
                self.version
            )));
        }
        Ok(())
    }

    /// Compute the bundle reference and installer image.
    ///
    /// Without a reference the registry and name are joined. A reference
    /// without a tag gets `v<version>` (with `+` replaced by `_`); a
    /// digest-only reference is rejected.
    pub fn set_defaults(&mut self) -> Result<()> {
        if self.reference.is_empty() && !self.registry.is_empty() {
            let joined = format!("{}/{}", self.registry.trim_end_matches('/'), self.name);
            self.reference = OCIReference::parse(&joined)?.repository();
        }
        let mut reference = OCIReference::parse(&self.reference)?;
        if !reference.has_tag() {
            if reference.has_digest() {
                return Err(PorterError::Validation(format!(
                    "invalid bundle reference {}: the tag must be an OCI image tag",
                    self.reference
                )));
            }
            reference = reference.with_tag(&format!("v{}", self.version.replace('+', "_")))?;
            self.reference = reference.to_string();
        }
        let fingerprint = hex::encode(Md5::digest(reference.to_string().as_bytes()));
        self.image = reference
            .repository_only()
            .with_tag(&format!("porter-{fingerprint}"))?
            .to_string();
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// The environment variable a parameter is exposed as by default.
pub fn param_to_env_var(name: &str) -> String {
    name.to_uppercase().replace(['-', '.'], "_")
}

/// Resolve a manifest path against the bundle directory.
pub fn resolve_path(value: &str) -> String {
    if value.is_empty() || value.starts_with('/') {
        value.to_string()
    } else {
        format!("{BUNDLE_DIR}/{}", value.trim_start_matches("./"))
    }
}

/// Name of the internal parameter that feeds an output back into the bundle.
pub fn parameter_source_for_output(output: &str) -> String {
    format!("{RESERVED_PARAMETER_PREFIX}{output}-output")
}

/// Name of the internal parameter that feeds a dependency output into the bundle.
pub fn parameter_source_for_dependency(dependency: &str, output: &str) -> String {
    format!("{RESERVED_PARAMETER_PREFIX}{dependency}-{output}-dep-output")
}
