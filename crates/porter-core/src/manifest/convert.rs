//! Manifest to bundle descriptor conversion.
//!
//! Produces the `bundle.json` a built bundle carries: one definition per
//! parameter and output, Porter's internal parameters, the dependency and
//! parameter-source extensions, and the `sh.porter` stamp.

use super::{
    BUNDLE_OUTPUTS_DIR, Manifest, OutputDeclaration, ParameterDeclaration, param_to_env_var,
    parameter_source_for_dependency, parameter_source_for_output, resolve_path,
};
use crate::bundle::extensions::{
    DEPENDENCIES_V1_KEY, DEPENDENCIES_V2_KEY, FILE_PARAMETERS_KEY, PARAMETER_SOURCES_KEY,
    get_supported_extension,
};
use crate::bundle::{
    ActionDefinition, Bundle, CredentialDefinition, DependenciesV1, DependenciesV2,
    DependencyV1, DependencyV2, DependencyVersion, ExtendedBundle, Image, Location,
    OutputDefinition, ParameterDefinition, ParameterSource, ParameterSourceDefinition,
    ParameterSources, PorterStamp, Schema, parse_dependency_source,
};
use crate::primitives::{BUNDLE_SCHEMA_VERSION, PORTER_CUSTOM_KEY, PORTER_INTERNAL};
use crate::reference::{cached_regex, parse_semver};
use crate::types::{PorterError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde_json::{Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use tracing::debug;

const GENERATED_ID_PREFIX: &str = "https://getporter.org/generated-bundle/#";

/// Whether a definition backs user data or Porter's persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefinitionKind {
    Parameter,
    Output,
    State,
}

impl DefinitionKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Parameter => "parameter",
            Self::Output => "output",
            Self::State => "state",
        }
    }
}

/// Builds an `ExtendedBundle` from a validated manifest.
#[derive(Debug)]
pub struct ManifestConverter<'a> {
    manifest: &'a Manifest,
    dependencies_v2: bool,
    raw_manifest: Option<&'a [u8]>,
}

impl<'a> ManifestConverter<'a> {
    pub fn new(manifest: &'a Manifest) -> Self {
        Self {
            manifest,
            dependencies_v2: false,
            raw_manifest: None,
        }
    }

    /// Emit the v2 dependency extension instead of v1.
    #[must_use]
    pub fn with_dependencies_v2(mut self, enabled: bool) -> Self {
        self.dependencies_v2 = enabled;
        self
    }

    /// Embed these bytes as the source manifest instead of re-serializing.
    #[must_use]
    pub fn with_raw_manifest(mut self, raw: &'a [u8]) -> Self {
        self.raw_manifest = Some(raw);
        self
    }

    pub fn to_bundle(&self) -> Result<ExtendedBundle> {
        let m = self.manifest;
        if m.image.is_empty() {
            return Err(PorterError::Validation(
                "the manifest defaults have not been set; validate the manifest first".into(),
            ));
        }

        let mut definitions = BTreeMap::new();
        let parameters = self.generate_parameters(&mut definitions);
        let outputs = self.generate_outputs(&mut definitions);

        let mut bundle = ExtendedBundle::new(Bundle {
            schema_version: BUNDLE_SCHEMA_VERSION.to_string(),
            name: m.name.clone(),
            version: m.version.clone(),
            description: m.description.clone(),
            maintainers: m.maintainers.clone(),
            invocation_images: vec![Image {
                image_type: "docker".into(),
                image: m.image.clone(),
                ..Image::default()
            }],
            images: self.generate_images(),
            actions: self.generate_actions(),
            parameters,
            credentials: self.generate_credentials(),
            outputs,
            definitions,
            ..Bundle::default()
        });

        let custom = self.generate_custom_extensions(&mut bundle)?;
        bundle.bundle.custom = custom;
        bundle.bundle.required_extensions = self.generate_required_extensions(&bundle);
        debug!(bundle = %m.name, "converted manifest to bundle");
        Ok(bundle)
    }

    // -------------------------------------------------------------------------
    // Actions
    // -------------------------------------------------------------------------

    fn generate_actions(&self) -> BTreeMap<String, ActionDefinition> {
        let m = self.manifest;
        m.actions
            .keys()
            .chain(m.custom_actions.keys())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|name| {
                let def = m
                    .custom_actions
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| default_action(name));
                (name.clone(), def)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Parameters & outputs
    // -------------------------------------------------------------------------

    fn generate_parameters(
        &self,
        defs: &mut BTreeMap<String, Schema>,
    ) -> BTreeMap<String, ParameterDefinition> {
        let declared = self
            .manifest
            .parameters
            .iter()
            .cloned()
            .map(|p| (p, DefinitionKind::Parameter));
        let mut params = BTreeMap::new();
        for (decl, kind) in declared.chain(default_porter_parameters()) {
            let destination = if decl.env.is_empty() && decl.path.is_empty() {
                Location {
                    env: param_to_env_var(&decl.name),
                    path: String::new(),
                }
            } else {
                Location {
                    env: decl.env.clone(),
                    path: resolve_path(&decl.path),
                }
            };
            let mut schema = decl.schema.clone();
            if decl.sensitive {
                schema.write_only = Some(true);
            }
            if schema.schema_type.is_none() {
                let t = if decl.path.is_empty() { "string" } else { "file" };
                schema.schema_type = Some(t.to_string());
            }
            let definition = add_definition(&decl.name, kind, schema, defs);
            params.insert(
                decl.name.clone(),
                ParameterDefinition {
                    definition,
                    description: decl.schema.description.clone(),
                    destination: Some(destination),
                    apply_to: decl.apply_to.clone(),
                    required: decl.schema.default.is_none() && kind != DefinitionKind::State,
                },
            );
        }
        params
    }

    fn generate_outputs(
        &self,
        defs: &mut BTreeMap<String, Schema>,
    ) -> BTreeMap<String, OutputDefinition> {
        let declared = self
            .manifest
            .outputs
            .iter()
            .cloned()
            .map(|o| (o, DefinitionKind::Output));
        let mut outputs = BTreeMap::new();
        for (decl, kind) in declared.chain(default_porter_outputs()) {
            let mut schema = decl.schema.clone();
            if decl.sensitive {
                schema.write_only = Some(true);
            }
            if schema.schema_type.is_none() {
                let t = if decl.path.is_empty() { "string" } else { "file" };
                schema.schema_type = Some(t.to_string());
            }
            let definition = add_definition(&decl.name, kind, schema, defs);
            outputs.insert(
                decl.name.clone(),
                OutputDefinition {
                    definition,
                    description: decl.schema.description.clone(),
                    apply_to: decl.apply_to.clone(),
                    path: format!("{BUNDLE_OUTPUTS_DIR}/{}", decl.name),
                },
            );
        }
        outputs
    }

    fn generate_credentials(&self) -> BTreeMap<String, CredentialDefinition> {
        self.manifest
            .credentials
            .iter()
            .map(|c| {
                let def = CredentialDefinition {
                    location: Location {
                        env: c.env.clone(),
                        path: resolve_path(&c.path),
                    },
                    description: c.description.clone(),
                    required: c.required,
                    apply_to: c.apply_to.clone(),
                };
                (c.name.clone(), def)
            })
            .collect()
    }

    fn generate_images(&self) -> BTreeMap<String, Image> {
        self.manifest
            .images
            .iter()
            .map(|(alias, img)| {
                let image = Image {
                    image_type: if img.image_type.is_empty() {
                        "docker".into()
                    } else {
                        img.image_type.clone()
                    },
                    image: img.image_reference(),
                    digest: (!img.digest.is_empty()).then(|| img.digest.clone()),
                    description: (!img.description.is_empty()).then(|| img.description.clone()),
                    media_type: (!img.media_type.is_empty()).then(|| img.media_type.clone()),
                    labels: img.labels.clone(),
                };
                (alias.clone(), image)
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Extensions
    // -------------------------------------------------------------------------

    fn generate_dependencies(&self) -> Result<Option<(&'static str, JsonValue)>> {
        let requires = &self.manifest.dependencies.requires;
        if requires.is_empty() {
            return Ok(None);
        }
        if self.dependencies_v2 {
            let mut deps = DependenciesV2::default();
            for d in requires {
                let mut dep = DependencyV2 {
                    name: d.name.clone(),
                    bundle: d.bundle.reference.clone(),
                    version: (!d.bundle.version.is_empty()).then(|| d.bundle.version.clone()),
                    sharing: d.sharing.clone(),
                    ..DependencyV2::default()
                };
                for (name, wiring) in &d.parameters {
                    dep.parameters.insert(name.clone(), parse_dependency_source(wiring)?);
                }
                for (name, wiring) in &d.credentials {
                    dep.credentials.insert(name.clone(), parse_dependency_source(wiring)?);
                }
                deps.requires.insert(d.name.clone(), dep);
            }
            return Ok(Some((DEPENDENCIES_V2_KEY, serde_json::to_value(deps)?)));
        }

        let mut deps = DependenciesV1::default();
        for d in requires {
            let version = (!d.bundle.version.is_empty()).then(|| DependencyVersion {
                ranges: vec![d.bundle.version.clone()],
                prereleases: parse_semver(&d.bundle.version).is_some_and(|v| !v.pre.is_empty()),
            });
            deps.sequence.push(d.name.clone());
            deps.requires.insert(
                d.name.clone(),
                DependencyV1 {
                    name: d.name.clone(),
                    bundle: d.bundle.reference.clone(),
                    version,
                },
            );
        }
        Ok(Some((DEPENDENCIES_V1_KEY, serde_json::to_value(deps)?)))
    }

    /// Parameter sources come from explicit `source` declarations, the
    /// state parameter, and outputs referenced by step templates.
    fn generate_parameter_sources(&self, b: &mut ExtendedBundle) -> Result<ParameterSources> {
        let m = self.manifest;
        let mut ps = ParameterSources::new();

        for p in &m.parameters {
            let Some(source) = p.source.as_ref().filter(|s| !s.output.is_empty()) else {
                continue;
            };
            let def = if source.dependency.is_empty() {
                ParameterSourceDefinition::Output {
                    name: source.output.clone(),
                }
            } else {
                ParameterSourceDefinition::DependencyOutput {
                    dependency: source.dependency.clone(),
                    name: source.output.clone(),
                }
            };
            ps.insert(p.name.clone(), single_source(def));
        }

        ps.insert(
            "porter-state".into(),
            single_source(ParameterSourceDefinition::Output {
                name: "porter-state".into(),
            }),
        );

        for output in m.templated_outputs()? {
            let wiring = parameter_source_for_output(&output);
            let mut def = b
                .outputs
                .get(&output)
                .and_then(|o| b.definitions.get(&o.definition))
                .cloned()
                .unwrap_or_default();
            mark_internal(&mut def, "porter-parameter-source-definition");
            let desc = format!(
                "Wires up the {output} output for use as a parameter. Porter internal parameter that should not be set manually."
            );
            b.bundle.parameters.insert(wiring.clone(), wiring_parameter(&wiring, desc));
            b.bundle.definitions.insert(wiring.clone(), def);
            ps.insert(wiring, single_source(ParameterSourceDefinition::Output { name: output }));
        }

        for (dependency, output) in m.templated_dependency_outputs()? {
            let wiring = parameter_source_for_dependency(&dependency, &output);
            let mut def = Schema::default();
            mark_internal(&mut def, "porter-parameter-source-definition");
            let desc = format!(
                "Wires up the {dependency} dependency {output} output for use as a parameter. Porter internal parameter that should not be set manually."
            );
            b.bundle.parameters.insert(wiring.clone(), wiring_parameter(&wiring, desc));
            b.bundle.definitions.insert(wiring.clone(), def);
            ps.insert(
                wiring,
                single_source(ParameterSourceDefinition::DependencyOutput {
                    dependency,
                    name: output,
                }),
            );
        }
        Ok(ps)
    }

    fn generate_custom_extensions(
        &self,
        b: &mut ExtendedBundle,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let m = self.manifest;
        let mut custom = BTreeMap::new();
        custom.insert(FILE_PARAMETERS_KEY.to_string(), json!({}));
        for (key, value) in &m.custom {
            custom.insert(key.clone(), value.clone());
        }
        if let Some((key, deps)) = self.generate_dependencies()? {
            custom.insert(key.to_string(), deps);
        }
        let ps = self.generate_parameter_sources(b)?;
        if !ps.is_empty() {
            custom.insert(PARAMETER_SOURCES_KEY.to_string(), serde_json::to_value(ps)?);
        }
        for ext in &m.required {
            custom.insert(
                lookup_extension_key(&ext.name),
                ext.config.clone().unwrap_or_else(|| json!({})),
            );
        }

        let raw = match self.raw_manifest {
            Some(raw) => raw.to_vec(),
            None => serde_yaml::to_string(m)?.into_bytes(),
        };
        let stamp = PorterStamp {
            manifest_digest: m.digest()?,
            manifest: Some(BASE64.encode(raw)),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        custom.insert(PORTER_CUSTOM_KEY.to_string(), serde_json::to_value(stamp)?);
        Ok(custom)
    }

    fn generate_required_extensions(&self, b: &ExtendedBundle) -> Vec<String> {
        let mut required = vec![FILE_PARAMETERS_KEY.to_string()];
        for key in [DEPENDENCIES_V1_KEY, DEPENDENCIES_V2_KEY, PARAMETER_SOURCES_KEY] {
            if b.custom.contains_key(key) {
                required.push(key.to_string());
            }
        }
        for ext in &self.manifest.required {
            let key = lookup_extension_key(&ext.name);
            if !required.contains(&key) {
                required.push(key);
            }
        }
        required
    }
}

// =============================================================================
// TEMPLATE SCANNING
// =============================================================================

fn output_template_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(&RE, r"\$\{\s*bundle\.outputs\.([A-Za-z0-9_-]+)\s*\}")
}

fn dependency_output_template_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(
        &RE,
        r"\$\{\s*bundle\.dependencies\.([A-Za-z0-9_-]+)\.outputs\.([A-Za-z0-9_-]+)\s*\}",
    )
}

impl Manifest {
    fn all_steps_text(&self) -> Result<String> {
        let mut text = String::new();
        let builtin = [&self.install, &self.upgrade, &self.uninstall];
        let steps = builtin
            .into_iter()
            .flatten()
            .chain(self.actions.values())
            .flatten();
        for step in steps {
            text.push_str(&step.to_yaml()?);
        }
        Ok(text)
    }

    /// Declared outputs that a step reads back through `${ bundle.outputs.X }`.
    pub fn templated_outputs(&self) -> Result<Vec<String>> {
        let text = self.all_steps_text()?;
        let found: BTreeSet<String> = output_template_regex()?
            .captures_iter(&text)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| self.output(name).is_some())
            .collect();
        Ok(found.into_iter().collect())
    }

    /// `(dependency, output)` pairs referenced by step templates.
    pub fn templated_dependency_outputs(&self) -> Result<Vec<(String, String)>> {
        let text = self.all_steps_text()?;
        let found: BTreeSet<(String, String)> = dependency_output_template_regex()?
            .captures_iter(&text)
            .filter_map(|c| Some((c.get(1)?.as_str().to_string(), c.get(2)?.as_str().to_string())))
            .collect();
        Ok(found.into_iter().collect())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Metadata for a custom action the manifest does not describe.
fn default_action(action: &str) -> ActionDefinition {
    let (description, modifies, stateless) = match action {
        "dry-run" | "io.cnab.dry-run" => (
            "Execute the installation in a dry-run mode, allowing to see what would happen with the given set of parameter values",
            false,
            true,
        ),
        "help" | "io.cnab.help" => ("Print a help message to the standard output", false, true),
        "log" | "io.cnab.log" => (
            "Print logs of the installed system to the standard output",
            false,
            false,
        ),
        "status" | "io.cnab.status" => (
            "Print a human readable status message to the standard output",
            false,
            false,
        ),
        "status+json" | "io.cnab.status+json" => (
            "Print a json payload describing the detailed status with the following the CNAB status schema",
            false,
            false,
        ),
        other => (other, true, false),
    };
    ActionDefinition {
        modifies,
        stateless,
        description: Some(description.to_string()),
    }
}

/// Register a definition for `name` and return the definition key.
///
/// `file` is Porter's own type; the descriptor gets a base64 string.
fn add_definition(
    name: &str,
    kind: DefinitionKind,
    mut schema: Schema,
    defs: &mut BTreeMap<String, Schema>,
) -> String {
    let suffix = kind.suffix();
    let def_name = if name.ends_with(suffix) {
        name.to_string()
    } else {
        format!("{name}-{suffix}")
    };
    if schema.schema_type.as_deref() == Some("file") {
        schema.schema_type = Some("string".into());
        schema.content_encoding = Some("base64".into());
    }
    defs.entry(def_name.clone()).or_insert(schema);
    def_name
}

fn mark_internal(schema: &mut Schema, id: &str) {
    schema
        .extra
        .insert("$id".into(), JsonValue::String(format!("{GENERATED_ID_PREFIX}{id}")));
    schema.comment = Some(PORTER_INTERNAL.into());
}

fn single_source(def: ParameterSourceDefinition) -> ParameterSource {
    let mut source = ParameterSource::default();
    source.add(def);
    source
}

fn wiring_parameter(wiring: &str, description: String) -> ParameterDefinition {
    ParameterDefinition {
        definition: wiring.to_string(),
        description: Some(description),
        destination: Some(Location {
            env: param_to_env_var(wiring),
            path: String::new(),
        }),
        apply_to: Vec::new(),
        required: false,
    }
}

fn lookup_extension_key(name: &str) -> String {
    get_supported_extension(name)
        .map(|e| e.key.to_string())
        .unwrap_or_else(|_| name.to_string())
}

const STATE_DESCRIPTION: &str =
    "Supports persisting state for bundles. Porter internal parameter that should not be set manually.";

fn state_schema() -> Schema {
    let mut schema = Schema {
        schema_type: Some("string".into()),
        content_encoding: Some("base64".into()),
        description: Some(STATE_DESCRIPTION.into()),
        ..Schema::default()
    };
    mark_internal(&mut schema, "porter-state");
    schema
}

fn default_porter_parameters() -> [(ParameterDeclaration, DefinitionKind); 2] {
    let mut debug_schema = Schema {
        schema_type: Some("boolean".into()),
        default: Some(JsonValue::Bool(false)),
        description: Some("Print debug information from Porter when executing the bundle".into()),
        ..Schema::default()
    };
    mark_internal(&mut debug_schema, "porter-debug");
    [
        (
            ParameterDeclaration {
                name: "porter-debug".into(),
                env: "PORTER_DEBUG".into(),
                schema: debug_schema,
                ..ParameterDeclaration::default()
            },
            DefinitionKind::Parameter,
        ),
        (
            ParameterDeclaration {
                name: "porter-state".into(),
                path: "/porter/state.tgz".into(),
                schema: state_schema(),
                ..ParameterDeclaration::default()
            },
            DefinitionKind::State,
        ),
    ]
}

fn default_porter_outputs() -> [(OutputDeclaration, DefinitionKind); 1] {
    [(
        OutputDeclaration {
            name: "porter-state".into(),
            path: "/cnab/app/outputs/porter-state.tgz".into(),
            schema: state_schema(),
            ..OutputDeclaration::default()
        },
        DefinitionKind::State,
    )]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::DeclaredDependencies;
    use crate::manifest::tests::sample_manifest;

    fn converted(v2: bool) -> ExtendedBundle {
        let mut m = sample_manifest();
        m.validate().expect("valid");
        ManifestConverter::new(&m)
            .with_dependencies_v2(v2)
            .to_bundle()
            .expect("convert")
    }

    #[test]
    fn requires_defaults() {
        let m = sample_manifest();
        assert!(ManifestConverter::new(&m).to_bundle().is_err());
    }

    #[test]
    fn converted_bundle_is_valid() {
        let b = converted(false);
        b.validate().expect("valid bundle");
        assert_eq!(b.schema_version, BUNDLE_SCHEMA_VERSION);
        assert_eq!(b.invocation_images.len(), 1);
        assert!(b.invocation_images[0].image.contains(":porter-"));
        assert_eq!(b.images["app"].image, "ghcr.io/getporter/app:v1");
    }

    #[test]
    fn definitions_follow_declarations() {
        let b = converted(false);
        assert_eq!(b.parameters["password"].definition, "password-parameter");
        assert!(b.is_sensitive_parameter("password"));
        assert!(b.parameters["password"].required);
        assert!(!b.parameters["region"].required);
        assert_eq!(
            b.parameters["region"].destination.as_ref().map(|d| d.env.as_str()),
            Some("REGION")
        );

        let tls = &b.definitions["tls-parameter"];
        assert_eq!(tls.schema_type.as_deref(), Some("string"));
        assert_eq!(tls.content_encoding.as_deref(), Some("base64"));
        assert_eq!(
            b.parameters["tls"].destination.as_ref().map(|d| d.path.as_str()),
            Some("/cnab/app/certs/tls.crt")
        );

        assert!(b.is_output_sensitive("token"));
        assert_eq!(b.outputs["endpoint"].path, "/cnab/app/outputs/endpoint");
        assert!(b.is_internal_parameter("porter-state"));
        assert!(b.is_internal_parameter("porter-debug"));
        assert!(!b.parameters["porter-state"].required);
    }

    #[test]
    fn custom_actions_carry_metadata() {
        let b = converted(false);
        assert!(!b.should_record("status"));
        assert!(b.has_action("status"));
    }

    #[test]
    fn unknown_action_defaults_to_modifying() {
        assert!(default_action("migrate").modifies);
        assert!(default_action("help").stateless);
        assert!(!default_action("io.cnab.status").modifies);
    }

    #[test]
    fn v1_dependencies_by_default() {
        let b = converted(false);
        assert!(b.supports_extension(DEPENDENCIES_V1_KEY));
        let Some(DeclaredDependencies::V1(deps)) = b.dependencies().expect("deps") else {
            unreachable!("expected v1 dependencies");
        };
        assert_eq!(deps.sequence, vec!["mysql".to_string()]);
        assert_eq!(
            deps.requires["mysql"].version.as_ref().map(|v| v.ranges.clone()),
            Some(vec!["^5.7".to_string()])
        );
    }

    #[test]
    fn v2_dependencies_behind_flag() {
        let b = converted(true);
        assert!(b.supports_extension(DEPENDENCIES_V2_KEY));
        assert!(!b.supports_extension(DEPENDENCIES_V1_KEY));
        let Some(DeclaredDependencies::V2(deps)) = b.dependencies().expect("deps") else {
            unreachable!("expected v2 dependencies");
        };
        assert_eq!(
            deps.requires["mysql"].parameters["database"].value.as_deref(),
            Some("wordpress")
        );
    }

    #[test]
    fn extensions_are_processable() {
        let b = converted(false);
        let processed = b.process_required_extensions().expect("process");
        assert!(processed.contains(FILE_PARAMETERS_KEY));
        assert!(processed.contains(PARAMETER_SOURCES_KEY));
        let ps = b.parameter_sources().expect("sources");
        assert!(ps.contains_key("porter-state"));
    }

    #[test]
    fn templated_outputs_get_wiring_parameters() {
        let mut m = sample_manifest();
        let step = crate::manifest::Step::from_yaml(
            "exec:\n  command: echo\n  arguments:\n    - ${ bundle.outputs.endpoint }\n    - ${ bundle.dependencies.mysql.outputs.host }\n",
        )
        .expect("step");
        if let Some(upgrade) = m.upgrade.as_mut() {
            upgrade.push(step);
        }
        m.validate().expect("valid");
        let b = ManifestConverter::new(&m).to_bundle().expect("convert");

        assert!(b.parameters.contains_key("porter-endpoint-output"));
        assert!(b.is_internal_parameter("porter-endpoint-output"));
        assert!(b.parameters.contains_key("porter-mysql-host-dep-output"));
        let ps = b.parameter_sources().expect("sources");
        assert_eq!(
            ps["porter-mysql-host-dep-output"].list_by_priority(),
            vec![&ParameterSourceDefinition::DependencyOutput {
                dependency: "mysql".into(),
                name: "host".into()
            }]
        );
        b.validate().expect("valid bundle");
    }

    #[test]
    fn stamp_embeds_manifest() {
        let mut m = sample_manifest();
        m.validate().expect("valid");
        let raw = b"name: mybun\n";
        let b = ManifestConverter::new(&m)
            .with_raw_manifest(raw)
            .to_bundle()
            .expect("convert");
        let stamp = b.porter_stamp().expect("stamp").expect("present");
        assert_eq!(stamp.manifest_digest.len(), 32);
        assert_eq!(b.embedded_manifest().expect("decode"), Some(raw.to_vec()));
    }

    #[test]
    fn required_extensions_use_full_keys() {
        let mut m = sample_manifest();
        m.required.push(crate::manifest::Declaration {
            name: "docker".into(),
            config: Some(json!({"privileged": true})),
        });
        m.validate().expect("valid");
        let b = ManifestConverter::new(&m).to_bundle().expect("convert");
        assert!(b.required_extensions.contains(&"io.cnab.docker".to_string()));
        assert!(b.read_docker().expect("docker").privileged);
    }
}
