//! # Step Resolution
//!
//! Resolves `${ bundle.X }` placeholders in a step before it is handed to a
//! mixin. The step is marshaled to YAML, rendered as a template against the
//! run context, and unmarshaled back, so mixins only ever see plain YAML.
//!
//! | Root | Value |
//! |------|-------|
//! | `bundle.name` | manifest name |
//! | `bundle.parameters.<p>` | parameter value for this action |
//! | `bundle.credentials.<c>` | credential value |
//! | `bundle.outputs.<o>` | output produced earlier in the run |
//! | `bundle.dependencies.<alias>.outputs.<o>` | dependency output |
//! | `bundle.images.<alias>.<field>` | image map entry, relocated |
//!
//! A missing variable fails the render. The one exception is a dependency
//! output during uninstall, which renders empty because dependencies are
//! torn down in reverse order.
//!
//! Every sensitive value the context exposes is recorded so that logs and
//! mixin output can be censored.

use super::{Manifest, Step};
use crate::bundle::ExtendedBundle;
use crate::cache::RelocationMapping;
use crate::primitives::ACTION_UNINSTALL;
use crate::reference::{OCIReference, cached_regex};
use crate::types::{InstallationRef, PorterError, Result};
use handlebars::Handlebars;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;
use tracing::debug;

// =============================================================================
// CONTEXT
// =============================================================================

/// Outputs of a dependency that already ran.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DependencyContext {
    pub name: String,
    pub version: String,
    pub description: String,
    pub outputs: BTreeMap<String, String>,
    /// Output names the dependency declares `writeOnly`.
    pub sensitive_outputs: BTreeSet<String>,
}

/// Values a step can reference.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuntimeContext {
    pub installation: InstallationRef,
    pub action: String,
    pub parameters: BTreeMap<String, JsonValue>,
    pub credentials: BTreeMap<String, String>,
    pub dependencies: BTreeMap<String, DependencyContext>,
    pub relocation_map: RelocationMapping,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageData {
    repository: String,
    digest: String,
    tag: String,
    image_type: String,
    media_type: String,
    description: String,
    labels: BTreeMap<String, String>,
}

// =============================================================================
// RESOLVER
// =============================================================================

/// Renders the steps of one run, accumulating outputs between steps.
pub struct StepResolver<'a> {
    manifest: &'a Manifest,
    bundle: &'a ExtendedBundle,
    context: RuntimeContext,
    outputs: BTreeMap<String, String>,
    sensitive_values: Vec<String>,
    engine: Handlebars<'static>,
}

impl std::fmt::Debug for StepResolver<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepResolver")
            .field("action", &self.context.action)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<'a> StepResolver<'a> {
    pub fn new(manifest: &'a Manifest, bundle: &'a ExtendedBundle, context: RuntimeContext) -> Self {
        let mut engine = Handlebars::new();
        engine.set_strict_mode(true);
        engine.register_escape_fn(handlebars::no_escape);
        Self {
            manifest,
            bundle,
            context,
            outputs: BTreeMap::new(),
            sensitive_values: Vec::new(),
            engine,
        }
    }

    /// Values that must be censored wherever run output is shown.
    pub fn sensitive_values(&self) -> &[String] {
        &self.sensitive_values
    }

    /// Outputs produced by the steps resolved so far.
    pub fn outputs(&self) -> &BTreeMap<String, String> {
        &self.outputs
    }

    /// Merge the outputs of a completed step.
    pub fn apply_step_outputs(&mut self, outputs: BTreeMap<String, String>) {
        self.outputs.extend(outputs);
    }

    fn note_sensitive(&mut self, value: &str) {
        if !value.is_empty() && !self.sensitive_values.iter().any(|v| v == value) {
            self.sensitive_values.push(value.to_string());
        }
    }

    /// The template data for the current state of the run.
    fn build_source_data(&mut self) -> Result<JsonValue> {
        let action = self.context.action.clone();
        let bundle = self.bundle;
        let manifest = self.manifest;

        let mut params = Map::new();
        let parameters = self.context.parameters.clone();
        for (name, value) in &parameters {
            if bundle.parameters.get(name).is_some_and(|p| !p.applies_to(&action)) {
                continue;
            }
            if bundle.is_sensitive_parameter(name) {
                let plain = bundle.write_parameter_to_string(name, value)?;
                self.note_sensitive(&plain);
            }
            params.insert(name.clone(), value.clone());
        }

        let credentials = self.context.credentials.clone();
        for value in credentials.values() {
            self.note_sensitive(value);
        }

        let outputs = self.outputs.clone();
        for (name, value) in &outputs {
            let declared_plain = manifest.output(name).is_some_and(|o| !o.sensitive);
            if !declared_plain {
                self.note_sensitive(value);
            }
        }

        let mut deps = Map::new();
        let dependencies = self.context.dependencies.clone();
        for (alias, dep) in &dependencies {
            for (name, value) in &dep.outputs {
                if dep.sensitive_outputs.contains(name) {
                    self.note_sensitive(value);
                }
            }
            deps.insert(
                alias.clone(),
                json!({
                    "name": dep.name,
                    "version": dep.version,
                    "description": dep.description,
                    "outputs": dep.outputs,
                }),
            );
        }

        let mut images = Map::new();
        for (alias, image) in &bundle.images {
            let relocated = self
                .context
                .relocation_map
                .get(&image.image)
                .unwrap_or(&image.image);
            let r = OCIReference::parse(relocated)
                .map_err(|e| e.context(format!("invalid image {alias}")))?;
            let data = ImageData {
                repository: r.repository(),
                digest: r
                    .digest()
                    .map(str::to_string)
                    .or_else(|| image.digest.clone())
                    .unwrap_or_default(),
                tag: r.tag().unwrap_or_default().to_string(),
                image_type: image.image_type.clone(),
                media_type: image.media_type.clone().unwrap_or_default(),
                description: image.description.clone().unwrap_or_default(),
                labels: image.labels.clone(),
            };
            images.insert(alias.clone(), serde_json::to_value(data)?);
        }

        let installer_image = bundle
            .invocation_images
            .first()
            .map(|i| {
                self.context
                    .relocation_map
                    .get(&i.image)
                    .cloned()
                    .unwrap_or_else(|| i.image.clone())
            })
            .unwrap_or_default();

        Ok(json!({
            "installation": {
                "namespace": self.context.installation.namespace,
                "name": self.context.installation.name,
            },
            "bundle": {
                "name": manifest.name,
                "version": manifest.version,
                "description": manifest.description.clone().unwrap_or_default(),
                "installerImage": installer_image,
                "custom": manifest.custom,
                "parameters": params,
                "credentials": self.context.credentials,
                "outputs": outputs,
                "dependencies": deps,
                "images": images,
            },
            "env": self.context.env,
        }))
    }

    /// Render a step against the current context.
    pub fn resolve_step(&mut self, step: &Step) -> Result<Step> {
        let yaml = step.to_yaml()?;
        let template = to_template(&yaml)?;
        let mut data = self.build_source_data()?;
        if self.context.action == ACTION_UNINSTALL {
            prefill_dependency_outputs(&mut data, &yaml)?;
        }
        let mixin = step.mixin_name()?.to_string();
        let rendered = self
            .engine
            .render_template(&template, &data)
            .map_err(|e| PorterError::Template(format!("unable to resolve step for {mixin}: {e}")))?;
        debug!(mixin, action = %self.context.action, "resolved step");
        Step::from_yaml(&rendered)
    }
}

// =============================================================================
// TEMPLATE TRANSLATION
// =============================================================================

fn placeholder_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(&RE, r"\$\{\s*([^}]*?)\s*\}")
}

fn dependency_output_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    cached_regex(
        &RE,
        r"\$\{\s*bundle\.dependencies\.([^.\s}]+)\.outputs\.([^.\s}]+)\s*\}",
    )
}

/// Translate `${ a.b-c }` placeholders into template expressions.
///
/// Literal `{{` already in the step is escaped so it survives rendering.
fn to_template(yaml: &str) -> Result<String> {
    let escaped = yaml.replace("{{", "\\{{");
    let mut err = None;
    let out = placeholder_regex()?.replace_all(&escaped, |caps: &regex::Captures<'_>| {
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        if expr.is_empty() {
            err = Some(PorterError::Template("empty placeholder ${}".into()));
            return String::new();
        }
        let path: Vec<String> = expr
            .split('.')
            .map(|segment| {
                if segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    segment.to_string()
                } else {
                    format!("[{segment}]")
                }
            })
            .collect();
        format!("{{{{{}}}}}", path.join("."))
    });
    match err {
        Some(e) => Err(e),
        None => Ok(out.into_owned()),
    }
}

/// Fill every dependency output the step references but the context lacks.
fn prefill_dependency_outputs(data: &mut JsonValue, yaml: &str) -> Result<()> {
    for caps in dependency_output_regex()?.captures_iter(yaml) {
        let (Some(dep), Some(output)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let Some(deps) = data
            .get_mut("bundle")
            .and_then(|b| b.get_mut("dependencies"))
            .and_then(JsonValue::as_object_mut)
        else {
            continue;
        };
        let entry = deps
            .entry(dep.as_str().to_string())
            .or_insert_with(|| json!({"outputs": {}}));
        if entry.get("outputs").is_none_or(|o| !o.is_object()) {
            entry["outputs"] = json!({});
        }
        if let Some(outputs) = entry.get_mut("outputs").and_then(JsonValue::as_object_mut) {
            outputs
                .entry(output.as_str().to_string())
                .or_insert_with(|| JsonValue::String(String::new()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestConverter;
    use crate::manifest::tests::sample_manifest;

    fn fixture() -> (Manifest, ExtendedBundle) {
        let mut m = sample_manifest();
        m.validate().expect("valid");
        let b = ManifestConverter::new(&m).to_bundle().expect("convert");
        (m, b)
    }

    fn step(text: &str) -> Step {
        Step::from_yaml(text).expect("step")
    }

    fn context(action: &str) -> RuntimeContext {
        let mut ctx = RuntimeContext {
            installation: InstallationRef::new("dev", "mybun"),
            action: action.into(),
            ..RuntimeContext::default()
        };
        ctx.parameters.insert("password".into(), json!("s3cret"));
        ctx.parameters.insert("region".into(), json!("eu"));
        ctx.credentials.insert("kubeconfig".into(), "kube-data".into());
        ctx
    }

    #[test]
    fn renders_parameters_and_names() {
        let (m, b) = fixture();
        let mut r = StepResolver::new(&m, &b, context("install"));
        let s = step("exec:\n  command: echo\n  arguments:\n    - ${ bundle.name }\n    - ${bundle.parameters.region}\n    - ${ installation.namespace }\n");
        let out = r.resolve_step(&s).expect("render");
        let args = out.0["exec"]["arguments"].as_sequence().expect("args");
        assert_eq!(args[0].as_str(), Some("mybun"));
        assert_eq!(args[1].as_str(), Some("eu"));
        assert_eq!(args[2].as_str(), Some("dev"));
    }

    #[test]
    fn step_without_placeholders_is_unchanged() {
        let (m, b) = fixture();
        let mut r = StepResolver::new(&m, &b, RuntimeContext::default());
        let s = step("helm3:\n  description: \"{{ literal }}\"\n  set:\n    replicas: 3\n");
        assert_eq!(r.resolve_step(&s).expect("render"), s);
    }

    #[test]
    fn missing_variable_fails() {
        let (m, b) = fixture();
        let mut r = StepResolver::new(&m, &b, context("install"));
        let s = step("exec:\n  command: ${ bundle.parameters.nope }\n");
        assert!(matches!(r.resolve_step(&s), Err(PorterError::Template(_))));
    }

    #[test]
    fn dependency_outputs_tolerated_only_on_uninstall() {
        let (m, b) = fixture();
        let s = step("exec:\n  command: ${ bundle.dependencies.mysql.outputs.host }\n");

        let mut install = StepResolver::new(&m, &b, context("install"));
        assert!(install.resolve_step(&s).is_err());

        let mut uninstall = StepResolver::new(&m, &b, context("uninstall"));
        let out = uninstall.resolve_step(&s).expect("render");
        assert_eq!(out.0["exec"]["command"].as_str(), Some(""));
    }

    #[test]
    fn dependency_outputs_render() {
        let (m, b) = fixture();
        let mut ctx = context("install");
        let mut dep = DependencyContext {
            name: "mysql".into(),
            ..DependencyContext::default()
        };
        dep.outputs.insert("password".into(), "dbpass".into());
        dep.sensitive_outputs.insert("password".into());
        ctx.dependencies.insert("mysql".into(), dep);
        let mut r = StepResolver::new(&m, &b, ctx);
        let s = step("exec:\n  command: ${ bundle.dependencies.mysql.outputs.password }\n");
        let out = r.resolve_step(&s).expect("render");
        assert_eq!(out.0["exec"]["command"].as_str(), Some("dbpass"));
        assert!(r.sensitive_values().contains(&"dbpass".to_string()));
    }

    #[test]
    fn sensitive_values_are_tracked() {
        let (m, b) = fixture();
        let mut r = StepResolver::new(&m, &b, context("install"));
        r.apply_step_outputs(BTreeMap::from([
            ("token".to_string(), "tok".to_string()),
            ("endpoint".to_string(), "http://x".to_string()),
            ("scratch".to_string(), "tmp".to_string()),
        ]));
        r.resolve_step(&step("exec:\n  command: ${ bundle.outputs.endpoint }\n"))
            .expect("render");
        let values = r.sensitive_values();
        assert!(values.contains(&"s3cret".to_string()));
        assert!(values.contains(&"kube-data".to_string()));
        assert!(values.contains(&"tok".to_string()));
        assert!(values.contains(&"tmp".to_string()));
        assert!(!values.contains(&"eu".to_string()));
        assert!(!values.contains(&"http://x".to_string()));
    }

    #[test]
    fn images_are_relocated() {
        let (m, b) = fixture();
        let mut ctx = context("install");
        let digest = format!("sha256:{}", "b".repeat(64));
        ctx.relocation_map.insert(
            "ghcr.io/getporter/app:v1".into(),
            format!("localhost:5000/mybun@{digest}"),
        );
        let mut r = StepResolver::new(&m, &b, ctx);
        let s = step("exec:\n  command: ${ bundle.images.app.repository }\n  digest: ${ bundle.images.app.digest }\n");
        let out = r.resolve_step(&s).expect("render");
        assert_eq!(out.0["exec"]["command"].as_str(), Some("localhost:5000/mybun"));
        assert_eq!(out.0["exec"]["digest"].as_str(), Some(digest.as_str()));
    }

    #[test]
    fn dashed_names_are_addressable() {
        let t = to_template("x: ${ bundle.parameters.my-param }").expect("template");
        assert_eq!(t, "x: {{bundle.parameters.[my-param]}}");
    }
}
