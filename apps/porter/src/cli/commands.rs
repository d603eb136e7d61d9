//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use super::{ActionArgs, InstallationCommands, SetCommands};
use porter_core::config::{SecretsBackend, StorageBackend};
use porter_core::manifest::MANIFEST_FILE;
use porter_core::mixin::has_lint_error;
use porter_core::primitives::MIXIN_GRACE_PERIOD;
use porter_core::{
    ActionExecutor, ActionOutcome, ActionRequest, BundleCache, BundleResolver, BundleSource,
    Config, ConfigOverrides, FilesystemSecretStore, HostDriver, InMemorySecretStore,
    InstallationRef, InstallationStore, ListOptions, Manifest, ManifestConverter, MemoryStore, MixinRunner,
    OCIReference, OciRegistry, OutputFormat, PorterError, RedbStore, Result, Sanitizer,
    SecretStore, SetKind, StrategySet, Store,
};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Line the mixin build fragments replace in a Dockerfile template.
const MIXINS_TOKEN: &str = "# PORTER_MIXINS";

/// Dockerfile used when the manifest names no template.
const DEFAULT_DOCKERFILE: &str = "FROM debian:stable-slim

ARG BUNDLE_DIR

RUN apt-get update && apt-get install -y ca-certificates

# PORTER_MIXINS

COPY . ${BUNDLE_DIR}
WORKDIR ${BUNDLE_DIR}
CMD [\"/cnab/app/run\"]
";

/// Directory written by `build`, next to the manifest.
const BUILD_DIR: &str = ".cnab";

// =============================================================================
// APPLICATION CONTEXT
// =============================================================================

/// Stores, runners and the executor wired from one `Config`.
pub struct App {
    config: Config,
    store: Arc<InstallationStore>,
    sanitizer: Sanitizer,
    mixins: MixinRunner,
    executor: ActionExecutor,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Resolve the configuration and open its backends.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        Self::from_config(Config::load(overrides)?)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let documents: Arc<dyn Store> = match config.storage {
            StorageBackend::Redb => Arc::new(RedbStore::open(config.database_path())?),
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
        };
        let secrets: Arc<dyn SecretStore> = match config.secrets {
            SecretsBackend::Filesystem => Arc::new(FilesystemSecretStore::new(config.secrets_dir())),
            SecretsBackend::Memory => Arc::new(InMemorySecretStore::new()),
        };
        debug!(
            home = %config.home.display(),
            storage = config.storage.as_str(),
            secrets = config.secrets.as_str(),
            "loaded configuration"
        );

        let store = Arc::new(InstallationStore::new(documents));
        let sanitizer = Sanitizer::new(secrets);
        let mixins = MixinRunner::new(config.mixins_dir())
            .with_debug(config.debug)
            .with_grace_period(MIXIN_GRACE_PERIOD);
        let bundles = BundleResolver::new(
            BundleCache::new(config.cache_dir()),
            Arc::new(OciRegistry::new(false)),
        );
        let driver = Arc::new(HostDriver::new(mixins.clone(), config.runs_dir()));
        let executor = ActionExecutor::new(
            config.namespace.clone(),
            Arc::clone(&store),
            sanitizer.clone(),
            bundles,
            driver,
        );

        Ok(Self {
            config,
            store,
            sanitizer,
            mixins,
            executor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<InstallationStore> {
        &self.store
    }

    fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn json(&self) -> bool {
        self.config.output == OutputFormat::Json
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Read a manifest file, returning its text and the validated model.
fn load_manifest(path: &Path) -> Result<(Vec<u8>, Manifest)> {
    let raw = std::fs::read(path).map_err(|e| {
        PorterError::Io(format!(
            "the specified porter configuration file {} could not be read: {e}",
            path.display()
        ))
    })?;
    let mut manifest = Manifest::from_yaml(&raw).map_err(|e| e.context(path.display()))?;
    manifest.validate()?;
    Ok((raw, manifest))
}

/// Parse `KEY=VALUE` labels.
pub fn parse_labels(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| !k.trim().is_empty())
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .ok_or_else(|| {
                    PorterError::Validation(format!("invalid label {entry:?}, expected KEY=VALUE"))
                })
        })
        .collect()
}

/// Last path segment of a repository, used as a default installation name.
fn repository_name(reference: &OCIReference) -> String {
    let repository = reference.repository();
    repository
        .rsplit('/')
        .next()
        .unwrap_or(repository.as_str())
        .to_string()
}

// =============================================================================
// BUILD COMMAND
// =============================================================================

/// Validate the manifest, then write `.cnab/bundle.json` and `.cnab/Dockerfile`.
pub async fn cmd_build(app: &App, cancel: &CancellationToken, file: &Path) -> Result<()> {
    let (raw, manifest) = load_manifest(file)?;
    let bundle = ManifestConverter::new(&manifest)
        .with_dependencies_v2(app.config().dependencies_v2())
        .with_raw_manifest(&raw)
        .to_bundle()?;

    let fragments = app.mixins.build_fragments(cancel, &manifest).await?;
    let base = file.parent().unwrap_or(Path::new("."));
    let template = if manifest.dockerfile.is_empty() {
        DEFAULT_DOCKERFILE.to_string()
    } else {
        let path = base.join(&manifest.dockerfile);
        std::fs::read_to_string(&path).map_err(|e| {
            PorterError::Io(format!("unable to read Dockerfile template {}: {e}", path.display()))
        })?
    };
    let dockerfile = render_dockerfile(&template, &fragments);

    let out_dir = base.join(BUILD_DIR);
    std::fs::create_dir_all(&out_dir)?;
    std::fs::write(out_dir.join("Dockerfile"), dockerfile)?;
    std::fs::write(out_dir.join("bundle.json"), bundle.to_json()?)?;
    info!(bundle = %bundle.name, dir = %out_dir.display(), "built bundle");

    if app.json() {
        print_json(&json!({
            "name": bundle.name,
            "version": bundle.version,
            "image": manifest.image,
            "dir": out_dir,
        }))
    } else {
        println!("Built bundle {}:{}", bundle.name, bundle.version);
        println!("  Installer image: {}", manifest.image);
        println!("  Output:          {}", out_dir.display());
        Ok(())
    }
}

/// Substitute the mixin fragments for the token line; append them when the
/// template has no token.
pub fn render_dockerfile(template: &str, fragments: &[Vec<u8>]) -> String {
    let block: String = fragments
        .iter()
        .map(|f| {
            let text = String::from_utf8_lossy(f);
            let trimmed = text.trim_end();
            format!("{trimmed}\n")
        })
        .collect();

    let mut out = String::with_capacity(template.len() + block.len());
    let mut replaced = false;
    for line in template.lines() {
        if line.trim() == MIXINS_TOKEN {
            out.push_str(&block);
            replaced = true;
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    if !replaced {
        out.push_str(&block);
    }
    out
}

// =============================================================================
// ACTION COMMANDS
// =============================================================================

/// Pick the bundle for an action: `--reference`, else the manifest, else
/// the bundle the installation already tracks.
fn bundle_source(app: &App, args: &ActionArgs) -> Result<(BundleSource, Option<String>)> {
    if let Some(reference) = &args.reference {
        let reference = OCIReference::parse(reference)?;
        let name = repository_name(&reference);
        return Ok((BundleSource::Reference(reference), Some(name)));
    }

    let path = args
        .file
        .clone()
        .unwrap_or_else(|| PathBuf::from(MANIFEST_FILE));
    if args.file.is_none() && !path.exists() {
        return Ok((BundleSource::Installation, None));
    }

    let (raw, manifest) = load_manifest(&path)?;
    let bundle = ManifestConverter::new(&manifest)
        .with_dependencies_v2(app.config().dependencies_v2())
        .with_raw_manifest(&raw)
        .to_bundle()?;
    Ok((
        BundleSource::Definition {
            bundle,
            reference: None,
        },
        Some(manifest.name),
    ))
}

/// Run `action` for the installation named in `args`.
pub async fn cmd_action(
    app: &App,
    cancel: &CancellationToken,
    action: &str,
    args: &ActionArgs,
    delete: bool,
) -> Result<()> {
    let (source, default_name) = bundle_source(app, args)?;
    let installation = args.installation.clone().or(default_name).ok_or_else(|| {
        PorterError::Validation(
            "an installation name is required when no manifest or --reference is given".into(),
        )
    })?;

    let mut request = ActionRequest::new(action, installation).with_source(source);
    request.params = args.params.clone();
    request.parameter_sets = args.parameter_sets.clone();
    request.credential_sets = args.credential_sets.clone();
    request.labels = parse_labels(&args.labels)?;
    request.force = args.force;
    request.delete = delete;

    info!(action, installation = %request.installation, "running bundle action");
    let outcome = app.executor.execute(cancel, &request).await?;
    report_outcome(app, &outcome)?;
    outcome.check()
}

fn report_outcome(app: &App, outcome: &ActionOutcome) -> Result<()> {
    let installation = outcome.installation.installation_ref().to_string();
    if app.json() {
        let dependencies: Vec<JsonValue> = outcome
            .dependencies
            .iter()
            .map(|d| {
                json!({
                    "key": d.key,
                    "installation": d.installation,
                    "status": d.status.map(|s| s.as_str()),
                })
            })
            .collect();
        return print_json(&json!({
            "installation": installation,
            "action": outcome.run.action,
            "runId": outcome.run.id,
            "status": outcome.status.as_str(),
            "message": outcome.message,
            "outputs": outcome.outputs,
            "dependencies": dependencies,
        }));
    }

    for dep in &outcome.dependencies {
        match dep.status {
            Some(status) => println!("dependency {} ({}): {}", dep.key, dep.installation, status.as_str()),
            None => println!("dependency {} ({}): skipped", dep.key, dep.installation),
        }
    }
    if !outcome.logs.is_empty() {
        print!("{}", outcome.logs);
        if !outcome.logs.ends_with('\n') {
            println!();
        }
    }
    println!(
        "{} of installation {} {}",
        outcome.run.action,
        installation,
        outcome.status.as_str()
    );
    Ok(())
}

// =============================================================================
// LINT, SCHEMA & VERSION COMMANDS
// =============================================================================

pub async fn cmd_lint(app: &App, cancel: &CancellationToken, file: &Path) -> Result<()> {
    let (raw, manifest) = load_manifest(file)?;
    let text = String::from_utf8_lossy(&raw);
    let results = app.mixins.lint(cancel, &manifest, &text).await?;

    if app.json() {
        print_json(&results)?;
    } else if results.is_empty() {
        println!("No problems found");
    } else {
        for r in &results {
            print!("{r}");
        }
    }

    if has_lint_error(&results) {
        return Err(PorterError::Validation(
            "lint errors were detected in the manifest".into(),
        ));
    }
    Ok(())
}

/// The manifest schema with one step definition per installed mixin.
pub async fn cmd_schema(app: &App, cancel: &CancellationToken) -> Result<()> {
    let mut steps = serde_json::Map::new();
    for mixin in app.mixins.list_installed()? {
        match app.mixins.schema(cancel, &mixin).await {
            Ok(schema) => {
                steps.insert(mixin, schema);
            }
            Err(PorterError::Canceled) => return Err(PorterError::Canceled),
            Err(e) => debug!(mixin = %mixin, error = %e, "mixin did not return a schema"),
        }
    }
    let step_refs: Vec<JsonValue> = steps
        .keys()
        .map(|m| json!({ "$ref": format!("#/definitions/mixin.{m}") }))
        .collect();

    let mut definitions = serde_json::Map::new();
    for (mixin, schema) in steps {
        definitions.insert(format!("mixin.{mixin}"), schema);
    }
    let action = json!({ "type": "array", "items": { "anyOf": step_refs } });

    let schema = json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "Porter manifest",
        "type": "object",
        "required": ["name", "version", "mixins", "install", "upgrade", "uninstall"],
        "properties": {
            "schemaVersion": { "type": "string" },
            "name": { "type": "string" },
            "version": { "type": "string" },
            "description": { "type": "string" },
            "registry": { "type": "string" },
            "reference": { "type": "string" },
            "dockerfile": { "type": "string" },
            "mixins": { "type": "array" },
            "parameters": { "type": "array" },
            "credentials": { "type": "array" },
            "outputs": { "type": "array" },
            "dependencies": { "type": "object" },
            "images": { "type": "object" },
            "custom": { "type": "object" },
            "required": { "type": "array" },
            "customActions": { "type": "object" },
            "install": action.clone(),
            "upgrade": action.clone(),
            "uninstall": action.clone(),
        },
        "additionalProperties": action,
        "definitions": definitions,
    });
    print_json(&schema)
}

pub async fn cmd_version(app: &App, cancel: &CancellationToken, system: bool) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    if !system {
        if app.json() {
            return print_json(&json!({ "name": "porter", "version": version }));
        }
        println!("porter v{version}");
        return Ok(());
    }

    let mut mixins = Vec::new();
    for mixin in app.mixins.list_installed()? {
        mixins.push(app.mixins.version(cancel, &mixin).await?);
    }
    if app.json() {
        return print_json(&json!({
            "version": { "name": "porter", "version": version },
            "system": { "os": std::env::consts::OS, "arch": std::env::consts::ARCH },
            "mixins": mixins,
        }));
    }

    println!("Client:");
    println!("  Version: v{version}");
    println!();
    println!("System:");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);
    println!();
    println!("Mixins:");
    if mixins.is_empty() {
        println!("  (none)");
    }
    for m in &mixins {
        println!("  {} {}", m.name, m.version);
    }
    Ok(())
}

// =============================================================================
// INSTALLATION COMMANDS
// =============================================================================

pub fn cmd_installations(app: &App, command: InstallationCommands) -> Result<()> {
    let store = app.store();
    let ns = app.namespace();
    match command {
        InstallationCommands::List {
            all_namespaces,
            labels,
        } => {
            let opts = ListOptions {
                namespace: (!all_namespaces).then(|| ns.to_string()),
                labels: parse_labels(&labels)?,
                ..ListOptions::default()
            };
            let installations = store.list_installations(&opts)?;
            if app.json() {
                return print_json(&installations);
            }
            println!(
                "{:<16} {:<24} {:<12} {:<10} MODIFIED",
                "NAMESPACE", "NAME", "LAST ACTION", "STATUS"
            );
            for i in &installations {
                println!(
                    "{:<16} {:<24} {:<12} {:<10} {}",
                    i.namespace,
                    i.name,
                    i.status.action,
                    i.status.result_status.map(|s| s.as_str()).unwrap_or(""),
                    i.modified.to_rfc3339()
                );
            }
            Ok(())
        }
        InstallationCommands::Show { name } => {
            let installation = store.get_installation(ns, &name)?;
            if app.json() {
                return print_json(&installation);
            }
            println!("Name:       {}", installation.name);
            println!("Namespace:  {}", installation.namespace);
            println!("Created:    {}", installation.created.to_rfc3339());
            println!("Modified:   {}", installation.modified.to_rfc3339());
            if !installation.bundle.repository.is_empty() {
                println!("Bundle:     {}", installation.bundle.repository);
                println!("Version:    {}", installation.bundle.version);
                println!("Digest:     {}", installation.bundle.digest);
            }
            println!("Installed:  {}", installation.status.installation_completed);
            println!("Last run:   {} {}", installation.status.action, installation.status.run_id);
            if let Some(status) = installation.status.result_status {
                println!("Status:     {}", status.as_str());
            }
            for (k, v) in &installation.labels {
                println!("Label:      {k}={v}");
            }
            Ok(())
        }
        InstallationCommands::Outputs { name } => {
            let stored = store.get_last_outputs(ns, &name)?;
            let outputs: BTreeMap<String, String> = app
                .sanitizer
                .restore_outputs(&stored)
                .iter()
                .map(|o| (o.name.clone(), o.value_string()))
                .collect();
            if app.json() {
                return print_json(&outputs);
            }
            for (k, v) in &outputs {
                println!("{k}: {v}");
            }
            Ok(())
        }
        InstallationCommands::Logs { name } => {
            let logs = store.get_logs(ns, &name)?.ok_or_else(|| {
                PorterError::not_found("logs", InstallationRef::new(ns, &name).to_string())
            })?;
            print!("{logs}");
            Ok(())
        }
        InstallationCommands::Delete { name } => {
            store.remove_installation(ns, &name)?;
            info!(installation = %name, "deleted installation");
            println!("Deleted installation {name}");
            Ok(())
        }
    }
}

// =============================================================================
// CREDENTIAL & PARAMETER SET COMMANDS
// =============================================================================

/// Parse a set document from YAML or JSON text.
pub fn parse_set(path: &Path) -> Result<StrategySet> {
    let data = std::fs::read(path)
        .map_err(|e| PorterError::Io(format!("unable to read {}: {e}", path.display())))?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    let set: StrategySet = if is_json {
        serde_json::from_slice(&data)?
    } else {
        serde_yaml::from_slice(&data)?
    };
    Ok(set)
}

pub fn cmd_sets(app: &App, kind: SetKind, command: SetCommands) -> Result<()> {
    let store = app.store();
    let ns = app.namespace();
    match command {
        SetCommands::Apply { file } => {
            let mut set = parse_set(&file).map_err(|e| e.context(file.display()))?;
            if !ns.is_empty() {
                set.namespace = ns.to_string();
            }
            let applied = store.apply_set(kind, &set)?;
            info!(kind = kind.label(), name = %applied.name, "applied set");
            println!(
                "Applied {} set {}",
                kind.label(),
                InstallationRef::new(&applied.namespace, &applied.name)
            );
            Ok(())
        }
        SetCommands::List => {
            let sets = store.list_sets(kind, Some(ns))?;
            if app.json() {
                return print_json(&sets);
            }
            println!("{:<16} {:<24} MODIFIED", "NAMESPACE", "NAME");
            for s in &sets {
                println!("{:<16} {:<24} {}", s.namespace, s.name, s.modified.to_rfc3339());
            }
            Ok(())
        }
        SetCommands::Show { name } => {
            let set = store.get_set(kind, ns, &name)?;
            if app.json() {
                return print_json(&set);
            }
            println!("Name:      {}", set.name);
            println!("Namespace: {}", set.namespace);
            for s in &set.entries {
                println!("  {}: {} {}", s.name, s.source.key, s.source.value);
            }
            Ok(())
        }
        SetCommands::Delete { name } => {
            if !store.remove_set(kind, ns, &name)? {
                return Err(PorterError::not_found(kind.label(), name));
            }
            println!("Deleted {} set {name}", kind.label());
            Ok(())
        }
    }
}

// =============================================================================
// MIXIN COMMANDS
// =============================================================================

pub fn cmd_mixins_list(app: &App) -> Result<()> {
    let mixins = app.mixins.list_installed()?;
    if app.json() {
        return print_json(&mixins);
    }
    for m in &mixins {
        println!("{m}");
    }
    Ok(())
}
