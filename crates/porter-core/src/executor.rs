//! # Action Executor
//!
//! Runs one action against an installation, together with the
//! dependencies its bundle declares:
//!
//! ```text
//! request ──▶ bundle ──▶ BundleGraph ──▶ per node, in execution order:
//!                                         inputs ─▶ Driver ─▶ Run/Result/Outputs
//! ```
//!
//! ## Parameter finalisation
//!
//! For every parameter that applies to the action, the first of these wins:
//!
//! 1. an explicit value: installation overrides, then parameter sets, then
//!    `--param` (later layers overwrite earlier ones)
//! 2. a parameter source (a previous output, or a dependency output)
//! 3. the definition default
//!
//! A required parameter left without a value is a validation error.
//! `--param` values are persisted on the installation so the next action
//! sees them again.
//!
//! ## Recording
//!
//! A recorded run writes the Run, one Result and its outputs (sensitive
//! values moved to the secret store), then folds the result into the
//! installation status. Custom actions declared stateless and
//! non-modifying leave no trace.

use crate::bundle::{DependencySource, ExtendedBundle, ParameterSource, ParameterSourceDefinition};
use crate::cache::RelocationMapping;
use crate::claims::store::SetKind;
use crate::claims::{Installation, InstallationStore, ResultStatus, Run};
use crate::dependencies::{
    BundleGraph, BundleNode, CompositeResolver, Node, ROOT_KEY, execution_order,
    installation_name,
};
use crate::manifest::resolver::DependencyContext;
use crate::primitives::{
    ACTION_INSTALL, ACTION_UNINSTALL, LABEL_PARENT_INSTALLATION, LABEL_SHARING_GROUP,
    OUTPUT_INVOCATION_IMAGE_LOGS,
};
use crate::reference::OCIReference;
use crate::registry::BundleResolver;
use crate::runtime::{Driver, Operation, OperationResult};
use crate::sanitizer::Sanitizer;
use crate::secrets::Strategy;
use crate::types::{InstallationRef, PorterError, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// REQUEST
// =============================================================================

/// Where the bundle for an action comes from.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BundleSource {
    /// The bundle the installation is bound to, or the bundle of its last run.
    #[default]
    Installation,
    /// A published bundle, fetched through the cache.
    Reference(OCIReference),
    /// A definition already in memory, e.g. built from a local manifest.
    Definition {
        bundle: ExtendedBundle,
        reference: Option<OCIReference>,
    },
}

/// One action to run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionRequest {
    pub action: String,
    pub installation: String,
    pub source: BundleSource,
    /// `NAME=VALUE` overrides; `DEP#NAME=VALUE` targets a dependency.
    pub params: Vec<String>,
    pub parameter_sets: Vec<String>,
    pub credential_sets: Vec<String>,
    pub labels: BTreeMap<String, String>,
    /// Repeat a successful install and re-pull the bundle.
    pub force: bool,
    /// Remove the installation records after a successful uninstall.
    pub delete: bool,
}

impl ActionRequest {
    pub fn new(action: impl Into<String>, installation: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            installation: installation.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: BundleSource) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(params.into_iter().map(Into::into));
        self
    }
}

/// Parsed `--param` values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterOverrides {
    pub root: BTreeMap<String, String>,
    /// Dependency alias to its overrides.
    pub dependencies: BTreeMap<String, BTreeMap<String, String>>,
}

impl ParameterOverrides {
    /// Parse `NAME=VALUE` and `DEP#NAME=VALUE` entries. Later entries win.
    pub fn parse(raw: &[String]) -> Result<Self> {
        let mut overrides = Self::default();
        for entry in raw {
            let invalid = || {
                PorterError::Validation(format!(
                    "invalid parameter {entry:?}, expected NAME=VALUE or DEPENDENCY#NAME=VALUE"
                ))
            };
            let (name, value) = entry.split_once('=').ok_or_else(invalid)?;
            let name = name.trim();
            if name.is_empty() {
                return Err(invalid());
            }
            match name.split_once('#') {
                None => {
                    overrides.root.insert(name.to_string(), value.to_string());
                }
                Some((dep, param)) if !dep.is_empty() && !param.is_empty() => {
                    overrides
                        .dependencies
                        .entry(dep.to_string())
                        .or_default()
                        .insert(param.to_string(), value.to_string());
                }
                Some(_) => return Err(invalid()),
            }
        }
        Ok(overrides)
    }

    fn for_dependency(&self, alias: &str) -> BTreeMap<String, String> {
        self.dependencies.get(alias).cloned().unwrap_or_default()
    }
}

// =============================================================================
// OUTCOME
// =============================================================================

/// What happened to one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyOutcome {
    pub key: String,
    pub installation: String,
    /// `None` when the dependency did not need to run.
    pub status: Option<ResultStatus>,
}

/// The result of an action on the root installation.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub installation: Installation,
    pub run: Run,
    pub status: ResultStatus,
    pub message: String,
    /// Outputs of the root run, in plaintext.
    pub outputs: BTreeMap<String, String>,
    pub logs: String,
    pub dependencies: Vec<DependencyOutcome>,
    /// False for actions that leave no records.
    pub recorded: bool,
}

impl ActionOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ResultStatus::Succeeded
    }

    /// `RunFailed` unless the root run succeeded.
    pub fn check(&self) -> Result<()> {
        if self.succeeded() {
            return Ok(());
        }
        Err(PorterError::RunFailed {
            installation: self.installation.installation_ref().to_string(),
            action: self.run.action.clone(),
            status: self.status.as_str().to_string(),
            message: self.message.clone(),
        })
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// The bundle an action runs.
#[derive(Debug, Clone)]
struct Target {
    definition: ExtendedBundle,
    reference: Option<OCIReference>,
    relocation_map: RelocationMapping,
}

/// Explicit inputs of one bundle node, computed before anything runs.
#[derive(Debug, Clone, Default)]
struct NodePlan {
    installation: String,
    parameters: BTreeMap<String, String>,
    credentials: BTreeMap<String, String>,
}

/// Everything one node run needs besides the installation.
struct RunSpec<'a> {
    action: &'a str,
    bundle: &'a ExtendedBundle,
    reference: Option<&'a OCIReference>,
    relocation_map: &'a RelocationMapping,
    parameters: BTreeMap<String, JsonValue>,
    credentials: BTreeMap<String, String>,
    dependencies: BTreeMap<String, DependencyContext>,
}

/// Progress through the graph.
#[derive(Debug, Default)]
struct Progress {
    /// Node key to the outputs it exposes to its parent.
    contexts: BTreeMap<String, DependencyContext>,
    dependencies: Vec<DependencyOutcome>,
}

/// Runs actions and records them in the installation store.
pub struct ActionExecutor {
    namespace: String,
    store: Arc<InstallationStore>,
    sanitizer: Sanitizer,
    bundles: BundleResolver,
    driver: Arc<dyn Driver>,
}

impl std::fmt::Debug for ActionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionExecutor")
            .field("namespace", &self.namespace)
            .field("bundles", &self.bundles)
            .finish_non_exhaustive()
    }
}

impl ActionExecutor {
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<InstallationStore>,
        sanitizer: Sanitizer,
        bundles: BundleResolver,
        driver: Arc<dyn Driver>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            sanitizer,
            bundles,
            driver,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<InstallationStore> {
        &self.store
    }

    /// Run `request`.
    ///
    /// A failed or canceled root run is reported in the outcome (see
    /// [`ActionOutcome::check`]); a dependency that does not succeed stops
    /// the action with `RunFailed` before the root runs.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        request: &ActionRequest,
    ) -> Result<ActionOutcome> {
        if request.installation.is_empty() {
            return Err(PorterError::Validation("installation name is required".into()));
        }
        if request.action.is_empty() {
            return Err(PorterError::Validation("action is required".into()));
        }
        let action = request.action.as_str();
        let existing = self.find_installation(&self.namespace, &request.installation)?;
        let target = self.resolve_target(cancel, request, existing.as_ref()).await?;
        target.definition.validate()?;
        Self::check_action(request, &target.definition, existing.as_ref())?;
        let overrides = ParameterOverrides::parse(&request.params)?;

        let mut root = existing
            .unwrap_or_else(|| Installation::new(&self.namespace, &request.installation));
        Self::prepare_root(&mut root, request, &target, &overrides)?;

        let mut root_node = BundleNode::root(target.definition.clone(), target.reference.clone());
        root_node.relocation_map = target.relocation_map.clone();
        let graph = CompositeResolver::new(&self.namespace, self.store.clone(), self.bundles.clone())
            .build_graph(cancel, root_node)
            .await?;
        let plans = self.plan(&graph, &root, &overrides)?;
        let order = execution_order(&graph, action)?;
        info!(
            installation = %root.installation_ref(),
            action,
            nodes = order.len(),
            "executing action"
        );

        let mut progress = Progress::default();
        if action == ACTION_UNINSTALL {
            self.prefill_contexts(&graph, &plans, &mut progress)?;
        }

        let mut root_run: Option<(Run, OperationResult)> = None;
        for node in order {
            if cancel.is_cancelled() && root_run.is_none() && node.parent_key().is_some() {
                return Err(PorterError::Canceled);
            }
            match node {
                Node::Installation(i) => {
                    let context = self.installation_context(&i.namespace, &i.name)?;
                    progress.contexts.insert(i.key.clone(), context);
                }
                Node::Bundle(b) if b.is_root() => {
                    let plan = plans.get(ROOT_KEY).cloned().unwrap_or_default();
                    let dependencies = children_contexts(&graph, ROOT_KEY, &progress.contexts);
                    let spec = RunSpec {
                        action,
                        bundle: &b.definition,
                        reference: b.reference.as_ref(),
                        relocation_map: &b.relocation_map,
                        parameters: self.finalize_parameters(
                            &b.definition,
                            action,
                            &root.installation_ref(),
                            &plan.parameters,
                            &dependencies,
                        )?,
                        credentials: finalize_credentials(&b.definition, action, &plan.credentials)?,
                        dependencies,
                    };
                    let (run, result) = self.run_bundle(cancel, &mut root, spec).await?;
                    let stop = result.status != ResultStatus::Succeeded;
                    root_run = Some((run, result));
                    if stop {
                        break;
                    }
                }
                Node::Bundle(b) => {
                    self.run_dependency(cancel, request, &graph, node, b, &plans, &root, &mut progress)
                        .await?;
                }
            }
        }

        let Some((run, result)) = root_run else {
            return Err(PorterError::Validation("the root bundle was not scheduled".into()));
        };
        let recorded = run.should_record();
        if recorded
            && action == ACTION_UNINSTALL
            && request.delete
            && result.status == ResultStatus::Succeeded
        {
            self.store.remove_installation(&root.namespace, &root.name)?;
        }
        Ok(ActionOutcome {
            installation: root,
            status: result.status,
            message: result.message,
            outputs: output_strings(&result.outputs),
            logs: result.logs,
            dependencies: progress.dependencies,
            recorded,
            run,
        })
    }

    // -------------------------------------------------------------------------
    // Preparation
    // -------------------------------------------------------------------------

    fn find_installation(&self, namespace: &str, name: &str) -> Result<Option<Installation>> {
        match self.store.get_installation(namespace, name) {
            Ok(i) => Ok(Some(i)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn resolve_target(
        &self,
        cancel: &CancellationToken,
        request: &ActionRequest,
        existing: Option<&Installation>,
    ) -> Result<Target> {
        match &request.source {
            BundleSource::Reference(reference) => self.pull(cancel, reference, request.force).await,
            BundleSource::Definition { bundle, reference } => Ok(Target {
                definition: bundle.clone(),
                reference: reference.clone(),
                relocation_map: RelocationMapping::new(),
            }),
            BundleSource::Installation => {
                let Some(inst) = existing else {
                    return Err(PorterError::not_found(
                        "installation",
                        InstallationRef::new(&self.namespace, &request.installation).to_string(),
                    ));
                };
                if let Some(reference) = inst.bundle.reference()? {
                    return self.pull(cancel, &reference, request.force).await;
                }
                let last = self.store.get_last_run(&inst.namespace, &inst.name).map_err(|e| {
                    e.context(format!(
                        "installation {} is not bound to a bundle reference",
                        inst.installation_ref()
                    ))
                })?;
                debug!(run = %last.id, "using the bundle of the last run");
                Ok(Target {
                    definition: last.bundle,
                    reference: None,
                    relocation_map: RelocationMapping::new(),
                })
            }
        }
    }

    async fn pull(
        &self,
        cancel: &CancellationToken,
        reference: &OCIReference,
        force: bool,
    ) -> Result<Target> {
        let cached = self
            .bundles
            .resolve(reference, force, cancel)
            .await
            .map_err(|e| e.context(format!("unable to pull bundle {reference}")))?;
        let pulled = cached.bundle_reference;
        Ok(Target {
            definition: pulled.definition,
            reference: Some(pulled.reference),
            relocation_map: pulled.relocation_map,
        })
    }

    fn check_action(
        request: &ActionRequest,
        bundle: &ExtendedBundle,
        existing: Option<&Installation>,
    ) -> Result<()> {
        let action = request.action.as_str();
        if !bundle.has_action(action) {
            return Err(PorterError::Validation(format!(
                "bundle {} does not define the {action} action",
                bundle.name
            )));
        }
        match existing {
            Some(inst) if action == ACTION_INSTALL && inst.is_installed() && !request.force => {
                Err(PorterError::Validation(format!(
                    "the installation {} has already been successfully installed and as a protection \
                     against accidentally overwriting existing installations, install cannot be repeated; \
                     verify the installation name and namespace and use upgrade, or repeat the install with --force",
                    inst.installation_ref()
                )))
            }
            None if action != ACTION_INSTALL && !bundle.action_is_stateless(action) => Err(
                PorterError::not_found("installation", request.installation.clone()),
            ),
            _ => Ok(()),
        }
    }

    fn prepare_root(
        root: &mut Installation,
        request: &ActionRequest,
        target: &Target,
        overrides: &ParameterOverrides,
    ) -> Result<()> {
        root.labels
            .extend(request.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        if !request.parameter_sets.is_empty() {
            root.parameter_sets.clone_from(&request.parameter_sets);
        }
        if !request.credential_sets.is_empty() {
            root.credential_sets.clone_from(&request.credential_sets);
        }
        if let Some(reference) = &target.reference {
            root.track_bundle(reference);
        }
        for (name, value) in &overrides.root {
            require_parameter(&target.definition, name)?;
            root.set_parameter(Strategy::literal(name.clone(), value.clone()));
        }
        Ok(())
    }

    /// Explicit inputs of every bundle node, parents before children so a
    /// dependency can be wired from its parent's values.
    fn plan(
        &self,
        graph: &BundleGraph,
        root: &Installation,
        overrides: &ParameterOverrides,
    ) -> Result<BTreeMap<String, NodePlan>> {
        for alias in overrides.dependencies.keys() {
            if !graph.nodes().any(|n| n.parent_key().is_some() && n.alias() == alias) {
                return Err(PorterError::Validation(format!(
                    "parameter override targets unknown dependency {alias}"
                )));
            }
        }

        let root_credentials = self.set_values(SetKind::Credentials, &root.credential_sets)?;
        let mut root_parameters = strategy_values(&self.sanitizer.restore_parameters(&root.parameters)?);
        root_parameters.extend(self.set_values(SetKind::Parameters, &root.parameter_sets)?);
        root_parameters.extend(overrides.root.clone());

        let mut plans = BTreeMap::new();
        for node in graph.nodes() {
            let Node::Bundle(b) = node else {
                continue;
            };
            let name = installation_name(graph, &root.name, node);
            let Some(parent_key) = &b.parent_key else {
                plans.insert(
                    b.key.clone(),
                    NodePlan {
                        installation: name,
                        parameters: root_parameters.clone(),
                        credentials: root_credentials.clone(),
                    },
                );
                continue;
            };
            let (Some(parent), Some(parent_plan)) = (
                graph.get_node(parent_key).and_then(Node::as_bundle),
                plans.get(parent_key),
            ) else {
                return Err(PorterError::UnresolvedDependency(format!(
                    "{} was scheduled before its parent",
                    b.key
                )));
            };
            let parent_view = parameter_view(&parent.definition, &parent_plan.parameters)?;
            let no_outputs = BTreeMap::new();

            let mut parameters = BTreeMap::new();
            if let Some(existing) = self.find_installation(&self.namespace, &name)? {
                parameters.extend(strategy_values(
                    &self.sanitizer.restore_parameters(&existing.parameters)?,
                ));
            }
            for (param, source) in &b.parameters {
                require_parameter(&b.definition, param)
                    .map_err(|e| e.context(format!("dependency {}", node.alias())))?;
                if source.is_dependency_output() {
                    continue;
                }
                if let Some(v) = source.resolve(&parent_view, &parent_plan.credentials, &no_outputs) {
                    parameters.insert(param.clone(), v);
                }
            }
            for param in overrides.for_dependency(node.alias()).keys() {
                require_parameter(&b.definition, param)
                    .map_err(|e| e.context(format!("dependency {}", node.alias())))?;
            }
            parameters.extend(overrides.for_dependency(node.alias()));

            let mut credentials = root_credentials.clone();
            for (cred, source) in &b.credentials {
                if source.is_dependency_output() {
                    continue;
                }
                if let Some(v) = source.resolve(&parent_view, &parent_plan.credentials, &no_outputs) {
                    credentials.insert(cred.clone(), v);
                }
            }
            plans.insert(
                b.key.clone(),
                NodePlan {
                    installation: name,
                    parameters,
                    credentials,
                },
            );
        }
        Ok(plans)
    }

    /// Values of the named sets, later sets overwriting earlier ones. A set
    /// missing from the current namespace is looked up in the global one.
    fn set_values(&self, kind: SetKind, names: &[String]) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for name in names {
            let set = match self.store.get_set(kind, &self.namespace, name) {
                Err(e) if e.is_not_found() && !self.namespace.is_empty() => {
                    self.store.get_set(kind, "", name)
                }
                other => other,
            }?;
            let restored = self.sanitizer.restore_parameter_set(&set)?;
            values.extend(strategy_values(&restored.entries));
        }
        Ok(values)
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    fn finalize_parameters(
        &self,
        bundle: &ExtendedBundle,
        action: &str,
        installation: &InstallationRef,
        explicit: &BTreeMap<String, String>,
        dependencies: &BTreeMap<String, DependencyContext>,
    ) -> Result<BTreeMap<String, JsonValue>> {
        let sources = bundle.parameter_sources()?;
        let mut values = BTreeMap::new();
        let mut missing = Vec::new();
        for (name, def) in &bundle.parameters {
            if !def.applies_to(action) {
                continue;
            }
            let raw = match explicit.get(name) {
                Some(v) => Some(v.clone()),
                None => self.parameter_source_value(sources.get(name), installation, dependencies)?,
            };
            if let Some(raw) = raw {
                values.insert(name.clone(), bundle.convert_parameter_value(name, &raw)?);
            } else if let Some(default) = bundle.parameter_default(name) {
                values.insert(name.clone(), default.clone());
            } else if def.required {
                missing.push(name.as_str());
            }
        }
        if !missing.is_empty() {
            return Err(PorterError::Validation(format!(
                "missing required parameters for {action} of {}: {}",
                bundle.name,
                missing.join(", ")
            )));
        }
        Ok(values)
    }

    fn parameter_source_value(
        &self,
        source: Option<&ParameterSource>,
        installation: &InstallationRef,
        dependencies: &BTreeMap<String, DependencyContext>,
    ) -> Result<Option<String>> {
        let Some(source) = source else {
            return Ok(None);
        };
        for def in source.list_by_priority() {
            match def {
                ParameterSourceDefinition::Output { name } => {
                    match self
                        .store
                        .get_last_output(&installation.namespace, &installation.name, name)
                    {
                        Ok(o) => return Ok(Some(self.sanitizer.restore_output(&o).value_string())),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                ParameterSourceDefinition::DependencyOutput { dependency, name } => {
                    if let Some(v) = dependencies.get(dependency).and_then(|d| d.outputs.get(name)) {
                        return Ok(Some(v.clone()));
                    }
                }
            }
        }
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Dependencies
    // -------------------------------------------------------------------------

    async fn run_dependency(
        &self,
        cancel: &CancellationToken,
        request: &ActionRequest,
        graph: &BundleGraph,
        node: &Node,
        b: &BundleNode,
        plans: &BTreeMap<String, NodePlan>,
        root: &Installation,
        progress: &mut Progress,
    ) -> Result<()> {
        let action = request.action.as_str();
        let plan = plans.get(&b.key).cloned().unwrap_or_default();
        let name = plan.installation.clone();
        let alias = node.alias();
        let existing = self.find_installation(&self.namespace, &name)?;

        if let Some(reason) = Self::skip_reason(request, b, &name, existing.as_ref())? {
            debug!(dependency = %b.key, installation = %name, reason, "skipping dependency");
            let mut context = context_for(&b.definition, self.stored_outputs(&self.namespace, &name)?);
            if let Some(prior) = progress.contexts.get(&b.key) {
                context.outputs.extend(prior.outputs.clone());
            }
            progress.contexts.insert(b.key.clone(), context);
            progress.dependencies.push(DependencyOutcome {
                key: b.key.clone(),
                installation: name,
                status: None,
            });
            return Ok(());
        }

        let mut inst = existing.unwrap_or_else(|| Installation::new(&self.namespace, &name));
        let parent_name = b
            .parent_key
            .as_ref()
            .and_then(|k| plans.get(k))
            .map_or_else(|| root.name.clone(), |p| p.installation.clone());
        inst.labels
            .insert(LABEL_PARENT_INSTALLATION.to_string(), parent_name);
        if let Some(group) = &b.sharing_group {
            inst.labels.insert(LABEL_SHARING_GROUP.to_string(), group.clone());
        }
        inst.credential_sets.clone_from(&root.credential_sets);
        if let Some(reference) = &b.reference {
            inst.track_bundle(reference);
        }
        let overrides = ParameterOverrides::parse(&request.params)?;
        for (param, value) in overrides.for_dependency(alias) {
            inst.set_parameter(Strategy::literal(param, value));
        }

        // Outputs of sibling dependencies are only known now.
        let parent_key = b.parent_key.as_deref().unwrap_or(ROOT_KEY);
        let siblings: BTreeMap<String, BTreeMap<String, String>> =
            children_contexts(graph, parent_key, &progress.contexts)
                .into_iter()
                .map(|(alias, c)| (alias, c.outputs))
                .collect();
        let mut parameters = plan.parameters.clone();
        let mut credentials = plan.credentials.clone();
        wire_outputs(&b.parameters, &siblings, &mut parameters);
        wire_outputs(&b.credentials, &siblings, &mut credentials);

        let dependencies = children_contexts(graph, &b.key, &progress.contexts);
        let spec = RunSpec {
            action,
            bundle: &b.definition,
            reference: b.reference.as_ref(),
            relocation_map: &b.relocation_map,
            parameters: self
                .finalize_parameters(&b.definition, action, &inst.installation_ref(), &parameters, &dependencies)
                .map_err(|e| e.context(format!("dependency {alias}")))?,
            credentials: finalize_credentials(&b.definition, action, &credentials)
                .map_err(|e| e.context(format!("dependency {alias}")))?,
            dependencies,
        };
        let (_, result) = self.run_bundle(cancel, &mut inst, spec).await?;

        let mut context = progress
            .contexts
            .remove(&b.key)
            .unwrap_or_else(|| context_for(&b.definition, BTreeMap::new()));
        context.outputs.extend(output_strings(&result.outputs));
        progress.contexts.insert(b.key.clone(), context);
        progress.dependencies.push(DependencyOutcome {
            key: b.key.clone(),
            installation: name.clone(),
            status: Some(result.status),
        });

        if result.status != ResultStatus::Succeeded {
            return Err(PorterError::RunFailed {
                installation: inst.installation_ref().to_string(),
                action: action.to_string(),
                status: result.status.as_str().to_string(),
                message: result.message,
            });
        }
        if action == ACTION_UNINSTALL && request.delete && b.sharing_group.is_none() {
            self.store.remove_installation(&inst.namespace, &inst.name)?;
        }
        Ok(())
    }

    /// Why a dependency does not need to run, if it does not.
    fn skip_reason(
        request: &ActionRequest,
        node: &BundleNode,
        name: &str,
        existing: Option<&Installation>,
    ) -> Result<Option<&'static str>> {
        let action = request.action.as_str();
        if let (Some(group), Some(inst)) = (&node.sharing_group, existing)
            && inst.is_installed()
        {
            let recorded = inst.labels.get(LABEL_SHARING_GROUP);
            if recorded != Some(group) {
                return Err(PorterError::Validation(format!(
                    "installation {name} already exists outside of sharing group {group}"
                )));
            }
            return Ok(Some("shared with the group"));
        }
        if !node.definition.has_action(action) {
            return Ok(Some("action not defined by the dependency"));
        }
        match existing {
            Some(inst) if action == ACTION_INSTALL && inst.is_installed() && !request.force => {
                Ok(Some("already installed"))
            }
            Some(inst) if action == ACTION_UNINSTALL && inst.is_uninstalled() => {
                Ok(Some("already uninstalled"))
            }
            None if action == ACTION_UNINSTALL => Ok(Some("not installed")),
            None if action != ACTION_INSTALL => {
                Err(PorterError::not_found("installation", name.to_string()))
            }
            _ => Ok(None),
        }
    }

    /// Load what every dependency last produced, for actions that run the
    /// root before its dependencies.
    fn prefill_contexts(
        &self,
        graph: &BundleGraph,
        plans: &BTreeMap<String, NodePlan>,
        progress: &mut Progress,
    ) -> Result<()> {
        for node in graph.nodes() {
            let context = match node {
                Node::Installation(i) => self.installation_context(&i.namespace, &i.name)?,
                Node::Bundle(b) if b.is_root() => continue,
                Node::Bundle(b) => {
                    let name = plans.get(&b.key).map(|p| p.installation.as_str()).unwrap_or_default();
                    context_for(&b.definition, self.stored_outputs(&self.namespace, name)?)
                }
            };
            progress.contexts.insert(node.key().to_string(), context);
        }
        Ok(())
    }

    fn installation_context(&self, namespace: &str, name: &str) -> Result<DependencyContext> {
        let outputs = self.stored_outputs(namespace, name)?;
        match self.store.get_last_run(namespace, name) {
            Ok(run) => Ok(context_for(&run.bundle, outputs)),
            Err(e) if e.is_not_found() => Ok(DependencyContext {
                name: name.to_string(),
                outputs,
                ..DependencyContext::default()
            }),
            Err(e) => Err(e),
        }
    }

    fn stored_outputs(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let outputs = self.store.get_last_outputs(namespace, name)?;
        Ok(self
            .sanitizer
            .restore_outputs(&outputs)
            .into_iter()
            .filter(|o| o.name != OUTPUT_INVOCATION_IMAGE_LOGS)
            .map(|o| (o.name.clone(), o.value_string()))
            .collect())
    }

    // -------------------------------------------------------------------------
    // Running & recording
    // -------------------------------------------------------------------------

    fn persist_installation(&self, inst: &Installation, bundle: &ExtendedBundle) -> Result<()> {
        let mut stored = inst.clone();
        stored.parameters = self
            .sanitizer
            .clean_parameters(&inst.parameters, bundle, &inst.id)?;
        self.store.upsert_installation(&stored)
    }

    async fn run_bundle(
        &self,
        cancel: &CancellationToken,
        inst: &mut Installation,
        spec: RunSpec<'_>,
    ) -> Result<(Run, OperationResult)> {
        let mut run = inst.new_run(spec.action, spec.bundle.clone());
        if let Some(reference) = spec.reference {
            run.bundle_reference = reference.to_string();
            run.bundle_digest = reference.digest().unwrap_or_default().to_string();
        }
        run.parameter_overrides = self
            .sanitizer
            .clean_parameters(&inst.parameters, spec.bundle, &inst.id)?;
        run.parameters = self
            .sanitizer
            .clean_raw_parameters(&spec.parameters, spec.bundle, &run.id)?;
        let record = run.should_record();
        if record {
            self.persist_installation(inst, spec.bundle)?;
            self.store.insert_run(&run)?;
        }

        let operation = Operation {
            run_id: run.id.clone(),
            action: spec.action.to_string(),
            installation: inst.installation_ref(),
            bundle: spec.bundle.clone(),
            relocation_map: spec.relocation_map.clone(),
            parameters: spec.parameters,
            credentials: spec.credentials,
            dependencies: spec.dependencies,
            env: BTreeMap::new(),
        };
        let outcome = match self.driver.run(cancel, &operation).await {
            Ok(r) => r,
            Err(e) => {
                warn!(installation = %inst.installation_ref(), error = %e, "bundle could not be run");
                let mut r = OperationResult::succeeded();
                r.fail(&e);
                r
            }
        };

        if record {
            let mut result = run.new_result(outcome.status);
            result.message.clone_from(&outcome.message);
            self.store.insert_result(&result)?;
            for (name, value) in &outcome.outputs {
                let output = result.new_output(name.clone(), value.clone());
                self.store
                    .insert_output(&self.sanitizer.clean_output(&output, spec.bundle)?)?;
            }
            if !outcome.logs.is_empty() {
                let logs = result.new_output(OUTPUT_INVOCATION_IMAGE_LOGS, outcome.logs.clone().into_bytes());
                self.store.insert_output(&logs)?;
            }
            inst.apply_result(&run, &result);
            self.persist_installation(inst, spec.bundle)?;
        }
        info!(
            installation = %inst.installation_ref(),
            action = %run.action,
            status = %outcome.status,
            recorded = record,
            "run finished"
        );
        Ok((run, outcome))
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn require_parameter(bundle: &ExtendedBundle, name: &str) -> Result<()> {
    if bundle.parameters.contains_key(name) {
        return Ok(());
    }
    Err(PorterError::Validation(format!(
        "parameter {name} is not defined in bundle {}",
        bundle.name
    )))
}

fn strategy_values(strategies: &[Strategy]) -> BTreeMap<String, String> {
    strategies
        .iter()
        .map(|s| (s.name.clone(), s.value.clone()))
        .collect()
}

/// Typed values a child can be wired from: explicit values, else defaults.
fn parameter_view(
    bundle: &ExtendedBundle,
    explicit: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, JsonValue>> {
    let mut view = BTreeMap::new();
    for name in bundle.parameters.keys() {
        if let Some(raw) = explicit.get(name) {
            view.insert(name.clone(), bundle.convert_parameter_value(name, raw)?);
        } else if let Some(default) = bundle.parameter_default(name) {
            view.insert(name.clone(), default.clone());
        }
    }
    Ok(view)
}

fn finalize_credentials(
    bundle: &ExtendedBundle,
    action: &str,
    available: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    let mut missing = Vec::new();
    for (name, def) in &bundle.credentials {
        if !def.applies_to(action) {
            continue;
        }
        match available.get(name) {
            Some(v) => {
                values.insert(name.clone(), v.clone());
            }
            None if def.required => missing.push(name.as_str()),
            None => {}
        }
    }
    if !missing.is_empty() {
        return Err(PorterError::Validation(format!(
            "missing required credentials for {action} of {}: {}",
            bundle.name,
            missing.join(", ")
        )));
    }
    Ok(values)
}

fn wire_outputs(
    sources: &BTreeMap<String, DependencySource>,
    siblings: &BTreeMap<String, BTreeMap<String, String>>,
    values: &mut BTreeMap<String, String>,
) {
    let none = BTreeMap::new();
    for (name, source) in sources {
        if source.is_dependency_output()
            && let Some(v) = source.resolve(&BTreeMap::new(), &none, siblings)
        {
            values.insert(name.clone(), v);
        }
    }
}

fn context_for(bundle: &ExtendedBundle, outputs: BTreeMap<String, String>) -> DependencyContext {
    DependencyContext {
        name: bundle.name.clone(),
        version: bundle.version.clone(),
        description: bundle.description.clone().unwrap_or_default(),
        sensitive_outputs: bundle
            .outputs
            .keys()
            .filter(|o| bundle.is_output_sensitive(o))
            .cloned()
            .collect(),
        outputs,
    }
}

/// Contexts of the direct dependencies of `parent_key`, by alias.
fn children_contexts(
    graph: &BundleGraph,
    parent_key: &str,
    contexts: &BTreeMap<String, DependencyContext>,
) -> BTreeMap<String, DependencyContext> {
    graph
        .nodes()
        .filter(|n| n.parent_key() == Some(parent_key))
        .filter_map(|n| contexts.get(n.key()).map(|c| (n.alias().to_string(), c.clone())))
        .collect()
}

fn output_strings(outputs: &BTreeMap<String, Vec<u8>>) -> BTreeMap<String, String> {
    outputs
        .iter()
        .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::DependenciesV2;
    use crate::bundle::extensions::DEPENDENCIES_V2_KEY;
    use crate::bundle::tests::sample_bundle;
    use crate::cache::BundleCache;
    use crate::claims::StrategySet;
    use crate::primitives::SOURCE_SECRET;
    use crate::registry::InMemoryRegistry;
    use crate::secrets::{InMemorySecretStore, SecretStore};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Records every operation and answers from a script keyed by installation name.
    #[derive(Default)]
    struct ScriptedDriver {
        calls: Mutex<Vec<Operation>>,
        failing: BTreeSet<String>,
        /// Installations whose run is interrupted.
        canceling: BTreeSet<String>,
        outputs: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    }

    impl ScriptedDriver {
        fn calls(&self) -> Vec<Operation> {
            self.calls.lock().expect("lock").clone()
        }

        fn order(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|o| o.installation.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Driver for ScriptedDriver {
        async fn run(&self, cancel: &CancellationToken, operation: &Operation) -> Result<OperationResult> {
            self.calls.lock().expect("lock").push(operation.clone());
            let name = &operation.installation.name;
            if self.canceling.contains(name) {
                return Err(PorterError::Canceled);
            }
            let mut result = OperationResult::succeeded();
            result.logs = format!("running {}\n", operation.action);
            if cancel.is_cancelled() {
                result.fail(&PorterError::Canceled);
            } else if self.failing.contains(name) {
                result.fail(&PorterError::MixinFailure {
                    mixin: "exec".into(),
                    command: "install".into(),
                    stderr: "exit status 1".into(),
                });
            }
            result.outputs = self.outputs.get(name).cloned().unwrap_or_default();
            Ok(result)
        }
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<InstallationStore>,
        secrets: Arc<InMemorySecretStore>,
        registry: Arc<InMemoryRegistry>,
        driver: Arc<ScriptedDriver>,
        executor: ActionExecutor,
    }

    fn fixture(driver: ScriptedDriver) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(InstallationStore::new(Arc::new(MemoryStore::new())));
        let secrets = Arc::new(InMemorySecretStore::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let driver = Arc::new(driver);
        let executor = ActionExecutor::new(
            "",
            store.clone(),
            Sanitizer::new(secrets.clone()),
            BundleResolver::new(BundleCache::new(dir.path()), registry.clone()),
            driver.clone(),
        );
        Fixture {
            _dir: dir,
            store,
            secrets,
            registry,
            driver,
            executor,
        }
    }

    fn local(bundle: ExtendedBundle) -> BundleSource {
        BundleSource::Definition {
            bundle,
            reference: None,
        }
    }

    fn reference(s: &str) -> OCIReference {
        OCIReference::parse(s).expect("reference")
    }

    fn with_v2(mut bundle: ExtendedBundle, deps: serde_json::Value) -> ExtendedBundle {
        let deps: DependenciesV2 = serde_json::from_value(deps).expect("deps");
        bundle.bundle.required_extensions.push(DEPENDENCIES_V2_KEY.to_string());
        bundle
            .bundle
            .custom
            .insert(DEPENDENCIES_V2_KEY.to_string(), serde_json::to_value(deps).expect("json"));
        bundle
    }

    async fn install(f: &Fixture, request: ActionRequest) -> ActionOutcome {
        f.executor
            .execute(&CancellationToken::new(), &request)
            .await
            .expect("execute")
    }

    #[test]
    fn parses_parameter_overrides() {
        let raw = vec!["region=eu".to_string(), "mysql#password=x=y".to_string(), "region=ap".to_string()];
        let parsed = ParameterOverrides::parse(&raw).expect("parse");
        assert_eq!(parsed.root.get("region").map(String::as_str), Some("ap"));
        assert_eq!(
            parsed.for_dependency("mysql").get("password").map(String::as_str),
            Some("x=y")
        );
        for bad in ["region", "=eu", "#p=1", "mysql#=1"] {
            assert!(ParameterOverrides::parse(&[bad.to_string()]).is_err(), "{bad}");
        }
    }

    #[tokio::test]
    async fn fresh_install_is_recorded() {
        let f = fixture(ScriptedDriver::default());
        let outcome = install(
            &f,
            ActionRequest::new("install", "mybun").with_source(local(sample_bundle())),
        )
        .await;
        assert!(outcome.succeeded());
        assert!(outcome.recorded);

        let inst = f.store.get_installation("", "mybun").expect("installation");
        assert!(inst.status.installation_completed);
        let runs = f.store.list_runs("", "mybun").expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].action, "install");
        let results = f.store.list_results(&runs[0].id).expect("results");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ResultStatus::Succeeded);
        assert_eq!(
            f.store.get_logs("", "mybun").expect("logs").as_deref(),
            Some("running install\n")
        );
    }

    #[tokio::test]
    async fn failed_install_is_recorded_as_failed() {
        let f = fixture(ScriptedDriver {
            failing: BTreeSet::from(["mybun".to_string()]),
            ..ScriptedDriver::default()
        });
        let outcome = install(
            &f,
            ActionRequest::new("install", "mybun").with_source(local(sample_bundle())),
        )
        .await;
        assert_eq!(outcome.status, ResultStatus::Failed);
        assert!(matches!(outcome.check(), Err(PorterError::RunFailed { .. })));

        let inst = f.store.get_installation("", "mybun").expect("installation");
        assert!(!inst.status.installation_completed);
        let run = f.store.get_last_run("", "mybun").expect("run");
        assert_eq!(f.store.run_status(&run.id).expect("status"), ResultStatus::Failed);
    }

    #[tokio::test]
    async fn repeated_install_requires_force() {
        let f = fixture(ScriptedDriver::default());
        let request = ActionRequest::new("install", "mybun").with_source(local(sample_bundle()));
        install(&f, request.clone()).await;

        let err = f
            .executor
            .execute(&CancellationToken::new(), &request)
            .await
            .expect_err("second install");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("already been successfully installed")));

        let forced = ActionRequest {
            force: true,
            ..request
        };
        assert!(install(&f, forced).await.succeeded());
        assert_eq!(f.store.list_runs("", "mybun").expect("runs").len(), 2);
    }

    #[tokio::test]
    async fn sensitive_overrides_are_persisted_as_secrets() {
        let f = fixture(ScriptedDriver::default());
        install(
            &f,
            ActionRequest::new("install", "mybun")
                .with_source(local(sample_bundle()))
                .with_params(["password=s3cret", "region=eu"]),
        )
        .await;

        let inst = f.store.get_installation("", "mybun").expect("installation");
        let password = inst
            .parameters
            .iter()
            .find(|p| p.name == "password")
            .expect("password override");
        assert!(password.is_secret());
        assert_eq!(
            f.secrets.resolve(SOURCE_SECRET, &password.source.value).expect("secret"),
            "s3cret"
        );
        let run = f.store.get_last_run("", "mybun").expect("run");
        let stored = run.parameters.iter().find(|p| p.name == "password").expect("run param");
        assert_eq!(stored.source.value, format!("{}password", run.id));

        // The next action picks the persisted overrides back up.
        install(&f, ActionRequest::new("upgrade", "mybun").with_source(local(sample_bundle()))).await;
        let upgrade = f.driver.calls().pop().expect("upgrade call");
        assert_eq!(upgrade.parameters.get("password"), Some(&json!("s3cret")));
        assert_eq!(upgrade.parameters.get("region"), Some(&json!("eu")));
        assert_eq!(upgrade.parameters.get("replicas"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn params_override_parameter_sets() {
        let f = fixture(ScriptedDriver::default());
        let mut set = StrategySet::new("", "prod");
        set.entries = vec![
            Strategy::literal("region", "eu"),
            Strategy::literal("replicas", "5"),
        ];
        f.store.apply_set(SetKind::Parameters, &set).expect("apply");

        let request = ActionRequest {
            parameter_sets: vec!["prod".into()],
            ..ActionRequest::new("install", "mybun")
                .with_source(local(sample_bundle()))
                .with_params(["region=ap"])
        };
        install(&f, request).await;
        let call = f.driver.calls().pop().expect("call");
        assert_eq!(call.parameters.get("region"), Some(&json!("ap")));
        assert_eq!(call.parameters.get("replicas"), Some(&json!(5)));
    }

    #[tokio::test]
    async fn missing_required_parameter_is_rejected() {
        let f = fixture(ScriptedDriver::default());
        let mut bundle = sample_bundle();
        if let Some(p) = bundle.bundle.parameters.get_mut("password") {
            p.required = true;
        }
        let err = f
            .executor
            .execute(
                &CancellationToken::new(),
                &ActionRequest::new("install", "mybun").with_source(local(bundle)),
            )
            .await
            .expect_err("missing password");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("password")));
        assert!(f.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_parameter_is_rejected() {
        let f = fixture(ScriptedDriver::default());
        let err = f
            .executor
            .execute(
                &CancellationToken::new(),
                &ActionRequest::new("install", "mybun")
                    .with_source(local(sample_bundle()))
                    .with_params(["colour=blue"]),
            )
            .await
            .expect_err("unknown parameter");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("colour")));
    }

    #[tokio::test]
    async fn stateless_action_leaves_no_records() {
        let f = fixture(ScriptedDriver::default());
        let outcome = install(
            &f,
            ActionRequest::new("status", "mybun").with_source(local(sample_bundle())),
        )
        .await;
        assert!(outcome.succeeded());
        assert!(!outcome.recorded);
        assert!(f.store.get_installation("", "mybun").expect_err("none").is_not_found());
    }

    #[tokio::test]
    async fn upgrade_requires_an_installation() {
        let f = fixture(ScriptedDriver::default());
        let err = f
            .executor
            .execute(
                &CancellationToken::new(),
                &ActionRequest::new("upgrade", "mybun").with_source(local(sample_bundle())),
            )
            .await
            .expect_err("not installed");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn canceled_run_is_recorded() {
        let f = fixture(ScriptedDriver {
            canceling: BTreeSet::from(["mybun".to_string()]),
            ..ScriptedDriver::default()
        });
        let outcome = install(
            &f,
            ActionRequest::new("install", "mybun").with_source(local(sample_bundle())),
        )
        .await;
        assert_eq!(outcome.status, ResultStatus::Canceled);
        let run = f.store.get_last_run("", "mybun").expect("run");
        assert_eq!(f.store.run_status(&run.id).expect("status"), ResultStatus::Canceled);
        assert!(!f.store.get_installation("", "mybun").expect("installation").is_installed());
    }

    #[tokio::test]
    async fn canceled_before_start_runs_nothing() {
        let f = fixture(ScriptedDriver::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f
            .executor
            .execute(
                &cancel,
                &ActionRequest::new("install", "mybun").with_source(local(sample_bundle())),
            )
            .await
            .expect_err("canceled");
        assert!(err.is_canceled());
        assert!(f.driver.calls().is_empty());
    }

    fn mysql_bundle() -> ExtendedBundle {
        let mut b = sample_bundle();
        b.bundle.name = "mysql".into();
        b
    }

    fn wordpress() -> ExtendedBundle {
        let mut root = with_v2(
            sample_bundle(),
            json!({"requires": {"mysql": {
                "bundle": "getporter/mysql:v5.7.1",
                "parameters": {"region": {"parameter": "region"}}
            }}}),
        );
        root.bundle.name = "wordpress".into();
        root
    }

    fn dependency_fixture(failing: &[&str]) -> Fixture {
        let mut outputs = BTreeMap::new();
        outputs.insert(
            "wordpress-mysql".to_string(),
            BTreeMap::from([("endpoint".to_string(), b"mysql.local".to_vec())]),
        );
        let f = fixture(ScriptedDriver {
            failing: failing.iter().map(ToString::to_string).collect(),
            outputs,
            ..ScriptedDriver::default()
        });
        f.registry
            .publish(&reference("getporter/mysql:v5.7.1"), mysql_bundle())
            .expect("publish");
        f
    }

    #[tokio::test]
    async fn dependencies_run_first_and_feed_the_root() {
        let f = dependency_fixture(&[]);
        let outcome = install(
            &f,
            ActionRequest::new("install", "wordpress")
                .with_source(local(wordpress()))
                .with_params(["region=eu", "mysql#replicas=3"]),
        )
        .await;
        assert!(outcome.succeeded());
        assert_eq!(f.driver.order(), vec!["wordpress-mysql", "wordpress"]);
        assert_eq!(outcome.dependencies.len(), 1);
        assert_eq!(outcome.dependencies[0].status, Some(ResultStatus::Succeeded));

        let calls = f.driver.calls();
        assert_eq!(calls[0].parameters.get("region"), Some(&json!("eu")));
        assert_eq!(calls[0].parameters.get("replicas"), Some(&json!(3)));
        let mysql = calls[1].dependencies.get("mysql").expect("mysql context");
        assert_eq!(mysql.name, "mysql");
        assert_eq!(mysql.outputs.get("endpoint").map(String::as_str), Some("mysql.local"));
        assert!(mysql.sensitive_outputs.contains("token"));

        let dep = f.store.get_installation("", "wordpress-mysql").expect("dependency");
        assert!(dep.is_installed());
        assert_eq!(
            dep.labels.get(LABEL_PARENT_INSTALLATION).map(String::as_str),
            Some("wordpress")
        );
        assert_eq!(dep.bundle.repository, "getporter/mysql");
    }

    #[tokio::test]
    async fn failed_dependency_stops_the_action() {
        let f = dependency_fixture(&["wordpress-mysql"]);
        let err = f
            .executor
            .execute(
                &CancellationToken::new(),
                &ActionRequest::new("install", "wordpress").with_source(local(wordpress())),
            )
            .await
            .expect_err("dependency failed");
        assert!(matches!(err, PorterError::RunFailed { ref installation, .. } if installation.contains("wordpress-mysql")));
        assert_eq!(f.driver.order(), vec!["wordpress-mysql"]);
    }

    #[tokio::test]
    async fn uninstall_runs_root_first_and_deletes() {
        let f = dependency_fixture(&[]);
        install(
            &f,
            ActionRequest::new("install", "wordpress").with_source(local(wordpress())),
        )
        .await;

        let request = ActionRequest {
            delete: true,
            ..ActionRequest::new("uninstall", "wordpress").with_source(local(wordpress()))
        };
        let outcome = install(&f, request).await;
        assert!(outcome.succeeded());
        assert_eq!(
            f.driver.order(),
            vec!["wordpress-mysql", "wordpress", "wordpress", "wordpress-mysql"]
        );
        // The root sees what the dependency produced when it was installed.
        let root_call = &f.driver.calls()[2];
        assert_eq!(
            root_call.dependencies.get("mysql").and_then(|d| d.outputs.get("endpoint")).map(String::as_str),
            Some("mysql.local")
        );
        assert!(f.store.get_installation("", "wordpress").expect_err("deleted").is_not_found());
        assert!(f.store.get_installation("", "wordpress-mysql").expect_err("deleted").is_not_found());
    }

    #[tokio::test]
    async fn installed_dependency_is_not_reinstalled() {
        let f = dependency_fixture(&[]);
        install(
            &f,
            ActionRequest::new("install", "wordpress").with_source(local(wordpress())),
        )
        .await;
        f.store.remove_installation("", "wordpress").expect("remove root");

        let outcome = install(
            &f,
            ActionRequest::new("install", "wordpress").with_source(local(wordpress())),
        )
        .await;
        assert!(outcome.succeeded());
        assert_eq!(outcome.dependencies[0].status, None);
        assert_eq!(f.driver.order(), vec!["wordpress-mysql", "wordpress", "wordpress"]);
        let root_call = f.driver.calls().pop().expect("root");
        assert_eq!(
            root_call.dependencies.get("mysql").and_then(|d| d.outputs.get("endpoint")).map(String::as_str),
            Some("mysql.local")
        );
    }

    #[tokio::test]
    async fn unknown_dependency_override_is_rejected() {
        let f = dependency_fixture(&[]);
        let err = f
            .executor
            .execute(
                &CancellationToken::new(),
                &ActionRequest::new("install", "wordpress")
                    .with_source(local(wordpress()))
                    .with_params(["redis#replicas=2"]),
            )
            .await
            .expect_err("unknown dependency");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("redis")));
    }
}
