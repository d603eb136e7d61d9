//! # Runtime
//!
//! The seam between the action executor and whatever actually runs a
//! bundle. A `Driver` receives the fully resolved inputs of one action and
//! reports how it ended plus the outputs it produced.
//!
//! `HostDriver` runs the manifest embedded in the bundle directly on the
//! host, one step at a time through the mixin runner.

use crate::bundle::ExtendedBundle;
use crate::cache::RelocationMapping;
use crate::claims::ResultStatus;
use crate::manifest::resolver::{DependencyContext, RuntimeContext, StepResolver};
use crate::manifest::{MANIFEST_FILE, Manifest, Steps};
use crate::mixin::{Censor, MixinRunner};
use crate::primitives::is_builtin_action;
use crate::types::{InstallationRef, PorterError, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// =============================================================================
// DRIVER CONTRACT
// =============================================================================

/// Everything a driver needs to run one action.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Operation {
    pub run_id: String,
    pub action: String,
    pub installation: InstallationRef,
    pub bundle: ExtendedBundle,
    pub relocation_map: RelocationMapping,
    pub parameters: BTreeMap<String, JsonValue>,
    pub credentials: BTreeMap<String, String>,
    /// Outputs of the dependencies that already ran, by alias.
    pub dependencies: BTreeMap<String, DependencyContext>,
    pub env: BTreeMap<String, String>,
}

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub status: ResultStatus,
    pub message: String,
    /// Bundle outputs produced by the action.
    pub outputs: BTreeMap<String, Vec<u8>>,
    /// Combined mixin output with sensitive values censored.
    pub logs: String,
}

impl OperationResult {
    pub fn succeeded() -> Self {
        Self {
            status: ResultStatus::Succeeded,
            message: String::new(),
            outputs: BTreeMap::new(),
            logs: String::new(),
        }
    }

    /// Record `err` as the reason the operation stopped.
    pub fn fail(&mut self, err: &PorterError) {
        self.status = if err.is_canceled() {
            ResultStatus::Canceled
        } else {
            ResultStatus::Failed
        };
        self.message = err.to_string();
    }
}

/// Runs bundles.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run `operation`. An `Err` means the driver could not run it at all;
    /// a run that started and failed is reported in the result.
    async fn run(&self, cancel: &CancellationToken, operation: &Operation) -> Result<OperationResult>;
}

// =============================================================================
// HOST DRIVER
// =============================================================================

/// Runs the bundle's embedded manifest through local mixins.
#[derive(Debug, Clone)]
pub struct HostDriver {
    runner: MixinRunner,
    work_root: PathBuf,
}

impl HostDriver {
    /// Runs execute in per-run directories under `work_root`.
    pub fn new(runner: MixinRunner, work_root: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            work_root: work_root.into(),
        }
    }

    pub fn runner(&self) -> &MixinRunner {
        &self.runner
    }

    fn load_manifest(bundle: &ExtendedBundle) -> Result<Manifest> {
        let data = bundle.embedded_manifest()?.ok_or_else(|| {
            PorterError::Validation(format!(
                "bundle {} does not embed a porter manifest and cannot run on the host",
                bundle.name
            ))
        })?;
        Manifest::from_yaml(&data)
    }

    fn steps(manifest: &Manifest, action: &str) -> Result<Steps> {
        match manifest.steps_for(action) {
            Ok(steps) => Ok(steps.clone()),
            // Built-in actions without steps have nothing to do.
            Err(_) if is_builtin_action(action) => Ok(Steps::new()),
            Err(e) => Err(e),
        }
    }

    async fn prepare_dir(&self, operation: &Operation, manifest: &Manifest) -> Result<PathBuf> {
        let dir = self.work_root.join(&operation.run_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            PorterError::Io(format!("unable to create working directory {}: {e}", dir.display()))
        })?;
        let text = serde_yaml::to_string(manifest)?;
        tokio::fs::write(dir.join(MANIFEST_FILE), text).await?;
        Ok(dir)
    }

    async fn cleanup(dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "unable to remove working directory");
        }
    }
}

#[async_trait]
impl Driver for HostDriver {
    async fn run(&self, cancel: &CancellationToken, operation: &Operation) -> Result<OperationResult> {
        let manifest = Self::load_manifest(&operation.bundle)?;
        let steps = Self::steps(&manifest, &operation.action)?;
        let dir = self.prepare_dir(operation, &manifest).await?;

        let context = RuntimeContext {
            installation: operation.installation.clone(),
            action: operation.action.clone(),
            parameters: operation.parameters.clone(),
            credentials: operation.credentials.clone(),
            dependencies: operation.dependencies.clone(),
            relocation_map: operation.relocation_map.clone(),
            env: operation.env.clone(),
        };
        let mut resolver = StepResolver::new(&manifest, &operation.bundle, context);
        let mut result = OperationResult::succeeded();
        let mut raw_logs = String::new();

        info!(
            installation = %operation.installation,
            action = %operation.action,
            steps = steps.len(),
            "running bundle on host"
        );
        for step in &steps {
            if cancel.is_cancelled() {
                result.fail(&PorterError::Canceled);
                break;
            }
            let resolved = match resolver.resolve_step(step) {
                Ok(s) => s,
                Err(e) => {
                    result.fail(&e);
                    break;
                }
            };
            let censor = Censor::new(resolver.sensitive_values());
            match self
                .runner
                .execute_step(cancel, &operation.action, &resolved, &dir, &censor)
                .await
            {
                Ok(step_run) => {
                    raw_logs.push_str(&step_run.execution.stdout_string());
                    raw_logs.push_str(&String::from_utf8_lossy(&step_run.execution.stderr));
                    resolver.apply_step_outputs(step_run.outputs);
                    if let Err(e) = step_run.execution.check() {
                        result.fail(&e);
                        break;
                    }
                }
                Err(e) => {
                    result.fail(&e);
                    break;
                }
            }
        }

        // Sensitive values can surface late, so censor the whole log once.
        result.logs = Censor::new(resolver.sensitive_values()).apply(&raw_logs);
        for (name, def) in &operation.bundle.outputs {
            if !def.applies_to(&operation.action) {
                continue;
            }
            if let Some(value) = resolver.outputs().get(name) {
                result.outputs.insert(name.clone(), value.clone().into_bytes());
            }
        }
        debug!(
            status = %result.status.as_str(),
            outputs = result.outputs.len(),
            "host run finished"
        );

        Self::cleanup(&dir).await;
        Ok(result)
    }
}
