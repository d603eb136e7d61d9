//! # Mixin Runtime
//!
//! Mixins are executables under `<mixins>/<name>/<name>` that implement a
//! fixed command surface:
//!
//! | Command | stdin | stdout |
//! |---------|-------|--------|
//! | `version --output json` | none | metadata JSON |
//! | `schema` | none | JSON schema of the step body |
//! | `build` | mixin input YAML | Dockerfile fragment |
//! | `lint` | mixin input YAML | JSON lint results |
//! | `install`, `upgrade`, `uninstall` | step YAML | `KEY=VALUE` outputs |
//! | `invoke --action <name>` | step YAML | `KEY=VALUE` outputs |
//!
//! The mixin input for `build` and `lint` carries the mixin's config from
//! the manifest and, per action, only the steps addressed to that mixin.

pub mod outputs;
pub mod runner;

pub use outputs::{
    Censor, CensoredWriter, evaluate_step_outputs, parse_output_assignments, select_json_path,
};
pub use runner::{InvocationState, MixinCommand, MixinExecution, MixinRunner, StepExecution};

use crate::manifest::{Manifest, Step};
use crate::types::{PorterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// METADATA
// =============================================================================

/// What `version --output json` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MixinMetadata {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub commit: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
}

/// The payload of `build` and `lint`.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct MixinInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<JsonValue>,
    pub actions: BTreeMap<String, Vec<Step>>,
}

impl MixinInput {
    /// The config and steps of `manifest` addressed to `mixin`.
    pub fn for_mixin(manifest: &Manifest, mixin: &str) -> Self {
        let config = manifest
            .mixins
            .iter()
            .find(|m| m.name == mixin)
            .and_then(|m| m.config.clone());
        let mut actions = BTreeMap::new();
        let mut add = |action: &str, steps: &[Step]| {
            let mine: Vec<Step> = steps
                .iter()
                .filter(|s| s.mixin_name().is_ok_and(|n| n == mixin))
                .cloned()
                .collect();
            actions.insert(action.to_string(), mine);
        };
        for (action, steps) in [
            ("install", &manifest.install),
            ("upgrade", &manifest.upgrade),
            ("uninstall", &manifest.uninstall),
        ] {
            if let Some(steps) = steps {
                add(action, steps);
            }
        }
        for (action, steps) in &manifest.actions {
            add(action, steps);
        }
        Self { config, actions }
    }
}

// =============================================================================
// LINT
// =============================================================================

/// Severity of a lint result. Encoded as `0` (error) or `2` (warning).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintLevel {
    Error,
    Warning,
}

impl Serialize for LintLevel {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_i64(match self {
            LintLevel::Error => 0,
            LintLevel::Warning => 2,
        })
    }
}

impl<'de> Deserialize<'de> for LintLevel {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        match i64::deserialize(d)? {
            0 => Ok(LintLevel::Error),
            2 => Ok(LintLevel::Warning),
            other => Err(serde::de::Error::custom(format!("unknown lint level {other}"))),
        }
    }
}

impl fmt::Display for LintLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warning => "warning",
        })
    }
}

/// Line and column of a lint result in the manifest, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct LintLocation {
    pub line: usize,
    pub column: usize,
}

/// One finding reported by a mixin's `lint` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LintResult {
    pub level: LintLevel,
    /// Text that locates the problem in the manifest.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub location: LintLocation,
    pub code: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "URL")]
    pub url: String,
}

impl fmt::Display for LintResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}({}) - {}", self.level, self.code, self.title)?;
        writeln!(
            f,
            "Location in manifest: Line: {}, Column: {}",
            self.location.line, self.location.column
        )?;
        if !self.message.is_empty() {
            writeln!(f, "{}", self.message)?;
        }
        if !self.url.is_empty() {
            writeln!(f, "See {} for more information", self.url)?;
        }
        writeln!(f, "---")
    }
}

pub fn has_lint_error(results: &[LintResult]) -> bool {
    results.iter().any(|r| r.level == LintLevel::Error)
}

/// First line and column where `key` appears in `text`.
fn locate(text: &str, key: &str) -> LintLocation {
    if key.is_empty() {
        return LintLocation::default();
    }
    text.lines()
        .enumerate()
        .find_map(|(i, line)| {
            line.find(key).map(|col| LintLocation {
                line: i + 1,
                column: col + 1,
            })
        })
        .unwrap_or_default()
}

// =============================================================================
// QUERIES
// =============================================================================

impl MixinRunner {
    /// Names of installed mixins, sorted.
    pub fn list_installed(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(self.mixins_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PorterError::Io(format!(
                    "unable to list mixins in {}: {e}",
                    self.mixins_dir().display()
                )));
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if entry.path().is_dir() && self.executable(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn version(&self, cancel: &CancellationToken, mixin: &str) -> Result<MixinMetadata> {
        let stdout = self
            .run(
                cancel,
                mixin,
                &MixinCommand::new(["version", "--output", "json"]),
                &Censor::default(),
            )
            .await?
            .into_stdout()?;
        let mut meta: MixinMetadata = serde_json::from_slice(&stdout)
            .map_err(|e| PorterError::Serialization(format!("invalid version output from mixin {mixin}: {e}")))?;
        if meta.name.is_empty() {
            meta.name = mixin.to_string();
        }
        Ok(meta)
    }

    /// The JSON schema the mixin publishes for its step body.
    pub async fn schema(&self, cancel: &CancellationToken, mixin: &str) -> Result<JsonValue> {
        let stdout = self
            .run(cancel, mixin, &MixinCommand::new(["schema"]), &Censor::default())
            .await?
            .into_stdout()?;
        serde_json::from_slice(&stdout)
            .map_err(|e| PorterError::Serialization(format!("invalid schema from mixin {mixin}: {e}")))
    }

    /// Dockerfile fragments from `build`, one per mixin in manifest order.
    ///
    /// Every mixin must answer.
    pub async fn build_fragments(
        &self,
        cancel: &CancellationToken,
        manifest: &Manifest,
    ) -> Result<Vec<Vec<u8>>> {
        let mut fragments = Vec::with_capacity(manifest.mixins.len());
        for decl in &manifest.mixins {
            let input = serde_yaml::to_string(&MixinInput::for_mixin(manifest, &decl.name))?;
            let stdout = self
                .run(
                    cancel,
                    &decl.name,
                    &MixinCommand::new(["build"]).with_input(input),
                    &Censor::default(),
                )
                .await?
                .into_stdout()
                .map_err(|e| e.context("unable to build the invocation image"))?;
            fragments.push(stdout);
        }
        Ok(fragments)
    }

    /// Lint results from every mixin that implements `lint`.
    ///
    /// Mixins that fail or do not answer are skipped, since `lint` is an
    /// optional command. Locations are found by searching `manifest_text`
    /// for each result's key.
    pub async fn lint(
        &self,
        cancel: &CancellationToken,
        manifest: &Manifest,
        manifest_text: &str,
    ) -> Result<Vec<LintResult>> {
        let mut results = Vec::new();
        for decl in &manifest.mixins {
            let input = serde_yaml::to_string(&MixinInput::for_mixin(manifest, &decl.name))?;
            let execution = self
                .run(
                    cancel,
                    &decl.name,
                    &MixinCommand::new(["lint"]).with_input(input),
                    &Censor::default(),
                )
                .await;
            let stdout = match execution.and_then(MixinExecution::into_stdout) {
                Ok(stdout) => stdout,
                Err(PorterError::Canceled) => return Err(PorterError::Canceled),
                Err(e) => {
                    debug!(mixin = %decl.name, error = %e, "mixin did not lint");
                    continue;
                }
            };
            if stdout.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let mut found: Vec<LintResult> = serde_json::from_slice(&stdout).map_err(|e| {
                PorterError::Serialization(format!(
                    "unable to parse lint response from mixin {:?}: {e}",
                    decl.name
                ))
            })?;
            for r in &mut found {
                r.location = locate(manifest_text, &r.key);
            }
            results.extend(found);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;

    #[test]
    fn input_filters_steps_per_mixin() {
        let mut m = sample_manifest();
        m.install = Some(vec![
            Step::from_yaml("exec:\n  command: a\n").expect("step"),
            Step::from_yaml("helm3:\n  chart: b\n").expect("step"),
        ]);
        let helm = MixinInput::for_mixin(&m, "helm3");
        assert!(helm.config.is_some());
        assert_eq!(helm.actions["install"].len(), 1);
        assert!(helm.actions["uninstall"].is_empty());
        assert!(helm.actions.contains_key("status"));

        let exec = MixinInput::for_mixin(&m, "exec");
        assert!(exec.config.is_none());
        assert_eq!(exec.actions["install"].len(), 1);
    }

    #[test]
    fn lint_results_parse() {
        let raw = r#"[{"Level":0,"Key":"bash -c","Code":"exec-100","Title":"bash -c argument","Message":"quote it","URL":"https://example.com"}]"#;
        let results: Vec<LintResult> = serde_json::from_str(raw).expect("parse");
        assert_eq!(results[0].level, LintLevel::Error);
        assert!(has_lint_error(&results));
        let text = results[0].to_string();
        assert!(text.starts_with("error(exec-100) - bash -c argument"));
        assert!(text.contains("See https://example.com"));
        assert!(serde_json::from_str::<Vec<LintResult>>(r#"[{"Level":7,"Code":"x"}]"#).is_err());
    }

    #[test]
    fn locate_key() {
        let text = "name: x\ninstall:\n  - exec:\n      command: bash -c\n";
        assert_eq!(locate(text, "bash -c"), LintLocation { line: 4, column: 16 });
        assert_eq!(locate(text, "nowhere"), LintLocation::default());
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use crate::mixin::runner::tests::install_mixin;

        #[test]
        fn lists_installed_mixins() {
            let dir = tempfile::tempdir().expect("tempdir");
            install_mixin(dir.path(), "helm3", "exit 0");
            install_mixin(dir.path(), "exec", "exit 0");
            std::fs::create_dir_all(dir.path().join("empty")).expect("dir");
            let r = MixinRunner::new(dir.path());
            assert_eq!(r.list_installed().expect("list"), vec!["exec", "helm3"]);
            assert!(
                MixinRunner::new(dir.path().join("absent"))
                    .list_installed()
                    .expect("list")
                    .is_empty()
            );
        }

        #[tokio::test]
        async fn version_and_fragments() {
            let dir = tempfile::tempdir().expect("tempdir");
            install_mixin(
                dir.path(),
                "exec",
                r#"case "$1" in
  version) echo '{"name":"exec","version":"v1.2.0","author":"Porter Authors"}' ;;
  build) cat > /dev/null; echo "RUN apt-get install -y curl" ;;
  lint) cat > /dev/null; echo '[{"Level":2,"Key":"command: a","Code":"exec-1","Title":"t"}]' ;;
esac"#,
            );
            install_mixin(dir.path(), "helm3", r#"cat > /dev/null; [ "$1" = build ] && echo "RUN helm" ; [ "$1" = lint ] && exit 1; exit 0"#);
            let r = MixinRunner::new(dir.path());
            let cancel = CancellationToken::new();

            let meta = r.version(&cancel, "exec").await.expect("version");
            assert_eq!(meta.version, "v1.2.0");

            let mut m = sample_manifest();
            m.install = Some(vec![Step::from_yaml("exec:\n  command: a\n").expect("step")]);
            let fragments = r.build_fragments(&cancel, &m).await.expect("build");
            assert_eq!(fragments.len(), 2);
            assert_eq!(fragments[0], b"RUN apt-get install -y curl\n");
            assert_eq!(fragments[1], b"RUN helm\n");

            let text = "install:\n  - exec:\n      command: a\n";
            let lint = r.lint(&cancel, &m, text).await.expect("lint");
            assert_eq!(lint.len(), 1);
            assert_eq!(lint[0].level, LintLevel::Warning);
            assert_eq!(lint[0].location.line, 3);
        }
    }
}
