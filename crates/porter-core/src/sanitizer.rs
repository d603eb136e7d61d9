//! # Sanitizer
//!
//! Keeps sensitive values out of the document store.
//!
//! On write, every parameter or output the bundle declares `writeOnly` is
//! sent to the secret backend under the key `<id><name>` and replaced by a
//! `{source: "secret", value: "<id><name>"}` reference. On read the
//! references are resolved back into the in-memory record.

use crate::bundle::ExtendedBundle;
use crate::claims::{Output, StrategySet};
use crate::primitives::{SOURCE_SECRET, SOURCE_VALUE};
use crate::secrets::{SecretStore, Strategy, resolve_strategy};
use crate::types::Result;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Moves sensitive values between records and the secret backend.
#[derive(Clone)]
pub struct Sanitizer {
    secrets: Arc<dyn SecretStore>,
}

impl std::fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sanitizer").finish_non_exhaustive()
    }
}

impl Sanitizer {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    pub fn secrets(&self) -> &Arc<dyn SecretStore> {
        &self.secrets
    }

    /// Turn raw parameter values into storable strategies.
    ///
    /// `id` is the run or installation id used to derive secret keys.
    pub fn clean_raw_parameters(
        &self,
        params: &BTreeMap<String, JsonValue>,
        bundle: &ExtendedBundle,
        id: &str,
    ) -> Result<Vec<Strategy>> {
        let mut strategies = Vec::with_capacity(params.len());
        for (name, value) in params {
            let plaintext = bundle.write_parameter_to_string(name, value)?;
            strategies.push(Strategy {
                value: plaintext.clone(),
                ..Strategy::literal(name.clone(), plaintext)
            });
        }
        self.clean_parameters(&strategies, bundle, id)
    }

    /// Redirect the sensitive entries of already-built strategies.
    ///
    /// Strategies that reference a source other than a literal are stored
    /// as given.
    pub fn clean_parameters(
        &self,
        strategies: &[Strategy],
        bundle: &ExtendedBundle,
        id: &str,
    ) -> Result<Vec<Strategy>> {
        let mut cleaned = Vec::with_capacity(strategies.len());
        for s in strategies {
            if !bundle.is_sensitive_parameter(&s.name) || s.source.key != SOURCE_VALUE {
                cleaned.push(Strategy {
                    value: String::new(),
                    ..s.clone()
                });
                continue;
            }
            let key = secret_key(id, &s.name);
            let plaintext = if s.value.is_empty() {
                s.source.value.as_str()
            } else {
                s.value.as_str()
            };
            self.secrets
                .create(SOURCE_SECRET, &key, plaintext)
                .map_err(|e| e.context(format!("unable to save sensitive parameter {}", s.name)))?;
            debug!(parameter = %s.name, "moved sensitive parameter to secret store");
            cleaned.push(Strategy::secret(s.name.clone(), key));
        }
        Ok(cleaned)
    }

    /// Resolve every strategy of a set into its plaintext value.
    pub fn restore_parameter_set(&self, set: &StrategySet) -> Result<StrategySet> {
        let mut restored = set.clone();
        for s in &mut restored.entries {
            s.value = resolve_strategy(self.secrets.as_ref(), s)
                .map_err(|e| e.context(format!("unable to resolve set {}", set.name)))?;
        }
        Ok(restored)
    }

    /// Resolve stored parameter strategies back into plaintext.
    pub fn restore_parameters(&self, strategies: &[Strategy]) -> Result<Vec<Strategy>> {
        strategies
            .iter()
            .map(|s| {
                Ok(Strategy {
                    value: resolve_strategy(self.secrets.as_ref(), s)?,
                    ..s.clone()
                })
            })
            .collect()
    }

    /// Prepare an output for storage. Sensitive values move to the secret
    /// backend under `<runId><name>` and the stored value is emptied.
    pub fn clean_output(&self, output: &Output, bundle: &ExtendedBundle) -> Result<Output> {
        if !bundle.is_output_sensitive(&output.name) {
            return Ok(output.clone());
        }
        let key = secret_key(&output.run_id, &output.name);
        let plaintext = String::from_utf8_lossy(&output.value);
        self.secrets
            .create(SOURCE_SECRET, &key, &plaintext)
            .map_err(|e| e.context(format!("unable to save sensitive output {}", output.name)))?;
        Ok(Output {
            value: Vec::new(),
            key,
            ..output.clone()
        })
    }

    /// Materialize a stored output. A secret that cannot be read yields an
    /// empty value and a warning rather than an error.
    pub fn restore_output(&self, output: &Output) -> Output {
        if output.key.is_empty() {
            return output.clone();
        }
        match self.secrets.resolve(SOURCE_SECRET, &output.key) {
            Ok(value) => Output {
                value: value.into_bytes(),
                ..output.clone()
            },
            Err(e) => {
                warn!(output = %output.name, error = %e, "unable to resolve sensitive output");
                Output {
                    value: Vec::new(),
                    ..output.clone()
                }
            }
        }
    }

    pub fn restore_outputs(&self, outputs: &[Output]) -> Vec<Output> {
        outputs.iter().map(|o| self.restore_output(o)).collect()
    }
}

/// The secret key for a sensitive value owned by record `id`.
pub fn secret_key(id: &str, name: &str) -> String {
    format!("{id}{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;
    use crate::claims::{Installation, ResultStatus};
    use crate::secrets::InMemorySecretStore;
    use serde_json::json;

    fn sanitizer() -> (Sanitizer, Arc<InMemorySecretStore>) {
        let secrets = Arc::new(InMemorySecretStore::new());
        (Sanitizer::new(secrets.clone()), secrets)
    }

    #[test]
    fn sensitive_parameters_become_references() {
        let (s, secrets) = sanitizer();
        let mut params = BTreeMap::new();
        params.insert("password".to_string(), json!("s3cret"));
        params.insert("region".to_string(), json!("us"));

        let cleaned = s
            .clean_raw_parameters(&params, &sample_bundle(), "RUN123")
            .expect("clean");
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].name, "password");
        assert_eq!(cleaned[0].source.key, "secret");
        assert_eq!(cleaned[0].source.value, "RUN123password");
        assert_eq!(cleaned[1].source.key, "value");
        assert_eq!(cleaned[1].source.value, "us");
        assert_eq!(
            secrets.resolve("secret", "RUN123password").expect("stored"),
            "s3cret"
        );
        assert_eq!(secrets.len(), 1);

        let restored = s.restore_parameters(&cleaned).expect("restore");
        assert_eq!(restored[0].value, "s3cret");
        assert_eq!(restored[1].value, "us");
    }

    #[test]
    fn non_string_values_are_json_encoded() {
        let (s, _) = sanitizer();
        let mut params = BTreeMap::new();
        params.insert("replicas".to_string(), json!(3));
        let cleaned = s
            .clean_raw_parameters(&params, &sample_bundle(), "RUN1")
            .expect("clean");
        assert_eq!(cleaned[0].source.value, "3");
    }

    #[test]
    fn sensitive_output_round_trip() {
        let (s, _) = sanitizer();
        let inst = Installation::new("", "mybun");
        let run = inst.new_run("install", sample_bundle());
        let result = run.new_result(ResultStatus::Succeeded);
        let output = result.new_output("token", b"abc123".to_vec());

        let cleaned = s.clean_output(&output, &run.bundle).expect("clean");
        assert!(cleaned.value.is_empty());
        assert_eq!(cleaned.key, format!("{}token", run.id));

        let restored = s.restore_output(&cleaned);
        assert_eq!(restored.value, b"abc123".to_vec());
    }

    #[test]
    fn plain_output_is_untouched() {
        let (s, secrets) = sanitizer();
        let inst = Installation::new("", "mybun");
        let run = inst.new_run("install", sample_bundle());
        let output = run
            .new_result(ResultStatus::Succeeded)
            .new_output("endpoint", b"http://x".to_vec());
        assert_eq!(s.clean_output(&output, &run.bundle).expect("clean"), output);
        assert!(secrets.is_empty());
    }

    #[test]
    fn unreadable_secret_restores_empty() {
        let (s, _) = sanitizer();
        let inst = Installation::new("", "mybun");
        let run = inst.new_run("install", sample_bundle());
        let mut output = run
            .new_result(ResultStatus::Succeeded)
            .new_output("token", Vec::new());
        output.key = "missing".into();
        assert!(s.restore_output(&output).value.is_empty());
    }
}
