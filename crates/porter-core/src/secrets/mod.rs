//! # Secret Backends
//!
//! Sensitive values never reach the document store. They are written to a
//! `SecretStore` under a derived key and the store keeps only a
//! `{source: "secret", value: <key>}` reference.
//!
//! Strategies with host sources (`value`, `env`, `path`) resolve without a
//! backend.

use crate::primitives::{SOURCE_ENV, SOURCE_PATH, SOURCE_SECRET, SOURCE_VALUE};
use crate::types::{PorterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

// =============================================================================
// STRATEGY
// =============================================================================

/// Where a strategy's value comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Source {
    /// Source kind: `secret`, `value`, `env`, `path` or a plugin name.
    pub key: String,
    /// Kind-specific locator: the secret key, literal, variable or path.
    pub value: String,
}

/// A named value and the source it resolves from.
///
/// The resolved plaintext lives in `value` only in memory; it is never
/// serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Strategy {
    pub name: String,
    pub source: Source,
    #[serde(skip)]
    pub value: String,
}

impl Strategy {
    /// A plain literal strategy.
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            source: Source {
                key: SOURCE_VALUE.to_string(),
                value: value.clone(),
            },
            value,
        }
    }

    /// A reference into the secret backend.
    pub fn secret(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Source {
                key: SOURCE_SECRET.to_string(),
                value: key.into(),
            },
            value: String::new(),
        }
    }

    pub fn is_secret(&self) -> bool {
        self.source.key == SOURCE_SECRET
    }
}

// =============================================================================
// SECRET STORE
// =============================================================================

/// External storage for sensitive values.
pub trait SecretStore: Send + Sync {
    /// Store `value` under `(source, key)`.
    fn create(&self, source: &str, key: &str, value: &str) -> Result<()>;

    /// Read back the value stored under `(source, key)`.
    fn resolve(&self, source: &str, key: &str) -> Result<String>;
}

/// Resolve a strategy through the host or the secret backend.
pub fn resolve_strategy(secrets: &dyn SecretStore, strategy: &Strategy) -> Result<String> {
    let Source { key, value } = &strategy.source;
    match key.as_str() {
        SOURCE_VALUE => Ok(value.clone()),
        SOURCE_ENV => std::env::var(value).map_err(|_| {
            PorterError::SecretStore(format!(
                "environment variable {value} for {} is not set",
                strategy.name
            ))
        }),
        SOURCE_PATH => fs::read_to_string(value).map_err(|e| {
            PorterError::SecretStore(format!(
                "unable to read {value} for {}: {e}",
                strategy.name
            ))
        }),
        _ => secrets
            .resolve(key, value)
            .map_err(|e| e.context(format!("unable to resolve {}", strategy.name))),
    }
}

/// Resolve every strategy, filling in `value`.
pub fn resolve_all(secrets: &dyn SecretStore, strategies: &[Strategy]) -> Result<Vec<Strategy>> {
    strategies
        .iter()
        .map(|s| {
            let value = resolve_strategy(secrets, s)?;
            Ok(Strategy {
                value,
                ..s.clone()
            })
        })
        .collect()
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// Secret store held in process memory. Used by tests and `secrets = "memory"`.
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    values: Mutex<BTreeMap<(String, String), String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of values held.
    pub fn len(&self) -> usize {
        self.values.lock().map(|v| v.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretStore for InMemorySecretStore {
    fn create(&self, source: &str, key: &str, value: &str) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| PorterError::SecretStore("secret store lock poisoned".into()))?;
        values.insert((source.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn resolve(&self, source: &str, key: &str) -> Result<String> {
        let values = self
            .values
            .lock()
            .map_err(|_| PorterError::SecretStore("secret store lock poisoned".into()))?;
        values
            .get(&(source.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| PorterError::SecretStore(format!("secret {key} not found")))
    }
}

// =============================================================================
// FILESYSTEM BACKEND
// =============================================================================

/// Secret store writing one file per key under a directory.
///
/// Files are created with mode 0600 on unix.
#[derive(Debug, Clone)]
pub struct FilesystemSecretStore {
    dir: PathBuf,
}

impl FilesystemSecretStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, source: &str, key: &str) -> Result<PathBuf> {
        for part in [source, key] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\'])
            {
                return Err(PorterError::SecretStore(format!(
                    "invalid secret key {part:?}"
                )));
            }
        }
        Ok(self.dir.join(source).join(key))
    }
}

impl SecretStore for FilesystemSecretStore {
    fn create(&self, source: &str, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(source, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                PorterError::SecretStore(format!("unable to create {}: {e}", parent.display()))
            })?;
        }
        write_private(&path, value.as_bytes())
            .map_err(|e| PorterError::SecretStore(format!("unable to write secret {key}: {e}")))?;
        debug!(key, "stored secret");
        Ok(())
    }

    fn resolve(&self, source: &str, key: &str) -> Result<String> {
        let path = self.path_for(source, key)?;
        fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PorterError::SecretStore(format!("secret {key} not found"))
            } else {
                PorterError::SecretStore(format!("unable to read secret {key}: {e}"))
            }
        })
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(data)
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    fs::write(path, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn strategy_value_is_not_serialized() {
        let s = Strategy::literal("region", "us");
        let json = serde_json::to_value(&s).expect("json");
        assert_eq!(
            json,
            serde_json::json!({"name": "region", "source": {"key": "value", "value": "us"}})
        );
    }

    #[test]
    fn memory_store_round_trip() {
        let store = InMemorySecretStore::new();
        store.create("secret", "RUN123password", "s3cret").expect("create");
        assert_eq!(
            store.resolve("secret", "RUN123password").expect("resolve"),
            "s3cret"
        );
        assert!(store.resolve("secret", "missing").is_err());
    }

    #[test]
    fn filesystem_store_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let store = FilesystemSecretStore::new(dir.path());
        store.create("secret", "RUN123password", "s3cret").expect("create");
        assert_eq!(
            store.resolve("secret", "RUN123password").expect("resolve"),
            "s3cret"
        );
    }

    #[cfg(unix)]
    #[test]
    fn filesystem_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().expect("tempdir");
        let store = FilesystemSecretStore::new(dir.path());
        store.create("secret", "k", "v").expect("create");
        let mode = fs::metadata(dir.path().join("secret").join("k"))
            .expect("stat")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn filesystem_rejects_traversal() {
        let dir = TempDir::new().expect("tempdir");
        let store = FilesystemSecretStore::new(dir.path());
        assert!(store.create("secret", "../escape", "v").is_err());
    }

    #[test]
    fn host_sources_resolve() {
        let dir = TempDir::new().expect("tempdir");
        let file = dir.path().join("token");
        fs::write(&file, "abc").expect("write");
        let store = InMemorySecretStore::new();
        let from_path = Strategy {
            name: "token".into(),
            source: Source {
                key: SOURCE_PATH.into(),
                value: file.display().to_string(),
            },
            value: String::new(),
        };
        assert_eq!(resolve_strategy(&store, &from_path).expect("path"), "abc");
        assert_eq!(
            resolve_strategy(&store, &Strategy::literal("r", "us")).expect("value"),
            "us"
        );
    }
}
