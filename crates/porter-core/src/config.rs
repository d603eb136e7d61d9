//! # Configuration
//!
//! Settings come from four layers, highest precedence first:
//!
//! 1. explicit flags (`ConfigOverrides`)
//! 2. `PORTER_<UPPER_SNAKE>` environment variables
//! 3. `$PORTER_HOME/config.toml`
//! 4. built-in defaults
//!
//! The environment is read through an injected lookup so tests never touch
//! the process environment.

use crate::types::{OutputFormat, PorterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ENV_HOME: &str = "PORTER_HOME";
pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "porter.db";

/// Experimental flag that switches manifests to the v2 dependency format.
pub const EXPERIMENTAL_DEPENDENCIES_V2: &str = "dependencies-v2";
const KNOWN_EXPERIMENTAL: &[&str] = &[EXPERIMENTAL_DEPENDENCIES_V2];

/// Environment variable for a setting: `output-format` -> `PORTER_OUTPUT_FORMAT`.
pub fn env_key(setting: &str) -> String {
    format!("PORTER_{}", setting.replace('-', "_").to_uppercase())
}

// =============================================================================
// VALUES
// =============================================================================

macro_rules! config_enum {
    ($(#[$meta:meta])* $name:ident, $setting:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            #[default]
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = PorterError;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(PorterError::Config(format!(
                        "invalid {} {other:?}, allowed values are: {}",
                        $setting,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum!(
    /// Where installation records live.
    StorageBackend, "storage", { Redb => "redb", Memory => "memory" }
);

config_enum!(
    /// Where sensitive values live.
    SecretsBackend, "secrets", { Filesystem => "filesystem", Memory => "memory" }
);

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub namespace: String,
    pub debug: bool,
    pub output: OutputFormat,
    pub experimental: BTreeSet<String>,
    pub storage: StorageBackend,
    pub secrets: SecretsBackend,
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub home: Option<PathBuf>,
    pub namespace: Option<String>,
    pub debug: Option<bool>,
    pub output: Option<OutputFormat>,
    pub experimental: Option<Vec<String>>,
}

/// Shape of `config.toml`. Unknown keys are rejected.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct FileConfig {
    namespace: Option<String>,
    debug: Option<bool>,
    output: Option<OutputFormat>,
    experimental: Option<Vec<String>>,
    storage: Option<StorageBackend>,
    secrets: Option<SecretsBackend>,
}

impl Config {
    /// Defaults rooted at `home`.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            namespace: String::new(),
            debug: false,
            output: OutputFormat::default(),
            experimental: BTreeSet::new(),
            storage: StorageBackend::default(),
            secrets: SecretsBackend::default(),
        }
    }

    /// Load from the process environment.
    pub fn load(overrides: &ConfigOverrides) -> Result<Self> {
        Self::load_with(overrides, |key| std::env::var(key).ok())
    }

    /// Load with an explicit environment lookup.
    pub fn load_with<F>(overrides: &ConfigOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = match &overrides.home {
            Some(h) => h.clone(),
            None => resolve_home(&env)?,
        };
        let mut config = Self::with_home(home);
        if let Some(file) = read_file(&config.config_path())? {
            config.apply_file(file)?;
        }
        config.apply_env(&env)?;
        config.apply_overrides(overrides)?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(ns) = file.namespace {
            self.namespace = ns;
        }
        if let Some(debug) = file.debug {
            self.debug = debug;
        }
        if let Some(output) = file.output {
            self.output = output;
        }
        if let Some(features) = file.experimental {
            self.experimental = parse_experimental(features)?;
        }
        if let Some(storage) = file.storage {
            self.storage = storage;
        }
        if let Some(secrets) = file.secrets {
            self.secrets = secrets;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, env: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |setting: &str| {
            let key = env_key(setting);
            env(&key).map(|v| (key, v))
        };
        if let Some((_, ns)) = lookup("namespace") {
            self.namespace = ns;
        }
        if let Some((key, v)) = lookup("debug") {
            self.debug = parse_bool(&key, &v)?;
        }
        if let Some((_, v)) = lookup("output") {
            self.output = v.parse()?;
        }
        if let Some((_, v)) = lookup("experimental") {
            self.experimental = parse_experimental(split_list(&v))?;
        }
        if let Some((_, v)) = lookup("storage") {
            self.storage = v.parse()?;
        }
        if let Some((_, v)) = lookup("secrets") {
            self.secrets = v.parse()?;
        }
        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(ns) = &overrides.namespace {
            self.namespace.clone_from(ns);
        }
        if let Some(debug) = overrides.debug {
            self.debug = debug;
        }
        if let Some(output) = overrides.output {
            self.output = output;
        }
        if let Some(features) = &overrides.experimental {
            self.experimental = parse_experimental(features.clone())?;
        }
        Ok(())
    }

    pub fn is_experimental(&self, feature: &str) -> bool {
        self.experimental.contains(feature)
    }

    pub fn dependencies_v2(&self) -> bool {
        self.is_experimental(EXPERIMENTAL_DEPENDENCIES_V2)
    }

    pub fn config_path(&self) -> PathBuf {
        self.home.join(CONFIG_FILE)
    }

    pub fn mixins_dir(&self) -> PathBuf {
        self.home.join("mixins")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.home.join("secrets")
    }

    pub fn database_path(&self) -> PathBuf {
        self.home.join(DATABASE_FILE)
    }

    /// Scratch directories of host runs.
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

fn resolve_home<F>(env: &F) -> Result<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(home) = env(ENV_HOME).filter(|h| !h.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    env("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".porter"))
        .ok_or_else(|| {
            PorterError::Config(format!("unable to determine the home directory, set {ENV_HOME}"))
        })
}

fn read_file(path: &Path) -> Result<Option<FileConfig>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PorterError::Config(format!(
                "unable to read {}: {e}",
                path.display()
            )));
        }
    };
    toml::from_str(&text)
        .map(Some)
        .map_err(|e| PorterError::Config(format!("invalid config file {}: {e}", path.display())))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        other => Err(PorterError::Config(format!(
            "invalid value {other:?} for {key}, expected a boolean"
        ))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_experimental(features: Vec<String>) -> Result<BTreeSet<String>> {
    let mut set = BTreeSet::new();
    for feature in features {
        let feature = feature.trim().to_ascii_lowercase();
        if !KNOWN_EXPERIMENTAL.contains(&feature.as_str()) {
            return Err(PorterError::Config(format!(
                "unknown experimental feature {feature:?}, known features are: {}",
                KNOWN_EXPERIMENTAL.join(", ")
            )));
        }
        set.insert(feature);
    }
    Ok(set)
}
