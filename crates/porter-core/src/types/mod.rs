//! # Core Type Definitions
//!
//! This module contains the types shared by every component of the substrate:
//! - The error type (`PorterError`) and `Result` alias
//! - Installation coordinates (`InstallationRef`)
//! - Output format selection (`OutputFormat`)
//!
//! ## Error Kinds
//!
//! Each variant maps onto one error kind the substrate distinguishes. Callers
//! branch on the kind through the predicates (`is_not_found`, `is_canceled`)
//! rather than by matching message text.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Errors produced by the bundle execution substrate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PorterError {
    // =========================================================================
    // Validation
    // =========================================================================
    /// A manifest or bundle failed schema or invariant checks.
    #[error("validation error: {0}")]
    Validation(String),

    /// The reference string could not be parsed.
    #[error("invalid bundle reference {reference}: {reason}")]
    InvalidReference { reference: String, reason: String },

    /// The reference carries a malformed digest segment.
    #[error("invalid digest for reference {reference}: {reason}")]
    InvalidDigest { reference: String, reason: String },

    /// A required extension is not recognised.
    #[error("unsupported required extension: {0}")]
    UnsupportedExtension(String),

    /// An extension accessor was called but the bundle does not carry it.
    #[error("extension {0} is not present on the bundle")]
    ExtensionNotPresent(String),

    // =========================================================================
    // Lookup
    // =========================================================================
    /// An installation, run, result, output or reference is absent.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    // =========================================================================
    // Store
    // =========================================================================
    /// The store schema is older than this version supports.
    #[error(
        "the schema of the installation store is version {found} but this version of porter requires {required}; back up your data and run a storage migration before continuing"
    )]
    MigrationRequired { found: String, required: String },

    /// The document store failed.
    #[error("storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Registry
    // =========================================================================
    /// Transient registry or authentication failure.
    #[error("registry error for {reference}: {reason}")]
    Registry { reference: String, reason: String },

    // =========================================================================
    // Mixins
    // =========================================================================
    /// A mixin subprocess exited nonzero.
    #[error("mixin {mixin} failed running {command}: {stderr}")]
    MixinFailure {
        mixin: String,
        command: String,
        stderr: String,
    },

    /// Step template rendering failed.
    #[error("template error: {0}")]
    Template(String),

    /// A bundle run finished without succeeding.
    #[error("{action} of installation {installation} {status}: {message}")]
    RunFailed {
        installation: String,
        action: String,
        status: String,
        message: String,
    },

    // =========================================================================
    // Secrets & Config
    // =========================================================================
    /// A sensitive value could not be written or read.
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// Invalid config key, unparseable value or type mismatch.
    #[error("config error: {0}")]
    Config(String),

    // =========================================================================
    // Dependencies
    // =========================================================================
    /// The dependency graph contains a cycle.
    #[error("dependency graph contains a cycle involving: {0}")]
    DependencyCycle(String),

    /// No resolver produced a match for the dependency.
    #[error("could not resolve dependency {0}")]
    UnresolvedDependency(String),

    // =========================================================================
    // Plumbing
    // =========================================================================
    /// Filesystem or process I/O failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation observed the cancellation signal.
    #[error("operation canceled")]
    Canceled,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, PorterError>;

impl PorterError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Returns true when the error reports an absent record.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true when the error came from the cancellation signal.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Prefix the message with context while keeping the error kind.
    #[must_use]
    pub fn context(self, prefix: impl fmt::Display) -> Self {
        let p = prefix.to_string();
        match self {
            Self::Validation(m) => Self::Validation(format!("{p}: {m}")),
            Self::Storage(m) => Self::Storage(format!("{p}: {m}")),
            Self::Template(m) => Self::Template(format!("{p}: {m}")),
            Self::SecretStore(m) => Self::SecretStore(format!("{p}: {m}")),
            Self::Config(m) => Self::Config(format!("{p}: {m}")),
            Self::Io(m) => Self::Io(format!("{p}: {m}")),
            Self::Serialization(m) => Self::Serialization(format!("{p}: {m}")),
            Self::Registry { reference, reason } => Self::Registry {
                reference,
                reason: format!("{p}: {reason}"),
            },
            Self::MixinFailure {
                mixin,
                command,
                stderr,
            } => Self::MixinFailure {
                mixin,
                command: format!("{p}: {command}"),
                stderr,
            },
            other => other,
        }
    }
}

impl From<std::io::Error> for PorterError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PorterError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for PorterError {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// INSTALLATION COORDINATES
// =============================================================================

/// Identifies an installation by `(namespace, name)`.
///
/// The empty namespace is the global namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct InstallationRef {
    pub namespace: String,
    pub name: String,
}

impl InstallationRef {
    /// Create a new installation reference.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for InstallationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "/{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

// =============================================================================
// OUTPUT FORMAT
// =============================================================================

/// How command results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Plaintext,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = PorterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plaintext" | "text" | "" => Ok(Self::Plaintext),
            "json" => Ok(Self::Json),
            other => Err(PorterError::Config(format!(
                "invalid output format {other:?}, allowed values are json, plaintext"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_kind() {
        let err = PorterError::Validation("bad step".into()).context("install");
        assert_eq!(err, PorterError::Validation("install: bad step".into()));
    }

    #[test]
    fn context_leaves_not_found_untouched() {
        let err = PorterError::not_found("installation", "/mybun").context("loading");
        assert!(err.is_not_found());
    }

    #[test]
    fn installation_ref_display() {
        assert_eq!(InstallationRef::new("", "mybun").to_string(), "/mybun");
        assert_eq!(InstallationRef::new("dev", "mybun").to_string(), "dev/mybun");
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("json".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
