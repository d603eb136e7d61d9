//! # Fixed Constants
//!
//! Names, keys and limits that are part of Porter's on-disk and on-wire
//! contracts. Changing any of these breaks compatibility with existing
//! bundles, stores or mixins.

use std::time::Duration;

// =============================================================================
// ACTIONS
// =============================================================================

/// Built-in install action.
pub const ACTION_INSTALL: &str = "install";

/// Built-in upgrade action.
pub const ACTION_UPGRADE: &str = "upgrade";

/// Built-in uninstall action.
pub const ACTION_UNINSTALL: &str = "uninstall";

/// Returns true for the three actions every bundle carries.
pub fn is_builtin_action(action: &str) -> bool {
    matches!(action, ACTION_INSTALL | ACTION_UPGRADE | ACTION_UNINSTALL)
}

// =============================================================================
// SCHEMA VERSIONS
// =============================================================================

/// CNAB bundle descriptor schema version written by the manifest converter.
pub const BUNDLE_SCHEMA_VERSION: &str = "1.2.0";

/// Schema version of installation documents.
pub const INSTALLATION_SCHEMA_VERSION: &str = "1.0.2";

/// Schema version of run, result and output documents.
pub const CLAIM_SCHEMA_VERSION: &str = "1.0.2";

/// Schema version of credential and parameter set documents.
pub const SET_SCHEMA_VERSION: &str = "1.0.1";

/// Schema version of the manifest format written by default.
pub const MANIFEST_SCHEMA_VERSION: &str = "1.0.0";

/// Manifest schema versions this build accepts.
pub const SUPPORTED_MANIFEST_SCHEMA_VERSIONS: &str = "1.0.0-alpha.1 || 1.0.0";

// =============================================================================
// EXTENSIONS
// =============================================================================

/// Custom section holding the manifest stamp and embedded manifest.
pub const PORTER_CUSTOM_KEY: &str = "sh.porter";

/// Definition comment marking parameters generated for Porter's own use.
pub const PORTER_INTERNAL: &str = "porter-internal";

/// Prefix reserved for parameters Porter injects into a bundle.
pub const RESERVED_PARAMETER_PREFIX: &str = "porter-";

/// Label tying a dependency installation to its parent.
pub const LABEL_PARENT_INSTALLATION: &str = "sh.porter.parentInstallation";

/// Label recording the sharing group of a shared dependency installation.
pub const LABEL_SHARING_GROUP: &str = "sh.porter.SharingGroup";

/// Output name under which invocation image logs are stored.
pub const OUTPUT_INVOCATION_IMAGE_LOGS: &str = "io.cnab.outputs.invocationImageLogs";

// =============================================================================
// STORE COLLECTIONS
// =============================================================================

pub const COLLECTION_INSTALLATIONS: &str = "installations";
pub const COLLECTION_RUNS: &str = "runs";
pub const COLLECTION_RESULTS: &str = "results";
pub const COLLECTION_OUTPUTS: &str = "outputs";
pub const COLLECTION_CREDENTIALS: &str = "credentials";
pub const COLLECTION_PARAMETERS: &str = "parameters";
pub const COLLECTION_CONFIG: &str = "config";

/// Id of the schema document in the config collection.
pub const SCHEMA_DOCUMENT_ID: &str = "schema";

/// Store schema version this build reads and writes.
pub const STORE_SCHEMA_VERSION: &str = "1.0.2";

// =============================================================================
// SECRETS
// =============================================================================

/// Strategy source key for values held by the secret backend.
pub const SOURCE_SECRET: &str = "secret";

/// Strategy source key for literal values.
pub const SOURCE_VALUE: &str = "value";

/// Strategy source key for environment variables.
pub const SOURCE_ENV: &str = "env";

/// Strategy source key for file contents.
pub const SOURCE_PATH: &str = "path";

// =============================================================================
// PROCESS LIMITS
// =============================================================================

/// Time a mixin gets to exit after the terminate signal before it is killed.
pub const MIXIN_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Bytes of mixin stderr kept for a `MixinFailure` message.
pub const MIXIN_STDERR_TAIL: usize = 4096;

/// Mask written in place of sensitive values in user-visible output.
pub const REDACTED: &str = "*******";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_actions() {
        assert!(is_builtin_action("install"));
        assert!(is_builtin_action("uninstall"));
        assert!(!is_builtin_action("status"));
    }

    #[test]
    fn grace_period_is_short() {
        assert!(MIXIN_GRACE_PERIOD <= Duration::from_secs(30));
    }
}
