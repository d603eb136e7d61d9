//! # porter-core
//!
//! The bundle execution substrate for Porter.
//!
//! Everything that makes a CNAB bundle run correctly and resumably lives
//! here; the `porter` binary is a thin shell around it.
//!
//! ## Layers
//!
//! - `reference`, `bundle`: OCI references and the typed bundle model
//! - `manifest`: the porter.yaml model, its conversion to a bundle and
//!   step templating
//! - `mixin`, `runtime`: the mixin subprocess protocol and the host driver
//! - `dependencies`: resolvers, the bundle graph and scheduling
//! - `claims`, `storage`, `secrets`, `sanitizer`: installation records,
//!   document backends and sensitive value handling
//! - `registry`, `cache`: pulling bundles and caching them on disk
//! - `executor`: runs an action end to end and records it
//!
//! ## Constraints
//!
//! - No global state: stores, caches and secret backends are injected
//! - Deterministic ordering: `BTreeMap` for every keyed collection
//! - Every long-running operation takes a `CancellationToken`

// =============================================================================
// MODULES
// =============================================================================

pub mod bundle;
pub mod cache;
pub mod claims;
pub mod config;
pub mod dependencies;
pub mod executor;
pub mod manifest;
pub mod mixin;
pub mod primitives;
pub mod reference;
pub mod registry;
pub mod runtime;
pub mod sanitizer;
pub mod secrets;
pub mod storage;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types (from types module)
// =============================================================================

pub use types::{InstallationRef, OutputFormat, PorterError, Result};

// =============================================================================
// RE-EXPORTS: Bundle Model
// =============================================================================

pub use bundle::{Bundle, ExtendedBundle};
pub use manifest::{Manifest, ManifestConverter};
pub use reference::OCIReference;

// =============================================================================
// RE-EXPORTS: State
// =============================================================================

pub use claims::store::{ListOptions, SetKind};
pub use claims::{Installation, InstallationStore, Output, ResultStatus, Run, RunResult, StrategySet};
pub use sanitizer::Sanitizer;
pub use secrets::{FilesystemSecretStore, InMemorySecretStore, SecretStore, Strategy};
pub use storage::{MemoryStore, RedbStore, Store};

// =============================================================================
// RE-EXPORTS: Execution
// =============================================================================

pub use cache::BundleCache;
pub use config::{Config, ConfigOverrides};
pub use dependencies::{BundleGraph, CompositeResolver};
pub use executor::{ActionExecutor, ActionOutcome, ActionRequest, BundleSource, ParameterOverrides};
pub use mixin::MixinRunner;
pub use registry::{BundleResolver, InMemoryRegistry, OciRegistry, Registry};
pub use runtime::{Driver, HostDriver, Operation, OperationResult};
