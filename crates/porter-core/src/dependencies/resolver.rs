//! # Dependency Resolution
//!
//! Turns each declared dependency into a graph node. Three resolvers are
//! tried in order until one answers:
//!
//! 1. `InstallationResolver` - an existing installation matching the selector
//! 2. `VersionResolver` - the highest registry tag inside the version range
//! 3. `DefaultBundleResolver` - the default bundle reference as declared
//!
//! `CompositeResolver::build_graph` walks the root bundle's dependencies
//! breadth first and records every prerequisite edge.

use super::graph::{BundleGraph, BundleNode, InstallationNode, Node, make_dependency_key};
use super::solver;
use crate::bundle::{
    DeclaredDependencies, DependencySource, DependencyV2, ExtendedBundle, InterfaceDocument,
    parse_dependency_source,
};
use crate::cache::CachedBundle;
use crate::claims::store::ListOptions;
use crate::claims::{Installation, InstallationStore};
use crate::manifest::Manifest;
use crate::reference::{OCIReference, VersionRanges, parse_semver};
use crate::registry::BundleResolver;
use crate::types::{PorterError, Result};
use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// =============================================================================
// SELECTORS
// =============================================================================

/// A default bundle, optionally constrained to a version range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleReferenceSelector {
    pub reference: OCIReference,
    pub version: Option<VersionRanges>,
    pub allow_prereleases: bool,
}

impl BundleReferenceSelector {
    /// Whether `installation` runs this bundle.
    ///
    /// With a range the repository must match and the installed version fall
    /// inside it; otherwise the bound reference must be identical.
    pub fn is_match(&self, installation: &Installation) -> bool {
        let Ok(Some(bound)) = installation.bundle.reference() else {
            return false;
        };
        match &self.version {
            Some(ranges) => {
                if bound.repository_only() != self.reference.repository_only() {
                    return false;
                }
                let raw = if installation.bundle.version.is_empty() {
                    &installation.bundle.tag
                } else {
                    &installation.bundle.version
                };
                parse_semver(raw).is_some_and(|v| ranges.matches(&v, self.allow_prereleases))
            }
            None => bound.to_string() == self.reference.to_string(),
        }
    }
}

/// Criteria an existing installation must meet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallationSelector {
    pub bundle: Option<BundleReferenceSelector>,
    pub interface: Option<InterfaceDocument>,
    pub labels: BTreeMap<String, String>,
    /// Searched in order; the first is the current namespace.
    pub namespaces: Vec<String>,
}

/// True when `bundle` declares every name listed by `interface`.
pub fn implements_interface(bundle: &ExtendedBundle, interface: &InterfaceDocument) -> bool {
    interface.parameters.iter().all(|p| bundle.parameters.contains_key(p))
        && interface.credentials.iter().all(|c| bundle.credentials.contains_key(c))
        && interface.outputs.iter().all(|o| bundle.outputs.contains_key(o))
}

/// The interface formed by a bundle's own declarations.
pub fn interface_of(bundle: &ExtendedBundle) -> InterfaceDocument {
    InterfaceDocument {
        parameters: bundle
            .parameters
            .keys()
            .filter(|p| !bundle.is_internal_parameter(p))
            .cloned()
            .collect(),
        credentials: bundle.credentials.keys().cloned().collect(),
        outputs: bundle.outputs.keys().cloned().collect(),
    }
}

/// A declared dependency with its selectors parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub key: String,
    pub parent_key: String,
    pub alias: String,
    pub default_bundle: Option<BundleReferenceSelector>,
    pub interface: Option<InterfaceDocument>,
    pub installation: Option<InstallationSelector>,
    pub parameters: BTreeMap<String, DependencySource>,
    pub credentials: BTreeMap<String, DependencySource>,
    pub sharing_group: Option<String>,
}

impl Dependency {
    /// Keys of the sibling dependencies whose outputs feed this one.
    pub fn data_flow_requirements(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .parameters
            .values()
            .chain(self.credentials.values())
            .filter(|s| s.is_dependency_output())
            .map(|s| make_dependency_key(&self.parent_key, &s.dependency))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

// =============================================================================
// RESOLVERS
// =============================================================================

/// What a dependency resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Installation { namespace: String, name: String },
    Bundle(CachedBundle),
}

#[async_trait]
pub trait DependencyResolver: Send + Sync {
    /// `None` lets the next resolver try.
    async fn resolve(&self, cancel: &CancellationToken, dep: &Dependency) -> Result<Option<Resolved>>;
}

/// Matches existing installations.
#[derive(Debug, Clone)]
pub struct InstallationResolver {
    store: Arc<InstallationStore>,
    namespace: String,
}

impl InstallationResolver {
    pub fn new(store: Arc<InstallationStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    fn implements(&self, installation: &Installation, interface: &InterfaceDocument) -> bool {
        self.store
            .get_last_run(&installation.namespace, &installation.name)
            .is_ok_and(|run| implements_interface(&run.bundle, interface))
    }
}

#[async_trait]
impl DependencyResolver for InstallationResolver {
    async fn resolve(&self, cancel: &CancellationToken, dep: &Dependency) -> Result<Option<Resolved>> {
        let Some(selector) = &dep.installation else {
            return Ok(None);
        };
        if cancel.is_cancelled() {
            return Err(PorterError::Canceled);
        }

        let mut candidates = Vec::new();
        for namespace in &selector.namespaces {
            let opts = ListOptions {
                namespace: Some(namespace.clone()),
                labels: selector.labels.clone(),
                ..ListOptions::default()
            };
            candidates.extend(self.store.list_installations(&opts)?);
        }
        candidates.retain(|i| {
            !i.is_uninstalled()
                && selector.bundle.as_ref().is_none_or(|b| b.is_match(i))
                && selector.interface.as_ref().is_none_or(|doc| self.implements(i, doc))
        });
        candidates.sort_by(|a, b| {
            (Reverse(&a.namespace), &a.name).cmp(&(Reverse(&b.namespace), &b.name))
        });
        debug!(dependency = %dep.key, candidates = candidates.len(), "matched installations");

        let preferred: Vec<&Installation> = match &dep.default_bundle {
            Some(default) => candidates
                .iter()
                .filter(|i| {
                    i.bundle.reference().ok().flatten().is_some_and(|r| {
                        r.repository_only() == default.reference.repository_only()
                    })
                })
                .collect(),
            None => Vec::new(),
        };
        let pool: Vec<&Installation> = if preferred.is_empty() {
            candidates.iter().collect()
        } else {
            preferred
        };
        let chosen = pool
            .iter()
            .find(|i| i.namespace == self.namespace)
            .or_else(|| pool.first());

        Ok(chosen.map(|i| Resolved::Installation {
            namespace: i.namespace.clone(),
            name: i.name.clone(),
        }))
    }
}

/// Picks the highest tag inside the default bundle's version range.
#[derive(Debug, Clone)]
pub struct VersionResolver {
    bundles: BundleResolver,
}

impl VersionResolver {
    pub fn new(bundles: BundleResolver) -> Self {
        Self { bundles }
    }
}

#[async_trait]
impl DependencyResolver for VersionResolver {
    async fn resolve(&self, cancel: &CancellationToken, dep: &Dependency) -> Result<Option<Resolved>> {
        let Some(default) = &dep.default_bundle else {
            return Ok(None);
        };
        let Some(ranges) = &default.version else {
            return Ok(None);
        };
        let tags = solver::list_tags(self.bundles.registry().as_ref(), &default.reference, cancel).await?;
        let Some(tag) = solver::highest_matching_tag(&tags, ranges, default.allow_prereleases) else {
            debug!(dependency = %dep.key, "no tag satisfies the version range");
            return Ok(None);
        };
        let reference = default.reference.with_tag(&tag)?;
        let cached = self.bundles.resolve(&reference, false, cancel).await?;
        Ok(Some(Resolved::Bundle(cached)))
    }
}

/// Pulls the default bundle reference as declared.
#[derive(Debug, Clone)]
pub struct DefaultBundleResolver {
    bundles: BundleResolver,
}

impl DefaultBundleResolver {
    pub fn new(bundles: BundleResolver) -> Self {
        Self { bundles }
    }
}

#[async_trait]
impl DependencyResolver for DefaultBundleResolver {
    async fn resolve(&self, cancel: &CancellationToken, dep: &Dependency) -> Result<Option<Resolved>> {
        let Some(default) = &dep.default_bundle else {
            return Ok(None);
        };
        // A range that matched nothing must not fall back to an arbitrary tag.
        if default.version.is_some() {
            return Ok(None);
        }
        let reference =
            solver::pin_reference(self.bundles.registry().as_ref(), &default.reference, cancel).await?;
        let cached = self.bundles.resolve(&reference, false, cancel).await?;
        Ok(Some(Resolved::Bundle(cached)))
    }
}

// =============================================================================
// COMPOSITE
// =============================================================================

/// Applies the resolvers in order and builds the dependency graph.
pub struct CompositeResolver {
    namespace: String,
    bundles: BundleResolver,
    resolvers: Vec<Box<dyn DependencyResolver>>,
}

impl std::fmt::Debug for CompositeResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeResolver")
            .field("namespace", &self.namespace)
            .field("resolvers", &self.resolvers.len())
            .finish_non_exhaustive()
    }
}

impl CompositeResolver {
    /// The standard chain: installations, version ranges, default bundles.
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<InstallationStore>,
        bundles: BundleResolver,
    ) -> Self {
        let namespace = namespace.into();
        let resolvers: Vec<Box<dyn DependencyResolver>> = vec![
            Box::new(InstallationResolver::new(store, namespace.clone())),
            Box::new(VersionResolver::new(bundles.clone())),
            Box::new(DefaultBundleResolver::new(bundles.clone())),
        ];
        Self {
            namespace,
            bundles,
            resolvers,
        }
    }

    /// Resolve one dependency, failing when no resolver matches.
    pub async fn resolve_dependency(
        &self,
        cancel: &CancellationToken,
        dep: &Dependency,
    ) -> Result<Resolved> {
        for resolver in &self.resolvers {
            if let Some(found) = resolver.resolve(cancel, dep).await? {
                return Ok(found);
            }
        }
        Err(PorterError::UnresolvedDependency(format!(
            "unable to find a bundle or installation for dependency {}",
            dep.key
        )))
    }

    /// The full graph rooted at `root`.
    pub async fn build_graph(&self, cancel: &CancellationToken, root: BundleNode) -> Result<BundleGraph> {
        let mut graph = BundleGraph::new();
        let root_chain: Vec<String> = root.reference.iter().map(ToString::to_string).collect();
        // Each pending node carries the references of the bundles above it.
        let mut pending = VecDeque::from([(root, root_chain)]);

        while let Some((mut node, chain)) = pending.pop_front() {
            if cancel.is_cancelled() {
                return Err(PorterError::Canceled);
            }
            if graph.contains(&node.key) {
                continue;
            }
            let Some(declared) = node.definition.dependencies()? else {
                graph.register_node(Node::Bundle(node));
                continue;
            };

            if let DeclaredDependencies::V1(v1) = &declared
                && v1.has_sequence_override()
            {
                let keys: Vec<String> = v1
                    .ordered_names()
                    .iter()
                    .map(|name| make_dependency_key(&node.key, name))
                    .collect();
                graph.set_sequence(&keys);
            }
            let manifest = match &declared {
                DeclaredDependencies::V1(_) => embedded_manifest(&node.definition)?,
                DeclaredDependencies::V2(_) => None,
            };

            for (alias, declaration) in &declared.as_v2().requires {
                let dep = self
                    .describe(cancel, &node, &declared, alias, declaration, manifest.as_ref())
                    .await
                    .map_err(|e| e.context(format!("dependency {alias}")))?;
                let resolved = self
                    .resolve_dependency(cancel, &dep)
                    .await
                    .map_err(|e| e.context(format!("dependency {alias}")))?;
                node.requires.push(dep.key.clone());

                match resolved {
                    Resolved::Installation { namespace, name } => {
                        info!(dependency = %dep.key, installation = %format!("{namespace}/{name}"), "using existing installation");
                        graph.register_node(Node::Installation(InstallationNode {
                            key: dep.key.clone(),
                            parent_key: Some(dep.parent_key.clone()),
                            namespace,
                            name,
                        }));
                    }
                    Resolved::Bundle(cached) => {
                        let reference = cached.bundle_reference.reference.clone();
                        if let Some(interface) = &dep.interface
                            && !implements_interface(cached.definition(), interface)
                        {
                            return Err(PorterError::Validation(format!(
                                "dependency {alias}: bundle {reference} does not implement the required interface"
                            )));
                        }
                        let resolved_ref = reference.to_string();
                        if chain.contains(&resolved_ref) {
                            let mut cycle = chain.clone();
                            cycle.push(resolved_ref);
                            return Err(PorterError::DependencyCycle(cycle.join(" -> ")));
                        }
                        let mut child_chain = chain.clone();
                        child_chain.push(resolved_ref);
                        info!(dependency = %dep.key, bundle = %reference, "using bundle");
                        pending.push_back((BundleNode {
                            key: dep.key.clone(),
                            parent_key: Some(dep.parent_key.clone()),
                            reference: Some(reference),
                            definition: cached.bundle_reference.definition,
                            relocation_map: cached.bundle_reference.relocation_map,
                            requires: dep.data_flow_requirements(),
                            parameters: dep.parameters,
                            credentials: dep.credentials,
                            sharing_group: dep.sharing_group,
                        }, child_chain));
                    }
                }
            }
            graph.register_node(Node::Bundle(node));
        }
        Ok(graph)
    }

    async fn describe(
        &self,
        cancel: &CancellationToken,
        parent: &BundleNode,
        declared: &DeclaredDependencies,
        alias: &str,
        declaration: &DependencyV2,
        manifest: Option<&Manifest>,
    ) -> Result<Dependency> {
        if declaration.has_no_selectors() {
            return Err(PorterError::Validation(format!(
                "dependency {alias} declares no bundle, interface or installation"
            )));
        }

        let default_bundle = if declaration.bundle.is_empty() {
            None
        } else {
            let version = declaration
                .version
                .as_deref()
                .map(VersionRanges::parse)
                .transpose()?;
            let allow_prereleases = declared.allows_prereleases(alias)
                || version.as_ref().is_some_and(VersionRanges::mentions_prerelease);
            Some(BundleReferenceSelector {
                reference: OCIReference::parse(&declaration.bundle)?,
                version,
                allow_prereleases,
            })
        };

        let interface = match &declaration.interface {
            Some(i) => match (&i.document, &i.reference) {
                (Some(doc), _) => Some(doc.clone()),
                (None, Some(reference)) => {
                    let reference = OCIReference::parse(reference)?;
                    let cached = self.bundles.resolve(&reference, false, cancel).await?;
                    Some(interface_of(cached.definition()))
                }
                (None, None) => None,
            },
            None => None,
        };

        let installation = declaration.installation.as_ref().map(|inst| {
            let criteria = inst.criteria.clone().unwrap_or_default();
            let mut namespaces = vec![self.namespace.clone()];
            if !criteria.match_namespace && !self.namespace.is_empty() {
                namespaces.push(String::new());
            }
            InstallationSelector {
                bundle: (!criteria.match_interface).then(|| default_bundle.clone()).flatten(),
                interface: criteria.match_interface.then(|| interface.clone()).flatten(),
                labels: if criteria.ignore_labels {
                    BTreeMap::new()
                } else {
                    inst.labels.clone()
                },
                namespaces,
            }
        });

        let mut dep = Dependency {
            key: make_dependency_key(&parent.key, alias),
            parent_key: parent.key.clone(),
            alias: alias.to_string(),
            default_bundle,
            interface,
            installation,
            parameters: declaration.parameters.clone(),
            credentials: declaration.credentials.clone(),
            sharing_group: declaration.sharing_group().map(str::to_string),
        };

        // v1 bundles carry their wiring only in the embedded manifest.
        if let Some(m) = manifest.and_then(|m| m.dependency(alias)) {
            for (name, wiring) in &m.parameters {
                dep.parameters.insert(name.clone(), parse_dependency_source(wiring)?);
            }
            for (name, wiring) in &m.credentials {
                dep.credentials.insert(name.clone(), parse_dependency_source(wiring)?);
            }
            if dep.sharing_group.is_none() {
                dep.sharing_group = m
                    .sharing
                    .as_ref()
                    .and_then(|s| s.group_name())
                    .map(str::to_string);
            }
        }
        Ok(dep)
    }
}

fn embedded_manifest(bundle: &ExtendedBundle) -> Result<Option<Manifest>> {
    bundle
        .embedded_manifest()?
        .map(|data| Manifest::from_yaml(&data))
        .transpose()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;
    use crate::bundle::{DependenciesV2, DependencyInstallation, InstallationCriteria};
    use crate::cache::BundleCache;
    use crate::bundle::extensions::DEPENDENCIES_V2_KEY;
    use crate::registry::InMemoryRegistry;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<InstallationStore>,
        registry: Arc<InMemoryRegistry>,
        resolver: CompositeResolver,
    }

    fn fixture(namespace: &str) -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let store = Arc::new(InstallationStore::new(Arc::new(MemoryStore::new())));
        let registry = Arc::new(InMemoryRegistry::new());
        let bundles = BundleResolver::new(BundleCache::new(dir.path()), registry.clone());
        let resolver = CompositeResolver::new(namespace, store.clone(), bundles);
        Fixture {
            _dir: dir,
            store,
            registry,
            resolver,
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

    fn installed(store: &InstallationStore, namespace: &str, name: &str, bundle: &str) {
        let mut inst = Installation::new(namespace, name);
        inst.track_bundle(&reference(bundle));
        store.insert_installation(&inst).expect("insert");
    }

    fn dependency(installation: Option<InstallationSelector>, bundle: Option<&str>) -> Dependency {
        Dependency {
            key: "root/db".into(),
            parent_key: "root".into(),
            alias: "db".into(),
            default_bundle: bundle.map(|b| BundleReferenceSelector {
                reference: reference(b),
                version: None,
                allow_prereleases: false,
            }),
            interface: None,
            installation,
            parameters: BTreeMap::new(),
            credentials: BTreeMap::new(),
            sharing_group: None,
        }
    }

    #[test]
    fn selector_matches_version_ranges() {
        let mut inst = Installation::new("", "db");
        inst.track_bundle(&reference("getporter/mysql:v5.7.3"));
        let exact = BundleReferenceSelector {
            reference: reference("getporter/mysql:v5.7.3"),
            version: None,
            allow_prereleases: false,
        };
        assert!(exact.is_match(&inst));

        let ranged = BundleReferenceSelector {
            reference: reference("getporter/mysql"),
            version: Some(VersionRanges::parse("5.x").expect("ranges")),
            allow_prereleases: false,
        };
        assert!(ranged.is_match(&inst));

        let other = BundleReferenceSelector {
            reference: reference("getporter/postgres"),
            ..ranged
        };
        assert!(!other.is_match(&inst));
    }

    #[test]
    fn data_flow_keys_are_siblings() {
        let mut dep = dependency(None, Some("getporter/app:v1"));
        dep.parameters.insert(
            "endpoint".into(),
            parse_dependency_source("bundle.dependencies.db.outputs.host").expect("source"),
        );
        dep.credentials.insert(
            "token".into(),
            parse_dependency_source("bundle.credentials.token").expect("source"),
        );
        assert_eq!(dep.data_flow_requirements(), vec!["root/db".to_string()]);
    }

    #[tokio::test]
    async fn installation_resolver_prefers_current_namespace() {
        let f = fixture("dev");
        installed(&f.store, "", "db", "getporter/mysql:v5.7.0");
        installed(&f.store, "dev", "db", "getporter/mysql:v5.7.0");
        installed(&f.store, "dev", "other", "getporter/postgres:v1.0.0");

        let selector = InstallationSelector {
            namespaces: vec!["dev".into(), String::new()],
            ..InstallationSelector::default()
        };
        let dep = dependency(Some(selector), Some("getporter/mysql:v5.7.0"));
        let found = f
            .resolver
            .resolve_dependency(&CancellationToken::new(), &dep)
            .await
            .expect("resolve");
        assert_eq!(
            found,
            Resolved::Installation {
                namespace: "dev".into(),
                name: "db".into()
            }
        );
    }

    #[tokio::test]
    async fn installation_resolver_falls_back_to_global() {
        let f = fixture("dev");
        installed(&f.store, "", "db", "getporter/mysql:v5.7.0");

        let selector = InstallationSelector {
            bundle: Some(BundleReferenceSelector {
                reference: reference("getporter/mysql:v5.7.0"),
                version: None,
                allow_prereleases: false,
            }),
            namespaces: vec!["dev".into(), String::new()],
            ..InstallationSelector::default()
        };
        let resolver = InstallationResolver::new(f.store.clone(), "dev");
        let found = resolver
            .resolve(&CancellationToken::new(), &dependency(Some(selector), None))
            .await
            .expect("resolve");
        assert_eq!(
            found,
            Some(Resolved::Installation {
                namespace: String::new(),
                name: "db".into()
            })
        );
    }

    #[tokio::test]
    async fn version_resolver_picks_highest_in_range() {
        let f = fixture("");
        for t in ["getporter/mysql:v5.6.0", "getporter/mysql:v5.7.1", "getporter/mysql:v8.0.0"] {
            f.registry.publish(&reference(t), sample_bundle()).expect("publish");
        }
        let mut dep = dependency(None, Some("getporter/mysql"));
        if let Some(d) = dep.default_bundle.as_mut() {
            d.version = Some(VersionRanges::parse("5.x").expect("ranges"));
        }
        let found = f
            .resolver
            .resolve_dependency(&CancellationToken::new(), &dep)
            .await
            .expect("resolve");
        let Resolved::Bundle(cached) = found else {
            unreachable!("expected a bundle");
        };
        assert_eq!(cached.bundle_reference.reference.tag(), Some("v5.7.1"));
    }

    #[tokio::test]
    async fn unmatched_range_is_unresolved() {
        let f = fixture("");
        f.registry
            .publish(&reference("getporter/mysql:v8.0.0"), sample_bundle())
            .expect("publish");
        let mut dep = dependency(None, Some("getporter/mysql"));
        if let Some(d) = dep.default_bundle.as_mut() {
            d.version = Some(VersionRanges::parse("5.x").expect("ranges"));
        }
        let err = f
            .resolver
            .resolve_dependency(&CancellationToken::new(), &dep)
            .await
            .expect_err("unresolved");
        assert!(matches!(err, PorterError::UnresolvedDependency(_)));
    }

    #[tokio::test]
    async fn graph_orders_wired_dependencies() {
        let f = fixture("");
        let mut lb = Installation::new("", "lb");
        lb.labels.insert("app".into(), "lb".into());
        f.store.insert_installation(&lb).expect("insert");
        f.registry
            .publish(&reference("getporter/mysql:5.7"), sample_bundle())
            .expect("publish");

        let root = with_v2(
            sample_bundle(),
            json!({"requires": {
                "load-balancer": {"installation": {"labels": {"app": "lb"}}},
                "mysql": {
                    "bundle": "getporter/mysql:5.7",
                    "parameters": {"region": {"dependency": "load-balancer", "output": "region"}}
                }
            }}),
        );
        let graph = f
            .resolver
            .build_graph(&CancellationToken::new(), BundleNode::root(root, None))
            .await
            .expect("graph");

        let order: Vec<&str> = graph.sort().expect("sort").iter().map(|n| n.key()).collect();
        assert_eq!(order, vec!["root/load-balancer", "root/mysql", "root"]);
        assert!(matches!(graph.get_node("root/load-balancer"), Some(Node::Installation(_))));
    }

    #[tokio::test]
    async fn bundle_reference_cycle_is_rejected() {
        let f = fixture("");
        let a = with_v2(sample_bundle(), json!({"requires": {"b": {"bundle": "getporter/b:1.0"}}}));
        let b = with_v2(sample_bundle(), json!({"requires": {"a": {"bundle": "getporter/a:1.0"}}}));
        f.registry.publish(&reference("getporter/a:1.0"), a.clone()).expect("publish a");
        f.registry.publish(&reference("getporter/b:1.0"), b).expect("publish b");

        let root = BundleNode::root(a, Some(reference("getporter/a:1.0")));
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            f.resolver.build_graph(&CancellationToken::new(), root),
        )
        .await
        .expect("graph construction terminates");
        let err = result.expect_err("cycle");
        assert!(matches!(err, PorterError::DependencyCycle(ref m) if m.contains("getporter/b")));
    }

    #[tokio::test]
    async fn unreferenced_root_cycle_is_rejected() {
        let f = fixture("");
        let a = with_v2(sample_bundle(), json!({"requires": {"b": {"bundle": "getporter/b:1.0"}}}));
        let b = with_v2(sample_bundle(), json!({"requires": {"a": {"bundle": "getporter/a:1.0"}}}));
        f.registry.publish(&reference("getporter/a:1.0"), a.clone()).expect("publish a");
        f.registry.publish(&reference("getporter/b:1.0"), b).expect("publish b");

        let err = f
            .resolver
            .build_graph(&CancellationToken::new(), BundleNode::root(a, None))
            .await
            .expect_err("cycle");
        assert!(matches!(err, PorterError::DependencyCycle(_)));
    }

    #[tokio::test]
    async fn missing_selectors_are_rejected() {
        let f = fixture("");
        let root = with_v2(sample_bundle(), json!({"requires": {"empty": {}}}));
        let err = f
            .resolver
            .build_graph(&CancellationToken::new(), BundleNode::root(root, None))
            .await
            .expect_err("invalid");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("empty")));
    }

    #[tokio::test]
    async fn interface_must_be_implemented() {
        let f = fixture("");
        f.registry
            .publish(&reference("getporter/mysql:5.7"), sample_bundle())
            .expect("publish");
        let root = with_v2(
            sample_bundle(),
            json!({"requires": {"db": {
                "bundle": "getporter/mysql:5.7",
                "interface": {"document": {"outputs": ["connstr"]}}
            }}}),
        );
        let err = f
            .resolver
            .build_graph(&CancellationToken::new(), BundleNode::root(root, None))
            .await
            .expect_err("interface");
        assert!(matches!(err, PorterError::Validation(ref m) if m.contains("interface")));
    }

    #[tokio::test]
    async fn installation_selector_honors_criteria() {
        let f = fixture("dev");
        let root = with_v2(sample_bundle(), json!({}));
        let declared = root.dependencies().expect("deps").expect("declared");
        let declaration = DependencyV2 {
            name: "db".into(),
            bundle: "getporter/mysql:5.7".into(),
            installation: Some(DependencyInstallation {
                labels: BTreeMap::from([("team".to_string(), "red".to_string())]),
                criteria: Some(InstallationCriteria {
                    match_interface: false,
                    match_namespace: true,
                    ignore_labels: true,
                }),
            }),
            ..DependencyV2::default()
        };
        let dep = f
            .resolver
            .describe(
                &CancellationToken::new(),
                &BundleNode::root(root, None),
                &declared,
                "db",
                &declaration,
                None,
            )
            .await
            .expect("describe");
        let selector = dep.installation.expect("selector");
        assert_eq!(selector.namespaces, vec!["dev".to_string()]);
        assert!(selector.labels.is_empty());
        assert!(selector.bundle.is_some());
    }
}
