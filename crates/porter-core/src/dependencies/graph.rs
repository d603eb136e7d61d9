//! # Bundle Graph
//!
//! The dependency graph of a root bundle, keyed by composite node keys.
//!
//! Every node lists the keys it requires. `sort()` returns the nodes with
//! prerequisites first; ties are broken by a v1 sequence position, then by
//! registration order, so the same graph always sorts the same way.

use crate::bundle::{DependencySource, ExtendedBundle};
use crate::cache::RelocationMapping;
use crate::reference::OCIReference;
use crate::types::{PorterError, Result};
use std::collections::{BTreeMap, BTreeSet};

/// Key of the root bundle.
pub const ROOT_KEY: &str = "root";

/// Key of `dependency` declared by the node at `parent`.
pub fn make_dependency_key(parent: &str, dependency: &str) -> String {
    format!("{parent}/{dependency}")
}

// =============================================================================
// NODES
// =============================================================================

/// A bundle that runs as part of the root action.
#[derive(Debug, Clone, PartialEq)]
pub struct BundleNode {
    pub key: String,
    pub parent_key: Option<String>,
    /// Published location, absent for a root built from a local manifest.
    pub reference: Option<OCIReference>,
    pub definition: ExtendedBundle,
    pub relocation_map: RelocationMapping,
    pub requires: Vec<String>,
    /// Inputs for this dependency, wired from its parent.
    pub parameters: BTreeMap<String, DependencySource>,
    pub credentials: BTreeMap<String, DependencySource>,
    pub sharing_group: Option<String>,
}

impl BundleNode {
    /// The root node for `definition`.
    pub fn root(definition: ExtendedBundle, reference: Option<OCIReference>) -> Self {
        Self {
            key: ROOT_KEY.to_string(),
            parent_key: None,
            reference,
            definition,
            relocation_map: RelocationMapping::new(),
            requires: Vec::new(),
            parameters: BTreeMap::new(),
            credentials: BTreeMap::new(),
            sharing_group: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_key.is_none()
    }
}

/// An existing installation satisfying a dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationNode {
    pub key: String,
    pub parent_key: Option<String>,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Bundle(BundleNode),
    Installation(InstallationNode),
}

impl Node {
    pub fn key(&self) -> &str {
        match self {
            Self::Bundle(b) => &b.key,
            Self::Installation(i) => &i.key,
        }
    }

    pub fn parent_key(&self) -> Option<&str> {
        match self {
            Self::Bundle(b) => b.parent_key.as_deref(),
            Self::Installation(i) => i.parent_key.as_deref(),
        }
    }

    /// Keys of the nodes that must run first. Installations need nothing.
    pub fn requires(&self) -> &[String] {
        match self {
            Self::Bundle(b) => &b.requires,
            Self::Installation(_) => &[],
        }
    }

    /// The dependency name this node was declared under.
    pub fn alias(&self) -> &str {
        let key = self.key();
        key.rsplit_once('/').map_or(key, |(_, alias)| alias)
    }

    pub fn as_bundle(&self) -> Option<&BundleNode> {
        match self {
            Self::Bundle(b) => Some(b),
            Self::Installation(_) => None,
        }
    }
}

// =============================================================================
// GRAPH
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct BundleGraph {
    nodes: Vec<Node>,
    /// Key -> position in `nodes`.
    index: BTreeMap<String, usize>,
    /// Key -> position in an explicit v1 sequence.
    sequence: BTreeMap<String, usize>,
}

impl BundleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Returns false, leaving the graph untouched, when the key
    /// is already registered.
    pub fn register_node(&mut self, node: Node) -> bool {
        if self.index.contains_key(node.key()) {
            return false;
        }
        self.index.insert(node.key().to_string(), self.nodes.len());
        self.nodes.push(node);
        true
    }

    pub fn get_node(&self, key: &str) -> Option<&Node> {
        self.index.get(key).and_then(|&i| self.nodes.get(i))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pin the relative order of sibling keys.
    pub fn set_sequence(&mut self, keys: &[String]) {
        for (position, key) in keys.iter().enumerate() {
            self.sequence.insert(key.clone(), position);
        }
    }

    /// Nodes in execution order, prerequisites first.
    pub fn sort(&self) -> Result<Vec<&Node>> {
        let mut waiting: Vec<usize> = Vec::with_capacity(self.nodes.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];

        for (i, node) in self.nodes.iter().enumerate() {
            let prerequisites: BTreeSet<usize> = node
                .requires()
                .iter()
                .map(|key| {
                    self.index.get(key).copied().ok_or_else(|| {
                        PorterError::UnresolvedDependency(format!(
                            "{} requires {key}, which is not part of the graph",
                            node.key()
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            waiting.push(prerequisites.len());
            for p in prerequisites {
                if let Some(d) = dependents.get_mut(p) {
                    d.push(i);
                }
            }
        }

        let rank = |i: usize| -> (usize, usize) {
            let position = self
                .nodes
                .get(i)
                .and_then(|n| self.sequence.get(n.key()))
                .copied()
                .unwrap_or(usize::MAX);
            (position, i)
        };

        let mut ready: BTreeSet<(usize, usize)> = waiting
            .iter()
            .enumerate()
            .filter(|(_, w)| **w == 0)
            .map(|(i, _)| rank(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some((_, i)) = ready.pop_first() {
            if let Some(node) = self.nodes.get(i) {
                order.push(node);
            }
            for &d in dependents.get(i).map(Vec::as_slice).unwrap_or_default() {
                if let Some(w) = waiting.get_mut(d) {
                    *w = w.saturating_sub(1);
                    if *w == 0 {
                        ready.insert(rank(d));
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let stuck: Vec<&str> = waiting
                .iter()
                .enumerate()
                .filter(|(_, w)| **w > 0)
                .filter_map(|(i, _)| self.nodes.get(i).map(Node::key))
                .collect();
            return Err(PorterError::DependencyCycle(stuck.join(", ")));
        }
        Ok(order)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;

    fn bundle_node(key: &str, requires: &[&str]) -> Node {
        let mut node = BundleNode::root(sample_bundle(), None);
        node.key = key.to_string();
        if key != ROOT_KEY {
            node.parent_key = Some(ROOT_KEY.to_string());
        }
        node.requires = requires.iter().map(ToString::to_string).collect();
        Node::Bundle(node)
    }

    fn keys(order: &[&Node]) -> Vec<String> {
        order.iter().map(|n| n.key().to_string()).collect()
    }

    #[test]
    fn installation_before_bundle_before_root() {
        let mut graph = BundleGraph::new();
        graph.register_node(bundle_node("root", &["mysql", "load-balancer"]));
        graph.register_node(bundle_node("mysql", &["load-balancer"]));
        graph.register_node(Node::Installation(InstallationNode {
            key: "load-balancer".into(),
            parent_key: Some(ROOT_KEY.into()),
            namespace: String::new(),
            name: "lb".into(),
        }));

        let order = graph.sort().expect("sort");
        assert_eq!(keys(&order), vec!["load-balancer", "mysql", "root"]);
    }

    #[test]
    fn duplicate_registration_is_a_noop() {
        let mut graph = BundleGraph::new();
        assert!(graph.register_node(bundle_node("root/a", &[])));
        assert!(!graph.register_node(bundle_node("root/a", &["root/b"])));
        assert_eq!(graph.len(), 1);
        assert!(graph.get_node("root/a").is_some_and(|n| n.requires().is_empty()));
    }

    #[test]
    fn diamond_visits_every_node_once() {
        let mut graph = BundleGraph::new();
        graph.register_node(bundle_node("root", &["root/a", "root/b"]));
        graph.register_node(bundle_node("root/a", &["root/c"]));
        graph.register_node(bundle_node("root/b", &["root/c"]));
        graph.register_node(bundle_node("root/c", &[]));

        let order = keys(&graph.sort().expect("sort"));
        assert_eq!(order, vec!["root/c", "root/a", "root/b", "root"]);
    }

    #[test]
    fn cycle_is_reported() {
        let mut graph = BundleGraph::new();
        graph.register_node(bundle_node("root", &["root/a"]));
        graph.register_node(bundle_node("root/a", &["root/b"]));
        graph.register_node(bundle_node("root/b", &["root/a"]));

        let err = graph.sort().expect_err("cycle");
        assert!(matches!(err, PorterError::DependencyCycle(ref keys) if keys.contains("root/a")));
    }

    #[test]
    fn unknown_prerequisite_is_unresolved() {
        let mut graph = BundleGraph::new();
        graph.register_node(bundle_node("root", &["root/missing"]));
        assert!(matches!(graph.sort(), Err(PorterError::UnresolvedDependency(_))));
    }

    #[test]
    fn sequence_orders_independent_siblings() {
        let mut graph = BundleGraph::new();
        graph.register_node(bundle_node("root/a", &[]));
        graph.register_node(bundle_node("root/b", &[]));
        graph.register_node(bundle_node("root", &["root/a", "root/b"]));
        graph.set_sequence(&["root/b".to_string(), "root/a".to_string()]);

        assert_eq!(keys(&graph.sort().expect("sort")), vec!["root/b", "root/a", "root"]);
    }

    #[test]
    fn alias_is_last_key_segment() {
        let node = bundle_node("root/mysql/lb", &[]);
        assert_eq!(node.alias(), "lb");
        assert_eq!(bundle_node("root", &[]).alias(), "root");
    }
}
