//! # Dependency Engine
//!
//! Resolves a root bundle's declared dependencies and schedules them:
//!
//! ```text
//! declarations ──resolve──▶ BundleGraph ──sort──▶ execution order
//! ```
//!
//! Each dependency becomes either a bundle that runs alongside the root or
//! an existing installation that only has to be present. Nodes are keyed
//! `<parentKey>/<alias>` so the same alias in two subtrees stays distinct.

pub mod graph;
pub mod resolver;
pub mod solver;

pub use graph::{BundleGraph, BundleNode, InstallationNode, Node, ROOT_KEY, make_dependency_key};
pub use resolver::{
    BundleReferenceSelector, CompositeResolver, DefaultBundleResolver, Dependency,
    DependencyResolver, InstallationResolver, InstallationSelector, Resolved, VersionResolver,
    implements_interface, interface_of,
};

use crate::bundle::ExtendedBundle;
use crate::primitives::ACTION_UNINSTALL;
use crate::types::Result;

/// Nodes in the order `action` runs them.
///
/// Uninstall tears the root down first and then its dependencies, the
/// reverse of the order they were installed in.
pub fn execution_order<'g>(graph: &'g BundleGraph, action: &str) -> Result<Vec<&'g Node>> {
    let mut order = graph.sort()?;
    if action == ACTION_UNINSTALL {
        order.reverse();
    }
    Ok(order)
}

/// The installation that records `node` when the root installation is
/// named `root_name`.
///
/// Names chain through parents (`app-mysql-lb`). A dependency in a sharing
/// group is named after its alias so every member finds the same record.
pub fn installation_name(graph: &BundleGraph, root_name: &str, node: &Node) -> String {
    match node {
        Node::Installation(i) => i.name.clone(),
        Node::Bundle(b) => {
            let Some(parent_key) = &b.parent_key else {
                return root_name.to_string();
            };
            if b.sharing_group.is_some() {
                return node.alias().to_string();
            }
            let parent_name = graph
                .get_node(parent_key)
                .map_or_else(|| root_name.to_string(), |p| installation_name(graph, root_name, p));
            ExtendedBundle::build_prerequisite_installation_name(&parent_name, node.alias())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tests::sample_bundle;

    fn child(key: &str, parent: &str, sharing_group: Option<&str>) -> Node {
        let mut node = BundleNode::root(sample_bundle(), None);
        node.key = key.to_string();
        node.parent_key = Some(parent.to_string());
        node.sharing_group = sharing_group.map(str::to_string);
        Node::Bundle(node)
    }

    fn graph() -> BundleGraph {
        let mut root = BundleNode::root(sample_bundle(), None);
        root.requires = vec!["root/mysql".into()];
        let mut mysql = child("root/mysql", ROOT_KEY, None);
        if let Node::Bundle(b) = &mut mysql {
            b.requires = vec!["root/mysql/lb".into()];
        }
        let mut g = BundleGraph::new();
        g.register_node(Node::Bundle(root));
        g.register_node(mysql);
        g.register_node(child("root/mysql/lb", "root/mysql", None));
        g
    }

    #[test]
    fn names_chain_through_parents() {
        let g = graph();
        let names: Vec<String> = g.nodes().map(|n| installation_name(&g, "app", n)).collect();
        assert_eq!(names, vec!["app", "app-mysql", "app-mysql-lb"]);
    }

    #[test]
    fn shared_dependencies_use_their_alias() {
        let mut g = graph();
        g.register_node(child("root/cache", ROOT_KEY, Some("team")));
        let node = g.get_node("root/cache").expect("node");
        assert_eq!(installation_name(&g, "app", node), "cache");
    }

    #[test]
    fn uninstall_runs_root_first() {
        let g = graph();
        let install: Vec<&str> = execution_order(&g, "install")
            .expect("order")
            .iter()
            .map(|n| n.key())
            .collect();
        assert_eq!(install, vec!["root/mysql/lb", "root/mysql", "root"]);

        let uninstall: Vec<&str> = execution_order(&g, ACTION_UNINSTALL)
            .expect("order")
            .iter()
            .map(|n| n.key())
            .collect();
        assert_eq!(uninstall, vec!["root", "root/mysql", "root/mysql/lb"]);
    }
}
