//! Resolved dependency graph.
//!
//! Nodes live in an arena addressed by [`NodeId`]. A package shared by
//! several dependents is one node referenced by id from each of them. The
//! `parent` of a node is its physical scope: the node whose `node_modules`
//! directory it is installed into, or `None` for the project root.

use super::integrity::Integrity;
use super::registry::ArtifactRef;
use semver::Version;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Handle to a node in a [`DependencyGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One selected package version at one place in the tree.
#[derive(Debug, Clone)]
pub struct ResolvedNode {
    pub id: NodeId,
    pub name: String,
    pub version: Version,
    pub artifact: ArtifactRef,
    /// Dependency name to the node that satisfies it.
    pub children: BTreeMap<String, NodeId>,
    /// Physical scope this node is installed into.
    pub parent: Option<NodeId>,
    /// Path relative to the project root, `/`-separated
    /// (`node_modules/a/node_modules/b`).
    pub install_path: String,
    /// Number of edges (including root edges) pointing at this node.
    pub ref_count: usize,
}

impl ResolvedNode {
    /// Store key derived from the artifact integrity, if it parses.
    #[must_use]
    pub fn store_key(&self) -> Option<String> {
        Integrity::parse(&self.artifact.integrity).map(|i| i.key())
    }

    /// `name@version` label for logs and reports.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

/// Install path of `name` inside `parent_path`'s scope.
#[must_use]
pub fn install_path_for(parent_path: Option<&str>, name: &str) -> String {
    match parent_path {
        Some(parent) => format!("{parent}/node_modules/{name}"),
        None => format!("node_modules/{name}"),
    }
}

/// Deduplicated, conflict-resolved graph produced by resolution.
///
/// Read-only once resolution finishes.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<ResolvedNode>,
    roots: BTreeMap<String, NodeId>,
}

impl DependencyGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node with no children and a zero reference count.
    pub(crate) fn add_node(
        &mut self,
        name: &str,
        version: Version,
        artifact: ArtifactRef,
        parent: Option<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let install_path = install_path_for(
            parent.map(|p| self.nodes[p.0].install_path.as_str()),
            name,
        );
        self.nodes.push(ResolvedNode {
            id,
            name: name.to_string(),
            version,
            artifact,
            children: BTreeMap::new(),
            parent,
            install_path,
            ref_count: 0,
        });
        id
    }

    /// Record a root edge.
    pub(crate) fn add_root(&mut self, name: &str, target: NodeId) {
        self.roots.insert(name.to_string(), target);
        self.nodes[target.0].ref_count += 1;
    }

    /// Record a dependency edge from `from` to `target`.
    pub(crate) fn add_edge(&mut self, from: NodeId, name: &str, target: NodeId) {
        self.nodes[from.0].children.insert(name.to_string(), target);
        self.nodes[target.0].ref_count += 1;
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &ResolvedNode {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> Option<&ResolvedNode> {
        self.nodes.get(id.0)
    }

    /// All nodes in creation order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResolvedNode> {
        self.nodes.iter()
    }

    /// Root dependency name to node.
    #[must_use]
    pub fn roots(&self) -> &BTreeMap<String, NodeId> {
        &self.roots
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Find the node installed at `path`.
    #[must_use]
    pub fn find_by_path(&self, path: &str) -> Option<&ResolvedNode> {
        self.nodes.iter().find(|n| n.install_path == path)
    }

    /// Nodes with the given name, in creation order.
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ResolvedNode> {
        self.nodes.iter().filter(move |n| n.name == name)
    }

    /// Physical ancestors of `id`, nearest first, excluding `id` itself.
    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.nodes[id.0].parent, move |p| self.nodes[p.0].parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str) -> ArtifactRef {
        ArtifactRef {
            url: format!("https://r.example.com/{name}.tgz"),
            integrity: String::new(),
        }
    }

    #[test]
    fn test_install_paths_follow_scope() {
        let mut graph = DependencyGraph::new();
        let lib = graph.add_node("lib", Version::new(1, 0, 0), artifact("lib"), None);
        let util = graph.add_node("@s/util", Version::new(2, 0, 0), artifact("util"), Some(lib));

        assert_eq!(graph.node(lib).install_path, "node_modules/lib");
        assert_eq!(
            graph.node(util).install_path,
            "node_modules/lib/node_modules/@s/util"
        );
        assert_eq!(graph.ancestors(util).collect::<Vec<_>>(), [lib]);
    }

    #[test]
    fn test_edges_count_references() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a", Version::new(1, 0, 0), artifact("a"), None);
        let b = graph.add_node("b", Version::new(1, 0, 0), artifact("b"), None);
        graph.add_root("a", a);
        graph.add_root("b", b);
        graph.add_edge(a, "b", b);

        assert_eq!(graph.node(b).ref_count, 2);
        assert_eq!(graph.node(a).children.get("b"), Some(&b));
        assert_eq!(graph.find_by_path("node_modules/b").map(|n| n.id), Some(b));
        assert_eq!(graph.node(a).label(), "a@1.0.0");
    }

    #[test]
    fn test_store_key_requires_valid_integrity() {
        let mut graph = DependencyGraph::new();
        let a = graph.add_node("a", Version::new(1, 0, 0), artifact("a"), None);
        assert!(graph.node(a).store_key().is_none());
    }
}
