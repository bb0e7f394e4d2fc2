//! Dependency graph over indexed source nodes.
//!
//! An adjacency-list graph with a mirrored reverse map so dependent lookups
//! cost the same as dependency lookups. Built wholesale during indexing;
//! there is no incremental edge removal — re-indexing rebuilds the graph.
//!
//! Traversal order is deterministic: edges are stored as insertion-ordered,
//! deduplicated vectors and node insertion order is recorded, so two builds
//! fed the same nodes in the same order traverse identically.

pub mod indexer;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of source construct a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Module,
    Class,
    Function,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Module => write!(f, "module"),
            NodeKind::Class => write!(f, "class"),
            NodeKind::Function => write!(f, "function"),
        }
    }
}

/// A single node in the dependency graph: one module, class, or function.
///
/// Immutable once created. Re-indexing the same id supersedes the node
/// rather than merging into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeNode {
    /// Stable id derived from file path and qualified name, e.g.
    /// `billing.refunds.process_refund`. Unique within one build.
    pub id: String,
    pub filepath: String,
    pub kind: NodeKind,
    /// Source snippet for context assembly.
    pub source: String,
    /// 1-based line where the construct is declared (0 for modules).
    pub line: usize,
    /// Truncated sha256 of the source, for change detection.
    pub checksum: String,
    /// Ids this node depends on, in declaration order.
    pub dependencies: Vec<String>,
}

impl CodeNode {
    pub fn new(
        id: impl Into<String>,
        filepath: impl Into<String>,
        kind: NodeKind,
        source: impl Into<String>,
        line: usize,
        dependencies: Vec<String>,
    ) -> Self {
        let source = source.into();
        let checksum = short_checksum(source.as_bytes());
        Self {
            id: id.into(),
            filepath: filepath.into(),
            kind,
            source,
            line,
            checksum,
            dependencies,
        }
    }
}

/// Truncated hex sha256 used for node and file change detection.
pub fn short_checksum(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..12].to_string()
}

/// Adjacency-list dependency graph with a mirrored reverse map.
///
/// Invariant: `y ∈ reverse[x] ⇔ x ∈ forward[y]`, maintained on every
/// insertion. Edges may reference ids with no indexed node (external
/// imports); traversals pass through them silently.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, CodeNode>,
    /// id -> ids it depends on.
    forward: HashMap<String, Vec<String>>,
    /// id -> ids that depend on it.
    reverse: HashMap<String, Vec<String>>,
    /// First-insertion order of node ids, for deterministic iteration.
    order: Vec<String>,
}

fn push_unique(edges: &mut Vec<String>, id: &str) {
    if !edges.iter().any(|e| e == id) {
        edges.push(id.to_string());
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, upserting by id, and record its forward edges plus the
    /// symmetric reverse edges.
    pub fn add_node(&mut self, node: CodeNode) {
        if !self.nodes.contains_key(&node.id) {
            self.order.push(node.id.clone());
        }
        for dep in &node.dependencies {
            push_unique(self.forward.entry(node.id.clone()).or_default(), dep);
            push_unique(self.reverse.entry(dep.clone()).or_default(), &node.id);
        }
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn node(&self, id: &str) -> Option<&CodeNode> {
        self.nodes.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node ids in first-insertion order.
    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    /// Nodes this node depends on, up to `max_depth` hops, breadth-first in
    /// discovery order. The start node is excluded; an unknown id yields an
    /// empty result.
    pub fn dependencies_of(&self, id: &str, max_depth: usize) -> Vec<&CodeNode> {
        self.bfs(id, max_depth, &self.forward)
    }

    /// Nodes that depend on this node, up to `max_depth` hops, breadth-first
    /// in discovery order. Used for change-impact analysis and selective
    /// test discovery.
    pub fn dependents_of(&self, id: &str, max_depth: usize) -> Vec<&CodeNode> {
        self.bfs(id, max_depth, &self.reverse)
    }

    fn bfs<'graph>(
        &'graph self,
        start: &str,
        max_depth: usize,
        edges: &'graph HashMap<String, Vec<String>>,
    ) -> Vec<&'graph CodeNode> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut result = Vec::new();
        let mut queue: VecDeque<(&str, usize)> = VecDeque::new();
        queue.push_back((start, 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth > max_depth || !visited.insert(current) {
                continue;
            }
            if current != start {
                if let Some(node) = self.nodes.get(current) {
                    result.push(node);
                }
            }
            if let Some(next) = edges.get(current) {
                for neighbor in next {
                    queue.push_back((neighbor, depth + 1));
                }
            }
        }
        result
    }

    /// Kahn's-algorithm topological order over forward edges: a node appears
    /// only after every node listing it as a dependency.
    ///
    /// In-degree counts incoming forward edges, i.e. how many nodes list the
    /// id as a dependency. If the graph contains a cycle the walk stops when
    /// no zero-in-degree node remains and the result covers only the
    /// acyclic-reachable prefix; cycles are neither detected nor rejected
    /// here.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: HashMap<&str, usize> =
            self.order.iter().map(|id| (id.as_str(), 0)).collect();
        for id in &self.order {
            if let Some(deps) = self.forward.get(id) {
                for dep in deps {
                    if let Some(degree) = in_degree.get_mut(dep.as_str()) {
                        *degree += 1;
                    }
                }
            }
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree[id] == 0)
            .collect();
        let mut result = Vec::new();

        while let Some(id) = queue.pop_front() {
            result.push(id.to_string());
            if let Some(deps) = self.forward.get(id) {
                for dep in deps {
                    if let Some(degree) = in_degree.get_mut(dep.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dep);
                        }
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, deps: Vec<&str>) -> CodeNode {
        CodeNode::new(
            id,
            format!("{}.py", id),
            NodeKind::Module,
            format!("# source of {}", id),
            0,
            deps.into_iter().map(String::from).collect(),
        )
    }

    #[test]
    fn forward_and_reverse_edges_are_symmetric() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec![]));
        graph.add_node(node("b", vec!["a"]));

        let deps: Vec<&str> = graph
            .dependencies_of("b", 1)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(deps, vec!["a"]);

        let dependents: Vec<&str> = graph
            .dependents_of("a", 1)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(dependents, vec!["b"]);
    }

    #[test]
    fn bfs_respects_depth_bound() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec![]));
        graph.add_node(node("b", vec!["a"]));
        graph.add_node(node("c", vec!["b"]));

        let at_depth_1: Vec<&str> = graph
            .dependencies_of("c", 1)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(at_depth_1, vec!["b"]);

        let at_depth_2: Vec<&str> = graph
            .dependencies_of("c", 2)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(at_depth_2, vec!["b", "a"]);
    }

    #[test]
    fn bfs_excludes_start_and_deduplicates() {
        let mut graph = DependencyGraph::new();
        // Diamond: d -> b, c; b -> a; c -> a.
        graph.add_node(node("a", vec![]));
        graph.add_node(node("b", vec!["a"]));
        graph.add_node(node("c", vec!["a"]));
        graph.add_node(node("d", vec!["b", "c"]));

        let deps: Vec<&str> = graph
            .dependencies_of("d", 3)
            .iter()
            .map(|n| n.id.as_str())
            .collect();
        assert_eq!(deps, vec!["b", "c", "a"]);
    }

    #[test]
    fn unknown_id_yields_empty_result() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec![]));
        assert!(graph.dependencies_of("missing", 3).is_empty());
        assert!(graph.dependents_of("missing", 3).is_empty());
    }

    #[test]
    fn edges_to_unindexed_ids_are_traversed_silently() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec!["os", "json"]));
        // External imports have no nodes, so nothing is emitted.
        assert!(graph.dependencies_of("a", 2).is_empty());
    }

    #[test]
    fn upsert_supersedes_node_by_id() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec![]));
        let replacement = CodeNode::new("a", "a.py", NodeKind::Module, "# new", 0, vec![]);
        graph.add_node(replacement);
        assert_eq!(graph.node_count(), 1);
        assert_eq!(graph.node("a").unwrap().source, "# new");
    }

    #[test]
    fn topological_order_lists_dependents_before_dependencies() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("a", vec![]));
        graph.add_node(node("b", vec!["a"]));
        graph.add_node(node("c", vec!["a", "b"]));

        let order = graph.topological_order();
        assert_eq!(order.len(), 3);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        // In-degree counts incoming forward edges, so nodes nothing depends
        // on come first and shared dependencies come last.
        assert!(pos("c") < pos("b"));
        assert!(pos("b") < pos("a"));
    }

    #[test]
    fn topological_order_on_cycle_returns_acyclic_prefix() {
        let mut graph = DependencyGraph::new();
        graph.add_node(node("x", vec!["y"]));
        graph.add_node(node("y", vec!["x"]));
        graph.add_node(node("standalone", vec![]));

        let order = graph.topological_order();
        assert_eq!(order, vec!["standalone".to_string()]);
    }

    #[test]
    fn traversal_is_deterministic_for_same_insertion_order() {
        let build = || {
            let mut graph = DependencyGraph::new();
            graph.add_node(node("a", vec![]));
            graph.add_node(node("b", vec!["a"]));
            graph.add_node(node("c", vec!["a"]));
            graph.add_node(node("d", vec!["b", "c"]));
            graph
        };
        let first = build();
        let second = build();

        let ids = |g: &DependencyGraph| -> Vec<String> {
            g.dependencies_of("d", 3)
                .iter()
                .map(|n| n.id.clone())
                .collect()
        };
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(first.topological_order(), second.topological_order());
    }

    #[test]
    fn short_checksum_is_stable_and_truncated() {
        let first = short_checksum(b"hello");
        let second = short_checksum(b"hello");
        assert_eq!(first, second);
        assert_eq!(first.len(), 12);
        assert_ne!(first, short_checksum(b"world"));
    }
}
