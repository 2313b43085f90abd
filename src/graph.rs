//! Static graph topology: nodes, unconditional edges, and a compile step.
//!
//! Grounded on `weavegraph::graphs::{builder, compilation, edges}`, collapsed
//! into a single module: the teacher splits builder/compilation/edges across
//! files because it also carries conditional-edge predicates and a reducer
//! registry that PetalFlow's simpler sequential scheduler (spec.md §4.2) has
//! no use for. Router nodes replace predicate-edges entirely (spec.md §4.5).

use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::node::{Node, NodeKind, Router};

/// The virtual end-of-graph marker; never registered via
/// [`GraphBuilder::add_node`]. There is no virtual start marker: the graph's
/// `Entry` field names the real first node directly (spec.md §3).
pub const END: &str = "__end__";

/// A registered node, keeping a `Node` handle for execution plus an
/// optional `Router` handle the scheduler consults after running the node
/// (spec.md §9: routers additionally expose `Route`).
#[derive(Clone)]
pub struct NodeEntry {
    node: Arc<dyn Node>,
    router: Option<Arc<dyn Router>>,
}

impl NodeEntry {
    fn plain(node: Arc<dyn Node>) -> Self {
        Self { node, router: None }
    }

    fn routed(router: Arc<dyn Router>) -> Self {
        Self {
            node: router.clone() as Arc<dyn Node>,
            router: Some(router),
        }
    }

    pub fn as_node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn as_router(&self) -> Option<&Arc<dyn Router>> {
        self.router.as_ref()
    }
}

/// Errors raised while compiling a [`GraphBuilder`] into a [`Graph`].
#[derive(Debug, Error)]
pub enum GraphCompileError {
    #[error("graph has no nodes")]
    Empty,

    #[error("entry node '{0}' was never registered")]
    UnknownEntry(String),

    #[error("node '{0}' has an outgoing edge but was never registered")]
    UnknownNode(String),

    #[error("node '{0}' is registered but unreachable from the entry")]
    Unreachable(String),
}

/// Builder for constructing a [`Graph`] with a fluent API, mirroring the
/// teacher's `GraphBuilder`.
#[derive(Default)]
pub struct GraphBuilder {
    entry: Option<NodeKind>,
    nodes: FxHashMap<NodeKind, NodeEntry>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entry(mut self, id: impl Into<NodeKind>) -> Self {
        self.entry = Some(id.into());
        self
    }

    #[must_use]
    pub fn add_node(mut self, id: impl Into<NodeKind>, node: Arc<dyn Node>) -> Self {
        self.nodes.insert(id.into(), NodeEntry::plain(node));
        self
    }

    #[must_use]
    pub fn add_router_node(mut self, id: impl Into<NodeKind>, router: Arc<dyn Router>) -> Self {
        self.nodes.insert(id.into(), NodeEntry::routed(router));
        self
    }

    /// Unconditional successor edge. `to` may be [`END`] or any registered
    /// node id.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<NodeKind>, to: impl Into<NodeKind>) -> Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Validates and compiles the graph (spec.md §3: entry resolves to a
    /// known node; every successor exists; no duplicate node ids — the
    /// last being automatic since `nodes` is a map).
    pub fn compile(self) -> Result<Graph, GraphCompileError> {
        let end = NodeKind::new(END);

        if self.nodes.is_empty() {
            return Err(GraphCompileError::Empty);
        }
        let entry = self.entry.ok_or(GraphCompileError::Empty)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphCompileError::UnknownEntry(entry.as_str().to_string()));
        }

        for (from, targets) in &self.edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphCompileError::UnknownNode(from.as_str().to_string()));
            }
            for target in targets {
                if target != &end && !self.nodes.contains_key(target) {
                    return Err(GraphCompileError::UnknownNode(target.as_str().to_string()));
                }
            }
        }

        let mut reachable: std::collections::HashSet<NodeKind> = std::collections::HashSet::new();
        let mut stack = vec![entry.clone()];
        while let Some(current) = stack.pop() {
            if !reachable.insert(current.clone()) {
                continue;
            }
            if let Some(targets) = self.edges.get(&current) {
                for target in targets {
                    if target != &end {
                        stack.push(target.clone());
                    }
                }
            }
        }
        for node_id in self.nodes.keys() {
            if !reachable.contains(node_id) {
                return Err(GraphCompileError::Unreachable(node_id.as_str().to_string()));
            }
        }

        Ok(Graph {
            entry,
            nodes: self.nodes,
            edges: self.edges,
        })
    }
}

/// A compiled, immutable workflow graph ready for execution by
/// [`crate::runtime::Runtime`].
pub struct Graph {
    entry: NodeKind,
    nodes: FxHashMap<NodeKind, NodeEntry>,
    edges: FxHashMap<NodeKind, Vec<NodeKind>>,
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn entry(&self) -> &NodeKind {
        &self.entry
    }

    pub fn node(&self, id: &NodeKind) -> Option<&NodeEntry> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeKind) -> bool {
        self.nodes.contains_key(id)
    }

    /// Unconditional successors of `id`. Empty means "fall through to end".
    pub fn successors(&self, id: &NodeKind) -> &[NodeKind] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_end(id: &NodeKind) -> bool {
        id.as_str() == END
    }
}
