//! Node execution contract for the PetalFlow workflow engine.
//!
//! Grounded on `weavegraph::node`'s `Node` trait / `NodeContext` shape, but
//! nodes here receive and return the mutable [`Envelope`] directly (spec.md
//! §4.2) rather than a read-only snapshot plus a merged partial.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::events::EventEmitter;

#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

/// Identifies a node instance within a [`Graph`](crate::graph::Graph).
///
/// An open string newtype rather than a closed enum: custom/func nodes and
/// graph-authoring tooling need no engine changes to introduce new ids,
/// mirroring the teacher's `NodeKind::Custom(String)` escape hatch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKind(pub String);

impl NodeKind {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeKind {
    fn from(s: &str) -> Self {
        NodeKind(s.to_string())
    }
}

impl From<String> for NodeKind {
    fn from(s: String) -> Self {
        NodeKind(s)
    }
}

/// Behavior tag used for dispatch and diagnostics; distinct from
/// [`NodeKind`] identity per spec.md §3's Kind enumeration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeBehavior {
    Llm,
    Tool,
    Router,
    Transform,
    Guardian,
    WebhookCall,
    WebhookTrigger,
    Func,
}

impl fmt::Display for NodeBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeBehavior::Llm => "llm",
            NodeBehavior::Tool => "tool",
            NodeBehavior::Router => "router",
            NodeBehavior::Transform => "transform",
            NodeBehavior::Guardian => "guardian",
            NodeBehavior::WebhookCall => "webhook_call",
            NodeBehavior::WebhookTrigger => "webhook_trigger",
            NodeBehavior::Func => "func",
        };
        write!(f, "{s}")
    }
}

/// A single next-hop target proposed by a router, with reason and
/// confidence (spec.md §3).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteDecision {
    pub targets: Vec<NodeKind>,
    pub reason: String,
    pub confidence: Option<f64>,
    pub meta: std::collections::HashMap<String, crate::envelope::Value>,
}

impl RouteDecision {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(target: NodeKind, reason: impl Into<String>) -> Self {
        Self {
            targets: vec![target],
            reason: reason.into(),
            confidence: None,
            meta: Default::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Execution context passed to every node invocation.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeKind,
    pub behavior: NodeBehavior,
    pub step: u64,
    pub emitter: Arc<dyn EventEmitter>,
    pub run_id: String,
}

impl NodeContext {
    pub fn emit(&self, event: crate::events::Event) {
        // Event emission is best-effort: a full subscriber channel must
        // never fail node execution (spec.md §5 ordering guarantees are
        // about emission order, not delivery guarantees).
        let _ = self.emitter.emit(event);
    }
}

/// Errors that halt workflow execution when returned from
/// [`Node::run`]. Recoverable, policy-swallowed errors go into
/// [`Envelope::errors`](crate::envelope::Envelope::errors) instead.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum RunError {
    #[error("missing expected input: {what}")]
    MissingInput { what: String },

    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("tool error: {0}")]
    Tool(#[from] crate::tools::adapters::ToolError),

    #[error("{node_id} ({kind}): {message}")]
    NodeFailed {
        node_id: String,
        kind: String,
        message: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

/// Core trait implemented by every executable workflow node.
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute this node against the given envelope, returning the
    /// (possibly mutated) envelope or a fatal [`RunError`].
    async fn run(&self, ctx: NodeContext, env: Envelope) -> Result<Envelope, RunError>;

    /// Optional per-node timeout; `None` means the parent context's
    /// deadline (if any) applies unchanged (spec.md §4.2 step 2).
    fn timeout(&self) -> Option<std::time::Duration> {
        None
    }
}

/// Additional surface exposed by router nodes (spec.md §3).
#[async_trait]
pub trait Router: Node {
    async fn route(&self, ctx: NodeContext, env: &Envelope) -> Result<RouteDecision, RunError>;
}
