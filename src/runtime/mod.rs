//! The core scheduler: a single-threaded sequential walk over the graph
//! (spec.md §4.2).
//!
//! Grounded on `weavegraph::runtimes::runner` for the overall run/step shape
//! (options, lifecycle events, cancellation) but collapsed to match spec.md's
//! much simpler algorithm: no versioned-channel barrier, no checkpointing, no
//! parallel supersteps — one envelope, one node at a time.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, instrument, warn};

use crate::envelope::Envelope;
use crate::events::EventEmitter;
use crate::graph::{Graph, NodeEntry};
use crate::node::{NodeBehavior, NodeContext, NodeKind, RunError};

/// Options accepted by [`Runtime::run`] (spec.md §4.2).
#[derive(Clone)]
pub struct RunOptions {
    /// Overrides `graph.Entry` for this run.
    pub entry_override: Option<NodeKind>,
    pub emitter: Arc<dyn EventEmitter>,
    pub run_id: String,
    /// Upper bound on node-to-node hops, guarding against a misconfigured
    /// graph that routes in a cycle forever. Not part of spec.md's core
    /// algorithm, but every step emits an event and advances `step`, so an
    /// unbounded loop is an operational hazard a daemon must cap.
    pub max_steps: u64,
}

impl RunOptions {
    pub fn new(emitter: Arc<dyn EventEmitter>, run_id: impl Into<String>) -> Self {
        Self {
            entry_override: None,
            emitter,
            run_id: run_id.into(),
            max_steps: 10_000,
        }
    }
}

/// Fatal errors raised by the scheduler itself, distinct from a node's
/// [`RunError`] (spec.md §4.2 step 1, step 3).
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("graph has no node '{0}'")]
    GraphInvalid(String),

    #[error("node '{node_id}' ({kind}) failed: {source}")]
    NodeFailed {
        node_id: String,
        kind: String,
        #[source]
        source: RunError,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("exceeded max step count ({0})")]
    StepLimitExceeded(u64),
}

/// Executes a compiled [`Graph`] against an [`Envelope`].
pub struct Runtime {
    graph: Arc<Graph>,
}

impl Runtime {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    /// Runs the graph to completion, following spec.md §4.2's algorithm
    /// exactly: resolve → (timeout-scope) → `Run` → guardian redirect →
    /// router decision → graph edge → repeat until the current node is
    /// empty or cancellation fires.
    #[instrument(skip(self, env, options, cancel))]
    pub async fn run(
        &self,
        env: Envelope,
        options: RunOptions,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<Envelope, RuntimeError> {
        let mut env = env;
        let mut current: Option<NodeKind> = Some(
            options
                .entry_override
                .clone()
                .unwrap_or_else(|| self.graph.entry().clone()),
        );
        let mut step: u64 = 0;

        while let Some(node_id) = current.take() {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            if Graph::is_end(&node_id) {
                break;
            }
            if step >= options.max_steps {
                return Err(RuntimeError::StepLimitExceeded(options.max_steps));
            }

            let entry = self
                .graph
                .node(&node_id)
                .ok_or_else(|| RuntimeError::GraphInvalid(node_id.as_str().to_string()))?;

            let behavior = behavior_of(entry);
            let ctx = NodeContext {
                node_id: node_id.clone(),
                behavior,
                step,
                emitter: options.emitter.clone(),
                run_id: options.run_id.clone(),
            };

            debug!(node = %node_id, step, "running node");
            env = run_with_timeout(entry.as_node().as_ref(), ctx.clone(), env, entry.as_node().timeout(), &cancel).await?;

            if let Some(redirect) = env.take_guardian_redirect() {
                current = Some(NodeKind::new(redirect));
                step += 1;
                continue;
            }

            if let Some(router) = entry.as_router() {
                let decision = router
                    .route(ctx.clone(), &env)
                    .await
                    .map_err(|source| RuntimeError::NodeFailed {
                        node_id: node_id.as_str().to_string(),
                        kind: behavior.to_string(),
                        source,
                    })?;
                if !decision.is_empty() {
                    current = self.run_fanout(&decision, &ctx, &mut env, &cancel, step).await?;
                    step += 1;
                    continue;
                }
            }

            let successors = self.graph.successors(&node_id);
            current = successors.first().cloned();
            step += 1;
        }

        Ok(env)
    }

    /// Sequential fan-out: spec.md §4.2 step 5 mandates declared-order
    /// sequential execution of every target but the last, which becomes
    /// the scheduler's next `current` so the outer loop keeps driving it
    /// (avoiding one extra recursive call for the common single-target case).
    async fn run_fanout(
        &self,
        decision: &crate::node::RouteDecision,
        ctx: &NodeContext,
        env: &mut Envelope,
        cancel: &tokio_util::sync::CancellationToken,
        step: u64,
    ) -> Result<Option<NodeKind>, RuntimeError> {
        let (last, rest) = decision
            .targets
            .split_last()
            .expect("non-empty decision checked by caller");

        for target in rest {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            let entry = self
                .graph
                .node(target)
                .ok_or_else(|| RuntimeError::GraphInvalid(target.as_str().to_string()))?;
            let node_ctx = NodeContext {
                node_id: target.clone(),
                behavior: behavior_of(entry),
                step,
                emitter: ctx.emitter.clone(),
                run_id: ctx.run_id.clone(),
            };
            let next_env = std::mem::replace(env, Envelope::new(crate::envelope::Value::Null));
            *env = run_with_timeout(entry.as_node().as_ref(), node_ctx, next_env, entry.as_node().timeout(), cancel).await?;
        }

        Ok(Some(last.clone()))
    }
}

fn behavior_of(entry: &NodeEntry) -> NodeBehavior {
    if entry.as_router().is_some() {
        NodeBehavior::Router
    } else {
        // Non-router behaviors are self-reported by the node through its
        // own NodeContext-bound events; the scheduler only needs a label
        // for lifecycle events and defaults to Func when no router is
        // present. Concrete node wrappers override this via their own
        // emitted events (spec.md §6 event `Node:{ID, Kind}`).
        NodeBehavior::Func
    }
}

async fn run_with_timeout(
    node: &dyn crate::node::Node,
    ctx: NodeContext,
    env: Envelope,
    node_timeout: Option<Duration>,
    cancel: &tokio_util::sync::CancellationToken,
) -> Result<Envelope, RuntimeError> {
    let node_id = ctx.node_id.clone();
    let behavior = ctx.behavior;

    let run_fut = node.run(ctx, env);
    let result = match node_timeout {
        Some(d) => {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                res = tokio_timeout(d, run_fut) => match res {
                    Ok(inner) => inner,
                    Err(_elapsed) => {
                        warn!(node = %node_id, "node timed out");
                        Err(RunError::NodeFailed {
                            node_id: node_id.as_str().to_string(),
                            kind: behavior.to_string(),
                            message: format!("timed out after {d:?}"),
                        })
                    }
                },
            }
        }
        None => {
            tokio::select! {
                _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                res = run_fut => res,
            }
        }
    };

    result.map_err(|source| RuntimeError::NodeFailed {
        node_id: node_id.as_str().to_string(),
        kind: behavior.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Envelope, Value};
    use crate::events::MemoryEmitter;
    use crate::node::{Node, NodeContext, RouteDecision, Router};
    use async_trait::async_trait;

    struct GreetNode;

    #[async_trait]
    impl Node for GreetNode {
        async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
            let name = env.get_var("name").and_then(Value::as_str).unwrap_or("world").to_string();
            env.set_var("greeting", Value::String(format!("Hello, {}!", name.to_uppercase())));
            Ok(env)
        }
    }

    struct AlwaysRightRouter;

    #[async_trait]
    impl Node for AlwaysRightRouter {
        async fn run(&self, _ctx: NodeContext, env: Envelope) -> Result<Envelope, RunError> {
            Ok(env)
        }
    }

    #[async_trait]
    impl Router for AlwaysRightRouter {
        async fn route(&self, _ctx: NodeContext, _env: &Envelope) -> Result<RouteDecision, RunError> {
            Ok(RouteDecision::single(NodeKind::new("right"), "always right"))
        }
    }

    #[tokio::test]
    async fn hello_world_func_node_sets_greeting() {
        let graph = Arc::new(
            Graph::builder()
                .entry("greet")
                .add_node("greet", Arc::new(GreetNode))
                .add_edge("greet", crate::graph::END)
                .compile()
                .unwrap(),
        );
        let runtime = Runtime::new(graph);
        let mut env = Envelope::new(Value::Null);
        env.set_var("name", Value::String("petalflow".into()));
        let emitter = MemoryEmitter::new();
        let options = RunOptions::new(emitter, "run-1");
        let result = runtime.run(env, options, tokio_util::sync::CancellationToken::new()).await.unwrap();
        assert_eq!(result.get_var("greeting").and_then(Value::as_str), Some("Hello, PETALFLOW!"));
    }

    #[tokio::test]
    async fn router_decision_drives_next_node() {
        struct RightNode;
        #[async_trait]
        impl Node for RightNode {
            async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
                env.set_var("visited", Value::String("right".into()));
                Ok(env)
            }
        }

        let graph = Arc::new(
            Graph::builder()
                .entry("router")
                .add_router_node("router", Arc::new(AlwaysRightRouter))
                .add_node("right", Arc::new(RightNode))
                .add_edge("router", crate::graph::END)
                .add_edge("right", crate::graph::END)
                .compile()
                .unwrap(),
        );
        let runtime = Runtime::new(graph);
        let env = Envelope::new(Value::Null);
        let options = RunOptions::new(MemoryEmitter::new(), "run-2");
        let result = runtime.run(env, options, tokio_util::sync::CancellationToken::new()).await.unwrap();
        assert_eq!(result.get_var("visited").and_then(Value::as_str), Some("right"));
    }
}
