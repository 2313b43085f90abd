//! The `func` node kind: a named, synchronous-looking hook into
//! user-supplied Rust logic (spec.md §3 Kind enumeration).
//!
//! Grounded on `runtime::mod`'s inline `GreetNode` test fixture, generalized
//! into a reusable node any graph-authoring collaborator can construct
//! without defining its own `Node` impl.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::sync::Arc;

use crate::envelope::Envelope;
use crate::node::{Node, NodeContext, RunError};

type Hook = dyn Fn(NodeContext, Envelope) -> BoxFuture<'static, Result<Envelope, RunError>> + Send + Sync;

/// Wraps an arbitrary async closure as a [`Node`]. The closure takes full
/// ownership of the envelope and returns it (or a node-level [`RunError`]),
/// the same contract every other node kind in this module honors.
pub struct FuncNode {
    name: String,
    hook: Arc<Hook>,
}

impl FuncNode {
    pub fn new<F, Fut>(name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(NodeContext, Envelope) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Envelope, RunError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            hook: Arc::new(move |ctx, env| Box::pin(hook(ctx, env))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Node for FuncNode {
    async fn run(&self, ctx: NodeContext, env: Envelope) -> Result<Envelope, RunError> {
        (self.hook)(ctx, env).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Value;
    use crate::events::MemoryEmitter;
    use crate::node::NodeKind;

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("fn1"),
            behavior: crate::node::NodeBehavior::Func,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn hook_runs_and_mutates_envelope() {
        let node = FuncNode::new("double", |_ctx, mut env| async move {
            let n = env.get_var("n").and_then(Value::as_f64).unwrap_or(0.0);
            env.set_var("n", Value::Number(n * 2.0));
            Ok(env)
        });
        let mut env = Envelope::new(Value::Null);
        env.set_var("n", Value::Number(21.0));
        let out = node.run(ctx(), env).await.unwrap();
        assert_eq!(out.get_var("n"), Some(&Value::Number(42.0)));
    }

    #[tokio::test]
    async fn hook_error_propagates() {
        let node = FuncNode::new("fail", |_ctx, _env| async move {
            Err(RunError::NodeFailed {
                node_id: "fn1".into(),
                kind: "func".into(),
                message: "boom".into(),
            })
        });
        let err = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap_err();
        assert!(matches!(err, RunError::NodeFailed { .. }));
    }
}
