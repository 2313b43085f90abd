//! Concrete node kinds built on the [`Node`](crate::node::Node)/
//! [`Router`](crate::node::Router) contract (spec.md §3, §4.3–§4.7).

pub mod func;
pub mod guardian;
pub mod llm_node;
pub mod router;
pub mod tool_node;
pub mod transform;
pub mod webhook;

use std::time::Duration;

/// Shared error-handling policy for the Tool and Webhook nodes (spec.md
/// §4.4, §4.7: "identical to the Tool node").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ErrorPolicy {
    #[default]
    Fail,
    Continue,
    Record,
}

/// Linear-backoff retry knobs shared by every node that wraps a fallible
/// external call (spec.md §4.3, §4.4, §9).
#[derive(Clone, Copy, Debug)]
pub struct NodeRetry {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for NodeRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(0),
        }
    }
}

impl From<NodeRetry> for crate::tools::adapters::retry::RetryPolicy {
    fn from(r: NodeRetry) -> Self {
        crate::tools::adapters::retry::RetryPolicy::new(r.max_attempts, r.backoff)
    }
}
