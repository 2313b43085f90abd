//! Router nodes (spec.md §4.5): rule-based and LLM-based next-hop
//! selection.

pub mod llm_router;
pub mod rule;

pub use llm_router::{LlmRouterConfig, LlmRouterNode};
pub use rule::{Condition, Operator, Rule, RuleRouterConfig, RuleRouterNode};
