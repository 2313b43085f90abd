//! Rule router (spec.md §4.5): ordered `{Conditions, Target, Reason}` rules.

use async_trait::async_trait;

use crate::envelope::{Envelope, Value};
use crate::node::{Node, NodeContext, NodeKind, RouteDecision, Router, RunError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Contains,
    Gt,
    Lt,
    Exists,
    NotExists,
    In,
}

pub struct Condition {
    pub var: String,
    pub op: Operator,
    pub value: Value,
}

pub struct Rule {
    pub conditions: Vec<Condition>,
    pub target: NodeKind,
    pub reason: String,
}

pub struct RuleRouterConfig {
    pub rules: Vec<Rule>,
    pub allow_multiple: bool,
    pub default_target: Option<NodeKind>,
}

impl Default for RuleRouterConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            allow_multiple: false,
            default_target: None,
        }
    }
}

pub struct RuleRouterNode {
    config: RuleRouterConfig,
}

impl RuleRouterNode {
    pub fn new(config: RuleRouterConfig) -> Self {
        Self { config }
    }
}

/// Printed form used for lexicographic string comparisons (spec.md §4.5:
/// "otherwise lexicographic string comparison of printed values").
fn printed(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).to_string(),
        Value::List(_) | Value::Map(_) => serde_json::to_string(&value.to_json()).unwrap_or_default(),
    }
}

fn compare(actual: &Value, expected: &Value) -> std::cmp::Ordering {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => printed(actual).cmp(&printed(expected)),
    }
}

fn eval_condition(cond: &Condition, env: &Envelope) -> bool {
    let actual = env.get_var_nested(&cond.var);
    match cond.op {
        Operator::Exists => actual.is_some(),
        Operator::NotExists => actual.is_none(),
        Operator::Eq => actual.map(|a| a == &cond.value).unwrap_or(false),
        Operator::Neq => actual.map(|a| a != &cond.value).unwrap_or(true),
        Operator::Contains => match actual {
            Some(Value::String(s)) => cond.value.as_str().map(|needle| s.contains(needle)).unwrap_or(false),
            Some(Value::List(items)) => items.contains(&cond.value),
            _ => false,
        },
        Operator::Gt => actual.map(|a| compare(a, &cond.value) == std::cmp::Ordering::Greater).unwrap_or(false),
        Operator::Lt => actual.map(|a| compare(a, &cond.value) == std::cmp::Ordering::Less).unwrap_or(false),
        Operator::In => match &cond.value {
            Value::List(items) => actual.map(|a| items.contains(a)).unwrap_or(false),
            _ => false,
        },
    }
}

fn rule_matches(rule: &Rule, env: &Envelope) -> bool {
    rule.conditions.iter().all(|c| eval_condition(c, env))
}

#[async_trait]
impl Node for RuleRouterNode {
    async fn run(&self, _ctx: NodeContext, env: Envelope) -> Result<Envelope, RunError> {
        Ok(env)
    }
}

#[async_trait]
impl Router for RuleRouterNode {
    async fn route(&self, _ctx: NodeContext, env: &Envelope) -> Result<RouteDecision, RunError> {
        let mut targets = Vec::new();
        let mut reasons = Vec::new();
        for rule in &self.config.rules {
            if rule_matches(rule, env) {
                if !self.config.allow_multiple {
                    return Ok(RouteDecision::single(rule.target.clone(), rule.reason.clone()));
                }
                targets.push(rule.target.clone());
                reasons.push(rule.reason.clone());
            }
        }
        if !targets.is_empty() {
            return Ok(RouteDecision {
                targets,
                reason: reasons.join("; "),
                confidence: None,
                meta: Default::default(),
            });
        }
        match &self.config.default_target {
            Some(target) => Ok(RouteDecision::single(target.clone(), "default route")),
            None => Ok(RouteDecision::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEmitter;

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("router1"),
            behavior: crate::node::NodeBehavior::Router,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn first_matching_rule_wins_by_default() {
        let config = RuleRouterConfig {
            rules: vec![
                Rule {
                    conditions: vec![Condition {
                        var: "status".into(),
                        op: Operator::Eq,
                        value: Value::from("urgent"),
                    }],
                    target: NodeKind::new("escalate"),
                    reason: "urgent".into(),
                },
                Rule {
                    conditions: vec![Condition {
                        var: "status".into(),
                        op: Operator::Exists,
                        value: Value::Null,
                    }],
                    target: NodeKind::new("triage"),
                    reason: "has status".into(),
                },
            ],
            ..Default::default()
        };
        let node = RuleRouterNode::new(config);
        let mut env = Envelope::new(Value::Null);
        env.set_var("status", Value::from("urgent"));
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("escalate")]);
    }

    #[tokio::test]
    async fn allow_multiple_accumulates_all_matches() {
        let config = RuleRouterConfig {
            rules: vec![
                Rule {
                    conditions: vec![Condition {
                        var: "a".into(),
                        op: Operator::Exists,
                        value: Value::Null,
                    }],
                    target: NodeKind::new("n1"),
                    reason: "has a".into(),
                },
                Rule {
                    conditions: vec![Condition {
                        var: "b".into(),
                        op: Operator::Exists,
                        value: Value::Null,
                    }],
                    target: NodeKind::new("n2"),
                    reason: "has b".into(),
                },
            ],
            allow_multiple: true,
            default_target: None,
        };
        let node = RuleRouterNode::new(config);
        let mut env = Envelope::new(Value::Null);
        env.set_var("a", Value::from(1.0));
        env.set_var("b", Value::from(2.0));
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets.len(), 2);
        assert_eq!(decision.reason, "has a; has b");
    }

    #[tokio::test]
    async fn no_match_falls_back_to_default_target() {
        let config = RuleRouterConfig {
            rules: Vec::new(),
            allow_multiple: false,
            default_target: Some(NodeKind::new("fallback")),
        };
        let node = RuleRouterNode::new(config);
        let decision = node.route(ctx(), &Envelope::new(Value::Null)).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("fallback")]);
        assert_eq!(decision.reason, "default route");
    }

    #[tokio::test]
    async fn no_match_and_no_default_yields_empty_decision() {
        let node = RuleRouterNode::new(RuleRouterConfig::default());
        let decision = node.route(ctx(), &Envelope::new(Value::Null)).await.unwrap();
        assert!(decision.is_empty());
    }

    #[tokio::test]
    async fn numeric_comparison_used_when_both_sides_numeric() {
        let config = RuleRouterConfig {
            rules: vec![Rule {
                conditions: vec![Condition {
                    var: "score".into(),
                    op: Operator::Gt,
                    value: Value::from(9.0),
                }],
                target: NodeKind::new("high"),
                reason: "high score".into(),
            }],
            ..Default::default()
        };
        let node = RuleRouterNode::new(config);
        let mut env = Envelope::new(Value::Null);
        env.set_var("score", Value::from(10.0));
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("high")]);
    }
}
