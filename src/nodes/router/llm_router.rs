//! LLM router (spec.md §4.5): classifies the envelope into one of a fixed
//! set of labels and maps the label to a target node id.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::envelope::{Envelope, Value};
use crate::llm::{Budget, LLMClient, LLMRequest};
use crate::node::{Node, NodeContext, NodeKind, RouteDecision, Router, RunError};

pub struct LlmRouterConfig {
    pub model: String,
    pub system: Option<String>,
    pub input_vars: Vec<String>,
    /// label -> target node id.
    pub targets: FxHashMap<String, NodeKind>,
    pub result_var: String,
    pub budget: Budget,
}

impl Default for LlmRouterConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system: None,
            input_vars: Vec::new(),
            targets: FxHashMap::default(),
            result_var: "router_classification".to_string(),
            budget: Budget::default(),
        }
    }
}

pub struct LlmRouterNode {
    config: LlmRouterConfig,
    client: Arc<dyn LLMClient>,
}

impl LlmRouterNode {
    pub fn new(config: LlmRouterConfig, client: Arc<dyn LLMClient>) -> Self {
        Self { config, client }
    }

    fn build_prompt(&self, env: &Envelope) -> String {
        let allowed: Vec<&str> = self.config.targets.keys().map(|s| s.as_str()).collect();
        let mut sections = Vec::new();
        for name in &self.config.input_vars {
            if let Some(value) = env.get_var_nested(name) {
                sections.push(format!("{name}: {}", printed(value)));
            }
        }
        format!(
            "Classify the input into exactly one of these labels: {}.\n{}\nRespond as JSON: {{\"choice\": <label>, \"reason\": <string>, \"confidence\": <0..1>}}.",
            allowed.join(", "),
            sections.join("\n")
        )
    }

    /// Parses the model's response: structured `json` field first, then
    /// free-text JSON, then a best-effort substring scan for an allowed
    /// label (spec.md §4.5).
    fn parse_choice(&self, text: &str, json: Option<&Value>) -> Option<(String, String, Option<f64>)> {
        if let Some(Value::Map(map)) = json {
            if let Some(choice) = map.get("choice").and_then(|v| v.as_str()) {
                let reason = map.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let confidence = map.get("confidence").and_then(|v| v.as_f64());
                return Some((choice.to_string(), reason, confidence));
            }
        }
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) {
            if let Some(choice) = parsed.get("choice").and_then(|v| v.as_str()) {
                let reason = parsed.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let confidence = parsed.get("confidence").and_then(|v| v.as_f64());
                return Some((choice.to_string(), reason, confidence));
            }
        }
        for label in self.config.targets.keys() {
            if text.contains(label.as_str()) {
                return Some((label.clone(), "substring match".to_string(), None));
            }
        }
        None
    }
}

fn printed(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
    }
}

#[async_trait]
impl Node for LlmRouterNode {
    async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let prompt = self.build_prompt(&env);
        let request = LLMRequest {
            model: self.config.model.clone(),
            system: self.config.system.clone(),
            input_text: prompt,
            json_schema: Some(Value::map([("type", Value::from("object"))])),
            ..Default::default()
        };

        let response = self.client.complete(&request).await.map_err(|e| RunError::Provider {
            provider: "llm_router".into(),
            message: e.to_string(),
        })?;

        self.config.budget.check(&response.usage).map_err(RunError::BudgetExceeded)?;

        let (choice, reason, confidence) = self
            .parse_choice(&response.text, response.json.as_ref())
            .ok_or_else(|| RunError::ValidationFailed("router: could not parse a choice from the model response".into()))?;

        if !self.config.targets.contains_key(&choice) {
            return Err(RunError::ValidationFailed(format!("router: unknown label '{choice}'")));
        }

        env.set_var(
            self.config.result_var.clone(),
            Value::map([
                ("choice", Value::String(choice)),
                ("reason", Value::String(reason)),
                ("confidence", confidence.map(Value::from).unwrap_or(Value::Null)),
            ]),
        );
        Ok(env)
    }
}

#[async_trait]
impl Router for LlmRouterNode {
    async fn route(&self, _ctx: NodeContext, env: &Envelope) -> Result<RouteDecision, RunError> {
        let classification = env
            .get_var(&self.config.result_var)
            .and_then(|v| v.as_map())
            .ok_or_else(|| RunError::ValidationFailed("router: missing classification result".into()))?;
        let choice = classification.get("choice").and_then(|v| v.as_str()).unwrap_or_default();
        let reason = classification.get("reason").and_then(|v| v.as_str()).unwrap_or_default();
        let confidence = classification.get("confidence").and_then(|v| v.as_f64());
        let target = self
            .config
            .targets
            .get(choice)
            .ok_or_else(|| RunError::ValidationFailed(format!("router: unknown label '{choice}'")))?;
        Ok(RouteDecision {
            targets: vec![target.clone()],
            reason: reason.to_string(),
            confidence,
            meta: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEmitter;
    use crate::llm::{LLMError, LLMResponse, Usage};

    struct StubClient {
        text: String,
        json: Option<Value>,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _req: &LLMRequest) -> Result<LLMResponse, LLMError> {
            Ok(LLMResponse {
                text: self.text.clone(),
                json: self.json.clone(),
                model: "stub".into(),
                provider: "stub".into(),
                usage: Usage::default(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("router1"),
            behavior: crate::node::NodeBehavior::Router,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    fn targets() -> FxHashMap<String, NodeKind> {
        let mut map = FxHashMap::default();
        map.insert("billing".to_string(), NodeKind::new("billing_node"));
        map.insert("support".to_string(), NodeKind::new("support_node"));
        map
    }

    #[tokio::test]
    async fn structured_choice_field_maps_to_target() {
        let client = Arc::new(StubClient {
            text: "ignored".into(),
            json: Some(Value::map([("choice", Value::from("billing")), ("reason", Value::from("invoice question"))])),
        });
        let node = LlmRouterNode::new(
            LlmRouterConfig {
                targets: targets(),
                ..Default::default()
            },
            client,
        );
        let env = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("billing_node")]);
    }

    #[tokio::test]
    async fn free_text_json_is_parsed_when_no_structured_field() {
        let client = Arc::new(StubClient {
            text: r#"{"choice": "support", "reason": "needs help"}"#.into(),
            json: None,
        });
        let node = LlmRouterNode::new(
            LlmRouterConfig {
                targets: targets(),
                ..Default::default()
            },
            client,
        );
        let env = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("support_node")]);
    }

    #[tokio::test]
    async fn substring_scan_finds_label_in_free_text() {
        let client = Arc::new(StubClient {
            text: "I think this is a billing issue.".into(),
            json: None,
        });
        let node = LlmRouterNode::new(
            LlmRouterConfig {
                targets: targets(),
                ..Default::default()
            },
            client,
        );
        let env = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        let decision = node.route(ctx(), &env).await.unwrap();
        assert_eq!(decision.targets, vec![NodeKind::new("billing_node")]);
    }

    #[tokio::test]
    async fn unknown_label_is_fatal() {
        let client = Arc::new(StubClient {
            text: "".into(),
            json: Some(Value::map([("choice", Value::from("unknown_label"))])),
        });
        let node = LlmRouterNode::new(
            LlmRouterConfig {
                targets: targets(),
                ..Default::default()
            },
            client,
        );
        let err = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap_err();
        assert!(matches!(err, RunError::ValidationFailed(_)));
    }
}
