//! Webhook nodes (spec.md §4.7): an outbound HTTP call node and an ingress
//! trigger node that maps a pre-populated request var to output vars.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::envelope::{Envelope, NodeError, Value};
use crate::events::{Event, EventKind};
use crate::node::{Node, NodeContext, RunError};
use crate::nodes::{ErrorPolicy, NodeRetry};
use crate::tools::adapters::pool::HttpClientPool;
use crate::tools::adapters::retry::invoke_with_retry;
use crate::tools::adapters::{ToolError, ToolErrorCode};
use crate::util::template;

/// Either a fixed set of vars (or all vars, when empty) or a rendered
/// template string (spec.md §4.7 "constructs a JSON body... or from a
/// template").
pub enum BodySource {
    Vars { input_vars: Vec<String>, include_artifacts: bool, include_messages: bool, include_trace: bool },
    Template(String),
}

pub struct WebhookCallConfig {
    pub url: String,
    pub method: String,
    pub headers: FxHashMap<String, String>,
    pub timeout: Duration,
    pub body: BodySource,
    pub result_var: String,
    pub error_policy: ErrorPolicy,
    pub retry: NodeRetry,
}

impl Default for WebhookCallConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "POST".to_string(),
            headers: FxHashMap::default(),
            timeout: Duration::from_secs(30),
            body: BodySource::Vars {
                input_vars: Vec::new(),
                include_artifacts: false,
                include_messages: false,
                include_trace: false,
            },
            result_var: "webhook_result".to_string(),
            error_policy: ErrorPolicy::Fail,
            retry: NodeRetry::default(),
        }
    }
}

pub struct WebhookCallNode {
    config: WebhookCallConfig,
    http_pool: std::sync::Arc<HttpClientPool>,
}

impl WebhookCallNode {
    pub fn new(config: WebhookCallConfig, http_pool: std::sync::Arc<HttpClientPool>) -> Self {
        Self { config, http_pool }
    }

    fn build_body(&self, env: &Envelope) -> Value {
        match &self.config.body {
            BodySource::Template(tmpl) => {
                let context = Value::Map(env.vars.clone());
                Value::String(template::render(tmpl, &context))
            }
            BodySource::Vars {
                input_vars,
                include_artifacts,
                include_messages,
                include_trace,
            } => {
                let mut map = FxHashMap::default();
                if input_vars.is_empty() {
                    map.extend(env.vars.clone());
                } else {
                    for name in input_vars {
                        if let Some(v) = env.get_var(name) {
                            map.insert(name.clone(), v.clone());
                        }
                    }
                }
                if *include_artifacts {
                    map.insert(
                        "artifacts".to_string(),
                        Value::List(env.artifacts.iter().map(|a| Value::String(a.id.clone())).collect()),
                    );
                }
                if *include_messages {
                    map.insert(
                        "messages".to_string(),
                        Value::List(env.messages.iter().map(|m| Value::String(m.content.clone())).collect()),
                    );
                }
                if *include_trace {
                    if let Some(trace) = &env.trace {
                        map.insert("trace".to_string(), Value::map([("run_id", Value::String(trace.run_id.clone()))]));
                    }
                }
                Value::Map(map)
            }
        }
    }

    async fn perform(&self, body: &Value) -> Result<Value, ToolError> {
        let client = self.http_pool.get(self.config.timeout).map_err(|e| ToolError::new(ToolErrorCode::TransportFailure, e.to_string()))?;
        let method = reqwest::Method::from_bytes(self.config.method.as_bytes()).map_err(|e| ToolError::new(ToolErrorCode::InvalidRequest, e.to_string()))?;

        let mut builder = client.request(method.clone(), &self.config.url);
        for (key, value) in &self.config.headers {
            builder = builder.header(key, value);
        }
        match body {
            Value::String(s) => builder = builder.body(s.clone()),
            other => builder = builder.json(&other.to_json()),
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ToolError::timeout()
            } else {
                ToolError::new(ToolErrorCode::TransportFailure, e.to_string())
            }
        })?;

        let status = response.status();
        let headers = Value::Map(
            response
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_str().unwrap_or_default().to_string())))
                .collect(),
        );
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::new(ToolErrorCode::DecodeFailure, format!("failed to read response body: {e}")))?;

        let ok = status.is_success();
        let result = Value::map([
            ("ok", Value::Bool(ok)),
            ("status_code", Value::from(status.as_u16() as i64)),
            ("headers", headers),
            ("body", Value::String(text)),
            ("url", Value::String(self.config.url.clone())),
            ("method", Value::String(method.to_string())),
        ]);

        if !ok {
            return Err(ToolError::new(ToolErrorCode::UpstreamFailure, format!("HTTP {status}")).with_details(result));
        }
        Ok(result)
    }
}

#[async_trait]
impl Node for WebhookCallNode {
    async fn run(&self, ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let body = self.build_body(&env);
        ctx.emit(
            Event::new(EventKind::ToolCall, ctx.run_id.clone(), &ctx.node_id, "webhook_call")
                .with_payload("url", Value::String(self.config.url.clone())),
        );

        let cancel = tokio_util::sync::CancellationToken::new();
        let result = invoke_with_retry(self.config.retry.into(), &cancel, |_| {}, |_attempt| self.perform(&body)).await;

        match result {
            Ok((value, _attempts)) => {
                ctx.emit(Event::new(EventKind::ToolResult, ctx.run_id.clone(), &ctx.node_id, "webhook_call").with_payload("is_error", Value::Bool(false)));
                env.set_var(self.config.result_var.clone(), value);
                Ok(env)
            }
            Err(err) => {
                ctx.emit(
                    Event::new(EventKind::ToolResult, ctx.run_id.clone(), &ctx.node_id, "webhook_call")
                        .with_payload("is_error", Value::Bool(true))
                        .with_payload("message", Value::String(err.message.clone())),
                );
                let fallback = err.details.clone();
                let result = if fallback.is_null() {
                    Value::map([("ok", Value::Bool(false)), ("error", Value::String(err.message.clone()))])
                } else {
                    fallback
                };
                match self.config.error_policy {
                    ErrorPolicy::Fail => Err(RunError::Tool(err)),
                    ErrorPolicy::Continue | ErrorPolicy::Record => {
                        env.set_var(self.config.result_var.clone(), result);
                        env.append_error(NodeError::new(ctx.node_id.as_str(), "webhook_call", err.message.clone()));
                        Ok(env)
                    }
                }
            }
        }
    }
}

/// RFC 7230 §3.2.6 token grammar: the set of characters a valid HTTP
/// method/header token may contain.
static HTTP_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[!#$%&'*+\-.^_`|~0-9A-Za-z]+$").unwrap());

pub fn is_valid_http_method(method: &str) -> bool {
    !method.is_empty() && HTTP_TOKEN_RE.is_match(method)
}

/// Ingress trigger config: splits `__webhook_request` into configured
/// output vars (spec.md §4.7).
pub struct WebhookTriggerConfig {
    pub request_var: String,
    pub output_request_var: String,
    pub output_body_var: String,
    pub output_headers_var: String,
    pub output_query_var: String,
    pub output_meta_var: String,
}

impl Default for WebhookTriggerConfig {
    fn default() -> Self {
        Self {
            request_var: "__webhook_request".to_string(),
            output_request_var: "request".to_string(),
            output_body_var: "body".to_string(),
            output_headers_var: "headers".to_string(),
            output_query_var: "query".to_string(),
            output_meta_var: "meta".to_string(),
        }
    }
}

pub struct WebhookTriggerNode {
    config: WebhookTriggerConfig,
}

impl WebhookTriggerNode {
    pub fn new(config: WebhookTriggerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Node for WebhookTriggerNode {
    async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let request = env.get_var(&self.config.request_var).cloned().ok_or_else(|| RunError::MissingInput {
            what: self.config.request_var.clone(),
        })?;
        let Some(map) = request.as_map() else {
            return Err(RunError::ValidationFailed(format!("{} is not an object", self.config.request_var)));
        };

        if let Some(Value::String(method)) = map.get("method") {
            if !is_valid_http_method(method) {
                return Err(RunError::ValidationFailed(format!("invalid HTTP method '{method}'")));
            }
        }

        env.set_var(self.config.output_request_var.clone(), request.clone());
        env.set_var(self.config.output_body_var.clone(), map.get("body").cloned().unwrap_or(Value::Null));
        env.set_var(self.config.output_headers_var.clone(), map.get("headers").cloned().unwrap_or_else(|| Value::map([])));
        env.set_var(self.config.output_query_var.clone(), map.get("query").cloned().unwrap_or_else(|| Value::map([])));
        env.set_var(self.config.output_meta_var.clone(), map.get("meta").cloned().unwrap_or_else(|| Value::map([])));
        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEmitter;
    use crate::node::NodeKind;
    use httpmock::prelude::*;

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("webhook1"),
            behavior: crate::node::NodeBehavior::WebhookCall,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn error_policy_record_stores_failure_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(500).body("boom");
        });
        let node = WebhookCallNode::new(
            WebhookCallConfig {
                url: server.url("/hook"),
                error_policy: ErrorPolicy::Record,
                ..Default::default()
            },
            HttpClientPool::new(),
        );
        let out = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        let result = out.get_var("webhook_result").unwrap().as_map().unwrap();
        assert_eq!(result.get("ok").unwrap().as_bool(), Some(false));
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn success_stores_response_shape() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/hook");
            then.status(200).json_body(serde_json::json!({"received": true}));
        });
        let node = WebhookCallNode::new(
            WebhookCallConfig {
                url: server.url("/hook"),
                ..Default::default()
            },
            HttpClientPool::new(),
        );
        let out = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        let result = out.get_var("webhook_result").unwrap().as_map().unwrap();
        assert_eq!(result.get("status_code").unwrap().as_f64(), Some(200.0));
    }

    #[tokio::test]
    async fn trigger_splits_request_into_output_vars() {
        let node = WebhookTriggerNode::new(WebhookTriggerConfig::default());
        let mut env = Envelope::new(Value::Null);
        env.set_var(
            "__webhook_request",
            Value::map([
                ("method", Value::from("POST")),
                ("body", Value::map([("x", Value::from(1.0))])),
                ("headers", Value::map([("content-type", Value::from("application/json"))])),
            ]),
        );
        let out = node.run(ctx(), env).await.unwrap();
        assert_eq!(out.get_var("body").unwrap().as_map().unwrap().get("x").unwrap().as_f64(), Some(1.0));
        assert!(out.get_var("headers").is_some());
    }

    #[tokio::test]
    async fn trigger_rejects_invalid_method() {
        let node = WebhookTriggerNode::new(WebhookTriggerConfig::default());
        let mut env = Envelope::new(Value::Null);
        env.set_var("__webhook_request", Value::map([("method", Value::from("BAD METHOD"))]));
        let err = node.run(ctx(), env).await.unwrap_err();
        assert!(matches!(err, RunError::ValidationFailed(_)));
    }

    #[test]
    fn http_token_grammar_rejects_spaces() {
        assert!(is_valid_http_method("POST"));
        assert!(!is_valid_http_method("BAD METHOD"));
    }
}
