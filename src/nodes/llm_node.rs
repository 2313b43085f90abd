//! The LLM node (spec.md §4.3): prompt assembly, streaming-preferred
//! dispatch, linear-backoff retry, budget enforcement, and an iterative
//! tool-call loop.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;

use crate::envelope::{Envelope, EnvelopeMessage, Value};
use crate::events::{Event, EventKind};
use crate::llm::{derive_tasks_view, Budget, LLMClient, LLMError, LLMRequest, StreamingLLMClient, ToolSpec, Usage};
use crate::node::{Node, NodeContext, RunError};
use crate::nodes::tool_node::resolve_registry_adapter;
use crate::nodes::NodeRetry;
use crate::secret::SecretKey;
use crate::tools::adapters::pool::{HttpClientPool, McpClientPool};
use crate::tools::adapters::{InvokeContext, ToolInvokeRequest};
use crate::tools::registry::Store;
use crate::util::template;

/// Where the tool-call loop resolves a named tool from (spec.md §4.3 "the
/// named tool from the registry"). `None` disables the loop even if the
/// model returns tool calls — they are simply left unresolved.
pub struct ToolRegistryHandle {
    pub store: Arc<dyn Store>,
    pub http_pool: Arc<HttpClientPool>,
    pub mcp_pool: Arc<McpClientPool>,
    pub native_registry: Arc<crate::tools::adapters::native::NativeToolRegistry>,
    pub secret_key: SecretKey,
}

pub struct LlmNodeConfig {
    pub model: String,
    pub system: Option<String>,
    pub prompt_template: Option<String>,
    pub input_vars: Vec<String>,
    pub tools: Vec<ToolSpec>,
    pub json_schema: Option<Value>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub budget: Budget,
    pub retry: NodeRetry,
    pub output_key: String,
    pub record_messages: bool,
    pub max_tool_iterations: u32,
}

impl Default for LlmNodeConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system: None,
            prompt_template: None,
            input_vars: Vec::new(),
            tools: Vec::new(),
            json_schema: None,
            temperature: None,
            max_tokens: None,
            budget: Budget::default(),
            retry: NodeRetry::default(),
            output_key: "output".to_string(),
            record_messages: false,
            max_tool_iterations: 8,
        }
    }
}

pub struct LlmNode {
    config: LlmNodeConfig,
    client: Arc<dyn LLMClient>,
    streaming_client: Option<Arc<dyn StreamingLLMClient>>,
    registry: Option<ToolRegistryHandle>,
}

impl LlmNode {
    pub fn new(config: LlmNodeConfig, client: Arc<dyn LLMClient>) -> Self {
        Self {
            config,
            client,
            streaming_client: None,
            registry: None,
        }
    }

    /// Enables the streaming dispatch path (spec.md §4.3: only used when
    /// `JSONSchema` is not required).
    pub fn with_streaming(mut self, streaming_client: Arc<dyn StreamingLLMClient>) -> Self {
        self.streaming_client = Some(streaming_client);
        self
    }

    /// Enables the tool-call loop against a registered tool set.
    pub fn with_tool_registry(mut self, registry: ToolRegistryHandle) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the prompt template's interpolation context: `input`, `vars`,
    /// and the derived `tasks` view, plus every top-level var directly
    /// (spec.md §4.3).
    fn template_context(&self, env: &Envelope) -> Value {
        let mut ctx = env.vars.clone();
        let input_view = if !env.input.is_null() { env.input.clone() } else { Value::Map(env.vars.clone()) };
        ctx.insert("input".to_string(), input_view);
        ctx.insert("vars".to_string(), Value::Map(env.vars.clone()));
        ctx.insert("tasks".to_string(), derive_tasks_view(&env.vars));
        Value::Map(ctx)
    }

    /// Prompt assembly (spec.md §4.3).
    fn assemble_prompt(&self, env: &Envelope) -> String {
        if let Some(tmpl) = &self.config.prompt_template {
            let context = self.template_context(env);
            let rendered = template::render(tmpl, &context);
            if !template::has_markers(tmpl) {
                if let Some(Value::String(input_text)) = env.get_var("input_text") {
                    return format!("{rendered}\n\nInput Text:\n{input_text}");
                }
            }
            return rendered;
        }
        self.config
            .input_vars
            .iter()
            .filter_map(|name| env.get_var(name))
            .map(Value::render_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn build_request(&self, prompt: String, messages: Vec<EnvelopeMessage>) -> LLMRequest {
        LLMRequest {
            model: self.config.model.clone(),
            system: self.config.system.clone(),
            input_text: prompt,
            messages,
            tools: self.config.tools.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            json_schema: self.config.json_schema.clone(),
        }
    }

    async fn complete_with_retry(&self, ctx: &NodeContext, req: &LLMRequest) -> Result<(String, Option<Value>, Usage, Vec<crate::llm::ToolCall>), RunError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let use_streaming = self.streaming_client.is_some() && self.config.json_schema.is_none();
            let outcome = if use_streaming {
                self.complete_streamed(ctx, req).await
            } else {
                self.client.complete(req).await.map(|resp| {
                    ctx.emit(
                        Event::new(EventKind::NodeOutputFinal, ctx.run_id.clone(), &ctx.node_id, "llm")
                            .with_payload("text", Value::String(resp.text.clone())),
                    );
                    (resp.text, resp.json, resp.usage, resp.tool_calls)
                })
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let exhausted = attempt >= self.config.retry.max_attempts.max(1);
                    let retryable = !matches!(err, LLMError::Cancelled);
                    if exhausted || !retryable {
                        return Err(RunError::Provider {
                            provider: "llm".into(),
                            message: err.to_string(),
                        });
                    }
                    tokio::time::sleep(self.config.retry.backoff * attempt).await;
                }
            }
        }
    }

    async fn complete_streamed(&self, ctx: &NodeContext, req: &LLMRequest) -> Result<(String, Option<Value>, Usage, Vec<crate::llm::ToolCall>), LLMError> {
        let streaming = self.streaming_client.as_ref().expect("checked by caller");
        let mut stream = streaming.complete_stream(req).await?;
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut tool_calls = Vec::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if let Some(err) = &chunk.error {
                return Err(LLMError::Provider {
                    provider: "llm".into(),
                    message: err.clone(),
                });
            }
            text.push_str(&chunk.delta);
            ctx.emit(
                Event::new(EventKind::NodeOutputDelta, ctx.run_id.clone(), &ctx.node_id, "llm").with_payload("delta", Value::String(chunk.delta.clone())),
            );
            if chunk.done {
                if let Some(final_usage) = chunk.usage {
                    usage = final_usage;
                }
                tool_calls = chunk.tool_calls;
            }
        }

        ctx.emit(Event::new(EventKind::NodeOutputFinal, ctx.run_id.clone(), &ctx.node_id, "llm").with_payload("text", Value::String(text.clone())));
        Ok((text, None, usage, tool_calls))
    }

    async fn run_tool_call(&self, ctx: &NodeContext, call: &crate::llm::ToolCall) -> Result<Value, RunError> {
        let registry = self.registry.as_ref().ok_or_else(|| RunError::MissingInput {
            what: format!("no tool registry configured to resolve tool call '{}'", call.name),
        })?;
        let (adapter, config, origin) =
            resolve_registry_adapter(&registry.store, &registry.http_pool, &registry.mcp_pool, &registry.native_registry, &registry.secret_key, &call.name).await?;
        let invoke_ctx = InvokeContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            request_id: format!("{}-tool-{}", ctx.run_id, call.id),
        };
        let req = ToolInvokeRequest {
            tool_name: call.name.clone(),
            action: "run".to_string(),
            inputs: call.arguments.clone(),
            config,
            request_id: invoke_ctx.request_id.clone(),
            transport: origin.clone(),
            tool_origin: origin,
        };
        let response = adapter.invoke(&invoke_ctx, req).await?;
        Ok(response.outputs)
    }
}

#[async_trait]
impl Node for LlmNode {
    async fn run(&self, ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let prompt = self.assemble_prompt(&env);
        let mut messages = env.messages.clone();
        let mut req = self.build_request(prompt.clone(), messages.clone());

        let (mut text, mut json, mut usage, mut tool_calls) = self.complete_with_retry(&ctx, &req).await?;

        let mut iterations = 0u32;
        while !tool_calls.is_empty() && iterations < self.config.max_tool_iterations {
            iterations += 1;
            let mut tool_results = Vec::new();
            for call in &tool_calls {
                ctx.emit(
                    Event::new(EventKind::ToolCall, ctx.run_id.clone(), &ctx.node_id, "llm")
                        .with_payload("tool", Value::String(call.name.clone()))
                        .with_payload("arguments", call.arguments.clone()),
                );
                let outputs = self.run_tool_call(&ctx, call).await?;
                ctx.emit(
                    Event::new(EventKind::ToolResult, ctx.run_id.clone(), &ctx.node_id, "llm")
                        .with_payload("tool", Value::String(call.name.clone()))
                        .with_payload("outputs", outputs.clone()),
                );
                tool_results.push((call.clone(), outputs));
            }

            messages.push(EnvelopeMessage::new("assistant", text.clone()).with_meta("tool_calls", Value::List(tool_calls.iter().map(|c| Value::String(c.name.clone())).collect())));
            for (call, outputs) in &tool_results {
                messages.push(EnvelopeMessage::new("tool", outputs.render_text()).with_meta("tool_call_id", Value::String(call.id.clone())));
            }

            req = self.build_request(prompt.clone(), messages.clone());
            let next = self.complete_with_retry(&ctx, &req).await?;
            text = next.0;
            json = next.1;
            usage = next.2;
            tool_calls = next.3;
        }

        self.config.budget.check(&usage).map_err(RunError::BudgetExceeded)?;

        let output_value = json.unwrap_or_else(|| Value::String(text.clone()));
        env.set_var(self.config.output_key.clone(), output_value);
        env.set_var(
            format!("{}_usage", self.config.output_key),
            Value::map([
                ("input_tokens", Value::from(usage.input_tokens as i64)),
                ("output_tokens", Value::from(usage.output_tokens as i64)),
                ("total_tokens", Value::from(usage.total_tokens as i64)),
                ("cost_usd", Value::Number(usage.cost_usd)),
            ]),
        );

        if self.config.record_messages {
            env.append_message(EnvelopeMessage::user(prompt));
            env.append_message(
                EnvelopeMessage::assistant(text)
                    .with_meta("model", Value::String(self.config.model.clone())),
            );
        }

        Ok(env)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEmitter;
    use crate::llm::LLMResponse;
    use crate::node::NodeKind;

    struct StubClient {
        text: String,
        usage: Usage,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _req: &LLMRequest) -> Result<LLMResponse, LLMError> {
            Ok(LLMResponse {
                text: self.text.clone(),
                json: None,
                model: "stub".into(),
                provider: "stub".into(),
                usage: self.usage.clone(),
                tool_calls: Vec::new(),
            })
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("llm1"),
            behavior: crate::node::NodeBehavior::Llm,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn stores_text_output_and_usage() {
        let client = Arc::new(StubClient {
            text: "hello".into(),
            usage: Usage {
                input_tokens: 5,
                output_tokens: 2,
                total_tokens: 7,
                cost_usd: 0.01,
            },
        });
        let node = LlmNode::new(
            LlmNodeConfig {
                input_vars: vec!["greeting".into()],
                ..Default::default()
            },
            client,
        );
        let mut env = Envelope::new(Value::Null);
        env.set_var("greeting", Value::from("hi"));
        let out = node.run(ctx(), env).await.unwrap();
        assert_eq!(out.get_var("output").and_then(Value::as_str), Some("hello"));
        assert_eq!(out.get_var("output_usage").unwrap().as_map().unwrap().get("total_tokens").unwrap().as_f64(), Some(7.0));
    }

    #[tokio::test]
    async fn budget_violation_is_rejected() {
        let client = Arc::new(StubClient {
            text: "hello".into(),
            usage: Usage {
                total_tokens: 100,
                ..Default::default()
            },
        });
        let node = LlmNode::new(
            LlmNodeConfig {
                budget: Budget {
                    max_total_tokens: Some(10),
                    ..Default::default()
                },
                ..Default::default()
            },
            client,
        );
        let err = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap_err();
        assert!(matches!(err, RunError::BudgetExceeded(_)));
    }

    #[tokio::test]
    async fn prompt_template_falls_back_to_input_text_when_no_markers() {
        let client = Arc::new(StubClient {
            text: "ok".into(),
            usage: Usage::default(),
        });
        let node = LlmNode::new(
            LlmNodeConfig {
                prompt_template: Some("static preamble".into()),
                ..Default::default()
            },
            client,
        );
        let mut env = Envelope::new(Value::Null);
        env.set_var("input_text", Value::from("the actual question"));
        let out = node.run(ctx(), env).await.unwrap();
        assert_eq!(out.get_var("output").and_then(Value::as_str), Some("ok"));
    }

    #[tokio::test]
    async fn record_messages_appends_conversation_pair() {
        let client = Arc::new(StubClient {
            text: "answer".into(),
            usage: Usage::default(),
        });
        let node = LlmNode::new(
            LlmNodeConfig {
                input_vars: vec!["q".into()],
                record_messages: true,
                model: "stub-model".into(),
                ..Default::default()
            },
            client,
        );
        let mut env = Envelope::new(Value::Null);
        env.set_var("q", Value::from("what time is it"));
        let out = node.run(ctx(), env).await.unwrap();
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].role, "user");
        assert_eq!(out.messages[1].role, "assistant");
    }
}
