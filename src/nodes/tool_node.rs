//! The Tool node (spec.md §4.4): invoke a tool by static+templated
//! arguments, retry on transient failure, apply an error policy.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::envelope::{Envelope, NodeError, Value};
use crate::events::{Event, EventKind};
use crate::node::{Node, NodeContext, RunError};
use crate::nodes::{ErrorPolicy, NodeRetry};
use crate::secret::SecretKey;
use crate::tools::adapters::native::NativeToolRegistry;
use crate::tools::adapters::pool::{HttpClientPool, McpClientPool};
use crate::tools::adapters::retry::invoke_with_retry;
use crate::tools::adapters::{self, Adapter, InvokeContext, ToolInvokeRequest};
use crate::tools::registry::Store;

/// Where the Tool node gets its [`Adapter`] from (spec.md §4.4: "either a
/// directly supplied implementation or a registry lookup by `ToolName`").
pub enum ToolSource {
    Direct(Arc<dyn Adapter>),
    Registry {
        store: Arc<dyn Store>,
        http_pool: Arc<HttpClientPool>,
        mcp_pool: Arc<McpClientPool>,
        native_registry: Arc<NativeToolRegistry>,
        secret_key: SecretKey,
    },
}

pub struct ToolNodeConfig {
    pub tool_name: String,
    pub action: String,
    pub static_args: Value,
    pub args_template: FxHashMap<String, String>,
    pub output_key: String,
    pub error_policy: ErrorPolicy,
    pub retry: NodeRetry,
}

impl Default for ToolNodeConfig {
    fn default() -> Self {
        Self {
            tool_name: String::new(),
            action: "run".to_string(),
            static_args: Value::map([]),
            args_template: FxHashMap::default(),
            output_key: "output".to_string(),
            error_policy: ErrorPolicy::Fail,
            retry: NodeRetry::default(),
        }
    }
}

pub struct ToolNode {
    config: ToolNodeConfig,
    source: ToolSource,
}

impl ToolNode {
    pub fn new(config: ToolNodeConfig, source: ToolSource) -> Self {
        Self { config, source }
    }

    /// `StaticArgs` merged first, then `ArgsTemplate` dot-path reads
    /// overwrite (spec.md §4.4).
    fn build_args(&self, env: &Envelope) -> Value {
        let mut map = match &self.config.static_args {
            Value::Map(m) => m.clone(),
            _ => FxHashMap::default(),
        };
        for (key, path) in &self.config.args_template {
            let value = env.get_var_nested(path).cloned().unwrap_or(Value::Null);
            map.insert(key.clone(), value);
        }
        Value::Map(map)
    }

    async fn resolve_adapter(&self) -> Result<(Box<dyn Adapter>, FxHashMap<String, String>, String), RunError> {
        match &self.source {
            ToolSource::Direct(adapter) => Ok((clone_adapter_handle(adapter), FxHashMap::default(), "direct".to_string())),
            ToolSource::Registry {
                store,
                http_pool,
                mcp_pool,
                native_registry,
                secret_key,
            } => resolve_registry_adapter(store, http_pool, mcp_pool, native_registry, secret_key, &self.config.tool_name).await,
        }
    }
}

/// Shared registry-lookup path used by both [`ToolNode`] and the LLM node's
/// tool-call loop (spec.md §4.3, §4.4: both resolve a named tool the same
/// way).
pub(crate) async fn resolve_registry_adapter(
    store: &Arc<dyn Store>,
    http_pool: &Arc<HttpClientPool>,
    mcp_pool: &Arc<McpClientPool>,
    native_registry: &Arc<NativeToolRegistry>,
    secret_key: &SecretKey,
    tool_name: &str,
) -> Result<(Box<dyn Adapter>, FxHashMap<String, String>, String), RunError> {
    let registration = store
        .get(tool_name)
        .await
        .map_err(|e| RunError::Provider {
            provider: "tool_registry".into(),
            message: e.to_string(),
        })?
        .ok_or_else(|| RunError::MissingInput {
            what: format!("tool '{tool_name}' is not registered"),
        })?;
    let registration = registration.decrypted(secret_key).map_err(|e| RunError::Provider {
        provider: "tool_registry".into(),
        message: e.to_string(),
    })?;
    let adapter = adapters::build_adapter(Some(&registration.origin), &registration.manifest, http_pool, mcp_pool, native_registry)?;
    Ok((adapter, registration.config, registration.origin))
}

/// A `Box<dyn Adapter>` can't be cloned directly; the direct-source case
/// just re-wraps the shared `Arc` behind a thin forwarding adapter so both
/// branches of [`ToolNode::resolve_adapter`] return the same owned type.
fn clone_adapter_handle(adapter: &Arc<dyn Adapter>) -> Box<dyn Adapter> {
    struct Forward(Arc<dyn Adapter>);

    #[async_trait]
    impl Adapter for Forward {
        async fn invoke(&self, ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<crate::tools::adapters::ToolInvokeResponse, adapters::ToolError> {
            self.0.invoke(ctx, req).await
        }
    }

    Box::new(Forward(adapter.clone()))
}

#[async_trait]
impl Node for ToolNode {
    async fn run(&self, ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let args = self.build_args(&env);
        let (adapter, config, origin) = self.resolve_adapter().await?;

        ctx.emit(
            Event::new(EventKind::ToolCall, ctx.run_id.clone(), &ctx.node_id, "tool")
                .with_payload("tool", Value::String(self.config.tool_name.clone()))
                .with_payload("arguments", args.clone()),
        );

        let invoke_ctx = InvokeContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            request_id: format!("{}-{}", ctx.run_id, ctx.step),
        };
        let retry_policy = self.config.retry.into();
        let request_id = invoke_ctx.request_id.clone();
        let result = invoke_with_retry(retry_policy, &invoke_ctx.cancel, |_| {}, |_attempt| {
            let req = ToolInvokeRequest {
                tool_name: self.config.tool_name.clone(),
                action: self.config.action.clone(),
                inputs: args.clone(),
                config: config.clone(),
                request_id: request_id.clone(),
                transport: origin.clone(),
                tool_origin: origin.clone(),
            };
            adapter.invoke(&invoke_ctx, req)
        })
        .await;

        match result {
            Ok((response, _attempts)) => {
                ctx.emit(
                    Event::new(EventKind::ToolResult, ctx.run_id.clone(), &ctx.node_id, "tool")
                        .with_payload("outputs", response.outputs.clone())
                        .with_payload("is_error", Value::Bool(false)),
                );
                env.set_var(self.config.output_key.clone(), response.outputs);
                Ok(env)
            }
            Err(err) => {
                ctx.emit(
                    Event::new(EventKind::ToolResult, ctx.run_id.clone(), &ctx.node_id, "tool")
                        .with_payload("is_error", Value::Bool(true))
                        .with_payload("message", Value::String(err.message.clone())),
                );
                match self.config.error_policy {
                    ErrorPolicy::Fail => Err(RunError::Tool(err)),
                    ErrorPolicy::Continue | ErrorPolicy::Record => {
                        env.set_var(self.config.output_key.clone(), Value::Null);
                        env.set_var(format!("{}_error", self.config.output_key), Value::String(err.message.clone()));
                        env.append_error(NodeError::new(ctx.node_id.as_str(), "tool", err.message.clone()));
                        Ok(env)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryEmitter;
    use crate::node::NodeKind;
    use crate::tools::adapters::{ToolError, ToolInvokeResponse};

    struct FlakyAdapter {
        calls: std::sync::atomic::AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Adapter for FlakyAdapter {
        async fn invoke(&self, _ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.fail_first {
                return Err(ToolError::timeout());
            }
            Ok(ToolInvokeResponse {
                outputs: req.inputs,
                metadata: FxHashMap::default(),
                duration_ms: 1,
            })
        }
    }

    struct AlwaysFailsAdapter;

    #[async_trait]
    impl Adapter for AlwaysFailsAdapter {
        async fn invoke(&self, _ctx: &InvokeContext, _req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError> {
            Err(ToolError::invocation_failed("nope"))
        }
    }

    fn ctx() -> NodeContext {
        NodeContext {
            node_id: NodeKind::new("tool1"),
            behavior: crate::node::NodeBehavior::Tool,
            step: 0,
            emitter: MemoryEmitter::new(),
            run_id: "run-1".into(),
        }
    }

    #[tokio::test]
    async fn success_stores_outputs_under_output_key() {
        let adapter: Arc<dyn Adapter> = Arc::new(FlakyAdapter {
            calls: Default::default(),
            fail_first: 0,
        });
        let mut config = ToolNodeConfig {
            tool_name: "echo".into(),
            ..Default::default()
        };
        config.args_template.insert("text".into(), "greeting".into());
        let node = ToolNode::new(config, ToolSource::Direct(adapter));

        let mut env = Envelope::new(Value::Null);
        env.set_var("greeting", Value::from("hi"));
        let out = node.run(ctx(), env).await.unwrap();
        let outputs = out.get_var("output").unwrap().as_map().unwrap();
        assert_eq!(outputs.get("text").unwrap().as_str(), Some("hi"));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let adapter: Arc<dyn Adapter> = Arc::new(FlakyAdapter {
            calls: Default::default(),
            fail_first: 2,
        });
        let config = ToolNodeConfig {
            tool_name: "echo".into(),
            retry: NodeRetry {
                max_attempts: 3,
                backoff: std::time::Duration::from_millis(1),
            },
            ..Default::default()
        };
        let node = ToolNode::new(config, ToolSource::Direct(adapter));
        let out = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        assert!(out.get_var("output").is_some());
    }

    #[tokio::test]
    async fn continue_policy_records_error_without_failing() {
        let node = ToolNode::new(
            ToolNodeConfig {
                tool_name: "echo".into(),
                error_policy: ErrorPolicy::Continue,
                ..Default::default()
            },
            ToolSource::Direct(Arc::new(AlwaysFailsAdapter)),
        );
        let out = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap();
        assert_eq!(out.get_var("output"), Some(&Value::Null));
        assert!(out.get_var("output_error").is_some());
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn fail_policy_propagates_run_error() {
        let node = ToolNode::new(ToolNodeConfig::default(), ToolSource::Direct(Arc::new(AlwaysFailsAdapter)));
        let err = node.run(ctx(), Envelope::new(Value::Null)).await.unwrap_err();
        assert!(matches!(err, RunError::Tool(_)));
    }
}
