//! End-to-end scenarios mirroring the worked examples documented
//! alongside the node and runtime modules: a full graph run exercising
//! multiple node kinds together rather than one node in isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use httpmock::prelude::*;

use petalflow::envelope::{Envelope, Value};
use petalflow::events::MemoryEmitter;
use petalflow::graph::{Graph, END};
use petalflow::llm::{LLMClient, LLMError, LLMRequest, LLMResponse, ToolCall, Usage};
use petalflow::node::{Node, NodeContext, NodeKind};
use petalflow::nodes::func::FuncNode;
use petalflow::nodes::llm_node::{LlmNode, LlmNodeConfig, ToolRegistryHandle};
use petalflow::nodes::router::rule::{Condition, Operator, Rule, RuleRouterConfig, RuleRouterNode};
use petalflow::nodes::webhook::{BodySource, WebhookCallConfig, WebhookCallNode};
use petalflow::nodes::ErrorPolicy;
use petalflow::runtime::{RunOptions, Runtime};
use petalflow::secret::SecretKey;
use petalflow::tools::adapters::pool::{HttpClientPool, McpClientPool};
use petalflow::tools::manifest::{Manifest, RetryPolicy, ToolMetadata, Transport, TransportType, MANIFEST_SCHEMA_ID, MANIFEST_VERSION};
use petalflow::tools::registry::{InMemoryToolStore, Store, ToolRegistration};

/// Scenario: hello-world FuncNode. A single-node graph sets `greeting`
/// from `name` and the run yields it unchanged downstream.
#[tokio::test]
async fn hello_world_func_node() {
    let greet = FuncNode::new("greet", |_ctx: NodeContext, mut env: Envelope| async move {
        let name = env.get_var("name").and_then(Value::as_str).unwrap_or("world").to_string();
        env.set_var("greeting", Value::String(format!("Hello, {}!", name.to_uppercase())));
        Ok(env)
    });
    let graph = Arc::new(
        Graph::builder()
            .entry("greet")
            .add_node("greet", Arc::new(greet))
            .add_edge("greet", END)
            .compile()
            .unwrap(),
    );
    let runtime = Runtime::new(graph);
    let mut env = Envelope::new(Value::Null);
    env.set_var("name", Value::String("petalflow".into()));
    let options = RunOptions::new(MemoryEmitter::new(), "scenario-1");
    let result = runtime.run(env, options, tokio_util::sync::CancellationToken::new()).await.unwrap();
    assert_eq!(result.get_var("greeting").and_then(Value::as_str), Some("Hello, PETALFLOW!"));
}

/// Scenario: rule router fan-out. Two independent conditions both match
/// with `AllowMultiple`, so both targets accumulate and reasons join.
#[tokio::test]
async fn rule_router_fanout_joins_reasons() {
    let config = RuleRouterConfig {
        rules: vec![
            Rule {
                conditions: vec![Condition {
                    var: "notify_email".into(),
                    op: Operator::Exists,
                    value: Value::Null,
                }],
                target: NodeKind::new("email"),
                reason: "Has email".into(),
            },
            Rule {
                conditions: vec![Condition {
                    var: "notify_sms".into(),
                    op: Operator::Exists,
                    value: Value::Null,
                }],
                target: NodeKind::new("sms"),
                reason: "Has SMS".into(),
            },
        ],
        allow_multiple: true,
        default_target: None,
    };
    let router = RuleRouterNode::new(config);
    let mut env = Envelope::new(Value::Null);
    env.set_var("notify_email", Value::from("a@example.com"));
    env.set_var("notify_sms", Value::from("+15555550000"));

    let ctx = NodeContext {
        node_id: NodeKind::new("router"),
        behavior: petalflow::node::NodeBehavior::Router,
        step: 0,
        emitter: MemoryEmitter::new(),
        run_id: "scenario-3".into(),
    };
    let decision = petalflow::node::Router::route(&router, ctx, &env).await.unwrap();
    assert_eq!(decision.targets, vec![NodeKind::new("email"), NodeKind::new("sms")]);
    assert_eq!(decision.reason, "Has email; Has SMS");
}

/// Scenario: webhook call returning HTTP 500 under `record` policy leaves
/// the run successful, with the failure captured in the result var and
/// the envelope's error log.
#[tokio::test]
async fn webhook_500_with_record_policy_does_not_fail_the_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/hook");
        then.status(500).body("internal error");
    });

    let node = WebhookCallNode::new(
        WebhookCallConfig {
            url: server.url("/hook"),
            error_policy: ErrorPolicy::Record,
            body: BodySource::Vars {
                input_vars: Vec::new(),
                include_artifacts: false,
                include_messages: false,
                include_trace: false,
            },
            ..Default::default()
        },
        HttpClientPool::new(),
    );

    let ctx = NodeContext {
        node_id: NodeKind::new("webhook"),
        behavior: petalflow::node::NodeBehavior::WebhookCall,
        step: 0,
        emitter: MemoryEmitter::new(),
        run_id: "scenario-4".into(),
    };
    let env = node.run(ctx, Envelope::new(Value::Null)).await.unwrap();
    let result = env.get_var("webhook_result").unwrap().as_map().unwrap();
    assert_eq!(result.get("ok").unwrap().as_bool(), Some(false));
    assert_eq!(result.get("status_code").unwrap().as_f64(), Some(500.0));
    assert_eq!(env.errors.len(), 1);
}

/// Scenario: LLM node with a tool-call loop. The stub client returns a
/// tool call on its first completion and a final answer on its second;
/// the tool itself is resolved through the registry over HTTP.
#[tokio::test]
async fn llm_tool_call_loop_resolves_through_registry() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/tools/context7");
        then.status(200).json_body(serde_json::json!({"outputs": {"snippets": ["example"]}}));
    });

    let manifest = Manifest {
        schema: MANIFEST_SCHEMA_ID.to_string(),
        manifest_version: MANIFEST_VERSION.to_string(),
        tool: ToolMetadata {
            name: "context7".into(),
            description: "docs resolver".into(),
            version: "1.0.0".into(),
            author: None,
            homepage: None,
            tags: vec![],
        },
        transport: Transport {
            transport_type: TransportType::Http,
            endpoint: Some(server.url("/tools/context7")),
            command: None,
            args: vec![],
            env: Default::default(),
            mode: None,
            timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        },
        actions: Default::default(),
        config: Default::default(),
        health: None,
    };
    let store = InMemoryToolStore::new();
    store.put(ToolRegistration::new("context7", "http", manifest)).await.unwrap();

    struct TwoTurnClient {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LLMClient for TwoTurnClient {
        async fn complete(&self, _req: &LLMRequest) -> Result<LLMResponse, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(LLMResponse {
                    text: String::new(),
                    json: None,
                    model: "stub".into(),
                    provider: "stub".into(),
                    usage: Usage::default(),
                    tool_calls: vec![ToolCall {
                        id: "call-1".into(),
                        name: "context7".into(),
                        arguments: Value::map([("query", Value::from("petalflow"))]),
                    }],
                })
            } else {
                Ok(LLMResponse {
                    text: "Resolved docs and generated answer.".into(),
                    json: None,
                    model: "stub".into(),
                    provider: "stub".into(),
                    usage: Usage {
                        input_tokens: 42,
                        output_tokens: 18,
                        total_tokens: 60,
                        cost_usd: 0.0,
                    },
                    tool_calls: Vec::new(),
                })
            }
        }
    }

    let client = Arc::new(TwoTurnClient { calls: AtomicU32::new(0) });
    let node = LlmNode::new(
        LlmNodeConfig {
            output_key: "answer".into(),
            ..Default::default()
        },
        client,
    )
    .with_tool_registry(ToolRegistryHandle {
        store,
        http_pool: HttpClientPool::new(),
        mcp_pool: McpClientPool::new(4),
        native_registry: petalflow::tools::adapters::native::NativeToolRegistry::new(),
        secret_key: SecretKey::host_derived(),
    });

    let emitter = MemoryEmitter::new();
    let ctx = NodeContext {
        node_id: NodeKind::new("answer_llm"),
        behavior: petalflow::node::NodeBehavior::Llm,
        step: 0,
        emitter: emitter.clone(),
        run_id: "scenario-2".into(),
    };
    let out = node.run(ctx, Envelope::new(Value::Null)).await.unwrap();

    assert_eq!(out.get_var("answer").and_then(Value::as_str), Some("Resolved docs and generated answer."));
    assert_eq!(out.get_var("answer_usage").unwrap().as_map().unwrap().get("total_tokens").unwrap().as_f64(), Some(60.0));

    let kinds: Vec<_> = emitter.kinds();
    use petalflow::events::EventKind;
    let first_tool_call = kinds.iter().position(|k| *k == EventKind::ToolCall).unwrap();
    let first_tool_result = kinds.iter().position(|k| *k == EventKind::ToolResult).unwrap();
    assert!(first_tool_call < first_tool_result);
}

/// Scenario: a registered tool's sensitive config value round-trips
/// through encryption without the plaintext ever touching storage.
#[tokio::test]
async fn sensitive_secret_round_trips_through_registry() {
    use petalflow::tools::manifest::FieldSpec;
    use petalflow::tools::manifest::FieldType;

    let key = SecretKey::host_derived();
    let mut manifest = Manifest {
        schema: MANIFEST_SCHEMA_ID.to_string(),
        manifest_version: MANIFEST_VERSION.to_string(),
        tool: ToolMetadata {
            name: "billing".into(),
            description: "billing API".into(),
            version: "1.0.0".into(),
            author: None,
            homepage: None,
            tags: vec![],
        },
        transport: Transport {
            transport_type: TransportType::Native,
            endpoint: None,
            command: None,
            args: vec![],
            env: Default::default(),
            mode: None,
            timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        },
        actions: Default::default(),
        config: Default::default(),
        health: None,
    };
    manifest.config.insert(
        "api_key".into(),
        FieldSpec {
            field_type: Some(FieldType::String),
            sensitive: true,
            ..Default::default()
        },
    );

    let mut reg = ToolRegistration::new("billing", "native", manifest);
    reg.config.insert("api_key".into(), "super-secret".into());
    reg.encrypt_sensitive(&key).unwrap();

    let raw = serde_json::to_string(&reg).unwrap();
    assert!(!raw.contains("super-secret"));
    assert!(!raw.contains("sup"));

    let store = InMemoryToolStore::new();
    store.put(reg).await.unwrap();
    let fetched = store.get("billing").await.unwrap().unwrap();
    let decrypted = fetched.decrypted(&key).unwrap();
    assert_eq!(decrypted.config["api_key"], "super-secret");
}

/// Scenario: MCP tool invoke with overlay grouping. The overlay aliases
/// `list` to the underlying MCP tool `list_s3_objects`; invoking the
/// alias dispatches `tools/call` against the real name and the adapter's
/// metadata records which name was actually called.
///
/// Spawns a tiny stdio JSON-RPC server over `python3`, mirroring how
/// `hi-youichi-loom`'s own MCP test spawns a real subprocess rather than
/// mocking the transport. Ignored by default since it depends on an
/// external interpreter being on `PATH`.
#[tokio::test]
#[ignore = "spawns a python3 stdio MCP server; run with --ignored"]
async fn mcp_invoke_with_overlay_grouping() {
    use petalflow::tools::adapters::mcp::McpAdapter;
    use petalflow::tools::adapters::pool::McpClientPool;
    use petalflow::tools::adapters::{Adapter, InvokeContext};
    use petalflow::tools::manifest::ActionSpec;
    use petalflow::tools::overlay::{merge_overlay, Overlay};

    let server_script = r#"
import json, sys
for line in sys.stdin:
    req = json.loads(line)
    method = req.get("method")
    if method == "initialize":
        resp = {"jsonrpc": "2.0", "id": req["id"], "result": {}}
    elif method == "tools/call":
        name = req["params"]["name"]
        resp = {
            "jsonrpc": "2.0",
            "id": req["id"],
            "result": {"content": [{"type": "text", "text": json.dumps({"keys": ["a.pdf", "b.pdf"]})}]},
        }
    else:
        resp = {"jsonrpc": "2.0", "id": req["id"], "result": {}}
    sys.stdout.write(json.dumps(resp) + "\n")
    sys.stdout.flush()
"#;

    let mut base = Manifest {
        schema: MANIFEST_SCHEMA_ID.to_string(),
        manifest_version: MANIFEST_VERSION.to_string(),
        tool: ToolMetadata {
            name: "s3".into(),
            description: "s3 object store".into(),
            version: "1.0.0".into(),
            author: None,
            homepage: None,
            tags: vec![],
        },
        transport: Transport {
            transport_type: TransportType::Mcp,
            endpoint: None,
            command: Some("python3".into()),
            args: vec!["-c".into(), server_script.into()],
            env: Default::default(),
            mode: None,
            timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        },
        actions: Default::default(),
        config: Default::default(),
        health: None,
    };
    let mut outputs = rustc_hash::FxHashMap::default();
    outputs.insert(
        "keys".to_string(),
        petalflow::tools::manifest::FieldSpec {
            field_type: Some(petalflow::tools::manifest::FieldType::Array),
            ..Default::default()
        },
    );
    base.actions.insert(
        "list_s3_objects".to_string(),
        ActionSpec {
            description: "list objects in a bucket".into(),
            inputs: Default::default(),
            outputs,
            idempotent: true,
            mcp_tool_name: None,
            llm_callable: true,
        },
    );

    let mut overlay = Overlay {
        overlay_version: "1.0".to_string(),
        ..Default::default()
    };
    overlay.group_actions.insert("list".to_string(), "list_s3_objects".to_string());

    let (manifest, diags) = merge_overlay(&base, &overlay);
    assert!(diags.is_empty());
    assert_eq!(
        manifest.actions.get("list").and_then(|a| a.mcp_tool_name.clone()),
        Some("list_s3_objects".to_string())
    );

    let pool = McpClientPool::new(4);
    let adapter = McpAdapter::new(&manifest, &pool).unwrap();

    let ctx = InvokeContext {
        cancel: tokio_util::sync::CancellationToken::new(),
        timeout: None,
        request_id: "req-1".into(),
    };
    let mcp_tool_name = manifest.actions["list"].mcp_tool_name.clone().unwrap();
    let mut config = rustc_hash::FxHashMap::default();
    config.insert("mcp_tool_name".to_string(), mcp_tool_name.clone());
    let req = petalflow::tools::adapters::ToolInvokeRequest {
        tool_name: "s3".into(),
        action: "list".into(),
        inputs: Value::map([("bucket", Value::from("reports"))]),
        config,
        request_id: "req-1".into(),
        transport: "mcp".into(),
        tool_origin: "mcp".into(),
    };
    let response = adapter.invoke(&ctx, req).await.unwrap();

    let outputs = response.outputs.as_map().unwrap();
    let keys = outputs.get("keys").and_then(Value::as_list).unwrap();
    assert_eq!(keys.len(), 2);
    assert_eq!(response.metadata.get("mcp_tool_name").and_then(Value::as_str), Some("list_s3_objects"));
    assert!(response.metadata.get("attempts").and_then(Value::as_f64).unwrap_or(0.0) >= 1.0);
}
