//! Native (in-process) adapter (spec.md §4.10).

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use super::{Adapter, InvokeContext, ToolError, ToolErrorCode, ToolInvokeRequest, ToolInvokeResponse};
use crate::envelope::Value;

/// An in-process tool implementation, looked up by action name.
#[async_trait]
pub trait NativeTool: Send + Sync {
    async fn invoke(&self, action: &str, inputs: &Value, config: &FxHashMap<String, String>) -> Result<Value, ToolError>;
}

/// Adapter over a registry of [`NativeTool`] implementations. No network;
/// duration is measured around the call (spec.md §4.10).
pub struct NativeAdapter {
    implementations: FxHashMap<String, Arc<dyn NativeTool>>,
}

impl NativeAdapter {
    pub fn new() -> Self {
        Self {
            implementations: FxHashMap::default(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, tool: Arc<dyn NativeTool>) -> Self {
        self.implementations.insert(name.into(), tool);
        self
    }
}

impl Default for NativeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry of builtin native-tool implementations, injected
/// into the adapter factory (spec.md §4.11: native-origin tools reached
/// through the registry/service path, not just hand-constructed adapters).
/// Registration is independent of `ToolRegistration` persistence: a native
/// tool still needs both a stored registration (for `Status`/config) and an
/// entry here (for the actual code to run).
#[derive(Default)]
pub struct NativeToolRegistry {
    tools: Mutex<FxHashMap<String, Arc<dyn NativeTool>>>,
}

impl NativeToolRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: impl Into<String>, tool: Arc<dyn NativeTool>) {
        self.tools.lock().insert(name.into(), tool);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn NativeTool>> {
        self.tools.lock().get(name).cloned()
    }
}

#[async_trait]
impl Adapter for NativeAdapter {
    async fn invoke(&self, _ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError> {
        let start = std::time::Instant::now();
        let tool = self
            .implementations
            .get(&req.tool_name)
            .ok_or_else(|| ToolError::new(ToolErrorCode::ActionNotFound, format!("no native implementation for '{}'", req.tool_name)))?;

        let outputs = tool.invoke(&req.action, &req.inputs, &req.config).await?;

        Ok(ToolInvokeResponse {
            outputs,
            metadata: FxHashMap::default(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl NativeTool for Echo {
        async fn invoke(&self, _action: &str, inputs: &Value, _config: &FxHashMap<String, String>) -> Result<Value, ToolError> {
            Ok(inputs.clone())
        }
    }

    #[tokio::test]
    async fn invokes_registered_native_tool() {
        let adapter = NativeAdapter::new().with_tool("echo", Arc::new(Echo));
        let ctx = InvokeContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            request_id: "r1".into(),
        };
        let req = ToolInvokeRequest {
            tool_name: "echo".into(),
            action: "run".into(),
            inputs: Value::String("hi".into()),
            config: FxHashMap::default(),
            request_id: "r1".into(),
            transport: "native".into(),
            tool_origin: "native".into(),
        };
        let resp = adapter.invoke(&ctx, req).await.unwrap();
        assert_eq!(resp.outputs.as_str(), Some("hi"));
    }

    #[tokio::test]
    async fn unknown_tool_is_action_not_found() {
        let adapter = NativeAdapter::new();
        let ctx = InvokeContext {
            cancel: tokio_util::sync::CancellationToken::new(),
            timeout: None,
            request_id: "r1".into(),
        };
        let req = ToolInvokeRequest {
            tool_name: "missing".into(),
            action: "run".into(),
            inputs: Value::Null,
            config: FxHashMap::default(),
            request_id: "r1".into(),
            transport: "native".into(),
            tool_origin: "native".into(),
        };
        let err = adapter.invoke(&ctx, req).await.unwrap_err();
        assert_eq!(err.code, ToolErrorCode::ActionNotFound);
    }
}
