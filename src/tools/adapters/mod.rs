//! Tool adapter plane: a uniform `Invoke` contract over native, HTTP,
//! stdio-subprocess, and MCP transports (spec.md §4.10).
//!
//! Grounded on `weavegraph::node`'s async-trait client seams for the trait
//! shape, and on `hi-youichi-loom`'s hand-rolled JSON-RPC test harness for
//! the MCP wire format — no third-party MCP crate is pulled in (see
//! DESIGN.md).

pub mod http;
pub mod mcp;
pub mod native;
pub mod pool;
pub mod retry;
pub mod stdio;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::envelope::Value;
use crate::tools::manifest::{Manifest, TransportType};

/// Error taxonomy codes, fixed per spec.md §7.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    ActionNotFound,
    InvalidRequest,
    TransportFailure,
    Timeout,
    UpstreamFailure,
    DecodeFailure,
    InvocationFailed,
    McpFailure,
}

impl ToolErrorCode {
    /// `TIMEOUT` is always retryable; other codes default to non-retryable
    /// unless an adapter overrides via [`ToolError::retryable`] (spec.md §7).
    pub fn default_retryable(self) -> bool {
        matches!(self, ToolErrorCode::Timeout)
    }
}

/// A structured adapter error, uniform across transports (spec.md §7).
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    pub retryable: bool,
    pub details: Value,
    pub cause: Option<Box<ToolError>>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.default_retryable();
        Self {
            code,
            message: message.into(),
            retryable,
            details: Value::Null,
            cause: None,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_cause(mut self, cause: ToolError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn invocation_failed(message: impl Into<String>) -> Self {
        Self::new(ToolErrorCode::InvocationFailed, message)
    }

    pub fn timeout() -> Self {
        Self::new(ToolErrorCode::Timeout, "operation timed out")
    }
}

/// Per-invocation context: cancellation and an optional timeout override
/// from the tool node (spec.md §5: timeouts are layered per-node,
/// per-adapter, per-invocation).
#[derive(Clone)]
pub struct InvokeContext {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
    pub request_id: String,
}

/// The request shape shared by every adapter (spec.md §4.10, §6: this is
/// the literal HTTP request body; other transports carry the same fields).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvokeRequest {
    pub tool_name: String,
    pub action: String,
    pub inputs: Value,
    pub config: FxHashMap<String, String>,
    pub request_id: String,
    pub transport: String,
    pub tool_origin: String,
}

/// The response shape shared by every adapter.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolInvokeResponse {
    pub outputs: Value,
    pub metadata: FxHashMap<String, Value>,
    pub duration_ms: u64,
}

/// Uniform transport contract every adapter implements.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn invoke(&self, ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError>;

    async fn close(&self) {}
}

/// Builds the adapter for a manifest: routes on `Origin`, falling back to
/// `Transport.Type` when `Origin` is unset (spec.md §4.10 "Adapter factory").
/// `native_registry` supplies the in-process implementation for
/// native-origin tools; a tool with no registered implementation still
/// gets a `NativeAdapter`, but invoking it fails with `ActionNotFound`
/// rather than resolving to a disguised no-op.
pub fn build_adapter(
    origin: Option<&str>,
    manifest: &Manifest,
    http_pool: &pool::HttpClientPool,
    mcp_pool: &pool::McpClientPool,
    native_registry: &native::NativeToolRegistry,
) -> Result<Box<dyn Adapter>, ToolError> {
    let kind = origin.unwrap_or_else(|| match manifest.transport.transport_type {
        TransportType::Native => "native",
        TransportType::Http => "http",
        TransportType::Stdio => "stdio",
        TransportType::Mcp => "mcp",
    });

    match kind {
        "native" => {
            let adapter = match native_registry.get(&manifest.tool.name) {
                Some(tool) => native::NativeAdapter::new().with_tool(manifest.tool.name.clone(), tool),
                None => native::NativeAdapter::new(),
            };
            Ok(Box::new(adapter))
        }
        "http" => Ok(Box::new(http::HttpAdapter::new(manifest, http_pool)?)),
        "stdio" => Ok(Box::new(stdio::StdioAdapter::new(manifest))),
        "mcp" => Ok(Box::new(mcp::McpAdapter::new(manifest, mcp_pool)?)),
        other => Err(ToolError::new(
            ToolErrorCode::InvalidRequest,
            format!("unknown tool origin/transport '{other}'"),
        )),
    }
}
