//! HTTP adapter (spec.md §4.10, §6).

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::pool::HttpClientPool;
use super::{Adapter, InvokeContext, ToolError, ToolErrorCode, ToolInvokeRequest, ToolInvokeResponse};
use crate::envelope::Value;
use crate::tools::manifest::Manifest;

#[derive(Serialize)]
struct HttpRequestBody<'a> {
    tool_name: &'a str,
    action: &'a str,
    inputs: serde_json::Value,
    config: &'a FxHashMap<String, String>,
    request_id: &'a str,
    transport: &'a str,
    tool_origin: &'a str,
}

#[derive(Deserialize)]
struct HttpSuccessBody {
    outputs: serde_json::Value,
    #[serde(default)]
    metadata: FxHashMap<String, serde_json::Value>,
    duration_ms: Option<u64>,
}

#[derive(Deserialize)]
struct HttpErrorEnvelope {
    error: HttpErrorBody,
}

#[derive(Deserialize)]
struct HttpErrorBody {
    code: String,
    message: String,
    #[serde(default)]
    retryable: bool,
    #[serde(default)]
    details: serde_json::Value,
}

/// Adapter that POSTs the uniform tool-invoke body to a configured
/// endpoint (spec.md §4.10 "HTTP adapter").
pub struct HttpAdapter {
    endpoint: String,
    client: reqwest::Client,
    retryable_codes: Vec<String>,
}

impl HttpAdapter {
    pub fn new(manifest: &Manifest, pool: &HttpClientPool) -> Result<Self, ToolError> {
        let endpoint = manifest
            .transport
            .endpoint
            .clone()
            .ok_or_else(|| ToolError::new(ToolErrorCode::InvalidRequest, "http transport requires an endpoint"))?;
        let timeout = Duration::from_millis(manifest.transport.timeout_ms.max(1));
        let client = pool.get(timeout).map_err(|e| ToolError::new(ToolErrorCode::TransportFailure, e.to_string()))?;
        Ok(Self {
            endpoint,
            client,
            retryable_codes: manifest.transport.retry.retryable_codes.clone(),
        })
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn invoke(&self, _ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError> {
        let start = std::time::Instant::now();
        let body = HttpRequestBody {
            tool_name: &req.tool_name,
            action: &req.action,
            inputs: req.inputs.to_json(),
            config: &req.config,
            request_id: &req.request_id,
            transport: &req.transport,
            tool_origin: &req.tool_origin,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::new(ToolErrorCode::DecodeFailure, format!("failed to read response body: {e}")))?;

        if !status.is_success() {
            if let Ok(error_envelope) = serde_json::from_str::<HttpErrorEnvelope>(&text) {
                let body = error_envelope.error;
                return Err(ToolError::new(parse_tool_error_code(&body.code), body.message)
                    .retryable(body.retryable || self.retryable_codes.contains(&status.as_u16().to_string()))
                    .with_details(Value::from_json(body.details)));
            }
            return Err(ToolError::new(ToolErrorCode::UpstreamFailure, format!("HTTP {status}"))
                .retryable(self.retryable_codes.contains(&status.as_u16().to_string()))
                .with_details(Value::String(text)));
        }

        let success: HttpSuccessBody =
            serde_json::from_str(&text).map_err(|e| ToolError::new(ToolErrorCode::DecodeFailure, format!("invalid response body: {e}")))?;

        let metadata = success.metadata.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect();

        Ok(ToolInvokeResponse {
            outputs: Value::from_json(success.outputs),
            metadata,
            duration_ms: success.duration_ms.unwrap_or_else(|| start.elapsed().as_millis() as u64),
        })
    }
}

fn classify_transport_error(err: &reqwest::Error) -> ToolError {
    if err.is_timeout() {
        ToolError::timeout()
    } else {
        ToolError::new(ToolErrorCode::TransportFailure, err.to_string())
    }
}

fn parse_tool_error_code(code: &str) -> ToolErrorCode {
    match code {
        "ACTION_NOT_FOUND" => ToolErrorCode::ActionNotFound,
        "INVALID_REQUEST" => ToolErrorCode::InvalidRequest,
        "TRANSPORT_FAILURE" => ToolErrorCode::TransportFailure,
        "TIMEOUT" => ToolErrorCode::Timeout,
        "UPSTREAM_FAILURE" => ToolErrorCode::UpstreamFailure,
        "DECODE_FAILURE" => ToolErrorCode::DecodeFailure,
        "MCP_FAILURE" => ToolErrorCode::McpFailure,
        _ => ToolErrorCode::InvocationFailed,
    }
}
