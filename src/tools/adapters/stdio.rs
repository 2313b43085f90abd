//! Stdio-subprocess adapter (spec.md §4.10, §6, §9 Open Question).

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Adapter, InvokeContext, ToolError, ToolErrorCode, ToolInvokeRequest, ToolInvokeResponse};
use crate::envelope::Value;
use crate::tools::manifest::Manifest;

/// Adapter that spawns the configured subprocess once per attempt, writes
/// a single JSON request to stdin, and reads the full stdout/stderr
/// (spec.md §4.10 "Stdio adapter").
pub struct StdioAdapter {
    command: String,
    args: Vec<String>,
    env: FxHashMap<String, String>,
    timeout: Duration,
}

impl StdioAdapter {
    pub fn new(manifest: &Manifest) -> Self {
        Self {
            command: manifest.transport.command.clone().unwrap_or_default(),
            args: manifest.transport.args.clone(),
            env: manifest.transport.env.clone(),
            timeout: Duration::from_millis(manifest.transport.timeout_ms.max(1)),
        }
    }
}

#[async_trait]
impl Adapter for StdioAdapter {
    async fn invoke(&self, ctx: &InvokeContext, req: ToolInvokeRequest) -> Result<ToolInvokeResponse, ToolError> {
        let start = std::time::Instant::now();
        let timeout = ctx.timeout.unwrap_or(self.timeout);

        let run = async {
            let mut child = Command::new(&self.command)
                .args(&self.args)
                .envs(&self.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .map_err(|e| ToolError::new(ToolErrorCode::TransportFailure, format!("failed to spawn '{}': {e}", self.command)))?;

            let body = serde_json::to_vec(&StdioRequestBody::from(&req)).map_err(|e| ToolError::new(ToolErrorCode::DecodeFailure, e.to_string()))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(&body)
                    .await
                    .map_err(|e| ToolError::new(ToolErrorCode::TransportFailure, format!("stdin write failed: {e}")))?;
                drop(stdin);
            }

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| ToolError::new(ToolErrorCode::TransportFailure, format!("wait failed: {e}")))?;

            if !output.status.success() {
                return Err(ToolError::new(ToolErrorCode::UpstreamFailure, format!("exited with {}", output.status))
                    .with_details(Value::String(String::from_utf8_lossy(&output.stderr).to_string())));
            }

            decode_first_json_document(&output.stdout)
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ToolError::new(ToolErrorCode::TransportFailure, "cancelled").retryable(false)),
            result = tokio::time::timeout(timeout, run) => match result {
                Ok(inner) => inner.map(|mut resp| {
                    resp.duration_ms = start.elapsed().as_millis() as u64;
                    resp
                }),
                Err(_elapsed) => Err(ToolError::timeout()),
            },
        }
    }
}

#[derive(serde::Serialize)]
struct StdioRequestBody {
    tool_name: String,
    action: String,
    inputs: serde_json::Value,
    config: FxHashMap<String, String>,
}

impl From<&ToolInvokeRequest> for StdioRequestBody {
    fn from(req: &ToolInvokeRequest) -> Self {
        Self {
            tool_name: req.tool_name.clone(),
            action: req.action.clone(),
            inputs: req.inputs.to_json(),
            config: req.config.clone(),
        }
    }
}

/// Treats the *first* JSON document on stdout as the response; trailing
/// content is ignored (spec.md §9 Open Question, resolved literally). The
/// document is decoded via the common `{outputs, metadata?, duration_ms?}`
/// shape (spec.md §6); a document with no `outputs` field is treated as
/// the outputs themselves.
fn decode_first_json_document(stdout: &[u8]) -> Result<ToolInvokeResponse, ToolError> {
    let text = String::from_utf8_lossy(stdout);
    let mut stream = serde_json::Deserializer::from_str(&text).into_iter::<serde_json::Value>();
    let document = match stream.next() {
        Some(Ok(value)) => value,
        Some(Err(e)) => return Err(ToolError::new(ToolErrorCode::DecodeFailure, format!("invalid JSON on stdout: {e}"))),
        None => return Err(ToolError::new(ToolErrorCode::DecodeFailure, "no JSON document on stdout")),
    };

    match document.as_object().filter(|obj| obj.contains_key("outputs")) {
        Some(obj) => {
            let outputs = obj.get("outputs").cloned().unwrap_or(serde_json::Value::Null);
            let metadata = obj
                .get("metadata")
                .and_then(|m| m.as_object())
                .map(|m| m.iter().map(|(k, v)| (k.clone(), Value::from_json(v.clone()))).collect())
                .unwrap_or_default();
            let duration_ms = obj.get("duration_ms").and_then(|d| d.as_u64()).unwrap_or(0);
            Ok(ToolInvokeResponse {
                outputs: Value::from_json(outputs),
                metadata,
                duration_ms,
            })
        }
        None => Ok(ToolInvokeResponse {
            outputs: Value::from_json(document),
            metadata: FxHashMap::default(),
            duration_ms: 0,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_first_json_document_ignores_trailing_content() {
        let stdout = b"{\"outputs\":{\"a\":1}}\ntrailing garbage that is not json";
        let resp = decode_first_json_document(stdout).unwrap();
        assert_eq!(resp.outputs.as_map().unwrap().get("a").unwrap().as_f64(), Some(1.0));
    }

    #[test]
    fn decode_first_json_document_errors_on_empty_stdout() {
        assert!(decode_first_json_document(b"").is_err());
    }

    #[test]
    fn bare_document_without_outputs_key_becomes_outputs() {
        let resp = decode_first_json_document(b"{\"keys\":[\"a\"]}").unwrap();
        assert!(resp.outputs.as_map().unwrap().contains_key("keys"));
    }
}
