//! Tool manifest types and the two-pass validator (spec.md §3, §4.8).
//!
//! Grounded on `weavegraph`'s channel-error diagnostics shape (`{Field,
//! Code, Severity, Message}`-style structured findings that never stop at
//! the first problem) and on the teacher's field-by-field validation style
//! used across its `state`/`channels` modules; the manifest schema itself
//! has no teacher counterpart and is modeled directly from spec.md §3/§6.

use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::envelope::Value;

pub const MANIFEST_SCHEMA_ID: &str = "https://petalflow.dev/schemas/tool-manifest/v1.json";
pub const MANIFEST_VERSION: &str = "1.0";

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]{1,63}$").unwrap());

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Native,
    Http,
    Stdio,
    Mcp,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(default)]
    pub retryable_codes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub transport_type: TransportType,
    pub endpoint: Option<String>,
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: FxHashMap<String, String>,
    pub mode: Option<String>,
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
    Bytes,
    Array,
    Object,
    Any,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub required: bool,
    pub description: Option<String>,
    pub default: Option<Value>,
    #[serde(default)]
    pub sensitive: bool,
    pub items: Option<Box<FieldSpec>>,
    #[serde(default)]
    pub properties: FxHashMap<String, FieldSpec>,
    /// Maps a config field to an environment variable name for the MCP
    /// runtime transport (spec.md §4.9 step 5).
    pub env_var: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionSpec {
    pub description: String,
    #[serde(default)]
    pub inputs: FxHashMap<String, FieldSpec>,
    #[serde(default)]
    pub outputs: FxHashMap<String, FieldSpec>,
    #[serde(default)]
    pub idempotent: bool,
    pub mcp_tool_name: Option<String>,
    #[serde(default = "default_true")]
    pub llm_callable: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStrategy {
    Process,
    Connection,
    Ping,
    Endpoint,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthSpec {
    #[serde(default)]
    pub strategy: Option<HealthStrategy>,
    pub endpoint: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_threshold")]
    pub unhealthy_threshold: u32,
}

fn default_method() -> String {
    "GET".to_string()
}
fn default_interval() -> u64 {
    30
}
fn default_health_timeout() -> u64 {
    5_000
}
fn default_threshold() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "$id", default = "default_schema_id")]
    pub schema: String,
    pub manifest_version: String,
    pub tool: ToolMetadata,
    pub transport: Transport,
    #[serde(default)]
    pub actions: FxHashMap<String, ActionSpec>,
    #[serde(default)]
    pub config: FxHashMap<String, FieldSpec>,
    pub health: Option<HealthSpec>,
}

fn default_schema_id() -> String {
    MANIFEST_SCHEMA_ID.to_string()
}

/// Severity of a validation finding; both severities are collected, never
/// halting the pass (spec.md §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub field: String,
    pub code: String,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    fn error(field: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.to_string(),
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Structural validation pass: type/presence/enum constraints field by
/// field. Never stops at the first error (spec.md §4.8).
pub fn validate_manifest_json(manifest: &Manifest) -> Vec<Diagnostic> {
    let mut diags = Vec::new();

    if manifest.manifest_version != MANIFEST_VERSION {
        diags.push(Diagnostic::error(
            "manifest_version",
            "UNSUPPORTED_VERSION",
            format!("expected '{MANIFEST_VERSION}', got '{}'", manifest.manifest_version),
        ));
    }
    if !NAME_RE.is_match(&manifest.tool.name) {
        diags.push(Diagnostic::error(
            "tool.name",
            "INVALID_NAME",
            format!("'{}' does not match ^[a-z][a-z0-9_]{{1,63}}$", manifest.tool.name),
        ));
    }
    if manifest.transport.timeout_ms == 0 {
        diags.push(Diagnostic::error("transport.timeout_ms", "MISSING_TIMEOUT", "timeout_ms must be positive"));
    }
    match manifest.transport.transport_type {
        TransportType::Http if manifest.transport.endpoint.is_none() => {
            diags.push(Diagnostic::error("transport.endpoint", "MISSING_ENDPOINT", "http transport requires an endpoint"));
        }
        TransportType::Stdio if manifest.transport.command.is_none() => {
            diags.push(Diagnostic::error("transport.command", "MISSING_COMMAND", "stdio transport requires a command"));
        }
        _ => {}
    }

    for (name, action) in &manifest.actions {
        if !NAME_RE.is_match(name) {
            diags.push(Diagnostic::error(format!("actions.{name}"), "INVALID_NAME", format!("action name '{name}' is invalid")));
        }
        for (field_name, spec) in action.inputs.iter().chain(action.outputs.iter()) {
            validate_field_spec(&format!("actions.{name}.{field_name}"), spec, &mut diags);
        }
    }

    for (name, spec) in &manifest.config {
        if spec.sensitive && spec.default.is_some() {
            diags.push(Diagnostic::error(
                format!("config.{name}"),
                "SENSITIVE_HAS_DEFAULT",
                "sensitive fields must not declare a default",
            ));
        }
        validate_field_spec(&format!("config.{name}"), spec, &mut diags);
    }

    diags
}

fn validate_field_spec(path: &str, spec: &FieldSpec, diags: &mut Vec<Diagnostic>) {
    if spec.field_type == Some(FieldType::Array) && spec.items.is_none() {
        diags.push(Diagnostic::error(path, "MISSING_ITEMS", "array fields must declare 'items'"));
    }
    if let Some(items) = &spec.items {
        validate_field_spec(&format!("{path}.items"), items, diags);
    }
    for (prop_name, prop_spec) in &spec.properties {
        validate_field_spec(&format!("{path}.{prop_name}"), prop_spec, diags);
    }
}

/// Type-system pass (`V1TypeSystem`): recursively checks every field
/// declares an allowed type and that arrays declare `items` (spec.md §4.8).
/// Structurally the same recursion as [`validate_manifest_json`]'s field
/// walk; kept separate because the type system is also invoked standalone
/// by the overlay validator (spec.md §4.9) before a full manifest exists.
pub fn validate_type_system(fields: &FxHashMap<String, FieldSpec>) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    for (name, spec) in fields {
        if spec.field_type.is_none() {
            diags.push(Diagnostic::error(name, "MISSING_TYPE", "field has no declared type"));
            continue;
        }
        validate_field_spec(name, spec, &mut diags);
    }
    diags
}

/// Cross-field compatibility check used by graph-authoring tooling (not
/// the runtime core): an output type that doesn't match a target input
/// type is a mismatch, with `any` on either side only a warning.
pub fn check_type_compatibility(output: &FieldSpec, input: &FieldSpec) -> Option<Diagnostic> {
    match (output.field_type, input.field_type) {
        (Some(FieldType::Any), _) | (_, Some(FieldType::Any)) => Some(Diagnostic {
            field: String::new(),
            code: "ANY_TYPE".to_string(),
            severity: Severity::Warning,
            message: "connection involves an 'any' typed field".to_string(),
        }),
        (Some(a), Some(b)) if a != b => Some(Diagnostic {
            field: String::new(),
            code: "TYPE_MISMATCH".to_string(),
            severity: Severity::Error,
            message: format!("output type {a:?} does not match input type {b:?}"),
        }),
        _ => None,
    }
}
