//! The Guardian node (spec.md §4.6): an ordered battery of validation
//! checks per field, with a configurable action on failure.

use async_trait::async_trait;
use regex::Regex;
use rustc_hash::FxHashMap;
use std::sync::{Arc, LazyLock};

use crate::envelope::{Envelope, Value};
use crate::node::{Node, NodeContext, RunError};
use crate::util::dotpath;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemanticType {
    String,
    Number,
    Bool,
    Array,
    Object,
    Null,
}

impl SemanticType {
    fn matches(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (SemanticType::String, Value::String(_))
                | (SemanticType::Number, Value::Number(_))
                | (SemanticType::Bool, Value::Bool(_))
                | (SemanticType::Array, Value::List(_))
                | (SemanticType::Object, Value::Map(_))
                | (SemanticType::Null, Value::Null)
        )
    }

    fn name(self) -> &'static str {
        match self {
            SemanticType::String => "string",
            SemanticType::Number => "number",
            SemanticType::Bool => "bool",
            SemanticType::Array => "array",
            SemanticType::Object => "object",
            SemanticType::Null => "null",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PiiCategory {
    Ssn,
    Email,
    Phone,
    CreditCard,
}

static SSN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[\w.+-]+@[\w-]+\.[\w.-]+\b").unwrap());
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap());
static CREDIT_CARD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());

impl PiiCategory {
    fn pattern(self) -> &'static Regex {
        match self {
            PiiCategory::Ssn => &SSN_RE,
            PiiCategory::Email => &EMAIL_RE,
            PiiCategory::Phone => &PHONE_RE,
            PiiCategory::CreditCard => &CREDIT_CARD_RE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            PiiCategory::Ssn => "ssn",
            PiiCategory::Email => "email",
            PiiCategory::Phone => "phone",
            PiiCategory::CreditCard => "credit_card",
        }
    }
}

pub struct PiiCheck {
    pub categories: Vec<PiiCategory>,
    pub block_pii: bool,
}

/// Recursive JSON-Schema-like subset (spec.md §4.6 `schema` check).
#[derive(Default)]
pub struct SchemaSpec {
    pub schema_type: Option<SemanticType>,
    pub required: Vec<String>,
    pub properties: FxHashMap<String, SchemaSpec>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub pattern: Option<Regex>,
    pub enum_values: Option<Vec<Value>>,
    pub items: Option<Box<SchemaSpec>>,
}

/// One failure contributed by a check (spec.md §4.6).
#[derive(Clone, Debug)]
pub struct CheckFailure {
    pub field: String,
    pub message: String,
    pub actual: Value,
    pub expected: Value,
    pub pii_type: Option<String>,
}

impl CheckFailure {
    fn new(field: impl Into<String>, message: impl Into<String>, actual: Value, expected: Value) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            actual,
            expected,
            pii_type: None,
        }
    }
}

/// The ordered battery of checks applied to a single field (spec.md §4.6:
/// `required`, `min_length`/`max_length`, `pattern`, `enum`, `type`,
/// `range`, `pii`, `schema`, `custom`, evaluated in that fixed order).
#[derive(Default)]
pub struct FieldGuard {
    pub field: String,
    pub required: bool,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub enum_values: Option<Vec<Value>>,
    pub expected_type: Option<SemanticType>,
    pub range: Option<(Option<f64>, Option<f64>)>,
    pub pii: Option<PiiCheck>,
    pub schema: Option<SchemaSpec>,
    pub custom: Option<Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>>,
}

impl FieldGuard {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Default::default()
        }
    }
}

fn sized_len(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::List(items) => Some(items.len()),
        Value::Map(map) => Some(map.len()),
        _ => None,
    }
}

fn run_field_checks(guard: &FieldGuard, value: Option<&Value>, out: &mut Vec<CheckFailure>) {
    let missing = value.is_none() || matches!(value, Some(Value::Null));

    if guard.required && missing {
        out.push(CheckFailure::new(&guard.field, "field is required", Value::Null, Value::String("present".into())));
        return;
    }
    let Some(value) = value else { return };

    if let Some(min) = guard.min_length {
        if let Some(len) = sized_len(value) {
            if len < min {
                out.push(CheckFailure::new(&guard.field, format!("length {len} is below minimum {min}"), Value::from(len as i64), Value::from(min as i64)));
            }
        }
    }
    if let Some(max) = guard.max_length {
        if let Some(len) = sized_len(value) {
            if len > max {
                out.push(CheckFailure::new(&guard.field, format!("length {len} exceeds maximum {max}"), Value::from(len as i64), Value::from(max as i64)));
            }
        }
    }
    if let Some(pattern) = &guard.pattern {
        if let Value::String(s) = value {
            if !pattern.is_match(s) {
                out.push(CheckFailure::new(&guard.field, "value does not match pattern", value.clone(), Value::String(pattern.as_str().to_string())));
            }
        }
    }
    if let Some(allowed) = &guard.enum_values {
        if !allowed.contains(value) {
            out.push(CheckFailure::new(&guard.field, "value is not in the allowed set", value.clone(), Value::List(allowed.clone())));
        }
    }
    if let Some(expected_type) = guard.expected_type {
        if !expected_type.matches(value) {
            out.push(CheckFailure::new(&guard.field, format!("expected type {}", expected_type.name()), value.clone(), Value::String(expected_type.name().into())));
        }
    }
    if let Some((min, max)) = guard.range {
        if let Value::Number(n) = value {
            if let Some(min) = min {
                if *n < min {
                    out.push(CheckFailure::new(&guard.field, format!("{n} is below minimum {min}"), Value::Number(*n), Value::Number(min)));
                }
            }
            if let Some(max) = max {
                if *n > max {
                    out.push(CheckFailure::new(&guard.field, format!("{n} exceeds maximum {max}"), Value::Number(*n), Value::Number(max)));
                }
            }
        }
    }
    if let Some(pii) = &guard.pii {
        if let Value::String(s) = value {
            for category in &pii.categories {
                if category.pattern().is_match(s) {
                    let mut failure = CheckFailure::new(&guard.field, format!("detected {} in value", category.name()), value.clone(), Value::Null);
                    failure.pii_type = Some(category.name().to_string());
                    if pii.block_pii {
                        out.push(failure);
                    }
                }
            }
        }
    }
    if let Some(schema) = &guard.schema {
        validate_schema(&guard.field, value, schema, out);
    }
    if let Some(custom) = &guard.custom {
        if let Some(message) = custom(value) {
            out.push(CheckFailure::new(&guard.field, message, value.clone(), Value::Null));
        }
    }
}

fn validate_schema(path: &str, value: &Value, spec: &SchemaSpec, out: &mut Vec<CheckFailure>) {
    if let Some(t) = spec.schema_type {
        if !t.matches(value) {
            out.push(CheckFailure::new(path, format!("expected type {}", t.name()), value.clone(), Value::String(t.name().into())));
            return;
        }
    }
    if let Some(len) = sized_len(value) {
        if let Some(min) = spec.min_length {
            if len < min {
                out.push(CheckFailure::new(path, format!("length {len} below minimum {min}"), Value::from(len as i64), Value::from(min as i64)));
            }
        }
        if let Some(max) = spec.max_length {
            if len > max {
                out.push(CheckFailure::new(path, format!("length {len} exceeds maximum {max}"), Value::from(len as i64), Value::from(max as i64)));
            }
        }
    }
    if let Value::Number(n) = value {
        if let Some(min) = spec.minimum {
            if *n < min {
                out.push(CheckFailure::new(path, format!("{n} below minimum {min}"), Value::Number(*n), Value::Number(min)));
            }
        }
        if let Some(max) = spec.maximum {
            if *n > max {
                out.push(CheckFailure::new(path, format!("{n} exceeds maximum {max}"), Value::Number(*n), Value::Number(max)));
            }
        }
    }
    if let Some(pattern) = &spec.pattern {
        if let Value::String(s) = value {
            if !pattern.is_match(s) {
                out.push(CheckFailure::new(path, "value does not match pattern", value.clone(), Value::String(pattern.as_str().to_string())));
            }
        }
    }
    if let Some(allowed) = &spec.enum_values {
        if !allowed.contains(value) {
            out.push(CheckFailure::new(path, "value is not in the allowed set", value.clone(), Value::List(allowed.clone())));
        }
    }
    if let Value::Map(map) = value {
        for name in &spec.required {
            if !map.contains_key(name) {
                out.push(CheckFailure::new(format!("{path}.{name}"), "required property is missing", Value::Null, Value::String("present".into())));
            }
        }
        for (name, prop_spec) in &spec.properties {
            if let Some(prop_value) = map.get(name) {
                validate_schema(&format!("{path}.{name}"), prop_value, prop_spec, out);
            }
        }
    }
    if let (Value::List(items), Some(item_spec)) = (value, &spec.items) {
        for (i, item) in items.iter().enumerate() {
            validate_schema(&format!("{path}[{i}]"), item, item_spec, out);
        }
    }
}

pub enum GuardianAction {
    Fail { fail_message: String },
    Skip,
    Redirect { redirect_node_id: String },
}

pub struct GuardianConfig {
    /// Root dot path to evaluate field rules against; empty evaluates
    /// against all envelope vars.
    pub input_var: String,
    pub fields: Vec<FieldGuard>,
    pub action: GuardianAction,
    pub result_var: String,
}

pub struct GuardianNode {
    config: GuardianConfig,
}

impl GuardianNode {
    pub fn new(config: GuardianConfig) -> Self {
        Self { config }
    }
}

fn failures_to_value(failures: &[CheckFailure]) -> Value {
    Value::List(
        failures
            .iter()
            .map(|f| {
                let mut entries = vec![
                    ("field".to_string(), Value::String(f.field.clone())),
                    ("message".to_string(), Value::String(f.message.clone())),
                    ("actual".to_string(), f.actual.clone()),
                    ("expected".to_string(), f.expected.clone()),
                ];
                if let Some(pii_type) = &f.pii_type {
                    entries.push(("pii_type".to_string(), Value::String(pii_type.clone())));
                }
                Value::Map(entries.into_iter().collect())
            })
            .collect(),
    )
}

#[async_trait]
impl Node for GuardianNode {
    async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let root = if self.config.input_var.is_empty() {
            Value::Map(env.vars.clone())
        } else {
            env.get_var_nested(&self.config.input_var).cloned().unwrap_or(Value::Null)
        };

        let mut failures = Vec::new();
        for field_guard in &self.config.fields {
            let value = dotpath::get_nested(&root, &field_guard.field);
            run_field_checks(field_guard, value, &mut failures);
        }

        let record = Value::map([("ok", Value::Bool(failures.is_empty())), ("failures", failures_to_value(&failures))]);
        env.set_var(self.config.result_var.clone(), record);

        if failures.is_empty() {
            return Ok(env);
        }

        match &self.config.action {
            GuardianAction::Fail { fail_message } => Err(RunError::ValidationFailed(fail_message.clone())),
            GuardianAction::Skip => Ok(env),
            GuardianAction::Redirect { redirect_node_id } => {
                env.set_guardian_redirect(redirect_node_id.clone());
                Ok(env)
            }
        }
    }
}
