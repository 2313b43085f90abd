//! The envelope: mutable per-run state carried through a graph execution.
//!
//! Grounded on `weavegraph::state::VersionedState`'s channel container and
//! builder idiom, but collapsed into a single mutable, deep-cloneable
//! struct per spec.md §3 rather than the teacher's versioned-channel /
//! snapshot split — PetalFlow nodes mutate and return the same envelope
//! instance rather than returning a partial merged by a barrier.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::util::dotpath;

/// Dynamic value held by envelope variables, tool arguments/outputs, and
/// manifest config. A closed sum type rather than a raw `serde_json::Value`
/// re-export, per the "Dynamic envelope values" design note.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(FxHashMap<String, Value>),
}

impl Value {
    /// Build a `Value::Map` from an iterator of key/value pairs.
    pub fn map<K, I>(pairs: I) -> Value
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&FxHashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render this value the way a template interpolation would: strings
    /// pass through verbatim, everything else serializes to compact JSON.
    pub fn render_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => serde_json::to_string(&other.to_json()).unwrap_or_default(),
        }
    }

    /// Convert to a `serde_json::Value` for wire formats and interop with
    /// libraries that expect plain JSON (HTTP bodies, manifest JSON, …).
    /// Bytes round-trip through a tagged object so `from_json` can recover
    /// them exactly.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n).map(J::Number).unwrap_or(J::Null),
            Value::String(s) => J::String(s.clone()),
            Value::Bytes(b) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                let mut map = serde_json::Map::new();
                map.insert("__bytes__".to_string(), J::String(encoded));
                J::Object(map)
            }
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Map(map) => {
                let mut obj = serde_json::Map::new();
                for (k, v) in map {
                    obj.insert(k.clone(), v.to_json());
                }
                J::Object(obj)
            }
        }
    }

    /// Convert from a `serde_json::Value`, recovering `Bytes` that were
    /// tagged by [`to_json`](Self::to_json).
    pub fn from_json(value: serde_json::Value) -> Value {
        use serde_json::Value as J;
        match value {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            J::String(s) => Value::String(s),
            J::Array(items) => Value::List(items.into_iter().map(Value::from_json).collect()),
            J::Object(obj) => {
                if obj.len() == 1 {
                    if let Some(J::String(encoded)) = obj.get("__bytes__") {
                        use base64::Engine;
                        if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) {
                            return Value::Bytes(bytes);
                        }
                    }
                }
                let mut map = FxHashMap::default();
                for (k, v) in obj {
                    map.insert(k, Value::from_json(v));
                }
                Value::Map(map)
            }
        }
    }

    pub fn get_nested(&self, path: &str) -> Option<&Value> {
        dotpath::get_nested(self, path)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::from_json(v)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        serde_json::Value::deserialize(deserializer).map(Value::from_json)
    }
}

/// A message exchanged through the envelope's conversation log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub meta: FxHashMap<String, Value>,
    #[serde(default)]
    pub tool_results: Vec<Value>,
}

impl EnvelopeMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            name: None,
            meta: FxHashMap::default(),
            tool_results: Vec::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

/// An artifact produced or consumed during a run (document, image, blob, …).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default)]
    pub meta: FxHashMap<String, Value>,
}

/// A single entry in the envelope's error log (§7: node-level errors that
/// were swallowed by a non-failing error policy).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub node_id: String,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl NodeError {
    pub fn new(node_id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            kind: kind.into(),
            message: message.into(),
            at: Utc::now(),
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }
}

/// Trace identifiers carried through a run, analogous to distributed
/// tracing span/parent/run identifiers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub span_id: String,
    pub started: DateTime<Utc>,
}

impl Trace {
    pub fn new_run() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            parent_id: None,
            span_id: Uuid::new_v4().to_string(),
            started: Utc::now(),
        }
    }

    /// Derive a child span within the same run (used when a node spawns a
    /// nested invocation, e.g. the LLM node's tool-call loop).
    pub fn child_span(&self) -> Self {
        Self {
            run_id: self.run_id.clone(),
            parent_id: Some(self.span_id.clone()),
            span_id: Uuid::new_v4().to_string(),
            started: Utc::now(),
        }
    }
}

/// Envelope variable key used to signal a guardian redirect to the
/// scheduler (spec.md §4.2 step 4, §4.6). Modeled as an out-of-band
/// variable rather than a dedicated node-contract field, per the
/// "Guardian redirect" design note.
pub const GUARDIAN_REDIRECT_VAR: &str = "__guardian_redirect__";

/// Mutable per-run state carried between nodes.
///
/// `Clone` deep-copies every field so that a node which clones before
/// mutating can never leak a partial write into the caller's copy if it
/// subsequently fails (spec.md §4.1, §8 universal invariant).
#[derive(Clone, Debug, Default)]
pub struct Envelope {
    pub vars: FxHashMap<String, Value>,
    pub input: Value,
    pub messages: Vec<EnvelopeMessage>,
    pub artifacts: Vec<Artifact>,
    pub errors: Vec<NodeError>,
    pub trace: Option<Trace>,
}

impl Envelope {
    pub fn new(input: Value) -> Self {
        Self {
            vars: FxHashMap::default(),
            input,
            messages: Vec::new(),
            artifacts: Vec::new(),
            errors: Vec::new(),
            trace: Some(Trace::new_run()),
        }
    }

    /// Look up a top-level variable by exact name (no dot-path splitting).
    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Look up a variable by dot path, e.g. `"user.profile.name"`. Splits
    /// the first segment against `vars`, then walks nested `Value::Map`s.
    /// Missing intermediates yield `None` (spec.md §4.1: "not found").
    pub fn get_var_nested(&self, dot_path: &str) -> Option<&Value> {
        let mut parts = dot_path.splitn(2, '.');
        let head = parts.next()?;
        let root = self.vars.get(head)?;
        match parts.next() {
            Some(rest) => dotpath::get_nested(root, rest),
            None => Some(root),
        }
    }

    /// Set a top-level variable.
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    /// Set a variable by dot path, creating intermediate maps as needed.
    pub fn set_var_nested(&mut self, dot_path: &str, value: Value) -> Result<(), dotpath::DotPathError> {
        let mut parts = dot_path.splitn(2, '.');
        let head = parts.next().unwrap_or(dot_path);
        match parts.next() {
            Some(rest) => {
                let root = self.vars.entry(head.to_string()).or_insert_with(|| Value::Map(Default::default()));
                dotpath::set_nested(root, rest, value)
            }
            None => {
                self.vars.insert(head.to_string(), value);
                Ok(())
            }
        }
    }

    /// Delete a variable (top-level or dot-path).
    pub fn delete_var_nested(&mut self, dot_path: &str) -> Option<Value> {
        let mut parts = dot_path.splitn(2, '.');
        let head = parts.next()?;
        match parts.next() {
            Some(rest) => {
                let root = self.vars.get_mut(head)?;
                dotpath::remove_nested(root, rest)
            }
            None => self.vars.remove(head),
        }
    }

    pub fn append_message(&mut self, message: EnvelopeMessage) {
        self.messages.push(message);
    }

    pub fn append_error(&mut self, error: NodeError) {
        self.errors.push(error);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Read and clear the guardian redirect hint, if one was set.
    pub fn take_guardian_redirect(&mut self) -> Option<String> {
        match self.vars.remove(GUARDIAN_REDIRECT_VAR) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn set_guardian_redirect(&mut self, node_id: impl Into<String>) {
        self.vars.insert(GUARDIAN_REDIRECT_VAR.to_string(), Value::String(node_id.into()));
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Envelope(vars={}, messages={}, artifacts={}, errors={})",
            self.vars.len(),
            self.messages.len(),
            self.artifacts.len(),
            self.errors.len()
        )
    }
}
