//! The Transform node (spec.md §4.6): a single declarative reshape
//! operation reading `InputVar` and writing `OutputVar`.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::envelope::{Envelope, Value};
use crate::node::{Node, NodeContext, RunError};
use crate::util::merge::{deep_merge, MergeStrategy};
use crate::util::template;

/// Where `merge` finds its second operand.
pub enum MergeSource {
    Var(String),
    Literal(Value),
}

pub enum TransformOp {
    Pick(Vec<String>),
    Omit(Vec<String>),
    Rename(FxHashMap<String, String>),
    Flatten { separator: String, max_depth: usize },
    Merge { with: MergeSource, strategy: MergeStrategy },
    Template(String),
    Stringify,
    Parse,
    Map(Box<TransformOp>),
    Custom(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

pub struct TransformNode {
    pub input_var: String,
    pub output_var: String,
    pub op: TransformOp,
}

impl TransformNode {
    pub fn new(input_var: impl Into<String>, output_var: impl Into<String>, op: TransformOp) -> Self {
        Self {
            input_var: input_var.into(),
            output_var: output_var.into(),
            op,
        }
    }
}

fn apply(op: &TransformOp, value: &Value, env: &Envelope) -> Result<Value, RunError> {
    match op {
        TransformOp::Pick(keys) => {
            let Some(map) = value.as_map() else { return Ok(Value::map([])) };
            Ok(Value::Map(keys.iter().filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone()))).collect()))
        }
        TransformOp::Omit(keys) => {
            let Some(map) = value.as_map() else { return Ok(Value::map([])) };
            Ok(Value::Map(map.iter().filter(|(k, _)| !keys.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect()))
        }
        TransformOp::Rename(mapping) => {
            let Some(map) = value.as_map() else { return Ok(Value::map([])) };
            Ok(Value::Map(
                map.iter()
                    .map(|(k, v)| (mapping.get(k).cloned().unwrap_or_else(|| k.clone()), v.clone()))
                    .collect(),
            ))
        }
        TransformOp::Flatten { separator, max_depth } => Ok(flatten(value, separator, *max_depth)),
        TransformOp::Merge { with, strategy } => {
            let other = match with {
                MergeSource::Var(path) => env.get_var_nested(path).cloned().unwrap_or(Value::Null),
                MergeSource::Literal(v) => v.clone(),
            };
            Ok(deep_merge(value, &other, *strategy))
        }
        TransformOp::Template(tmpl) => {
            let context = Value::Map(env.vars.clone());
            Ok(Value::String(template::render(tmpl, &context)))
        }
        TransformOp::Stringify => Ok(Value::String(serde_json::to_string(&value.to_json()).unwrap_or_default())),
        TransformOp::Parse => match value {
            Value::String(s) => serde_json::from_str::<serde_json::Value>(s)
                .map(Value::from_json)
                .map_err(|e| RunError::ValidationFailed(format!("parse: invalid json: {e}"))),
            other => Ok(other.clone()),
        },
        TransformOp::Map(inner) => {
            let Some(items) = value.as_list() else {
                return Err(RunError::ValidationFailed("map: input is not a list".into()));
            };
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(apply(inner, item, env)?);
            }
            Ok(Value::List(out))
        }
        TransformOp::Custom(f) => Ok(f(value)),
    }
}

fn flatten(value: &Value, separator: &str, max_depth: usize) -> Value {
    fn walk(prefix: &str, value: &Value, separator: &str, depth: usize, max_depth: usize, out: &mut FxHashMap<String, Value>) {
        match value {
            Value::Map(map) if depth < max_depth => {
                for (k, v) in map {
                    let key = if prefix.is_empty() { k.clone() } else { format!("{prefix}{separator}{k}") };
                    walk(&key, v, separator, depth + 1, max_depth, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
    let mut out = FxHashMap::default();
    walk("", value, separator, 0, max_depth, &mut out);
    Value::Map(out)
}

#[async_trait]
impl Node for TransformNode {
    async fn run(&self, _ctx: NodeContext, mut env: Envelope) -> Result<Envelope, RunError> {
        let input = env.get_var_nested(&self.input_var).cloned().unwrap_or(Value::Null);
        let result = apply(&self.op, &input, &env)?;
        env.set_var_nested(&self.output_var, result).map_err(|e| RunError::ValidationFailed(e.to_string()))?;
        Ok(env)
    }
}
