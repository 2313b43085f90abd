//! LLM client contract and request/response types (spec.md §3, §4.3).
//!
//! Concrete provider clients are an external collaborator (spec.md §1); this
//! module defines only the trait and wire types the LLM node programs
//! against, grounded on `weavegraph::event_bus`'s streaming-chunk shape for
//! the `StreamChunk` type and on the teacher's async-trait client seams.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::{EnvelopeMessage, Value};

/// A tool exposed to the model for function calling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Token and cost accounting for one completion.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}

/// A requested tool invocation surfaced by the model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// A completion request (spec.md §3).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LLMRequest {
    pub model: String,
    pub system: Option<String>,
    pub input_text: String,
    pub messages: Vec<EnvelopeMessage>,
    pub tools: Vec<ToolSpec>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json_schema: Option<Value>,
}

/// A completion response (spec.md §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LLMResponse {
    pub text: String,
    pub json: Option<Value>,
    pub model: String,
    pub provider: String,
    pub usage: Usage,
    pub tool_calls: Vec<ToolCall>,
}

/// One chunk of a streamed completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub index: u32,
    pub done: bool,
    pub usage: Option<Usage>,
    /// Tool calls accumulated by the provider, carried on the chunk marked
    /// `done` (spec.md §4.3's tool loop applies to the streamed path too).
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
}

/// Errors surfaced by an [`LLMClient`] implementation.
#[derive(Debug, Error)]
pub enum LLMError {
    #[error("provider error ({provider}): {message}")]
    Provider { provider: String, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Synchronous completion contract. Concrete providers are external
/// collaborators (spec.md §1); this crate only programs against the trait.
#[async_trait]
pub trait LLMClient: Send + Sync {
    async fn complete(&self, req: &LLMRequest) -> Result<LLMResponse, LLMError>;
}

/// Optional streaming extension. The LLM node prefers this path when the
/// client implements it and no `JSONSchema` is required (spec.md §4.3).
#[async_trait]
pub trait StreamingLLMClient: LLMClient {
    async fn complete_stream(&self, req: &LLMRequest) -> Result<BoxStream<'static, Result<StreamChunk, LLMError>>, LLMError>;
}

/// Token/cost caps enforced after a successful response (spec.md §4.3:
/// all-or-nothing — an exceeded cap means the response never reaches the
/// envelope).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Budget {
    pub max_input_tokens: Option<u64>,
    pub max_output_tokens: Option<u64>,
    pub max_total_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

impl Budget {
    pub fn check(&self, usage: &Usage) -> Result<(), String> {
        if let Some(cap) = self.max_input_tokens {
            if usage.input_tokens > cap {
                return Err(format!("input tokens {} exceed budget {}", usage.input_tokens, cap));
            }
        }
        if let Some(cap) = self.max_output_tokens {
            if usage.output_tokens > cap {
                return Err(format!("output tokens {} exceed budget {}", usage.output_tokens, cap));
            }
        }
        if let Some(cap) = self.max_total_tokens {
            if usage.total_tokens > cap {
                return Err(format!("total tokens {} exceed budget {}", usage.total_tokens, cap));
            }
        }
        if let Some(cap) = self.max_cost_usd {
            if usage.cost_usd > cap {
                return Err(format!("cost {:.4} exceeds budget {:.4}", usage.cost_usd, cap));
            }
        }
        Ok(())
    }
}

/// A tagged view the LLM node builds for templates, derived from vars named
/// `<task>__<agent>_output` (spec.md §4.3).
pub fn derive_tasks_view(vars: &FxHashMap<String, Value>) -> Value {
    let mut tasks: FxHashMap<String, Value> = FxHashMap::default();
    for (key, value) in vars {
        if let Some((task, _agent)) = key.split_once("__") {
            if key.ends_with("_output") {
                let entry = tasks
                    .entry(task.to_string())
                    .or_insert_with(|| Value::map([]));
                if let Value::Map(map) = entry {
                    map.insert("output".to_string(), value.clone());
                }
            }
        }
    }
    Value::Map(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rejects_exceeded_total() {
        let budget = Budget {
            max_total_tokens: Some(10),
            ..Default::default()
        };
        let usage = Usage {
            total_tokens: 11,
            ..Default::default()
        };
        assert!(budget.check(&usage).is_err());
    }

    #[test]
    fn derive_tasks_view_groups_by_task() {
        let mut vars = FxHashMap::default();
        vars.insert("research__agent1_output".to_string(), Value::String("docs".into()));
        let view = derive_tasks_view(&vars);
        let research = view.as_map().unwrap().get("research").unwrap();
        assert_eq!(research.as_map().unwrap().get("output").unwrap().as_str(), Some("docs"));
    }
}
