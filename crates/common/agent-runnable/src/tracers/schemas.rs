use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    #[default]
    Chain,
    Llm,
    Tool,
    Retriever,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunType::Chain => "chain",
            RunType::Llm => "llm",
            RunType::Tool => "tool",
            RunType::Retriever => "retriever",
        }
    }
}

impl std::fmt::Display for RunType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for RunType {
    fn from(s: &str) -> Self {
        match s {
            "llm" => RunType::Llm,
            "tool" => RunType::Tool,
            "retriever" => RunType::Retriever,
            _ => RunType::Chain,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwargs: Option<Value>,
}

impl RunEvent {
    pub fn new(name: impl Into<String>, kwargs: Option<Value>) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            kwargs,
        }
    }
}

/// A single recorded execution.
///
/// Created on the start callback, mutated by token/stream events and
/// finalized exactly once by an end or error callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,

    pub name: String,

    pub run_type: RunType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<Uuid>,

    pub trace_id: Uuid,

    pub dotted_order: String,

    pub execution_order: u64,

    pub child_execution_order: u64,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    pub inputs: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub extra: HashMap<String, Value>,

    #[serde(default)]
    pub events: Vec<RunEvent>,

    #[serde(default)]
    pub child_runs: Vec<Run>,
}

impl Run {
    /// Metadata recorded at start, stored under `extra.metadata`.
    pub fn metadata(&self) -> Value {
        self.extra
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| json!({}))
    }

    pub fn is_finished(&self) -> bool {
        self.end_time.is_some()
    }

    /// The run in the shape posted to a tracing backend.
    pub fn to_persisted(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "start_time": self.start_time,
            "end_time": self.end_time,
            "run_type": self.run_type,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "error": self.error,
            "parent_run_id": self.parent_run_id,
            "trace_id": self.trace_id,
            "dotted_order": self.dotted_order,
            "tags": self.tags,
            "extra": self.extra,
        })
    }
}

/// Wrap a non-object value as `{key: value}` for logging.
pub fn coerce_to_dict(value: Value, key: &str) -> Value {
    match value {
        Value::Object(_) => value,
        other => json!({ key: other }),
    }
}

/// Compute one dotted-order segment for a run.
///
/// The segment is the start time to the millisecond with separators
/// stripped, the execution order zero-padded to three digits, then `Z` and
/// the run id. Orders above 999 are clamped so the segment keeps its width.
pub fn dotted_order_segment(start_time: DateTime<Utc>, execution_order: u64, id: Uuid) -> String {
    format!(
        "{}{:03}Z{}",
        start_time.format("%Y%m%dT%H%M%S%3f"),
        execution_order.min(999),
        id
    )
}
