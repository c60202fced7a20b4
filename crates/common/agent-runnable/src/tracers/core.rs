//! Run-tree bookkeeping shared by every tracer.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::callbacks::{NewToken, RunEnd, RunFailure, RunStart, StreamChunk};
use crate::error::TracerError;

use super::schemas::{Run, RunEvent, RunType, coerce_to_dict, dotted_order_segment};

/// The active runs of one tracer instance.
///
/// A run enters the map on start and leaves it on end or error. A child
/// whose parent already left the map is traced as a new root.
#[derive(Debug, Default)]
pub struct TracerCore {
    run_map: HashMap<Uuid, Run>,
}

impl TracerCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_run(&self, run_id: Uuid) -> Option<&Run> {
        self.run_map.get(&run_id)
    }

    pub fn active_runs(&self) -> usize {
        self.run_map.len()
    }

    /// Record a started run and return a snapshot of it.
    ///
    /// The execution order is `1` for a root and one past the parent's
    /// child execution order otherwise; the parent's child execution order
    /// is raised to cover the new run. Starting a run id that is still
    /// active fails.
    pub fn start_run(&mut self, start: &RunStart) -> Result<Run, TracerError> {
        if self.run_map.contains_key(&start.run_id) {
            return Err(TracerError::DuplicateRun(start.run_id));
        }
        let start_time = Utc::now();
        let parent = start
            .parent_run_id
            .and_then(|parent_id| self.run_map.get_mut(&parent_id));

        let (parent_run_id, execution_order, parent_order) = match parent {
            Some(parent) => {
                let order = parent.child_execution_order + 1;
                parent.child_execution_order = parent.child_execution_order.max(order);
                (
                    Some(parent.id),
                    order,
                    Some((parent.trace_id, parent.dotted_order.clone())),
                )
            }
            None => {
                if let Some(parent_id) = start.parent_run_id {
                    tracing::debug!(
                        target: "agent_runnable::tracers",
                        "Parent run {} not found for run {}. Treating as a root run.",
                        parent_id,
                        start.run_id
                    );
                }
                (None, 1, None)
            }
        };

        let segment = dotted_order_segment(start_time, execution_order, start.run_id);
        let (trace_id, dotted_order) = match parent_order {
            Some((trace_id, parent_dotted)) => (trace_id, format!("{parent_dotted}.{segment}")),
            None => (start.run_id, segment),
        };

        let mut extra = HashMap::new();
        extra.insert("metadata".to_string(), json!(start.metadata));

        let run = Run {
            id: start.run_id,
            name: start.name.clone(),
            run_type: start.run_type,
            parent_run_id,
            trace_id,
            dotted_order,
            execution_order,
            child_execution_order: execution_order,
            start_time,
            end_time: None,
            inputs: coerce_to_dict(start.inputs.clone(), "input"),
            outputs: None,
            error: None,
            tags: start.tags.clone(),
            extra,
            events: vec![RunEvent::new("start", None)],
            child_runs: Vec::new(),
        };

        self.run_map.insert(run.id, run.clone());
        Ok(run)
    }

    /// Finalize a run successfully.
    pub fn end_run(&mut self, end: &RunEnd) -> Result<Run, TracerError> {
        let mut run = self
            .run_map
            .remove(&end.run_id)
            .ok_or(TracerError::RunNotFound(end.run_id))?;
        run.end_time = Some(Utc::now());
        run.outputs = Some(coerce_to_dict(end.outputs.clone(), "output"));
        if let Some(inputs) = &end.inputs {
            run.inputs = coerce_to_dict(inputs.clone(), "input");
        }
        run.events.push(RunEvent::new("end", None));
        self.fold_into_parent(&run);
        Ok(run)
    }

    /// Finalize a run with an error.
    pub fn error_run(&mut self, failure: &RunFailure) -> Result<Run, TracerError> {
        let mut run = self
            .run_map
            .remove(&failure.run_id)
            .ok_or(TracerError::RunNotFound(failure.run_id))?;
        run.end_time = Some(Utc::now());
        run.error = Some(failure.error.to_string());
        run.events.push(RunEvent::new("error", None));
        self.fold_into_parent(&run);
        Ok(run)
    }

    /// Record a new LLM token.
    pub fn new_token(&mut self, token: &NewToken) -> Result<Run, TracerError> {
        let run = self
            .run_map
            .get_mut(&token.run_id)
            .ok_or(TracerError::RunNotFound(token.run_id))?;
        if run.run_type != RunType::Llm {
            return Err(TracerError::WrongRunType {
                run_id: token.run_id,
                expected: RunType::Llm.to_string(),
                actual: run.run_type.to_string(),
            });
        }
        let mut kwargs = json!({ "token": token.token });
        if let Some(chunk) = &token.chunk {
            kwargs["chunk"] = chunk.clone();
        }
        run.events.push(RunEvent::new("new_token", Some(kwargs)));
        Ok(run.clone())
    }

    /// Record a streamed output chunk.
    pub fn stream_chunk(&mut self, chunk: &StreamChunk) -> Result<(), TracerError> {
        let run = self
            .run_map
            .get_mut(&chunk.run_id)
            .ok_or(TracerError::RunNotFound(chunk.run_id))?;
        run.events.push(RunEvent::new(
            "stream",
            Some(json!({ "chunk": chunk.chunk.clone() })),
        ));
        Ok(())
    }

    fn fold_into_parent(&mut self, run: &Run) {
        let Some(parent_id) = run.parent_run_id else {
            return;
        };
        if let Some(parent) = self.run_map.get_mut(&parent_id) {
            parent.child_execution_order = parent
                .child_execution_order
                .max(run.child_execution_order);
            parent.child_runs.push(run.clone());
        }
    }
}

/// Standardized payload of a run for event-oriented consumers: a single
/// `input`/`output` key is unwrapped.
pub fn unwrap_single_key(value: &Value, key: &str) -> Value {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key(key) => map[key].clone(),
        other => other.clone(),
    }
}
