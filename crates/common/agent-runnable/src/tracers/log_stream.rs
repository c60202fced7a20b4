//! Run logs streamed as JSON Patch (RFC 6902) operations.
//!
//! The state built by the patches has the shape
//!
//! ```text
//! { id, name, type, streamed_output: [...], final_output, logs: { key: entry } }
//! ```
//!
//! where each log entry describes one included sub-run. Keys are the run
//! name, suffixed `:2`, `:3`, ... for repeated names.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::callbacks::{CallbackHandler, NewToken, RunEnd, RunFailure, RunStart, StreamChunk};
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::runnables::base::Runnable;
use crate::runnables::config::{RunnableConfig, ensure_config};
use crate::runnables::utils::RootEventFilter;

use super::base::BaseTracer;
use super::core::{TracerCore, unwrap_single_key};
use super::memory_stream::{SendStream, memory_stream};
use super::schemas::Run;

/// One JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    Test { path: String, value: Value },
}

impl PatchOp {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self::Add {
            path: path.into(),
            value,
        }
    }

    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self::Replace {
            path: path.into(),
            value,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Self::Remove { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Add { path, .. }
            | Self::Remove { path }
            | Self::Replace { path, .. }
            | Self::Move { path, .. }
            | Self::Copy { path, .. }
            | Self::Test { path, .. } => path,
        }
    }
}

/// Apply operations to `state` atomically: on error `state` is unchanged.
pub fn apply_ops(state: &mut Value, ops: &[PatchOp]) -> Result<()> {
    let operations: Vec<json_patch::PatchOperation> =
        serde_json::from_value(serde_json::to_value(ops)?)?;
    json_patch::patch(state, &operations)?;
    Ok(())
}

/// Escape one JSON Pointer reference token.
fn escape_pointer(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_pointer(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// A batch of operations sent by the log stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogPatch {
    pub ops: Vec<PatchOp>,
}

impl RunLogPatch {
    pub fn new(ops: Vec<PatchOp>) -> Self {
        Self { ops }
    }

    /// Join two patches into a log whose state is both applied to `null`.
    pub fn concat(&self, other: &RunLogPatch) -> Result<RunLog> {
        let mut ops = self.ops.clone();
        ops.extend(other.ops.iter().cloned());
        RunLog::from_ops(ops)
    }
}

impl From<RunLog> for RunLogPatch {
    fn from(log: RunLog) -> Self {
        Self { ops: log.ops }
    }
}

/// All operations seen so far, with the state they produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub ops: Vec<PatchOp>,
    pub state: Value,
}

impl Default for RunLog {
    fn default() -> Self {
        Self {
            ops: Vec::new(),
            state: Value::Null,
        }
    }
}

impl RunLog {
    pub fn from_ops(ops: Vec<PatchOp>) -> Result<Self> {
        let mut state = Value::Null;
        apply_ops(&mut state, &ops)?;
        Ok(Self { ops, state })
    }

    /// Append a patch, applying its operations to a copy of the state.
    pub fn concat(&self, other: &RunLogPatch) -> Result<RunLog> {
        let mut state = self.state.clone();
        apply_ops(&mut state, &other.ops)?;
        let mut ops = self.ops.clone();
        ops.extend(other.ops.iter().cloned());
        Ok(RunLog { ops, state })
    }

    /// In-place version of [`RunLog::concat`].
    pub fn apply(&mut self, patch: &RunLogPatch) -> Result<()> {
        apply_ops(&mut self.state, &patch.ops)?;
        self.ops.extend(patch.ops.iter().cloned());
        Ok(())
    }

    /// A log entry by key.
    pub fn log(&self, key: &str) -> Option<&Value> {
        self.state.get("logs").and_then(|logs| logs.get(key))
    }
}

/// How inputs and outputs appear in log entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchemaFormat {
    /// Outputs as recorded on the run, always an object. Entries carry no
    /// inputs.
    #[default]
    Original,
    /// Inputs and outputs unwrapped to the values the runnable saw, and
    /// entries carry `inputs`. Used to derive v1 events.
    StreamingEvents,
}

/// Options for [`stream_log`].
#[derive(Debug, Clone)]
pub struct LogStreamOptions {
    pub filter: RootEventFilter,
    pub schema_format: SchemaFormat,
    /// Whether the root's chunks are appended to `/streamed_output`.
    pub with_streamed_output_list: bool,
}

impl Default for LogStreamOptions {
    fn default() -> Self {
        Self {
            filter: RootEventFilter::default(),
            schema_format: SchemaFormat::default(),
            with_streamed_output_list: true,
        }
    }
}

#[bon::bon]
impl LogStreamOptions {
    #[builder]
    pub fn new(
        #[builder(default)] filter: RootEventFilter,
        #[builder(default)] schema_format: SchemaFormat,
        #[builder(default = true)] with_streamed_output_list: bool,
    ) -> Self {
        Self {
            filter,
            schema_format,
            with_streamed_output_list,
        }
    }
}

#[derive(Debug, Default)]
struct LogState {
    root_id: Option<Uuid>,
    key_map_by_run_id: HashMap<Uuid, String>,
    counter_map_by_run_name: HashMap<String, usize>,
}

/// Tracer that turns run lifecycle callbacks into [`RunLogPatch`]es.
///
/// The first run it sees becomes the root; the root never gets a log
/// entry. Every other run that passes the filter does.
#[derive(Debug)]
pub struct LogStreamCallbackHandler {
    core: Mutex<TracerCore>,
    state: Mutex<LogState>,
    filter: RootEventFilter,
    schema_format: SchemaFormat,
    send: SendStream<Result<RunLogPatch>>,
}

impl LogStreamCallbackHandler {
    pub fn new(
        send: SendStream<Result<RunLogPatch>>,
        filter: RootEventFilter,
        schema_format: SchemaFormat,
    ) -> Self {
        Self {
            core: Mutex::new(TracerCore::new()),
            state: Mutex::new(LogState::default()),
            filter,
            schema_format,
            send,
        }
    }

    pub fn root_id(&self) -> Option<Uuid> {
        self.state.lock().root_id
    }

    fn send(&self, ops: Vec<PatchOp>) {
        if !self.send.send(Ok(RunLogPatch::new(ops))) {
            tracing::debug!(
                target: "agent_runnable::tracers",
                "Log stream reader is gone; dropping patch"
            );
        }
    }

    fn include_run(&self, run: &Run, root_id: Option<Uuid>) -> bool {
        if Some(run.id) == root_id {
            return false;
        }
        self.filter
            .include_event(&run.name, &run.tags, run.run_type.as_str())
    }

    fn key_for(&self, run_id: Uuid) -> Option<String> {
        self.state.lock().key_map_by_run_id.get(&run_id).cloned()
    }

    fn standardized_inputs(&self, run: &Run) -> Option<Value> {
        if run.inputs == json!({ "input": "" }) {
            return None;
        }
        Some(unwrap_single_key(&run.inputs, "input"))
    }

    fn standardized_outputs(&self, run: &Run) -> Value {
        let outputs = run.outputs.clone().unwrap_or(Value::Null);
        match self.schema_format {
            SchemaFormat::Original => outputs,
            SchemaFormat::StreamingEvents => unwrap_single_key(&outputs, "output"),
        }
    }
}

impl BaseTracer for LogStreamCallbackHandler {
    fn core(&self) -> &Mutex<TracerCore> {
        &self.core
    }

    fn on_run_create(&self, run: &Run) -> Result<()> {
        let key = {
            let mut state = self.state.lock();
            if state.root_id.is_none() {
                state.root_id = Some(run.id);
                self.send(vec![PatchOp::replace(
                    "",
                    json!({
                        "id": run.id.to_string(),
                        "name": run.name,
                        "type": run.run_type.as_str(),
                        "streamed_output": [],
                        "final_output": null,
                        "logs": {},
                    }),
                )]);
            }

            if !self.include_run(run, state.root_id) {
                return Ok(());
            }

            let count = state
                .counter_map_by_run_name
                .entry(run.name.clone())
                .or_insert(0);
            *count += 1;
            let key = if *count == 1 {
                run.name.clone()
            } else {
                format!("{}:{}", run.name, count)
            };
            state.key_map_by_run_id.insert(run.id, key.clone());
            key
        };

        let mut entry = json!({
            "id": run.id.to_string(),
            "name": run.name,
            "type": run.run_type.as_str(),
            "tags": run.tags,
            "metadata": run.metadata(),
            "start_time": run.start_time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "streamed_output": [],
            "streamed_output_str": [],
            "final_output": null,
            "end_time": null,
        });
        if self.schema_format == SchemaFormat::StreamingEvents {
            entry["inputs"] = self.standardized_inputs(run).unwrap_or(Value::Null);
        }

        self.send(vec![PatchOp::add(
            format!("/logs/{}", escape_pointer(&key)),
            entry,
        )]);
        Ok(())
    }

    fn on_run_update(&self, run: &Run) -> Result<()> {
        let Some(key) = self.key_for(run.id) else {
            return Ok(());
        };
        let base = format!("/logs/{}", escape_pointer(&key));

        let mut ops = Vec::new();
        if self.schema_format == SchemaFormat::StreamingEvents {
            ops.push(PatchOp::replace(
                format!("{base}/inputs"),
                self.standardized_inputs(run).unwrap_or(Value::Null),
            ));
        }
        ops.push(PatchOp::add(
            format!("{base}/final_output"),
            self.standardized_outputs(run),
        ));
        if let Some(end_time) = run.end_time {
            ops.push(PatchOp::add(
                format!("{base}/end_time"),
                json!(end_time.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()),
            ));
        }
        self.send(ops);
        Ok(())
    }

    fn on_run_token(&self, run: &Run, token: &NewToken) -> Result<()> {
        let Some(key) = self.key_for(run.id) else {
            return Ok(());
        };
        let base = format!("/logs/{}", escape_pointer(&key));
        self.send(vec![
            PatchOp::add(format!("{base}/streamed_output_str/-"), json!(token.token)),
            PatchOp::add(
                format!("{base}/streamed_output/-"),
                token.chunk.clone().unwrap_or_else(|| json!(token.token)),
            ),
        ]);
        Ok(())
    }

    fn on_run_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        let Some(key) = self.key_for(chunk.run_id) else {
            return Ok(());
        };
        self.send(vec![PatchOp::add(
            format!("/logs/{}/streamed_output/-", escape_pointer(&key)),
            chunk.chunk.clone(),
        )]);
        Ok(())
    }
}

impl CallbackHandler for LogStreamCallbackHandler {
    fn name(&self) -> &str {
        "log_stream"
    }

    fn raise_error(&self) -> bool {
        true
    }

    fn on_run_start(&self, run: &RunStart) -> Result<()> {
        self.handle_start(run)
    }

    fn on_run_end(&self, run: &RunEnd) -> Result<()> {
        self.handle_end(run)
    }

    fn on_run_error(&self, run: &RunFailure) -> Result<()> {
        self.handle_error(run)
    }

    fn on_new_token(&self, token: &NewToken) -> Result<()> {
        self.handle_token(token)
    }

    fn on_stream_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        self.handle_chunk(chunk)
    }
}

/// Stream the run log of `runnable` as patches.
///
/// The runnable is driven from inside the returned stream, so nothing runs
/// until the stream is polled. Patches from the handler and from the
/// root's own output share one channel and arrive in the order produced.
/// An error from the runnable is yielded after every patch that precedes
/// it and ends the stream.
pub fn stream_log<'a, R>(
    runnable: &'a R,
    input: Chunk,
    config: Option<RunnableConfig>,
    options: LogStreamOptions,
) -> BoxStream<'a, Result<RunLogPatch>>
where
    R: Runnable + ?Sized,
{
    let (send, receive) = memory_stream::<Result<RunLogPatch>>();
    let handler = Arc::new(LogStreamCallbackHandler::new(
        send.clone(),
        options.filter,
        options.schema_format,
    ));
    let config = ensure_config(config).with_handler(handler);
    let with_streamed_output_list = options.with_streamed_output_list;

    let driver = async move {
        let mut final_output: Option<Chunk> = None;
        let mut output = runnable.stream(input, Some(config));
        while let Some(item) = output.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(error) => {
                    send.send(Err(error));
                    break;
                }
            };

            let mut ops = Vec::new();
            if with_streamed_output_list {
                ops.push(PatchOp::add("/streamed_output/-", chunk.to_json()));
            }
            final_output = Some(match final_output.take() {
                None => chunk,
                Some(previous) => previous.concat(&chunk).unwrap_or(chunk),
            });
            let current = final_output.as_ref().map(Chunk::to_json);
            ops.push(PatchOp::replace(
                "/final_output",
                current.unwrap_or(Value::Null),
            ));
            send.send(Ok(RunLogPatch::new(ops)));
        }
        send.close();
    };

    let driver =
        futures::stream::once(driver).filter_map(|()| async { None::<Result<RunLogPatch>> });
    Box::pin(futures::stream::select(receive.into_stream(), driver))
}

/// Fold a patch stream into the log after each patch.
pub fn accumulate_run_log<'a>(
    patches: BoxStream<'a, Result<RunLogPatch>>,
) -> BoxStream<'a, Result<RunLog>> {
    Box::pin(async_stream::try_stream! {
        let mut log = RunLog::default();
        let mut patches = patches;
        while let Some(patch) = patches.next().await {
            log.apply(&patch?)?;
            yield log.clone();
        }
    })
}

/// Keys of `/logs/<key>` entries touched by `ops`, in first-touch order.
pub(crate) fn touched_log_keys(ops: &[PatchOp]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for op in ops {
        let Some(rest) = op.path().strip_prefix("/logs/") else {
            continue;
        };
        let key = unescape_pointer(rest.split('/').next().unwrap_or_default());
        if !key.is_empty() && !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Error for a log entry that received more than one chunk in one patch.
pub(crate) fn unexpected_chunk_count(name: &str, count: usize) -> Error {
    Error::StreamEvents(format!(
        "expected exactly one chunk of streamed output for {name}, got {count}"
    ))
}
