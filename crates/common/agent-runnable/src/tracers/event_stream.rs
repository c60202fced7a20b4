//! Flat streams of typed run events.
//!
//! Version 2 events come straight from a callback handler and carry
//! `parent_ids`. Version 1 events are derived from the run log and never
//! do.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::callbacks::{CallbackHandler, CustomEvent, NewToken, RunEnd, RunFailure, RunStart, StreamChunk};
use crate::chunk::Chunk;
use crate::error::{Error, Result, TracerError};
use crate::runnables::base::Runnable;
use crate::runnables::config::{RunnableConfig, ensure_config};
use crate::runnables::schema::{CustomStreamEvent, EventData, StandardStreamEvent, StreamEvent};
use crate::runnables::utils::RootEventFilter;

use super::log_stream::{
    LogStreamOptions, RunLog, SchemaFormat, stream_log, touched_log_keys, unexpected_chunk_count,
};
use super::memory_stream::{SendStream, memory_stream};
use super::schemas::RunType;

/// Event stream schema version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventsVersion {
    V1,
    #[default]
    V2,
}

#[derive(Debug, Clone, Default)]
pub struct StreamEventsOptions {
    pub version: EventsVersion,
    pub filter: RootEventFilter,
}

#[bon::bon]
impl StreamEventsOptions {
    #[builder]
    pub fn new(
        #[builder(default)] version: EventsVersion,
        #[builder(default)] filter: RootEventFilter,
    ) -> Self {
        Self { version, filter }
    }
}

#[derive(Debug, Clone)]
struct RunInfo {
    name: String,
    tags: Vec<String>,
    metadata: HashMap<String, Value>,
    run_type: RunType,
    inputs: Option<Value>,
}

#[derive(Debug, Default)]
struct HandlerState {
    run_map: HashMap<Uuid, RunInfo>,
    /// Kept after runs finish so late custom events still resolve.
    parent_map: HashMap<Uuid, Option<Uuid>>,
}

impl HandlerState {
    fn parent_ids(&self, mut run_id: Uuid) -> Result<Vec<String>> {
        let mut parent_ids: Vec<String> = Vec::new();
        while let Some(Some(parent_id)) = self.parent_map.get(&run_id) {
            let parent = parent_id.to_string();
            if parent_ids.contains(&parent) {
                return Err(Error::StreamEvents(format!(
                    "parent id {parent} appears twice in the ancestry of {run_id}"
                )));
            }
            parent_ids.push(parent);
            run_id = *parent_id;
        }
        parent_ids.reverse();
        Ok(parent_ids)
    }
}

/// Callback handler that writes version 2 events to a channel.
///
/// A callback for a run it never saw start is an error and fails the run.
#[derive(Debug)]
pub struct EventStreamCallbackHandler {
    state: Mutex<HandlerState>,
    filter: RootEventFilter,
    send: SendStream<Result<StreamEvent>>,
}

impl EventStreamCallbackHandler {
    pub fn new(send: SendStream<Result<StreamEvent>>, filter: RootEventFilter) -> Self {
        Self {
            state: Mutex::new(HandlerState::default()),
            filter,
            send,
        }
    }

    fn send(&self, event: StreamEvent, event_type: &str) {
        if self
            .filter
            .include_event(event.name(), event.tags(), event_type)
        {
            self.send.send(Ok(event));
        }
    }

    fn standard_event(
        &self,
        info: &RunInfo,
        run_id: Uuid,
        phase: &str,
        parent_ids: Vec<String>,
        data: EventData,
    ) -> StreamEvent {
        StandardStreamEvent::builder()
            .event(format!("on_{}_{phase}", info.run_type))
            .name(info.name.clone())
            .run_id(run_id.to_string())
            .tags(info.tags.clone())
            .metadata(info.metadata.clone())
            .parent_ids(parent_ids)
            .data(data)
            .build()
            .into()
    }

    fn emit_stream(&self, run_id: Uuid, chunk: Value) -> Result<()> {
        let (info, parent_ids) = {
            let state = self.state.lock();
            let info = state
                .run_map
                .get(&run_id)
                .cloned()
                .ok_or(TracerError::RunNotFound(run_id))?;
            (info, state.parent_ids(run_id)?)
        };
        let data = EventData::builder().chunk(chunk).build();
        let event = self.standard_event(&info, run_id, "stream", parent_ids, data);
        self.send(event, info.run_type.as_str());
        Ok(())
    }
}

impl CallbackHandler for EventStreamCallbackHandler {
    fn name(&self) -> &str {
        "event_stream"
    }

    fn raise_error(&self) -> bool {
        true
    }

    fn on_run_start(&self, run: &RunStart) -> Result<()> {
        let inputs = (run.inputs != json!({ "input": "" })).then(|| run.inputs.clone());
        let info = RunInfo {
            name: run.name.clone(),
            tags: run.tags.clone(),
            metadata: run.metadata.clone(),
            run_type: run.run_type,
            inputs: inputs.clone(),
        };
        let parent_ids = {
            let mut state = self.state.lock();
            state.run_map.insert(run.run_id, info.clone());
            state.parent_map.insert(run.run_id, run.parent_run_id);
            state.parent_ids(run.run_id)?
        };
        let data = EventData {
            input: inputs,
            ..EventData::default()
        };
        let event = self.standard_event(&info, run.run_id, "start", parent_ids, data);
        self.send(event, info.run_type.as_str());
        Ok(())
    }

    fn on_run_end(&self, run: &RunEnd) -> Result<()> {
        let (info, parent_ids) = {
            let mut state = self.state.lock();
            let info = state
                .run_map
                .remove(&run.run_id)
                .ok_or(TracerError::RunNotFound(run.run_id))?;
            (info, state.parent_ids(run.run_id)?)
        };
        let inputs = run
            .inputs
            .clone()
            .or_else(|| info.inputs.clone())
            .unwrap_or_else(|| json!({}));
        let data = EventData::builder()
            .output(run.outputs.clone())
            .input(inputs)
            .build();
        let event = self.standard_event(&info, run.run_id, "end", parent_ids, data);
        self.send(event, info.run_type.as_str());
        Ok(())
    }

    fn on_run_error(&self, run: &RunFailure) -> Result<()> {
        let (info, parent_ids) = {
            let mut state = self.state.lock();
            let info = state
                .run_map
                .remove(&run.run_id)
                .ok_or(TracerError::RunNotFound(run.run_id))?;
            (info, state.parent_ids(run.run_id)?)
        };
        // Only tools report failures as events; other runs surface their
        // error through the stream itself.
        if info.run_type == RunType::Tool {
            let data = EventData::builder()
                .error(run.error.to_string())
                .input(info.inputs.clone().unwrap_or_else(|| json!({})))
                .build();
            let event = self.standard_event(&info, run.run_id, "error", parent_ids, data);
            self.send(event, info.run_type.as_str());
        }
        Ok(())
    }

    fn on_new_token(&self, token: &NewToken) -> Result<()> {
        let chunk = token.chunk.clone().unwrap_or_else(|| json!(token.token));
        self.emit_stream(token.run_id, chunk)
    }

    fn on_stream_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        self.emit_stream(chunk.run_id, chunk.chunk.clone())
    }

    fn on_custom_event(&self, event: &CustomEvent) -> Result<()> {
        let parent_ids = self.state.lock().parent_ids(event.run_id)?;
        let custom = CustomStreamEvent::builder()
            .name(event.name.clone())
            .run_id(event.run_id.to_string())
            .data(event.data.clone())
            .tags(event.tags.clone())
            .metadata(event.metadata.clone())
            .parent_ids(parent_ids)
            .build();
        self.send(custom.into(), &event.name);
        Ok(())
    }
}

/// Version 2 event stream of `runnable`.
///
/// The first event carries the caller's input literally; the end event of
/// the same run drops its input, which the first event already has.
pub fn stream_events_v2<'a, R>(
    runnable: &'a R,
    input: Chunk,
    config: Option<RunnableConfig>,
    filter: RootEventFilter,
) -> BoxStream<'a, Result<StreamEvent>>
where
    R: Runnable + ?Sized,
{
    let (send, receive) = memory_stream::<Result<StreamEvent>>();
    let handler = Arc::new(EventStreamCallbackHandler::new(send.clone(), filter));
    let mut config = ensure_config(config).with_handler(handler);
    config.run_id.get_or_insert_with(Uuid::new_v4);
    let literal_input = input.to_json();

    let driver = async move {
        let mut output = runnable.stream(input, Some(config));
        while let Some(item) = output.next().await {
            if let Err(error) = item {
                send.send(Err(error));
                break;
            }
        }
        send.close();
    };
    let driver =
        futures::stream::once(driver).filter_map(|()| async { None::<Result<StreamEvent>> });
    let mut events = Box::pin(futures::stream::select(receive.into_stream(), driver));

    Box::pin(async_stream::try_stream! {
        let mut first_run_id: Option<String> = None;
        while let Some(event) = events.next().await {
            let mut event = event?;
            match &first_run_id {
                None => {
                    first_run_id = Some(event.run_id().to_string());
                    if let Some(data) = event.data_mut() {
                        data.input = Some(literal_input.clone());
                    }
                }
                Some(root) => {
                    if event.run_id() == root
                        && event.event().ends_with("_end")
                        && let Some(data) = event.data_mut()
                    {
                        data.input = None;
                    }
                }
            }
            yield event;
        }
    })
}

fn metadata_map(value: &Value) -> HashMap<String, Value> {
    value
        .as_object()
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn str_field<'v>(value: &'v Value, key: &str) -> &'v str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Turn the log entries touched by the latest patch into events.
fn entry_events(log: &mut RunLog, keys: &[String]) -> Result<Vec<StreamEvent>> {
    let mut events = Vec::new();
    for key in keys {
        let Some(entry) = log
            .state
            .get_mut("logs")
            .and_then(|logs| logs.get_mut(key.as_str()))
        else {
            continue;
        };

        let streamed = entry
            .get("streamed_output")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let phase = if entry.get("end_time").is_none_or(Value::is_null) {
            if streamed > 0 { "stream" } else { "start" }
        } else {
            "end"
        };

        let inputs = entry.get("inputs").filter(|v| !v.is_null()).cloned();
        let mut data = EventData::default();
        match phase {
            "start" => data.input = inputs,
            "stream" => {
                if streamed != 1 {
                    return Err(unexpected_chunk_count(str_field(entry, "name"), streamed));
                }
                data.chunk = entry["streamed_output"].get(0).cloned();
                entry["streamed_output"] = json!([]);
            }
            _ => {
                data.input = inputs;
                data.output = Some(entry.get("final_output").cloned().unwrap_or(Value::Null));
            }
        }

        events.push(
            StandardStreamEvent::builder()
                .event(format!("on_{}_{phase}", str_field(entry, "type")))
                .name(str_field(entry, "name"))
                .run_id(str_field(entry, "id"))
                .tags(string_list(&entry["tags"]))
                .metadata(metadata_map(&entry["metadata"]))
                .data(data)
                .build()
                .into(),
        );
    }
    Ok(events)
}

/// Version 1 event stream of `runnable`, derived from its run log.
///
/// Events for the root run use the caller's config for name, tags and
/// metadata and are filtered here; events for sub-runs were already
/// filtered by the log.
pub fn stream_events_v1<'a, R>(
    runnable: &'a R,
    input: Chunk,
    config: Option<RunnableConfig>,
    filter: RootEventFilter,
) -> BoxStream<'a, Result<StreamEvent>>
where
    R: Runnable + ?Sized,
{
    let config = ensure_config(config);
    let root_name = config.run_name.clone().unwrap_or_else(|| runnable.name());
    let root_tags = config.tags.clone();
    let root_metadata = config.metadata.clone();
    let literal_input = input.to_json();

    let options = LogStreamOptions::builder()
        .filter(filter.clone())
        .schema_format(SchemaFormat::StreamingEvents)
        .with_streamed_output_list(true)
        .build();
    let mut patches = stream_log(runnable, input, Some(config), options);

    Box::pin(async_stream::try_stream! {
        let mut log = RunLog::default();
        let mut started = false;
        let mut root_type = String::from("chain");
        let mut root_id = String::new();

        while let Some(patch) = patches.next().await {
            let patch = patch?;
            log.apply(&patch)?;

            if !started {
                started = true;
                root_type = str_field(&log.state, "type").to_string();
                root_id = str_field(&log.state, "id").to_string();
                if filter.include_event(&root_name, &root_tags, &root_type) {
                    yield StreamEvent::from(
                        StandardStreamEvent::builder()
                            .event(format!("on_{root_type}_start"))
                            .name(root_name.clone())
                            .run_id(root_id.clone())
                            .tags(root_tags.clone())
                            .metadata(root_metadata.clone())
                            .data(EventData::builder().input(literal_input.clone()).build())
                            .build(),
                    );
                }
            }

            for event in entry_events(&mut log, &touched_log_keys(&patch.ops))? {
                yield event;
            }

            let streamed = log.state["streamed_output"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0);
            if streamed > 0 {
                if streamed != 1 {
                    Err::<(), Error>(unexpected_chunk_count(&root_name, streamed))?;
                }
                let chunk = log.state["streamed_output"].get(0).cloned();
                log.state["streamed_output"] = json!([]);
                if filter.include_event(&root_name, &root_tags, &root_type) {
                    yield StreamEvent::from(
                        StandardStreamEvent::builder()
                            .event(format!("on_{root_type}_stream"))
                            .name(root_name.clone())
                            .run_id(root_id.clone())
                            .tags(root_tags.clone())
                            .metadata(root_metadata.clone())
                            .data(EventData { chunk, ..EventData::default() })
                            .build(),
                    );
                }
            }
        }

        if started && filter.include_event(&root_name, &root_tags, &root_type) {
            let output = log.state.get("final_output").cloned().unwrap_or(Value::Null);
            yield StreamEvent::from(
                StandardStreamEvent::builder()
                    .event(format!("on_{root_type}_end"))
                    .name(root_name.clone())
                    .run_id(root_id.clone())
                    .tags(root_tags.clone())
                    .metadata(root_metadata.clone())
                    .data(EventData::builder().output(output).build())
                    .build(),
            );
        }
    })
}

/// Encode events as `text/event-stream` frames.
///
/// Each event becomes `event: data` with its JSON on the `data:` line; a
/// final `event: end` frame closes the stream.
pub fn encode_event_stream<'a>(
    events: BoxStream<'a, Result<StreamEvent>>,
) -> BoxStream<'a, Result<String>> {
    Box::pin(async_stream::try_stream! {
        let mut events = events;
        while let Some(event) = events.next().await {
            let event = event?;
            let json = serde_json::to_string(&event)?;
            yield format!("event: data\ndata: {json}\n\n");
        }
        yield "event: end\n\n".to_string();
    })
}
