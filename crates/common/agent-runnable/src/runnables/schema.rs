//! Event payloads yielded by `stream_events`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the event emitted for user-dispatched events.
pub const CUSTOM_EVENT_TYPE: &str = "on_custom_event";

/// Payload of a standard event.
///
/// Start events may carry `input`, stream events carry `chunk`, end events
/// carry `output` and, when known, `input`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[bon::bon]
impl EventData {
    #[builder]
    pub fn new(
        input: Option<Value>,
        output: Option<Value>,
        chunk: Option<Value>,
        #[builder(into)] error: Option<String>,
    ) -> Self {
        Self {
            input,
            output,
            chunk,
            error,
        }
    }
}

/// A lifecycle event of one run: `on_<run_type>_<start|stream|end>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardStreamEvent {
    pub event: String,

    pub name: String,

    pub run_id: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// Ancestor run ids, root first. Always empty for v1 events.
    #[serde(default)]
    pub parent_ids: Vec<String>,

    pub data: EventData,
}

#[bon::bon]
impl StandardStreamEvent {
    #[builder]
    pub fn new(
        #[builder(into)] event: String,
        #[builder(into)] name: String,
        #[builder(into)] run_id: String,
        #[builder(default)] tags: Vec<String>,
        #[builder(default)] metadata: HashMap<String, Value>,
        #[builder(default)] parent_ids: Vec<String>,
        #[builder(default)] data: EventData,
    ) -> Self {
        Self {
            event,
            name,
            run_id,
            tags,
            metadata,
            parent_ids,
            data,
        }
    }
}

/// An event dispatched by user code through `dispatch_custom_event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomStreamEvent {
    pub event: String,

    pub name: String,

    /// The run that dispatched the event.
    pub run_id: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    #[serde(default)]
    pub parent_ids: Vec<String>,

    pub data: Value,
}

#[bon::bon]
impl CustomStreamEvent {
    #[builder]
    pub fn new(
        #[builder(into)] name: String,
        #[builder(into)] run_id: String,
        data: Value,
        #[builder(default)] tags: Vec<String>,
        #[builder(default)] metadata: HashMap<String, Value>,
        #[builder(default)] parent_ids: Vec<String>,
    ) -> Self {
        Self {
            event: CUSTOM_EVENT_TYPE.to_string(),
            name,
            run_id,
            tags,
            metadata,
            parent_ids,
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Standard(StandardStreamEvent),
    Custom(CustomStreamEvent),
}

impl StreamEvent {
    pub fn event(&self) -> &str {
        match self {
            StreamEvent::Standard(e) => &e.event,
            StreamEvent::Custom(e) => &e.event,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            StreamEvent::Standard(e) => &e.name,
            StreamEvent::Custom(e) => &e.name,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            StreamEvent::Standard(e) => &e.run_id,
            StreamEvent::Custom(e) => &e.run_id,
        }
    }

    pub fn tags(&self) -> &[String] {
        match self {
            StreamEvent::Standard(e) => &e.tags,
            StreamEvent::Custom(e) => &e.tags,
        }
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        match self {
            StreamEvent::Standard(e) => &e.metadata,
            StreamEvent::Custom(e) => &e.metadata,
        }
    }

    pub fn parent_ids(&self) -> &[String] {
        match self {
            StreamEvent::Standard(e) => &e.parent_ids,
            StreamEvent::Custom(e) => &e.parent_ids,
        }
    }

    /// The payload of a standard event.
    pub fn data(&self) -> Option<&EventData> {
        match self {
            StreamEvent::Standard(e) => Some(&e.data),
            StreamEvent::Custom(_) => None,
        }
    }

    pub(crate) fn data_mut(&mut self) -> Option<&mut EventData> {
        match self {
            StreamEvent::Standard(e) => Some(&mut e.data),
            StreamEvent::Custom(_) => None,
        }
    }
}

impl From<StandardStreamEvent> for StreamEvent {
    fn from(event: StandardStreamEvent) -> Self {
        StreamEvent::Standard(event)
    }
}

impl From<CustomStreamEvent> for StreamEvent {
    fn from(event: CustomStreamEvent) -> Self {
        StreamEvent::Custom(event)
    }
}
