pub mod base;
pub mod core;
pub mod event_stream;
pub mod log_stream;
pub mod memory_stream;
pub mod run_collector;
pub mod schemas;

pub use self::core::{TracerCore, unwrap_single_key};

pub use schemas::{Run, RunEvent, RunType};

pub use base::BaseTracer;

pub use memory_stream::{ReceiveStream, SendStream, memory_stream};

pub use log_stream::{
    LogStreamCallbackHandler, LogStreamOptions, PatchOp, RunLog, RunLogPatch, SchemaFormat,
    accumulate_run_log, stream_log,
};

pub use run_collector::{RunCollector, batch_runs_for_ingest, flatten_runs};

pub use event_stream::{
    EventStreamCallbackHandler, EventsVersion, StreamEventsOptions, encode_event_stream,
    stream_events_v1, stream_events_v2,
};
