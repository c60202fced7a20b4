//! Callback handlers and the managers that dispatch run events to them.

pub mod base;
pub mod manager;

pub use base::{
    CallbackHandler, Callbacks, CustomEvent, DynCallbackHandler, NewToken, RunEnd, RunFailure,
    RunStart, StreamChunk,
};

pub use manager::{CallbackManager, RunManager, dispatch_custom_event, handle_event};
