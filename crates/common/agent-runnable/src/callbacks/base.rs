//! Callback handler trait and the payloads passed to its hooks.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::tracers::schemas::RunType;

use super::manager::CallbackManager;

/// A run has started.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub run_type: RunType,
    pub name: String,
    /// The input exactly as the runnable received it.
    pub inputs: Value,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// A run finished successfully.
#[derive(Debug, Clone)]
pub struct RunEnd {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub run_type: RunType,
    pub outputs: Value,
    /// The input accumulated while streaming, when it was not known at start.
    pub inputs: Option<Value>,
}

/// A run failed.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub run_type: RunType,
    pub error: Error,
}

/// A new token from an LLM run.
#[derive(Debug, Clone)]
pub struct NewToken {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub token: String,
    pub chunk: Option<Value>,
}

/// A chunk emitted by a streaming run.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub run_id: Uuid,
    pub parent_run_id: Option<Uuid>,
    pub run_type: RunType,
    pub chunk: Value,
}

/// A user-defined event dispatched from inside a run.
#[derive(Debug, Clone)]
pub struct CustomEvent {
    /// The run that dispatched the event.
    pub run_id: Uuid,
    pub name: String,
    pub data: Value,
    pub tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// Receives run lifecycle notifications.
///
/// Every hook defaults to doing nothing. Errors returned from a hook are
/// logged and swallowed unless [`CallbackHandler::raise_error`] is set, in
/// which case the error aborts the notifying call.
pub trait CallbackHandler: Send + Sync + Debug {
    fn name(&self) -> &str {
        "CallbackHandler"
    }

    /// Whether hook errors propagate to the run.
    fn raise_error(&self) -> bool {
        false
    }

    fn ignore_chain(&self) -> bool {
        false
    }

    fn ignore_llm(&self) -> bool {
        false
    }

    fn ignore_tool(&self) -> bool {
        false
    }

    fn ignore_retriever(&self) -> bool {
        false
    }

    fn ignore_custom_event(&self) -> bool {
        false
    }

    fn ignores(&self, run_type: RunType) -> bool {
        match run_type {
            RunType::Chain => self.ignore_chain(),
            RunType::Llm => self.ignore_llm(),
            RunType::Tool => self.ignore_tool(),
            RunType::Retriever => self.ignore_retriever(),
        }
    }

    fn on_run_start(&self, _run: &RunStart) -> Result<()> {
        Ok(())
    }

    fn on_run_end(&self, _run: &RunEnd) -> Result<()> {
        Ok(())
    }

    fn on_run_error(&self, _run: &RunFailure) -> Result<()> {
        Ok(())
    }

    fn on_new_token(&self, _token: &NewToken) -> Result<()> {
        Ok(())
    }

    fn on_stream_chunk(&self, _chunk: &StreamChunk) -> Result<()> {
        Ok(())
    }

    fn on_custom_event(&self, _event: &CustomEvent) -> Result<()> {
        Ok(())
    }
}

pub type DynCallbackHandler = Arc<dyn CallbackHandler>;

/// Where a config's callbacks come from.
#[derive(Debug, Clone)]
pub enum Callbacks {
    Handlers(Vec<DynCallbackHandler>),
    Manager(CallbackManager),
}

impl Callbacks {
    pub fn is_empty(&self) -> bool {
        match self {
            Callbacks::Handlers(handlers) => handlers.is_empty(),
            Callbacks::Manager(manager) => manager.handlers.is_empty(),
        }
    }

    /// Combine two callback sources, `self` first.
    ///
    /// Lists concatenate; a list merged with a manager becomes inheritable
    /// handlers on a copy of that manager.
    pub fn merge(&self, other: &Callbacks) -> Callbacks {
        match (self, other) {
            (Callbacks::Handlers(left), Callbacks::Handlers(right)) => {
                let mut handlers = left.clone();
                handlers.extend(right.iter().cloned());
                Callbacks::Handlers(handlers)
            }
            (Callbacks::Handlers(handlers), Callbacks::Manager(manager)) => {
                Callbacks::Manager(CallbackManager::new(handlers.clone()).merge(manager))
            }
            (Callbacks::Manager(manager), Callbacks::Handlers(handlers)) => {
                let mut manager = manager.clone();
                for handler in handlers {
                    manager.add_handler(handler.clone(), true);
                }
                Callbacks::Manager(manager)
            }
            (Callbacks::Manager(left), Callbacks::Manager(right)) => {
                Callbacks::Manager(left.merge(right))
            }
        }
    }
}

impl From<Vec<DynCallbackHandler>> for Callbacks {
    fn from(handlers: Vec<DynCallbackHandler>) -> Self {
        Callbacks::Handlers(handlers)
    }
}

impl From<CallbackManager> for Callbacks {
    fn from(manager: CallbackManager) -> Self {
        Callbacks::Manager(manager)
    }
}
