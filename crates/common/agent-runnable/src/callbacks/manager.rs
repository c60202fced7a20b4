//! Callback managers fan run lifecycle events out to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use bon::bon;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result, TracerError};
use crate::runnables::config::{RunnableConfig, get_callback_manager_for_config};
use crate::tracers::schemas::RunType;

use super::base::{
    CallbackHandler, Callbacks, CustomEvent, DynCallbackHandler, NewToken, RunEnd, RunFailure,
    RunStart, StreamChunk,
};

/// Call `event` on every handler not skipped by `ignore`.
///
/// Failures of ordinary handlers are logged and swallowed. A failure from a
/// handler with `raise_error` does not stop the remaining handlers; the
/// first such failure is returned once all handlers ran.
pub fn handle_event<F>(
    handlers: &[DynCallbackHandler],
    event_name: &str,
    ignore: impl Fn(&dyn CallbackHandler) -> bool,
    event: F,
) -> Result<()>
where
    F: Fn(&dyn CallbackHandler) -> Result<()>,
{
    let mut first_error: Option<Error> = None;
    for handler in handlers {
        if ignore(handler.as_ref()) {
            continue;
        }
        if let Err(error) = event(handler.as_ref()) {
            if handler.raise_error() {
                tracing::error!(
                    target: "agent_runnable::callbacks",
                    handler = handler.name(),
                    event = event_name,
                    %error,
                    "Error in callback handler"
                );
                if first_error.is_none() {
                    first_error = Some(Error::Callback {
                        handler: handler.name().to_string(),
                        message: error.to_string(),
                    });
                }
            } else {
                tracing::warn!(
                    target: "agent_runnable::callbacks",
                    handler = handler.name(),
                    event = event_name,
                    %error,
                    "Error in callback handler"
                );
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

fn push_handler(handlers: &mut Vec<DynCallbackHandler>, handler: DynCallbackHandler) {
    if !handlers.iter().any(|existing| Arc::ptr_eq(existing, &handler)) {
        handlers.push(handler);
    }
}

fn push_tags(target: &mut Vec<String>, tags: &[String]) {
    for tag in tags {
        if !target.contains(tag) {
            target.push(tag.clone());
        }
    }
}

/// Handlers, tags and metadata for one callback scope.
///
/// Entries marked inheritable are copied into child scopes created with
/// [`RunManager::get_child`]; the others apply to runs started directly
/// from this manager only.
#[derive(Debug, Clone, Default)]
pub struct CallbackManager {
    pub handlers: Vec<DynCallbackHandler>,
    pub inheritable_handlers: Vec<DynCallbackHandler>,
    pub parent_run_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub inheritable_tags: Vec<String>,
    pub metadata: HashMap<String, Value>,
    pub inheritable_metadata: HashMap<String, Value>,
}

#[bon]
impl CallbackManager {
    pub fn new(handlers: Vec<DynCallbackHandler>) -> Self {
        Self {
            inheritable_handlers: handlers.clone(),
            handlers,
            ..Default::default()
        }
    }

    pub fn add_handler(&mut self, handler: DynCallbackHandler, inherit: bool) {
        push_handler(&mut self.handlers, handler.clone());
        if inherit {
            push_handler(&mut self.inheritable_handlers, handler);
        }
    }

    pub fn remove_handler(&mut self, handler: &DynCallbackHandler) {
        self.handlers.retain(|h| !Arc::ptr_eq(h, handler));
        self.inheritable_handlers.retain(|h| !Arc::ptr_eq(h, handler));
    }

    pub fn add_tags(&mut self, tags: &[String], inherit: bool) {
        push_tags(&mut self.tags, tags);
        if inherit {
            push_tags(&mut self.inheritable_tags, tags);
        }
    }

    pub fn add_metadata(&mut self, metadata: &HashMap<String, Value>, inherit: bool) {
        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        if inherit {
            self.inheritable_metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }

    /// Union of two managers; `other` wins on metadata conflicts.
    pub fn merge(&self, other: &CallbackManager) -> CallbackManager {
        let mut merged = self.clone();
        for handler in &other.handlers {
            push_handler(&mut merged.handlers, handler.clone());
        }
        for handler in &other.inheritable_handlers {
            push_handler(&mut merged.inheritable_handlers, handler.clone());
        }
        push_tags(&mut merged.tags, &other.tags);
        push_tags(&mut merged.inheritable_tags, &other.inheritable_tags);
        merged
            .metadata
            .extend(other.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.inheritable_metadata.extend(
            other
                .inheritable_metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if merged.parent_run_id.is_none() {
            merged.parent_run_id = other.parent_run_id;
        }
        merged
    }

    /// Build a manager from inheritable and local sources.
    pub fn configure(
        inheritable_callbacks: Option<Callbacks>,
        local_callbacks: Option<Callbacks>,
        inheritable_tags: &[String],
        local_tags: &[String],
        inheritable_metadata: &HashMap<String, Value>,
        local_metadata: &HashMap<String, Value>,
    ) -> CallbackManager {
        let mut manager = match inheritable_callbacks {
            Some(Callbacks::Manager(manager)) => manager,
            Some(Callbacks::Handlers(handlers)) => CallbackManager::new(handlers),
            None => CallbackManager::default(),
        };
        match local_callbacks {
            Some(Callbacks::Handlers(handlers)) => {
                for handler in handlers {
                    manager.add_handler(handler, false);
                }
            }
            Some(Callbacks::Manager(local)) => {
                for handler in local.handlers {
                    manager.add_handler(handler, false);
                }
            }
            None => {}
        }
        manager.add_tags(inheritable_tags, true);
        manager.add_tags(local_tags, false);
        manager.add_metadata(inheritable_metadata, true);
        manager.add_metadata(local_metadata, false);
        manager
    }

    /// Notify handlers that a run started and return its manager.
    #[builder]
    pub fn on_run_start(
        &self,
        #[builder(default)] run_type: RunType,
        #[builder(into)] name: String,
        inputs: Value,
        run_id: Option<Uuid>,
    ) -> Result<RunManager> {
        let run_id = run_id.unwrap_or_else(Uuid::new_v4);
        let start = RunStart {
            run_id,
            parent_run_id: self.parent_run_id,
            run_type,
            name: name.clone(),
            inputs,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
        };
        handle_event(
            &self.handlers,
            "on_run_start",
            |handler| handler.ignores(run_type),
            |handler| handler.on_run_start(&start),
        )?;
        Ok(RunManager {
            run_id,
            run_type,
            name,
            parent_run_id: self.parent_run_id,
            handlers: self.handlers.clone(),
            inheritable_handlers: self.inheritable_handlers.clone(),
            tags: self.tags.clone(),
            inheritable_tags: self.inheritable_tags.clone(),
            metadata: self.metadata.clone(),
            inheritable_metadata: self.inheritable_metadata.clone(),
        })
    }

    /// Dispatch a custom event on behalf of the scope's parent run.
    pub fn on_custom_event(&self, name: &str, data: Value) -> Result<()> {
        let run_id = self
            .parent_run_id
            .ok_or_else(|| TracerError::NoParentRun(name.to_string()))?;
        let event = CustomEvent {
            run_id,
            name: name.to_string(),
            data,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
        };
        handle_event(
            &self.handlers,
            "on_custom_event",
            |handler| handler.ignore_custom_event(),
            |handler| handler.on_custom_event(&event),
        )
    }
}

/// Handle on one started run.
#[derive(Debug, Clone)]
pub struct RunManager {
    pub run_id: Uuid,
    pub run_type: RunType,
    pub name: String,
    pub parent_run_id: Option<Uuid>,
    handlers: Vec<DynCallbackHandler>,
    inheritable_handlers: Vec<DynCallbackHandler>,
    tags: Vec<String>,
    inheritable_tags: Vec<String>,
    metadata: HashMap<String, Value>,
    inheritable_metadata: HashMap<String, Value>,
}

impl RunManager {
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    fn ignores(&self, handler: &dyn CallbackHandler) -> bool {
        handler.ignores(self.run_type)
    }

    /// A manager for runs nested under this one.
    ///
    /// The child sees only the inheritable handlers, tags and metadata,
    /// plus `tag` as a tag of its own that its children will not inherit.
    pub fn get_child(&self, tag: Option<&str>) -> CallbackManager {
        let mut manager = CallbackManager {
            handlers: self.inheritable_handlers.clone(),
            inheritable_handlers: self.inheritable_handlers.clone(),
            parent_run_id: Some(self.run_id),
            tags: self.inheritable_tags.clone(),
            inheritable_tags: self.inheritable_tags.clone(),
            metadata: self.inheritable_metadata.clone(),
            inheritable_metadata: self.inheritable_metadata.clone(),
        };
        if let Some(tag) = tag {
            manager.add_tags(&[tag.to_string()], false);
        }
        manager
    }

    pub fn on_end(&self, outputs: Value) -> Result<()> {
        self.finish(outputs, None)
    }

    /// End the run, also reporting the input accumulated while streaming.
    pub fn on_end_with_inputs(&self, outputs: Value, inputs: Value) -> Result<()> {
        self.finish(outputs, Some(inputs))
    }

    fn finish(&self, outputs: Value, inputs: Option<Value>) -> Result<()> {
        let end = RunEnd {
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            run_type: self.run_type,
            outputs,
            inputs,
        };
        handle_event(
            &self.handlers,
            "on_run_end",
            |handler| self.ignores(handler),
            |handler| handler.on_run_end(&end),
        )
    }

    pub fn on_error(&self, error: &Error) -> Result<()> {
        let failure = RunFailure {
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            run_type: self.run_type,
            error: error.clone(),
        };
        handle_event(
            &self.handlers,
            "on_run_error",
            |handler| self.ignores(handler),
            |handler| handler.on_run_error(&failure),
        )
    }

    pub fn on_new_token(&self, token: &str, chunk: Option<Value>) -> Result<()> {
        let token = NewToken {
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            token: token.to_string(),
            chunk,
        };
        handle_event(
            &self.handlers,
            "on_new_token",
            |handler| self.ignores(handler),
            |handler| handler.on_new_token(&token),
        )
    }

    pub fn on_stream_chunk(&self, chunk: Value) -> Result<()> {
        let chunk = StreamChunk {
            run_id: self.run_id,
            parent_run_id: self.parent_run_id,
            run_type: self.run_type,
            chunk,
        };
        handle_event(
            &self.handlers,
            "on_stream_chunk",
            |handler| self.ignores(handler),
            |handler| handler.on_stream_chunk(&chunk),
        )
    }

    /// Dispatch a custom event reported by this run.
    pub fn on_custom_event(&self, name: &str, data: Value) -> Result<()> {
        let event = CustomEvent {
            run_id: self.run_id,
            name: name.to_string(),
            data,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
        };
        handle_event(
            &self.handlers,
            "on_custom_event",
            |handler| handler.ignore_custom_event(),
            |handler| handler.on_custom_event(&event),
        )
    }
}

/// Dispatch a custom event from inside a running runnable.
///
/// `config` must be the config the runnable received, so that its
/// callbacks point at the current run.
pub fn dispatch_custom_event(name: &str, data: Value, config: &RunnableConfig) -> Result<()> {
    get_callback_manager_for_config(config).on_custom_event(name, data)
}
