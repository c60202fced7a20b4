use std::fmt::{self, Debug};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::tracers::schemas::RunType;

use super::base::{
    ChunkStream, DynRunnable, Runnable, call_with_config, single_chunk, transform_stream_with_config,
};
use super::config::{RunnableConfig, patch_config};

pub type FallbackErrorPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Tries a primary runnable, then each fallback in order.
///
/// Errors the predicate rejects, and cancellations, are returned at once.
/// When every candidate fails the first error is the one surfaced. With
/// an `exception_key`, each fallback receives the previous error's message
/// under that key of its (dict) input.
#[derive(Clone)]
pub struct RunnableWithFallbacks {
    runnable: DynRunnable,
    fallbacks: Vec<DynRunnable>,
    error_predicate: Option<FallbackErrorPredicate>,
    exception_key: Option<String>,
}

impl Debug for RunnableWithFallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableWithFallbacks")
            .field("runnable", &self.runnable)
            .field("fallbacks", &self.fallbacks)
            .field("error_predicate", &self.error_predicate.is_some())
            .field("exception_key", &self.exception_key)
            .finish()
    }
}

impl RunnableWithFallbacks {
    pub fn new(runnable: DynRunnable, fallbacks: Vec<DynRunnable>) -> Self {
        Self {
            runnable,
            fallbacks,
            error_predicate: None,
            exception_key: None,
        }
    }

    pub fn with_error_predicate(
        mut self,
        predicate: impl Fn(&Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.error_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn with_exception_key(mut self, key: impl Into<String>) -> Self {
        self.exception_key = Some(key.into());
        self
    }

    /// The primary runnable followed by the fallbacks.
    pub fn runnables(&self) -> impl Iterator<Item = &DynRunnable> {
        std::iter::once(&self.runnable).chain(self.fallbacks.iter())
    }

    fn should_fallback(&self, error: &Error) -> bool {
        if error.is_cancellation() {
            return false;
        }
        self.error_predicate
            .as_ref()
            .is_none_or(|predicate| predicate(error))
    }

    fn check_input(&self, input: &Chunk) -> Result<()> {
        if self.exception_key.is_some() && input.as_dict().is_none() {
            return Err(Error::other(format!(
                "If 'exception_key' is specified then input must be a dictionary, got {}",
                input.kind()
            )));
        }
        Ok(())
    }

    fn attempt_input(&self, input: &Chunk, last_error: Option<&Error>) -> Chunk {
        match (&self.exception_key, last_error, input) {
            (Some(key), Some(error), Chunk::Dict(map)) => {
                let mut map = map.clone();
                map.insert(key.clone(), Chunk::Str(error.to_string()));
                Chunk::Dict(map)
            }
            _ => input.clone(),
        }
    }
}

#[async_trait]
impl Runnable for RunnableWithFallbacks {
    fn name(&self) -> String {
        self.runnable.name()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        self.check_input(&input)?;
        call_with_config(self, input, config, RunType::Chain, |input, config, run_manager| async move {
            let mut first_error: Option<Error> = None;
            let mut last_error: Option<Error> = None;
            for runnable in self.runnables() {
                let attempt_config = patch_config()
                    .config(config.clone())
                    .callbacks(run_manager.get_child(None))
                    .call();
                let attempt_input = self.attempt_input(&input, last_error.as_ref());
                match runnable.invoke(attempt_input, Some(attempt_config)).await {
                    Ok(output) => return Ok(output),
                    Err(error) if self.should_fallback(&error) => {
                        tracing::debug!(
                            target: "agent_runnable::runnables",
                            "{} failed, trying next fallback: {}",
                            runnable.name(),
                            error
                        );
                        first_error.get_or_insert_with(|| error.clone());
                        last_error = Some(error);
                    }
                    Err(error) => return Err(error),
                }
            }
            Err(first_error.unwrap_or_else(|| Error::other("No error stored at end of fallbacks.")))
        })
        .await
    }

    /// Falls back only while no chunk has been yielded; once output has
    /// started, later errors end the stream.
    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        transform_stream_with_config(self, single_chunk(input), config, RunType::Chain, move |input, config, run_manager| {
            Box::pin(async_stream::stream! {
                let mut input = input;
                let mut collected: Option<Chunk> = None;
                while let Some(chunk) = input.next().await {
                    let joined = match chunk {
                        Ok(chunk) => match collected.take() {
                            None => Ok(chunk),
                            Some(previous) => previous.concat(&chunk),
                        },
                        Err(error) => Err(error),
                    };
                    match joined {
                        Ok(joined) => collected = Some(joined),
                        Err(error) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                let input = collected.unwrap_or_default();
                if let Err(error) = self.check_input(&input) {
                    yield Err(error);
                    return;
                }

                let mut first_error: Option<Error> = None;
                let mut last_error: Option<Error> = None;
                for runnable in self.runnables() {
                    let attempt_config = patch_config()
                        .config(config.clone())
                        .callbacks(run_manager.get_child(None))
                        .call();
                    let attempt_input = self.attempt_input(&input, last_error.as_ref());
                    let mut output = runnable.stream(attempt_input, Some(attempt_config));
                    match output.next().await {
                        Some(Ok(first)) => {
                            yield Ok(first);
                            while let Some(item) = output.next().await {
                                yield item;
                            }
                            return;
                        }
                        None => return,
                        Some(Err(error)) if self.should_fallback(&error) => {
                            first_error.get_or_insert_with(|| error.clone());
                            last_error = Some(error);
                        }
                        Some(Err(error)) => {
                            yield Err(error);
                            return;
                        }
                    }
                }
                yield Err(first_error.unwrap_or_else(|| Error::other("No error stored at end of fallbacks.")));
            })
        })
    }
}
