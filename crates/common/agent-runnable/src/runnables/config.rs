//! Configuration threaded through every runnable call.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::callbacks::{CallbackManager, Callbacks, DynCallbackHandler};
use crate::error::{Error, Result};

use super::signal::AbortSignal;

pub const DEFAULT_RECURSION_LIMIT: usize = 25;

/// Configuration for a Runnable call.
#[derive(Debug, Clone)]
pub struct RunnableConfig {
    /// Tags for this call and any sub-calls. These can be used to filter
    /// runs in tracers and event streams.
    pub tags: Vec<String>,

    /// Metadata for this call and any sub-calls. Merged, never replaced.
    pub metadata: HashMap<String, Value>,

    /// Callbacks for this call and any sub-calls.
    pub callbacks: Option<Callbacks>,

    /// Maximum number of parallel calls in `batch` and map fan-out.
    pub max_concurrency: Option<usize>,

    /// Maximum nesting depth, defaults to 25.
    pub recursion_limit: usize,

    /// Cooperative cancellation.
    pub signal: Option<AbortSignal>,

    /// Converted into a deadline on `signal` by [`ensure_config`].
    pub timeout: Option<Duration>,

    /// Identifier for the run of this call; only applies to that run.
    pub run_id: Option<Uuid>,

    /// Name for the run of this call; only applies to that run.
    pub run_name: Option<String>,

    /// Runtime values for configurable behaviour. Primitive values are
    /// copied into `metadata` so that tracers see them.
    pub configurable: HashMap<String, Value>,
}

impl Default for RunnableConfig {
    fn default() -> Self {
        Self {
            tags: Vec::new(),
            metadata: HashMap::new(),
            callbacks: None,
            max_concurrency: None,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            signal: None,
            timeout: None,
            run_id: None,
            run_name: None,
            configurable: HashMap::new(),
        }
    }
}

impl RunnableConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_callbacks(mut self, callbacks: impl Into<Callbacks>) -> Self {
        self.callbacks = Some(callbacks.into());
        self
    }

    /// Add one handler to the callbacks, keeping any already set.
    pub fn with_handler(mut self, handler: DynCallbackHandler) -> Self {
        let added = Callbacks::Handlers(vec![handler]);
        self.callbacks = Some(match self.callbacks.take() {
            Some(existing) => existing.merge(&added),
            None => added,
        });
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_recursion_limit(mut self, recursion_limit: usize) -> Self {
        self.recursion_limit = recursion_limit;
        self
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    pub fn with_configurable(mut self, configurable: HashMap<String, Value>) -> Self {
        self.configurable = configurable;
        self
    }
}

/// Either a single RunnableConfig or one per batch input.
#[derive(Debug, Clone)]
pub enum ConfigOrList {
    Single(Box<RunnableConfig>),
    List(Vec<RunnableConfig>),
}

impl From<RunnableConfig> for ConfigOrList {
    fn from(config: RunnableConfig) -> Self {
        ConfigOrList::Single(Box::new(config))
    }
}

impl From<Vec<RunnableConfig>> for ConfigOrList {
    fn from(configs: Vec<RunnableConfig>) -> Self {
        ConfigOrList::List(configs)
    }
}

/// Resolve a config for one call.
///
/// Primitive `configurable` values are copied into `metadata` (keys
/// starting with `__` are private and skipped), and a positive `timeout`
/// becomes a deadline on the signal. The timeout is cleared afterwards so
/// nested calls keep the original deadline instead of extending it.
pub fn ensure_config(config: Option<RunnableConfig>) -> RunnableConfig {
    let mut config = config.unwrap_or_default();

    for (key, value) in &config.configurable {
        if key.starts_with("__") || config.metadata.contains_key(key) {
            continue;
        }
        if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            config.metadata.insert(key.clone(), value.clone());
        }
    }

    if let Some(timeout) = config.timeout.take()
        && !timeout.is_zero()
    {
        let deadline = AbortSignal::with_timeout(timeout);
        config.signal = Some(match &config.signal {
            Some(signal) => AbortSignal::any(signal, &deadline),
            None => deadline,
        });
    }

    config
}

/// Expand an optional config (or list) into one config per input.
///
/// An explicit `run_id` on a single config is kept only for the first
/// input.
pub fn get_config_list(config: Option<ConfigOrList>, length: usize) -> Result<Vec<RunnableConfig>> {
    match config {
        Some(ConfigOrList::Single(config)) => {
            let config = *config;
            if length > 1 && config.run_id.is_some() {
                tracing::warn!(
                    target: "agent_runnable::runnables",
                    "Provided run_id will be used only for the first element of the batch."
                );
                let mut rest = config.clone();
                rest.run_id = None;
                let mut configs = Vec::with_capacity(length);
                configs.push(config);
                configs.extend(std::iter::repeat_n(rest, length - 1));
                Ok(configs)
            } else {
                Ok(vec![config; length])
            }
        }
        Some(ConfigOrList::List(list)) => {
            if list.len() != length {
                return Err(Error::ConfigListLength {
                    configs: list.len(),
                    inputs: length,
                });
            }
            Ok(list)
        }
        None => Ok(vec![RunnableConfig::default(); length]),
    }
}

/// Patch a config for a nested call.
///
/// Replacing callbacks also clears `run_name` and `run_id`, which belong to
/// the run that owned the original callbacks.
#[bon::builder]
pub fn patch_config(
    config: Option<RunnableConfig>,
    callbacks: Option<CallbackManager>,
    recursion_limit: Option<usize>,
    max_concurrency: Option<usize>,
    #[builder(into)] run_name: Option<String>,
    configurable: Option<HashMap<String, Value>>,
) -> RunnableConfig {
    let mut config = config.unwrap_or_default();

    if let Some(callbacks) = callbacks {
        config.callbacks = Some(Callbacks::Manager(callbacks));
        config.run_name = None;
        config.run_id = None;
    }
    if let Some(limit) = recursion_limit {
        config.recursion_limit = limit;
    }
    if let Some(max) = max_concurrency {
        config.max_concurrency = Some(max);
    }
    if let Some(name) = run_name {
        config.run_name = Some(name);
    }
    if let Some(configurable) = configurable {
        config.configurable.extend(configurable);
    }

    config
}

/// Merge configs left to right.
///
/// Tags concatenate without duplicates, metadata and configurable keys
/// from later configs win, callbacks concatenate in order, the smaller
/// timeout wins and signals combine so that either one aborts.
pub fn merge_configs<'a, I>(configs: I) -> RunnableConfig
where
    I: IntoIterator<Item = Option<&'a RunnableConfig>>,
{
    let mut merged = RunnableConfig::default();

    for config in configs.into_iter().flatten() {
        for tag in &config.tags {
            if !merged.tags.contains(tag) {
                merged.tags.push(tag.clone());
            }
        }
        merged
            .metadata
            .extend(config.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.configurable.extend(
            config
                .configurable
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );

        merged.callbacks = match (merged.callbacks.take(), &config.callbacks) {
            (None, next) => next.clone(),
            (Some(base), None) => Some(base),
            (Some(base), Some(next)) => Some(base.merge(next)),
        };

        merged.signal = match (merged.signal.take(), &config.signal) {
            (None, next) => next.clone(),
            (Some(base), None) => Some(base),
            (Some(base), Some(next)) => Some(AbortSignal::any(&base, next)),
        };

        merged.timeout = match (merged.timeout, config.timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if config.recursion_limit != DEFAULT_RECURSION_LIMIT {
            merged.recursion_limit = config.recursion_limit;
        }
        if config.max_concurrency.is_some() {
            merged.max_concurrency = config.max_concurrency;
        }
        if config.run_name.is_some() {
            merged.run_name.clone_from(&config.run_name);
        }
        if config.run_id.is_some() {
            merged.run_id = config.run_id;
        }
    }

    merged
}

/// Get a callback manager configured from the given RunnableConfig.
pub fn get_callback_manager_for_config(config: &RunnableConfig) -> CallbackManager {
    CallbackManager::configure(
        config.callbacks.clone(),
        None,
        &config.tags,
        &[],
        &config.metadata,
        &HashMap::new(),
    )
}
