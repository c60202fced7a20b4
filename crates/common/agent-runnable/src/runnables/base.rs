//! The Runnable protocol and its core compositions.
//!
//! Every runnable works on [`Chunk`]s, so any two can be piped together and
//! streamed output can always be concatenated back into a single value.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::callbacks::RunManager;
use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::tracers::event_stream::{
    EventsVersion, StreamEventsOptions, encode_event_stream, stream_events_v1, stream_events_v2,
};
use crate::tracers::log_stream::{LogStreamOptions, RunLogPatch};
use crate::tracers::schemas::RunType;

use super::config::{
    ConfigOrList, RunnableConfig, ensure_config, get_callback_manager_for_config,
    get_config_list, merge_configs, patch_config,
};
use super::fallbacks::RunnableWithFallbacks;
use super::retry::{RunnableRetry, RunnableRetryConfig};
use super::schema::StreamEvent;
use super::signal::check_signal;
use super::utils::{ChunkAccumulator, gather_with_concurrency, tee, try_gather_with_concurrency};

/// A shared, type-erased runnable.
pub type DynRunnable = Arc<dyn Runnable>;

/// A stream of chunks, or the error that ended it.
pub type ChunkStream<'a> = BoxStream<'a, Result<Chunk>>;

/// Options for [`Runnable::batch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
    /// Upper bound on calls in flight; falls back to the config's.
    pub max_concurrency: Option<usize>,
    /// Collect every per-input error instead of failing on the first.
    pub return_exceptions: bool,
}

#[bon::bon]
impl BatchOptions {
    #[builder]
    pub fn new(max_concurrency: Option<usize>, #[builder(default)] return_exceptions: bool) -> Self {
        Self {
            max_concurrency,
            return_exceptions,
        }
    }
}

/// A unit of work that can be invoked, batched, streamed and composed.
///
/// Only [`Runnable::name`] and [`Runnable::invoke`] are required. The
/// default `stream` yields the invoke result as one chunk and the default
/// `transform` buffers its whole input before streaming, so components that
/// can do better override those two.
#[async_trait]
pub trait Runnable: Send + Sync + Debug {
    fn name(&self) -> String;

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk>;

    /// Invoke on each input concurrently, results in input order.
    ///
    /// Without `return_exceptions` the first failure is returned as the
    /// outer error and the calls still in flight are dropped.
    async fn batch(
        &self,
        inputs: Vec<Chunk>,
        config: Option<ConfigOrList>,
        options: BatchOptions,
    ) -> Result<Vec<Result<Chunk>>> {
        batch_invoke(self, inputs, config, options).await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        Box::pin(stream::once(self.invoke(input, config)))
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        Box::pin(async_stream::try_stream! {
            let mut input = input;
            let mut final_input: Option<Chunk> = None;
            while let Some(chunk) = input.next().await {
                let chunk = chunk?;
                final_input = Some(match final_input.take() {
                    None => chunk,
                    Some(previous) => previous.concat(&chunk)?,
                });
            }
            if let Some(final_input) = final_input {
                let mut output = self.stream(final_input, config);
                while let Some(chunk) = output.next().await {
                    let chunk = chunk?;
                    yield chunk;
                }
            }
        })
    }

    /// Stream the run log of this call as JSON Patch batches.
    fn stream_log<'a>(
        &'a self,
        input: Chunk,
        config: Option<RunnableConfig>,
        options: LogStreamOptions,
    ) -> BoxStream<'a, Result<RunLogPatch>> {
        crate::tracers::log_stream::stream_log(self, input, config, options)
    }

    fn stream_events<'a>(
        &'a self,
        input: Chunk,
        config: Option<RunnableConfig>,
        options: StreamEventsOptions,
    ) -> BoxStream<'a, Result<StreamEvent>> {
        match options.version {
            EventsVersion::V1 => stream_events_v1(self, input, config, options.filter),
            EventsVersion::V2 => stream_events_v2(self, input, config, options.filter),
        }
    }

    /// [`Runnable::stream_events`] encoded as `text/event-stream` frames.
    fn stream_events_encoded<'a>(
        &'a self,
        input: Chunk,
        config: Option<RunnableConfig>,
        options: StreamEventsOptions,
    ) -> BoxStream<'a, Result<String>> {
        encode_event_stream(self.stream_events(input, config, options))
    }

    /// The steps of a sequence, so that piping flattens nested sequences.
    fn sequence_steps(&self) -> Option<&[DynRunnable]> {
        None
    }

    /// The binding itself, so that re-binding collapses onto one layer.
    fn as_binding(&self) -> Option<&RunnableBinding> {
        None
    }
}

/// Composition methods for every runnable.
pub trait RunnableExt: Sized {
    fn boxed(self) -> DynRunnable;

    /// Run `self`, then feed its output to `next`.
    fn pipe(self, next: impl RunnableExt) -> RunnableSequence {
        let mut steps = Vec::new();
        for runnable in [self.boxed(), next.boxed()] {
            let inner = runnable.sequence_steps().map(<[DynRunnable]>::to_vec);
            match inner {
                Some(inner) => steps.extend(inner),
                None => steps.push(runnable),
            }
        }
        RunnableSequence { steps, name: None }
    }

    fn with_config(self, config: RunnableConfig) -> RunnableBinding {
        let bound = self.boxed();
        match bound.as_binding() {
            Some(binding) => binding.merged_with(config, HashMap::new()),
            None => RunnableBinding::new(bound, config, HashMap::new()),
        }
    }

    /// Bind values that reach the runnable through `configurable`.
    fn bind(self, kwargs: HashMap<String, Value>) -> RunnableBinding {
        let bound = self.boxed();
        match bound.as_binding() {
            Some(binding) => binding.merged_with(RunnableConfig::default(), kwargs),
            None => RunnableBinding::new(bound, RunnableConfig::default(), kwargs),
        }
    }

    fn with_retry(self, config: RunnableRetryConfig) -> RunnableRetry {
        RunnableRetry::new(self.boxed(), config)
    }

    fn with_fallbacks(self, fallbacks: Vec<DynRunnable>) -> RunnableWithFallbacks {
        RunnableWithFallbacks::new(self.boxed(), fallbacks)
    }
}

impl<R: Runnable + 'static> RunnableExt for R {
    fn boxed(self) -> DynRunnable {
        Arc::new(self)
    }
}

impl RunnableExt for DynRunnable {
    fn boxed(self) -> DynRunnable {
        self
    }
}

fn report_error(run_manager: &RunManager, error: Error) -> Error {
    match run_manager.on_error(&error) {
        Ok(()) => error,
        Err(callback_error) => callback_error,
    }
}

fn check_recursion_limit(config: &RunnableConfig, name: &str) -> Result<()> {
    if config.recursion_limit == 0 {
        tracing::warn!(
            target: "agent_runnable::runnables",
            run = name,
            "Recursion limit reached"
        );
        return Err(Error::RecursionLimit(name.to_string()));
    }
    Ok(())
}

/// A stream holding just `input`.
pub fn single_chunk<'a>(input: Chunk) -> ChunkStream<'a> {
    Box::pin(stream::iter([Ok::<_, Error>(input)]))
}

/// Run `func` as one traced run of `runnable`.
///
/// The run starts with the input as given, `func` gets a config whose
/// callbacks make nested calls children of the run, and the run ends with
/// the output or the error. The abort signal is checked before `func`
/// starts and raced against it.
///
/// Every traced run spends one level of `recursion_limit`; a run whose
/// config has none left fails without starting.
pub async fn call_with_config<R, F, Fut>(
    runnable: &R,
    input: Chunk,
    config: Option<RunnableConfig>,
    run_type: RunType,
    func: F,
) -> Result<Chunk>
where
    R: Runnable + ?Sized,
    F: FnOnce(Chunk, RunnableConfig, RunManager) -> Fut,
    Fut: Future<Output = Result<Chunk>>,
{
    let config = ensure_config(config);
    let name = config.run_name.clone().unwrap_or_else(|| runnable.name());
    check_recursion_limit(&config, &name)?;
    let run_manager = get_callback_manager_for_config(&config)
        .on_run_start()
        .run_type(run_type)
        .name(name)
        .inputs(input.to_json())
        .maybe_run_id(config.run_id)
        .call()?;
    let child_config = patch_config()
        .config(config.clone())
        .callbacks(run_manager.get_child(None))
        .recursion_limit(config.recursion_limit - 1)
        .call();

    let work = func(input, child_config, run_manager.clone());
    let result = match &config.signal {
        Some(signal) => signal.guard(work).await,
        None => work.await,
    };

    match result {
        Ok(output) => {
            run_manager.on_end(output.to_json())?;
            Ok(output)
        }
        Err(error) => Err(report_error(&run_manager, error)),
    }
}

/// Run `transformer` over a chunk stream as one traced run of `runnable`.
///
/// The input is not known when the run starts, so it is recorded as it
/// streams through and reported on end together with the concatenated
/// output. Each output chunk is reported to the run before it is yielded,
/// and the abort signal is checked between chunks.
pub fn transform_stream_with_config<'a, R, F>(
    runnable: &'a R,
    input: ChunkStream<'a>,
    config: Option<RunnableConfig>,
    run_type: RunType,
    transformer: F,
) -> ChunkStream<'a>
where
    R: Runnable + ?Sized,
    F: FnOnce(ChunkStream<'a>, RunnableConfig, RunManager) -> ChunkStream<'a> + Send + 'a,
{
    Box::pin(async_stream::stream! {
        let config = ensure_config(config);
        let name = config.run_name.clone().unwrap_or_else(|| runnable.name());
        if let Err(error) = check_recursion_limit(&config, &name) {
            yield Err(error);
            return;
        }
        let started = get_callback_manager_for_config(&config)
            .on_run_start()
            .run_type(run_type)
            .name(name)
            .inputs(json!({ "input": "" }))
            .maybe_run_id(config.run_id)
            .call();
        let run_manager = match started {
            Ok(run_manager) => run_manager,
            Err(error) => {
                yield Err(error);
                return;
            }
        };
        let child_config = patch_config()
            .config(config.clone())
            .callbacks(run_manager.get_child(None))
            .recursion_limit(config.recursion_limit - 1)
            .call();
        let signal = config.signal.clone();

        let recorded_input = Arc::new(Mutex::new(ChunkAccumulator::default()));
        let recorder = Arc::clone(&recorded_input);
        let input = input
            .inspect(move |item| {
                if let Ok(chunk) = item {
                    recorder.lock().push(chunk);
                }
            })
            .boxed();

        let mut output = transformer(input, child_config, run_manager.clone());
        let mut final_output = ChunkAccumulator::default();
        loop {
            let next = match &signal {
                Some(signal) => signal.guard(async { Ok(output.next().await) }).await,
                None => Ok(output.next().await),
            };
            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(error) => Err(error),
            };
            let checked = item.and_then(|chunk| {
                check_signal(signal.as_ref())?;
                run_manager.on_stream_chunk(chunk.to_json())?;
                Ok(chunk)
            });
            match checked {
                Ok(chunk) => {
                    final_output.push(&chunk);
                    yield Ok(chunk);
                }
                Err(error) => {
                    yield Err(report_error(&run_manager, error));
                    return;
                }
            }
        }

        let inputs = recorded_input.lock().to_json();
        if let Err(error) = run_manager.on_end_with_inputs(final_output.to_json(), inputs) {
            yield Err(error);
        }
    })
}

/// The default batch: one invoke per input, gated by the concurrency limit.
pub async fn batch_invoke<R>(
    runnable: &R,
    inputs: Vec<Chunk>,
    config: Option<ConfigOrList>,
    options: BatchOptions,
) -> Result<Vec<Result<Chunk>>>
where
    R: Runnable + ?Sized,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let configs = get_config_list(config, inputs.len())?;
    let limit = options
        .max_concurrency
        .or_else(|| configs.first().and_then(|config| config.max_concurrency));
    let calls = inputs
        .into_iter()
        .zip(configs)
        .map(|(input, config)| runnable.invoke(input, Some(config)));

    if options.return_exceptions {
        Ok(gather_with_concurrency(limit, calls).await)
    } else {
        let outputs = try_gather_with_concurrency(limit, calls).await?;
        Ok(outputs.into_iter().map(Ok).collect())
    }
}

type LambdaFn = Arc<dyn Fn(Chunk, RunnableConfig) -> BoxFuture<'static, Result<Chunk>> + Send + Sync>;

/// A runnable made from a function.
///
/// The function sees the whole input at once: when streamed, the input is
/// buffered first and the single output is emitted as one chunk.
#[derive(Clone)]
pub struct RunnableLambda {
    func: LambdaFn,
    name: Option<String>,
}

impl Debug for RunnableLambda {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableLambda")
            .field("name", &self.name)
            .finish()
    }
}

impl RunnableLambda {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Chunk>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, _config| -> BoxFuture<'static, Result<Chunk>> {
                Box::pin(func(input))
            }),
            name: None,
        }
    }

    /// A function that also receives the config, for nested calls that
    /// should be traced as children of the lambda's run.
    pub fn with_config_fn<F, Fut>(func: F) -> Self
    where
        F: Fn(Chunk, RunnableConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Chunk>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |input, config| -> BoxFuture<'static, Result<Chunk>> {
                Box::pin(func(input, config))
            }),
            name: None,
        }
    }

    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(Chunk) -> Result<Chunk> + Send + Sync + 'static,
    {
        Self {
            func: Arc::new(move |input, _config| -> BoxFuture<'static, Result<Chunk>> {
                let result = func(input);
                Box::pin(async move { result })
            }),
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

#[async_trait]
impl Runnable for RunnableLambda {
    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "RunnableLambda".to_string())
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        let func = Arc::clone(&self.func);
        call_with_config(self, input, config, RunType::Chain, move |input, config, _| {
            func(input, config)
        })
        .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.transform(single_chunk(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        let func = Arc::clone(&self.func);
        transform_stream_with_config(self, input, config, RunType::Chain, move |input, config, _| {
            Box::pin(async_stream::try_stream! {
                let mut input = input;
                let mut final_input: Option<Chunk> = None;
                while let Some(chunk) = input.next().await {
                    let chunk = chunk?;
                    final_input = Some(match final_input.take() {
                        None => chunk,
                        Some(previous) => previous.concat(&chunk)?,
                    });
                }
                let output = func(final_input.unwrap_or_default(), config).await?;
                yield output;
            })
        })
    }
}

/// Steps run one after another, each fed the previous step's output.
///
/// Streaming pipes each step's `transform` into the next, so output flows
/// as soon as every step can pass chunks on.
#[derive(Debug, Clone)]
pub struct RunnableSequence {
    steps: Vec<DynRunnable>,
    name: Option<String>,
}

impl RunnableSequence {
    pub fn new(steps: Vec<DynRunnable>) -> Result<Self> {
        if steps.len() < 2 {
            return Err(Error::other(format!(
                "RunnableSequence must have at least 2 steps, got {}",
                steps.len()
            )));
        }
        Ok(Self { steps, name: None })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn steps(&self) -> &[DynRunnable] {
        &self.steps
    }
}

fn step_config(config: &RunnableConfig, run_manager: &RunManager, tag: String) -> RunnableConfig {
    patch_config()
        .config(config.clone())
        .callbacks(run_manager.get_child(Some(&tag)))
        .call()
}

#[async_trait]
impl Runnable for RunnableSequence {
    fn name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| "RunnableSequence".to_string())
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        let steps = &self.steps;
        call_with_config(self, input, config, RunType::Chain, move |input, config, run_manager| async move {
            let mut value = input;
            for (index, step) in steps.iter().enumerate() {
                check_signal(config.signal.as_ref())?;
                let config = step_config(&config, &run_manager, format!("seq:step:{}", index + 1));
                value = step.invoke(value, Some(config)).await?;
            }
            Ok::<_, Error>(value)
        })
        .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.transform(single_chunk(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        let steps = &self.steps;
        transform_stream_with_config(self, input, config, RunType::Chain, move |input, config, run_manager| {
            let mut piped = input;
            for (index, step) in steps.iter().enumerate() {
                let config = step_config(&config, &run_manager, format!("seq:step:{}", index + 1));
                piped = step.transform(piped, Some(config));
            }
            piped
        })
    }

    fn sequence_steps(&self) -> Option<&[DynRunnable]> {
        Some(&self.steps)
    }
}

/// Branches run concurrently on the same input, output keyed by branch.
///
/// When streamed, every branch reads its own copy of the input and each
/// branch chunk is yielded as a single-key dict as soon as it arrives;
/// concatenating them rebuilds the invoke output.
#[derive(Debug, Clone, Default)]
pub struct RunnableMap {
    steps: IndexMap<String, DynRunnable>,
    name: Option<String>,
}

impl RunnableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, key: impl Into<String>, step: impl RunnableExt) -> Self {
        self.steps.insert(key.into(), step.boxed());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

impl FromIterator<(String, DynRunnable)> for RunnableMap {
    fn from_iter<I: IntoIterator<Item = (String, DynRunnable)>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
            name: None,
        }
    }
}

#[async_trait]
impl Runnable for RunnableMap {
    fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            let keys: Vec<&str> = self.keys().collect();
            format!("RunnableMap<{}>", keys.join(","))
        })
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        let steps = &self.steps;
        call_with_config(self, input, config, RunType::Chain, move |input, config, run_manager| async move {
            let branches = steps.iter().map(|(key, step)| {
                let branch_config = step_config(&config, &run_manager, format!("map:key:{key}"));
                let input = input.clone();
                async move {
                    let output = step.invoke(input, Some(branch_config)).await?;
                    Ok::<_, Error>((key.clone(), output))
                }
            });
            let outputs = try_gather_with_concurrency(config.max_concurrency, branches).await?;
            Ok::<_, Error>(Chunk::Dict(outputs.into_iter().collect()))
        })
        .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.transform(single_chunk(input), config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        let steps = &self.steps;
        transform_stream_with_config(self, input, config, RunType::Chain, move |input, config, run_manager| {
            if steps.is_empty() {
                return Box::pin(async_stream::try_stream! {
                    let mut input = input;
                    while let Some(chunk) = input.next().await {
                        chunk?;
                    }
                    yield Chunk::Dict(Default::default());
                }) as ChunkStream<'a>;
            }
            let peers = tee(input, steps.len());
            let branches: Vec<ChunkStream<'a>> = steps
                .iter()
                .zip(peers)
                .map(|((key, step), peer)| {
                    let branch_config = step_config(&config, &run_manager, format!("map:key:{key}"));
                    let key = key.clone();
                    step.transform(Box::pin(peer), Some(branch_config))
                        .map(move |item| item.map(|chunk| Chunk::dict([(key.clone(), chunk)])))
                        .boxed()
                })
                .collect();
            Box::pin(stream::select_all(branches))
        })
    }
}

/// A runnable with config and values attached.
///
/// Binding does not start a run of its own: calls go straight to the bound
/// runnable with the bound config merged under the call config, so values
/// given at call time win.
#[derive(Debug, Clone)]
pub struct RunnableBinding {
    bound: DynRunnable,
    config: RunnableConfig,
    kwargs: HashMap<String, Value>,
}

impl RunnableBinding {
    pub fn new(bound: DynRunnable, config: RunnableConfig, kwargs: HashMap<String, Value>) -> Self {
        Self {
            bound,
            config,
            kwargs,
        }
    }

    pub fn bound(&self) -> &DynRunnable {
        &self.bound
    }

    pub fn config(&self) -> &RunnableConfig {
        &self.config
    }

    pub fn kwargs(&self) -> &HashMap<String, Value> {
        &self.kwargs
    }

    fn merged_with(&self, config: RunnableConfig, kwargs: HashMap<String, Value>) -> Self {
        let mut merged_kwargs = self.kwargs.clone();
        merged_kwargs.extend(kwargs);
        Self {
            bound: Arc::clone(&self.bound),
            config: merge_configs([Some(&self.config), Some(&config)]),
            kwargs: merged_kwargs,
        }
    }

    fn call_config(&self, config: Option<RunnableConfig>) -> RunnableConfig {
        let mut own = self.config.clone();
        own.configurable
            .extend(self.kwargs.iter().map(|(k, v)| (k.clone(), v.clone())));
        merge_configs([Some(&own), config.as_ref()])
    }
}

#[async_trait]
impl Runnable for RunnableBinding {
    fn name(&self) -> String {
        self.bound.name()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        self.bound.invoke(input, Some(self.call_config(config))).await
    }

    async fn batch(
        &self,
        inputs: Vec<Chunk>,
        config: Option<ConfigOrList>,
        options: BatchOptions,
    ) -> Result<Vec<Result<Chunk>>> {
        let configs = get_config_list(config, inputs.len())?
            .into_iter()
            .map(|config| self.call_config(Some(config)))
            .collect();
        self.bound
            .batch(inputs, Some(ConfigOrList::List(configs)), options)
            .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.bound.stream(input, Some(self.call_config(config)))
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        self.bound.transform(input, Some(self.call_config(config)))
    }

    fn as_binding(&self) -> Option<&RunnableBinding> {
        Some(self)
    }
}
