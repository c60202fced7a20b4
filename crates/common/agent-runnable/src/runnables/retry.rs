use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use bon::bon;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::tracers::schemas::RunType;

use super::base::{ChunkStream, DynRunnable, Runnable, call_with_config};
use super::config::{RunnableConfig, patch_config};

/// Delays between attempts: `initial * exp_base^(n-1)`, capped at `max`,
/// with random jitter added.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialJitterParams {
    pub initial: Duration,
    pub max: Duration,
    pub exp_base: f32,
}

impl Default for ExponentialJitterParams {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            exp_base: 2.0,
        }
    }
}

#[bon]
impl ExponentialJitterParams {
    #[builder]
    pub fn new(
        #[builder(default = Duration::from_secs(1))] initial: Duration,
        #[builder(default = Duration::from_secs(60))] max: Duration,
        #[builder(default = 2.0)] exp_base: f32,
    ) -> Self {
        Self {
            initial,
            max,
            exp_base,
        }
    }

    fn backoff(&self, retries: usize) -> ExponentialBackoff {
        ExponentialBuilder::default()
            .with_min_delay(self.initial)
            .with_max_delay(self.max)
            .with_factor(self.exp_base)
            .with_jitter()
            .with_max_times(retries)
            .build()
    }
}

/// Which errors are worth another attempt.
///
/// Cancellation and timeouts are never retried, whatever the predicate.
#[derive(Clone, Default)]
pub enum RetryErrorPredicate {
    #[default]
    All,
    Custom(Arc<dyn Fn(&Error) -> bool + Send + Sync>),
}

impl Debug for RetryErrorPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryErrorPredicate::All => f.write_str("All"),
            RetryErrorPredicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl RetryErrorPredicate {
    pub fn custom(predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        RetryErrorPredicate::Custom(Arc::new(predicate))
    }

    pub fn should_retry(&self, error: &Error) -> bool {
        if error.is_cancellation() {
            return false;
        }
        match self {
            RetryErrorPredicate::All => true,
            RetryErrorPredicate::Custom(predicate) => predicate(error),
        }
    }
}

/// Called after every failed attempt with the error and the attempt number.
pub type OnFailedAttempt = Arc<dyn Fn(&Error, usize) + Send + Sync>;

#[derive(Clone)]
pub struct RunnableRetryConfig {
    pub retry_predicate: RetryErrorPredicate,

    /// Wait between attempts; without it attempts follow immediately.
    pub wait_exponential_jitter: bool,

    pub exponential_jitter_params: ExponentialJitterParams,

    /// Total attempts, the first one included.
    pub max_attempt_number: usize,

    pub on_failed_attempt: Option<OnFailedAttempt>,
}

impl Debug for RunnableRetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnableRetryConfig")
            .field("retry_predicate", &self.retry_predicate)
            .field("wait_exponential_jitter", &self.wait_exponential_jitter)
            .field("exponential_jitter_params", &self.exponential_jitter_params)
            .field("max_attempt_number", &self.max_attempt_number)
            .field("on_failed_attempt", &self.on_failed_attempt.is_some())
            .finish()
    }
}

impl Default for RunnableRetryConfig {
    fn default() -> Self {
        Self {
            retry_predicate: RetryErrorPredicate::All,
            wait_exponential_jitter: true,
            exponential_jitter_params: ExponentialJitterParams::default(),
            max_attempt_number: 3,
            on_failed_attempt: None,
        }
    }
}

#[bon]
impl RunnableRetryConfig {
    #[builder]
    pub fn new(
        #[builder(default)] retry_predicate: RetryErrorPredicate,
        #[builder(default = true)] wait_exponential_jitter: bool,
        #[builder(default)] exponential_jitter_params: ExponentialJitterParams,
        #[builder(default = 3)] max_attempt_number: usize,
        on_failed_attempt: Option<OnFailedAttempt>,
    ) -> Self {
        Self {
            retry_predicate,
            wait_exponential_jitter,
            exponential_jitter_params,
            max_attempt_number,
            on_failed_attempt,
        }
    }
}

/// Re-invokes the bound runnable on failure.
///
/// Attempts after the first run as children tagged `retry:attempt:<n>`.
/// Streaming is forwarded to the bound runnable without retries.
#[derive(Debug, Clone)]
pub struct RunnableRetry {
    bound: DynRunnable,
    config: RunnableRetryConfig,
}

impl RunnableRetry {
    pub fn new(bound: DynRunnable, config: RunnableRetryConfig) -> Self {
        Self { bound, config }
    }

    pub fn bound(&self) -> &DynRunnable {
        &self.bound
    }

    pub fn max_attempt_number(&self) -> usize {
        self.config.max_attempt_number.max(1)
    }

    fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        if self.config.wait_exponential_jitter {
            Box::new(
                self.config
                    .exponential_jitter_params
                    .backoff(self.max_attempt_number() - 1),
            )
        } else {
            Box::new(std::iter::empty())
        }
    }
}

#[async_trait]
impl Runnable for RunnableRetry {
    fn name(&self) -> String {
        self.bound.name()
    }

    async fn invoke(&self, input: Chunk, config: Option<RunnableConfig>) -> Result<Chunk> {
        call_with_config(self, input, config, RunType::Chain, |input, config, run_manager| async move {
            let mut delays = self.delays();
            let mut attempt = 1;
            loop {
                let tag = (attempt > 1).then(|| format!("retry:attempt:{attempt}"));
                let attempt_config = patch_config()
                    .config(config.clone())
                    .callbacks(run_manager.get_child(tag.as_deref()))
                    .call();

                let error = match self.bound.invoke(input.clone(), Some(attempt_config)).await {
                    Ok(output) => return Ok(output),
                    Err(error) => error,
                };

                if let Some(on_failed_attempt) = &self.config.on_failed_attempt {
                    on_failed_attempt(&error, attempt);
                }
                if attempt >= self.max_attempt_number()
                    || !self.config.retry_predicate.should_retry(&error)
                {
                    return Err(error);
                }

                let delay = delays.next().unwrap_or_default();
                tracing::debug!(
                    target: "agent_runnable::runnables",
                    "Attempt {} of {} failed: {}. Retrying in {:?}",
                    attempt,
                    self.max_attempt_number(),
                    error,
                    delay
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        })
        .await
    }

    fn stream<'a>(&'a self, input: Chunk, config: Option<RunnableConfig>) -> ChunkStream<'a> {
        self.bound.stream(input, config)
    }

    fn transform<'a>(
        &'a self,
        input: ChunkStream<'a>,
        config: Option<RunnableConfig>,
    ) -> ChunkStream<'a> {
        self.bound.transform(input, config)
    }
}
