//! The Runnable abstraction, its compositions and the config that flows
//! through every call.

pub mod base;
pub mod config;
pub mod fallbacks;
pub mod passthrough;
pub mod retry;
pub mod schema;
pub mod signal;
pub mod utils;

pub use base::{
    BatchOptions, ChunkStream, DynRunnable, Runnable, RunnableBinding, RunnableExt,
    RunnableLambda, RunnableMap, RunnableSequence, call_with_config, single_chunk,
    transform_stream_with_config,
};
pub use config::{
    ConfigOrList, DEFAULT_RECURSION_LIMIT, RunnableConfig, ensure_config,
    get_callback_manager_for_config, get_config_list, merge_configs, patch_config,
};
pub use fallbacks::{FallbackErrorPredicate, RunnableWithFallbacks};
pub use passthrough::RunnablePassthrough;
pub use retry::{
    ExponentialJitterParams, OnFailedAttempt, RetryErrorPredicate, RunnableRetry,
    RunnableRetryConfig,
};
pub use schema::{CUSTOM_EVENT_TYPE, CustomStreamEvent, EventData, StandardStreamEvent, StreamEvent};
pub use signal::{AbortSignal, check_signal};
pub use utils::{RootEventFilter, gather_with_concurrency, tee, try_gather_with_concurrency};
