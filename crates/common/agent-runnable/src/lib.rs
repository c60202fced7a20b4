//! Agent Runnable - composable units of work with streaming and tracing.
//!
//! This crate provides:
//! - The [`Runnable`](runnables::Runnable) protocol: invoke, batch, stream and transform
//! - Compositions: sequences, maps, bindings, retries and fallbacks
//! - A callback system that reports every run to its handlers
//! - Tracers that turn runs into JSON Patch logs and stream events
//!
//! # Architecture
//!
//! - **Data layer** ([`chunk`]): the dynamic [`Chunk`] value and its concatenation
//! - **Runnable layer** ([`runnables`]): the trait, its compositions and the run config
//! - **Callbacks layer** ([`callbacks`]): handlers, managers and per-run managers
//! - **Tracing layer** ([`tracers`]): run trees, run logs and event streams

pub mod callbacks;
pub mod chunk;
pub mod error;
pub mod runnables;
pub mod tracers;

pub use chunk::{Chunk, CustomChunk, concat_all};

pub use error::{Error, Result, TracerError};
