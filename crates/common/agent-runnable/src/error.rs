//! Error types for agent-runnable.
//!
//! A single error enum is shared by the chunk model, the runnables and the
//! tracers. It is `Clone` because one failure can be observed from several
//! places at once: a tee'd input stream, a batch slot, a fallback chain.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for agent-runnable operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for agent-runnable operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Two chunks of incompatible kinds were concatenated.
    #[error("cannot concatenate {left} with {right}")]
    ChunkMismatch {
        left: &'static str,
        right: &'static str,
    },

    /// Two chunks of the same kind that have no concatenation.
    #[error("unsupported concatenation: {0}")]
    ChunkUnsupported(String),

    /// Concatenation failed on a shared dictionary key.
    #[error("failed to concatenate key `{key}`: {source}")]
    ChunkKey {
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// A config list does not line up with the batch inputs.
    #[error("config list has {configs} entries but {inputs} inputs were given")]
    ConfigListLength { configs: usize, inputs: usize },

    /// The abort signal fired.
    #[error("run cancelled")]
    Cancelled,

    /// The configured timeout elapsed.
    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    /// Nested runs went deeper than the config's `recursion_limit`.
    #[error("recursion limit reached before `{0}` could start")]
    RecursionLimit(String),

    /// A callback handler marked `raise_error` failed.
    #[error("callback handler `{handler}` failed: {message}")]
    Callback { handler: String, message: String },

    /// Run bookkeeping inside a tracer is inconsistent.
    #[error(transparent)]
    Tracer(#[from] TracerError),

    /// Error serializing or parsing JSON.
    #[error("JSON error: {0}")]
    Json(String),

    /// A JSON Patch could not be applied.
    #[error("JSON patch error: {0}")]
    Patch(String),

    /// The event stream observed malformed log state.
    #[error("stream events error: {0}")]
    StreamEvents(String),

    /// Generic error with message, also used for user function failures.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a generic error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Wrap a nested concatenation failure with the key it happened on.
    pub fn chunk_key(key: impl Into<String>, source: Error) -> Self {
        Self::ChunkKey {
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Whether the error came from the abort signal or a timeout.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

impl From<json_patch::PatchError> for Error {
    fn from(error: json_patch::PatchError) -> Self {
        Self::Patch(error.to_string())
    }
}

/// Errors raised by tracer run bookkeeping.
#[derive(Debug, Clone, Error)]
pub enum TracerError {
    #[error("no run found with id {0}")]
    RunNotFound(Uuid),

    #[error("run {0} was already started")]
    DuplicateRun(Uuid),

    #[error("run {run_id} has type {actual}, expected {expected}")]
    WrongRunType {
        run_id: Uuid,
        expected: String,
        actual: String,
    },

    #[error("unable to dispatch custom event `{0}` without a parent run")]
    NoParentRun(String),
}
