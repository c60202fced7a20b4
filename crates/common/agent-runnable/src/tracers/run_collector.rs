use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::callbacks::{CallbackHandler, NewToken, RunEnd, RunFailure, RunStart, StreamChunk};
use crate::error::Result;

use super::base::BaseTracer;
use super::core::TracerCore;
use super::schemas::{Run, RunType};

/// Default byte budget for one ingestion payload.
pub const DEFAULT_BATCH_SIZE_LIMIT_BYTES: usize = 20 * 1024 * 1024;

/// Collects every finished root run, children included.
#[derive(Debug, Default)]
pub struct RunCollector {
    core: Mutex<TracerCore>,
    traced_runs: Mutex<Vec<Run>>,
}

impl RunCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn traced_runs(&self) -> Vec<Run> {
        self.traced_runs.lock().clone()
    }

    pub fn latest_run(&self) -> Option<Run> {
        self.traced_runs.lock().last().cloned()
    }

    pub fn runs_by_type(&self, run_type: RunType) -> Vec<Run> {
        self.traced_runs
            .lock()
            .iter()
            .filter(|run| run.run_type == run_type)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.traced_runs.lock().clear();
    }
}

impl BaseTracer for RunCollector {
    fn core(&self) -> &Mutex<TracerCore> {
        &self.core
    }

    fn persist_run(&self, run: &Run) -> Result<()> {
        self.traced_runs.lock().push(run.clone());
        Ok(())
    }
}

impl CallbackHandler for RunCollector {
    fn name(&self) -> &str {
        "run_collector"
    }

    fn on_run_start(&self, run: &RunStart) -> Result<()> {
        self.handle_start(run)
    }

    fn on_run_end(&self, run: &RunEnd) -> Result<()> {
        self.handle_end(run)
    }

    fn on_run_error(&self, run: &RunFailure) -> Result<()> {
        self.handle_error(run)
    }

    fn on_new_token(&self, token: &NewToken) -> Result<()> {
        self.handle_token(token)
    }

    fn on_stream_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        self.handle_chunk(chunk)
    }
}

/// Flatten a run tree depth-first, parents before children, with
/// `child_runs` cleared on every copy.
pub fn flatten_runs(run: &Run) -> Vec<Run> {
    let mut flat = Vec::new();
    let mut stack = vec![run];
    while let Some(current) = stack.pop() {
        let mut copy = current.clone();
        copy.child_runs.clear();
        flat.push(copy);
        stack.extend(current.child_runs.iter().rev());
    }
    flat
}

/// Split `{post, patch}` ingestion payloads so each serialized batch stays
/// under `max_bytes`.
///
/// Runs are kept in order. A single run larger than the limit is sent in a
/// batch of its own rather than dropped.
pub fn batch_runs_for_ingest(post: &[Run], patch: &[Run], max_bytes: usize) -> Result<Vec<Value>> {
    let mut batches = Vec::new();
    let mut current_post = Vec::new();
    let mut current_patch = Vec::new();
    let mut current_size = 0usize;

    let tagged = post
        .iter()
        .map(|run| (true, run))
        .chain(patch.iter().map(|run| (false, run)));

    for (is_post, run) in tagged {
        let payload = run.to_persisted();
        let size = serde_json::to_vec(&payload)?.len();
        if current_size + size > max_bytes && current_size > 0 {
            batches.push(json!({ "post": current_post, "patch": current_patch }));
            current_post = Vec::new();
            current_patch = Vec::new();
            current_size = 0;
        }
        current_size += size;
        if is_post {
            current_post.push(payload);
        } else {
            current_patch.push(payload);
        }
    }

    if current_size > 0 {
        batches.push(json!({ "post": current_post, "patch": current_patch }));
    }
    Ok(batches)
}
