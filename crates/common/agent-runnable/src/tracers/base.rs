use std::fmt::Debug;

use parking_lot::Mutex;

use crate::callbacks::{NewToken, RunEnd, RunFailure, RunStart, StreamChunk};
use crate::error::Result;

use super::core::TracerCore;
use super::schemas::Run;

/// A callback handler that keeps a run tree.
///
/// Implementors provide the core and whichever hooks they need, and call
/// the `handle_*` methods from their `CallbackHandler` impl. The core lock
/// is released before any hook runs.
pub trait BaseTracer: Send + Sync + Debug {
    fn core(&self) -> &Mutex<TracerCore>;

    /// Called with every finished root run.
    fn persist_run(&self, _run: &Run) -> Result<()> {
        Ok(())
    }

    fn on_run_create(&self, _run: &Run) -> Result<()> {
        Ok(())
    }

    fn on_run_update(&self, _run: &Run) -> Result<()> {
        Ok(())
    }

    fn on_run_token(&self, _run: &Run, _token: &NewToken) -> Result<()> {
        Ok(())
    }

    fn on_run_chunk(&self, _chunk: &StreamChunk) -> Result<()> {
        Ok(())
    }

    fn handle_start(&self, start: &RunStart) -> Result<()> {
        let run = self.core().lock().start_run(start)?;
        self.on_run_create(&run)
    }

    fn handle_end(&self, end: &RunEnd) -> Result<()> {
        let run = self.core().lock().end_run(end)?;
        self.finish(&run)
    }

    fn handle_error(&self, failure: &RunFailure) -> Result<()> {
        let run = self.core().lock().error_run(failure)?;
        self.finish(&run)
    }

    fn handle_token(&self, token: &NewToken) -> Result<()> {
        let run = self.core().lock().new_token(token)?;
        self.on_run_token(&run, token)
    }

    fn handle_chunk(&self, chunk: &StreamChunk) -> Result<()> {
        self.core().lock().stream_chunk(chunk)?;
        self.on_run_chunk(chunk)
    }

    fn finish(&self, run: &Run) -> Result<()> {
        if run.parent_run_id.is_none() {
            self.persist_run(run)?;
        }
        self.on_run_update(run)
    }
}
