use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::Stream;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::chunk::Chunk;
use crate::error::{Error, Result};

/// Name, type and tag filters for runs and events.
///
/// With no include filter set everything is included; otherwise a run is
/// included when any include filter matches. Exclude filters always win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootEventFilter {
    pub include_names: Option<Vec<String>>,
    pub include_types: Option<Vec<String>>,
    pub include_tags: Option<Vec<String>>,
    pub exclude_names: Option<Vec<String>>,
    pub exclude_types: Option<Vec<String>>,
    pub exclude_tags: Option<Vec<String>>,
}

#[bon::bon]
impl RootEventFilter {
    #[builder]
    pub fn new(
        include_names: Option<Vec<String>>,
        include_types: Option<Vec<String>>,
        include_tags: Option<Vec<String>>,
        exclude_names: Option<Vec<String>>,
        exclude_types: Option<Vec<String>>,
        exclude_tags: Option<Vec<String>>,
    ) -> Self {
        Self {
            include_names,
            include_types,
            include_tags,
            exclude_names,
            exclude_types,
            exclude_tags,
        }
    }

    pub fn include_event(&self, name: &str, tags: &[String], run_type: &str) -> bool {
        let mut include = self.include_names.is_none()
            && self.include_types.is_none()
            && self.include_tags.is_none();

        if let Some(names) = &self.include_names {
            include = include || names.iter().any(|n| n == name);
        }
        if let Some(types) = &self.include_types {
            include = include || types.iter().any(|t| t == run_type);
        }
        if let Some(include_tags) = &self.include_tags {
            include = include || tags.iter().any(|tag| include_tags.contains(tag));
        }

        if let Some(names) = &self.exclude_names {
            include = include && !names.iter().any(|n| n == name);
        }
        if let Some(types) = &self.exclude_types {
            include = include && !types.iter().any(|t| t == run_type);
        }
        if let Some(exclude_tags) = &self.exclude_tags {
            include = include && !tags.iter().any(|tag| exclude_tags.contains(tag));
        }

        include
    }
}

async fn gated<F: Future>(semaphore: Option<Arc<Semaphore>>, future: F) -> Result<F::Output> {
    let _permit = match &semaphore {
        Some(semaphore) => Some(
            semaphore
                .acquire()
                .await
                .map_err(|e| Error::other(e.to_string()))?,
        ),
        None => None,
    };
    Ok(future.await)
}

fn semaphore_for(limit: Option<usize>) -> Option<Arc<Semaphore>> {
    limit
        .filter(|limit| *limit > 0)
        .map(|limit| Arc::new(Semaphore::new(limit)))
}

/// Run futures with at most `limit` in flight, collecting every result in
/// input order.
pub async fn gather_with_concurrency<F, T>(
    limit: Option<usize>,
    futures: impl IntoIterator<Item = F>,
) -> Vec<Result<T>>
where
    F: Future<Output = Result<T>>,
{
    let semaphore = semaphore_for(limit);
    let gated = futures
        .into_iter()
        .map(|future| gated(semaphore.clone(), future));
    futures::future::join_all(gated)
        .await
        .into_iter()
        .map(|result| result.and_then(|inner| inner))
        .collect()
}

/// Like [`gather_with_concurrency`] but stops at the first error,
/// dropping the futures still in flight.
pub async fn try_gather_with_concurrency<F, T>(
    limit: Option<usize>,
    futures: impl IntoIterator<Item = F>,
) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let semaphore = semaphore_for(limit);
    let gated = futures.into_iter().map(|future| {
        let semaphore = semaphore.clone();
        async move { gated(semaphore, future).await.and_then(|inner| inner) }
    });
    futures::future::try_join_all(gated).await
}

/// Running concatenation of streamed chunks, used for tracing.
///
/// Once two chunks fail to concatenate the accumulator gives up and
/// reports no value.
#[derive(Debug)]
pub(crate) struct ChunkAccumulator {
    value: Option<Chunk>,
    supported: bool,
}

impl Default for ChunkAccumulator {
    fn default() -> Self {
        Self {
            value: None,
            supported: true,
        }
    }
}

impl ChunkAccumulator {
    pub(crate) fn push(&mut self, chunk: &Chunk) {
        if !self.supported {
            return;
        }
        self.value = match self.value.take() {
            None => Some(chunk.clone()),
            Some(previous) => match previous.concat(chunk) {
                Ok(joined) => Some(joined),
                Err(error) => {
                    tracing::debug!(
                        target: "agent_runnable::runnables",
                        "Stopped accumulating chunks: {}",
                        error
                    );
                    self.supported = false;
                    None
                }
            },
        };
    }

    pub(crate) fn to_json(&self) -> Value {
        self.value
            .as_ref()
            .map(Chunk::to_json)
            .unwrap_or(Value::Null)
    }
}

struct TeeShared<'a, T> {
    source: BoxStream<'a, T>,
    buffers: Vec<VecDeque<T>>,
    wakers: Vec<Option<Waker>>,
    dropped: Vec<bool>,
    exhausted: bool,
}

impl<T> TeeShared<'_, T> {
    fn wake_others(&mut self, index: usize) {
        for (i, waker) in self.wakers.iter_mut().enumerate() {
            if i != index
                && let Some(waker) = waker.take()
            {
                waker.wake();
            }
        }
    }
}

/// Split one stream into `n` independent peers.
///
/// Items read by any peer are buffered for the others. A peer that finds
/// its buffer empty while another peer is waiting on the source parks and
/// is woken when the next item or the end of the source arrives. Dropped
/// peers stop receiving items.
pub fn tee<'a, T>(source: BoxStream<'a, T>, n: usize) -> Vec<TeePeer<'a, T>>
where
    T: Clone + Send + 'a,
{
    let shared = Arc::new(Mutex::new(TeeShared {
        source,
        buffers: (0..n).map(|_| VecDeque::new()).collect(),
        wakers: (0..n).map(|_| None).collect(),
        dropped: vec![false; n],
        exhausted: false,
    }));

    (0..n)
        .map(|index| TeePeer {
            shared: Arc::clone(&shared),
            index,
        })
        .collect()
}

pub struct TeePeer<'a, T> {
    shared: Arc<Mutex<TeeShared<'a, T>>>,
    index: usize,
}

impl<T: Clone> Stream for TeePeer<'_, T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock();

        if let Some(item) = shared.buffers[this.index].pop_front() {
            return Poll::Ready(Some(item));
        }
        if shared.exhausted {
            return Poll::Ready(None);
        }

        match shared.source.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                let TeeShared {
                    buffers, dropped, ..
                } = &mut *shared;
                for (i, buffer) in buffers.iter_mut().enumerate() {
                    if i != this.index && !dropped[i] {
                        buffer.push_back(item.clone());
                    }
                }
                shared.wake_others(this.index);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => {
                shared.exhausted = true;
                shared.wake_others(this.index);
                Poll::Ready(None)
            }
            Poll::Pending => {
                // The source only remembers the last waker that polled it.
                shared.wakers[this.index] = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> Drop for TeePeer<'_, T> {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.dropped[self.index] = true;
        shared.buffers[self.index].clear();
        shared.wakers[self.index] = None;
        // The dropped peer may have been the one the source would wake.
        shared.wake_others(self.index);
    }
}
