//! An in-memory channel between a tracer and the stream that reads it.
//!
//! Tracer hooks are synchronous, so sends never wait. The channel is
//! unbounded and closes explicitly: the reader stops at the close marker
//! even while senders are still alive.

use futures::Stream;
use tokio::sync::mpsc;

/// The writing half; cheap to clone.
#[derive(Debug)]
pub struct SendStream<T> {
    sender: mpsc::UnboundedSender<Option<T>>,
}

impl<T> SendStream<T> {
    /// Send an item. Returns `false` once the reader is gone.
    pub fn send(&self, item: T) -> bool {
        self.sender.send(Some(item)).is_ok()
    }

    /// Mark the end of the stream.
    pub fn close(&self) {
        let _ = self.sender.send(None);
    }
}

impl<T> Clone for SendStream<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

/// The reading half.
#[derive(Debug)]
pub struct ReceiveStream<T> {
    receiver: mpsc::UnboundedReceiver<Option<T>>,
}

impl<T: Send + 'static> ReceiveStream<T> {
    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        futures::stream::unfold(Some(self.receiver), |receiver| async move {
            let mut receiver = receiver?;
            match receiver.recv().await {
                Some(Some(item)) => Some((item, Some(receiver))),
                Some(None) | None => None,
            }
        })
    }
}

/// Create a connected send/receive pair.
pub fn memory_stream<T>() -> (SendStream<T>, ReceiveStream<T>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (SendStream { sender }, ReceiveStream { receiver })
}
