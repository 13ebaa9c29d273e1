//! Task-backed streams: the output type of every pipeline stage.
//!
//! A [`TaskStream`] owns the receiving half of a bounded channel together
//! with the tasks producing into it and the [`CancellationToken`] those tasks
//! observe. Whoever holds the stream owns the work behind it:
//!
//! - [`TaskStream::close`] cancels the token and awaits every task, so once it
//!   returns nothing the stream started is still running.
//! - Dropping the stream cancels the token and aborts the tasks. Drop cannot
//!   await; use `close` when ordered teardown matters.
//! - An `Err` item is terminal. The stream cancels its producers and the
//!   next poll yields `None`.

use crate::error::{Result, SpeechError};
use futures_util::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Producer half handed to the tasks behind a [`TaskStream`].
pub struct StreamSink<T> {
    tx: mpsc::Sender<Result<T>>,
    cancel: CancellationToken,
}

impl<T> Clone for StreamSink<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T: Send> StreamSink<T> {
    /// Send one item, waiting for capacity.
    ///
    /// Returns `false` once the consumer is gone or the stream was cancelled;
    /// producers treat that as a request to stop.
    pub async fn send(&self, item: T) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(Ok(item)) => sent.is_ok(),
        }
    }

    /// Deliver a terminal error to the consumer.
    pub async fn fail(&self, err: SpeechError) {
        // The send future owns `err` as soon as the select is built.
        let detail = err.to_string();
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => debug!(error = %detail, "error dropped, stream already cancelled"),
            sent = self.tx.send(Err(err)) => {
                if sent.is_err() {
                    debug!("error dropped, consumer gone");
                }
            }
        }
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed() || self.cancel.is_cancelled()
    }
}

/// Collects producer tasks before handing them to a [`TaskStream`].
pub(crate) struct StreamBuilder<T> {
    sink: StreamSink<T>,
    rx: mpsc::Receiver<Result<T>>,
    tasks: JoinSet<()>,
}

impl<T: Send + 'static> StreamBuilder<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sink: StreamSink {
                tx,
                cancel: CancellationToken::new(),
            },
            rx,
            tasks: JoinSet::new(),
        }
    }

    pub(crate) fn sink(&self) -> StreamSink<T> {
        self.sink.clone()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.sink.cancel.clone()
    }

    /// Spawn a producer. An `Err` it returns is delivered to the consumer
    /// and cancels the sibling producers.
    pub(crate) fn spawn<Fut>(&mut self, producer: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let sink = self.sink();
        self.tasks.spawn(async move {
            if let Err(e) = producer.await {
                sink.fail(e).await;
                sink.cancel.cancel();
            }
        });
    }

    pub(crate) fn finish(self) -> TaskStream<T> {
        let Self { sink, rx, tasks } = self;
        // Only producers keep the channel open from here on.
        let cancel = sink.cancel.clone();
        drop(sink);
        TaskStream {
            rx,
            tasks,
            cancel,
            done: false,
        }
    }
}

/// A stream whose items come from tasks it owns.
pub struct TaskStream<T> {
    rx: mpsc::Receiver<Result<T>>,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    done: bool,
}

impl<T> Unpin for TaskStream<T> {}

impl<T: Send + 'static> TaskStream<T> {
    /// Start one producer task feeding a channel of `capacity` items.
    ///
    /// The closure receives the sink to produce into and the token the task
    /// must observe at every suspension point.
    pub fn spawn<F, Fut>(capacity: usize, producer: F) -> Self
    where
        F: FnOnce(StreamSink<T>, CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut builder = StreamBuilder::new(capacity);
        let fut = producer(builder.sink(), builder.cancel_token());
        builder.spawn(fut);
        builder.finish()
    }

    /// Drive an arbitrary stream from a task of its own.
    pub fn from_stream<S>(capacity: usize, stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self::spawn(capacity, move |sink, cancel| async move {
            let mut stream = std::pin::pin!(stream);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    item = stream.next() => match item {
                        Some(Ok(item)) => {
                            if !sink.send(item).await {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    },
                }
            }
        })
    }

    /// A finite stream of ready items.
    pub fn from_items(items: Vec<T>) -> Self {
        let capacity = items.len().max(1);
        Self::spawn(capacity, move |sink, _cancel| async move {
            for item in items {
                if !sink.send(item).await {
                    break;
                }
            }
            Ok(())
        })
    }

    /// A clone of the token the producers observe.
    ///
    /// Cancelling it stops the producers without awaiting them.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every producer and wait for all of them to finish.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.rx.close();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    warn!("stream producer panicked: {e}");
                }
            }
        }
        self.done = true;
    }

    /// Number of producer tasks still tracked by this stream.
    pub fn running_tasks(&self) -> usize {
        self.tasks.len()
    }
}

impl<T> Stream for TaskStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                this.cancel.cancel();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<T> Drop for TaskStream<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
        // JoinSet aborts whatever is left when it drops.
    }
}

/// Producer handle for a source that cannot be paused.
///
/// Pushing never waits. Once the bounded queue is full the next push fails
/// with [`SpeechError::Overflow`] and the consumer receives the same error
/// after the items already queued.
pub struct PushHandle<T> {
    tx: mpsc::Sender<Result<T>>,
    capacity: usize,
    cancel: CancellationToken,
    overflowed: bool,
}

/// Create a push-driven stream holding at most `capacity` queued items.
pub fn push_source<T: Send + 'static>(capacity: usize) -> (PushHandle<T>, TaskStream<T>) {
    let capacity = capacity.max(1);
    // One extra slot is kept for the overflow error itself.
    let (tx, rx) = mpsc::channel(capacity + 1);
    let cancel = CancellationToken::new();
    let handle = PushHandle {
        tx,
        capacity,
        cancel: cancel.clone(),
        overflowed: false,
    };
    let stream = TaskStream {
        rx,
        tasks: JoinSet::new(),
        cancel,
        done: false,
    };
    (handle, stream)
}

impl<T> PushHandle<T> {
    /// Queue one item without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Overflow`] when the queue is full and
    /// [`SpeechError::Channel`] once the consumer is gone.
    pub fn push(&mut self, item: T) -> Result<()> {
        if self.overflowed {
            return Err(SpeechError::Overflow {
                capacity: self.capacity,
            });
        }
        if self.cancel.is_cancelled() || self.tx.is_closed() {
            return Err(SpeechError::Channel("push source consumer is gone".into()));
        }
        if self.tx.capacity() <= 1 {
            self.overflowed = true;
            let _ = self.tx.try_send(Err(SpeechError::Overflow {
                capacity: self.capacity,
            }));
            return Err(SpeechError::Overflow {
                capacity: self.capacity,
            });
        }
        self.tx
            .try_send(Ok(item))
            .map_err(|e| SpeechError::Channel(format!("push failed: {e}")))
    }

    /// Whether the consumer cancelled or went away.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    /// End the stream after the queued items.
    pub fn finish(self) {}
}
