//! Audio source and sink seams, plus channel-backed implementations.
//!
//! Device I/O lives outside this crate. A capture backend or network socket
//! pushes frames into a [`ChannelSource`]; a playback backend drains a
//! [`ChannelSink`].

use crate::error::{Result, SpeechError};
use crate::pipeline::stream::{StreamSink, TaskStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A lazy, possibly endless sequence of PCM16 mono frames.
pub type AudioStream = TaskStream<Bytes>;

/// Produces audio captures.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Start a capture. Closing the returned stream stops it.
    async fn open(&self) -> Result<AudioStream>;
}

/// Accepts PCM16 frames for playback or forwarding.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue one frame.
    async fn write(&self, frame: Bytes) -> Result<()>;

    /// Stop early, discarding anything queued but not yet played.
    async fn stop(&self) -> Result<()>;
}

/// Audio source fed from a channel of frames.
///
/// Each [`open`](AudioSource::open) takes frames from the shared receiver
/// until the capture is closed, so consecutive captures see consecutive
/// audio. Frames a capture already pulled but nobody read are dropped with
/// it.
pub struct ChannelSource {
    rx: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
    capacity: usize,
}

impl ChannelSource {
    /// Create a source and the sender a capture backend writes into.
    pub fn new(capacity: usize) -> (mpsc::Sender<Bytes>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            rx: Arc::new(AsyncMutex::new(rx)),
            capacity: capacity.max(1),
        };
        (tx, source)
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    async fn open(&self) -> Result<AudioStream> {
        let rx = Arc::clone(&self.rx);
        Ok(TaskStream::spawn(self.capacity, move |sink, cancel| {
            capture(rx, sink, cancel)
        }))
    }
}

async fn capture(
    rx: Arc<AsyncMutex<mpsc::Receiver<Bytes>>>,
    sink: StreamSink<Bytes>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut rx = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        guard = rx.lock_owned() => guard,
    };
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if !sink.send(frame).await {
                        return Ok(());
                    }
                }
                None => {
                    debug!("audio channel closed, capture ended");
                    return Ok(());
                }
            },
        }
    }
}

/// Sink that forwards frames to a channel and tracks early stops.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
    stops: AtomicUsize,
}

impl ChannelSink {
    /// Create a sink and the receiver a playback backend drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            tx,
            stops: AtomicUsize::new(0),
        };
        (sink, rx)
    }

    /// How many times playback was stopped early.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for ChannelSink {
    async fn write(&self, frame: Bytes) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| SpeechError::Channel("audio sink receiver dropped".into()))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
