//! Speech-to-text collaborator seam.
//!
//! The vendor protocol lives behind [`SttCollaborator`]. A connection is
//! split in two: the [`SttSender`] half receives audio, and the event stream
//! half delivers transcripts. The transcription stage drives the halves from
//! different tasks.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// A transcript update from the collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Provisional hypothesis for the utterance in progress.
    Partial(String),
    /// The collaborator committed to an utterance boundary.
    Final(String),
}

/// Stream of transcript updates. Yields
/// [`SpeechError::Malformed`](crate::SpeechError::Malformed) for payloads it
/// could not decode and keeps going.
pub type SttEventStream = BoxStream<'static, Result<SttEvent>>;

/// An open STT connection.
pub struct SttConnection {
    /// Audio input half.
    pub sender: Box<dyn SttSender>,
    /// Transcript output half. Ends after [`SttSender::finish`] once pending
    /// transcripts are flushed, or when the connection closes.
    pub events: SttEventStream,
}

/// Opens STT connections.
#[async_trait]
pub trait SttCollaborator: Send + Sync {
    /// Open a connection and complete its handshake.
    ///
    /// The returned sender accepts audio immediately. Implementations whose
    /// transport is still warming up buffer or block briefly inside
    /// [`SttSender::send_audio`].
    async fn connect(&self) -> Result<SttConnection>;
}

/// Audio input half of an STT connection.
#[async_trait]
pub trait SttSender: Send {
    /// Forward one PCM16 frame.
    ///
    /// An error here means the connection is gone.
    async fn send_audio(&mut self, frame: Bytes) -> Result<()>;

    /// Signal end-of-audio.
    async fn finish(&mut self) -> Result<()>;

    /// Close the connection. Safe to call more than once.
    async fn close(&mut self) -> Result<()>;
}
