//! Text-to-speech collaborator seam.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

/// Synthesized PCM16 audio as the collaborator produces it.
pub type TtsAudioStream = BoxStream<'static, Result<Bytes>>;

/// An open TTS connection.
pub struct TtsConnection {
    /// Text input half.
    pub sender: Box<dyn TtsSender>,
    /// Audio output half. Must end once the connection is closed.
    pub audio: TtsAudioStream,
}

/// Opens TTS connections.
#[async_trait]
pub trait TtsCollaborator: Send + Sync {
    /// Open a connection and complete its handshake.
    async fn connect(&self) -> Result<TtsConnection>;
}

/// Text input half of a TTS connection.
#[async_trait]
pub trait TtsSender: Send {
    /// Request synthesis of one text unit. Audio arrives on the audio half.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Close the connection, letting already-requested audio drain.
    async fn close(&mut self) -> Result<()>;
}
