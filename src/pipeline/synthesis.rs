//! Synthesis stage: passes every event through and voices each agent turn.
//!
//! Agent text is accumulated per turn and sent to the TTS collaborator as a
//! single unit when [`EventKind::AgentTurnEnd`] arrives. Synthesized audio is
//! fanned in with the passthrough events through [`merge`], so audio for one
//! turn can play while text for the next is still arriving.

use crate::config::PipelineConfig;
use crate::error::{Result, SpeechError, with_timeout};
use crate::pipeline::EventStream;
use crate::pipeline::merge::merge;
use crate::pipeline::messages::{Event, EventKind};
use crate::pipeline::stream::{StreamSink, TaskStream};
use crate::tts::{TtsAudioStream, TtsCollaborator, TtsConnection, TtsSender};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Wraps a TTS collaborator as a passthrough stage.
pub struct SynthesisStage {
    config: Arc<PipelineConfig>,
    tts: Arc<dyn TtsCollaborator>,
}

impl SynthesisStage {
    /// Create a stage that opens one connection per [`run`](Self::run).
    pub fn new(config: Arc<PipelineConfig>, tts: Arc<dyn TtsCollaborator>) -> Self {
        Self { config, tts }
    }

    /// Re-emit every input event, interleaved with synthesized
    /// [`EventKind::AudioChunk`]s as they arrive.
    pub fn run(self, events_in: EventStream) -> EventStream {
        let capacity = self.config.channels.event_capacity;
        TaskStream::spawn(capacity, move |sink, cancel| {
            self.synthesize(events_in, sink, cancel)
                .instrument(info_span!("synthesis_stage"))
        })
    }

    async fn synthesize(
        self,
        events_in: EventStream,
        sink: StreamSink<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let timeout = self.config.tts_handshake_timeout();
        let connected = tokio::select! {
            () = cancel.cancelled() => {
                events_in.close().await;
                return Ok(());
            }
            connected = with_timeout("tts handshake", timeout, self.tts.connect()) => connected,
        };
        let TtsConnection { sender, audio } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                events_in.close().await;
                return Err(e);
            }
        };
        info!("tts connected");

        let capacity = self.config.channels.event_capacity;
        // Fires once the TTS connection has been closed by the passthrough side.
        let closing = CancellationToken::new();
        let passthrough = TaskStream::spawn(capacity, {
            let closing = closing.clone();
            move |sink, cancel| passthrough(events_in, sender, sink, cancel, closing)
        });
        let drain = self.config.tts_drain_timeout();
        let voiced = TaskStream::spawn(capacity, move |sink, cancel| {
            voice(audio, sink, cancel, closing, drain)
        });

        let mut merged = merge(vec![passthrough, voiced], self.config.channels.merge_capacity);
        let outcome = loop {
            let item = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                item = merged.next() => item,
            };
            match item {
                Some(Ok(event)) => {
                    if !sink.send(event).await {
                        break Ok(());
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        merged.close().await;
        outcome
    }
}

/// Forward input events and feed completed turns to the TTS sender.
///
/// Owns the sender half and closes it on every exit path, which lets the
/// audio side run dry.
async fn passthrough(
    mut events_in: EventStream,
    mut sender: Box<dyn TtsSender>,
    sink: StreamSink<Event>,
    cancel: CancellationToken,
    closing: CancellationToken,
) -> Result<()> {
    let mut pending = String::new();
    let outcome = loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            event = events_in.next() => event,
        };
        let event = match event {
            Some(Ok(event)) => event,
            Some(Err(e)) => break Err(e),
            None => break Ok(()),
        };

        let turn_ended = match event.kind() {
            EventKind::AgentTextChunk { text } => {
                pending.push_str(text);
                false
            }
            EventKind::AgentTurnEnd => true,
            _ => false,
        };
        if !sink.send(event).await {
            break Ok(());
        }
        if !turn_ended {
            continue;
        }

        let text = std::mem::take(&mut pending);
        if text.trim().is_empty() {
            debug!("agent turn had no text, nothing to synthesize");
            continue;
        }
        debug!(chars = text.len(), "requesting synthesis");
        let sent = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            sent = sender.send_text(&text) => sent,
        };
        if let Err(e) = sent {
            break Err(e);
        }
    };

    events_in.close().await;
    if let Err(e) = sender.close().await {
        debug!(error = %e, "tts close failed");
    }
    closing.cancel();
    outcome
}

/// Turn the collaborator's audio into events until it runs dry.
///
/// Once the connection is closing, audio is only awaited for `drain`.
async fn voice(
    mut audio: TtsAudioStream,
    sink: StreamSink<Event>,
    cancel: CancellationToken,
    closing: CancellationToken,
    drain: Duration,
) -> Result<()> {
    let deadline = async {
        closing.cancelled().await;
        tokio::time::sleep(drain).await;
    };
    tokio::pin!(deadline);

    let mut chunks = 0u64;
    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            () = &mut deadline => {
                debug!(chunks, "tts audio did not drain in time, dropping the rest");
                return Ok(());
            }
            chunk = audio.next() => chunk,
        };
        match chunk {
            Some(Ok(bytes)) => {
                if bytes.is_empty() {
                    continue;
                }
                chunks += 1;
                if !sink.send(Event::audio_chunk(bytes)).await {
                    return Ok(());
                }
            }
            Some(Err(SpeechError::Malformed(detail))) => {
                warn!(%detail, "skipping malformed tts message");
            }
            Some(Err(e)) => return Err(e),
            None => {
                debug!(chunks, "tts audio stream ended");
                return Ok(());
            }
        }
    }
}
