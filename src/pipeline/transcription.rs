//! Transcription stage: audio frames in, transcript events out.
//!
//! Two activities share one STT connection. A [`SenderTask`] drains the audio
//! stream into the connection's sender half, while the stage task reads the
//! event half and re-emits typed [`Event`]s. Shutdown is ordered: stop the
//! sender task, wait for it, then close the connection, so no audio is ever
//! written to a connection that is already closing.
//!
//! The sender task observes a child of the stage token. When the stage is
//! dropped rather than closed, nobody is left to take the sender half back,
//! so the task closes the connection itself once it has stopped forwarding.

use crate::audio::AudioStream;
use crate::config::PipelineConfig;
use crate::error::{Result, SpeechError, with_timeout};
use crate::pipeline::EventStream;
use crate::pipeline::messages::Event;
use crate::pipeline::stream::{StreamSink, TaskStream};
use crate::stt::{SttCollaborator, SttConnection, SttEvent, SttSender};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Wraps an STT collaborator as a pipeline stage.
pub struct TranscriptionStage {
    config: Arc<PipelineConfig>,
    stt: Arc<dyn SttCollaborator>,
}

impl TranscriptionStage {
    /// Create a stage that opens one connection per [`run`](Self::run).
    pub fn new(config: Arc<PipelineConfig>, stt: Arc<dyn SttCollaborator>) -> Self {
        Self { config, stt }
    }

    /// Transcribe `audio_in`, yielding partial and final transcript events.
    ///
    /// Empty frames are never forwarded. Blank transcripts are suppressed.
    pub fn run(self, audio_in: AudioStream) -> EventStream {
        let capacity = self.config.channels.event_capacity;
        TaskStream::spawn(capacity, move |sink, cancel| {
            self.transcribe(audio_in, sink, cancel)
                .instrument(info_span!("transcription_stage"))
        })
    }

    async fn transcribe(
        self,
        audio_in: AudioStream,
        sink: StreamSink<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let timeout = self.config.stt_handshake_timeout();
        let connected = tokio::select! {
            () = cancel.cancelled() => {
                audio_in.close().await;
                return Ok(());
            }
            connected = with_timeout("stt handshake", timeout, self.stt.connect()) => connected,
        };
        let SttConnection { sender, mut events } = match connected {
            Ok(connection) => connection,
            Err(e) => {
                audio_in.close().await;
                return Err(e);
            }
        };
        info!("stt connected");

        let sender_task = SenderTask::start(sender, audio_in, sink.clone(), &cancel);

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                update = events.next() => match update {
                    Some(Ok(SttEvent::Partial(text))) => {
                        if text.is_empty() {
                            continue;
                        }
                        if !sink.send(Event::partial_transcript(text)).await {
                            break Ok(());
                        }
                    }
                    Some(Ok(SttEvent::Final(text))) => {
                        if text.trim().is_empty() {
                            debug!("suppressing blank final transcript");
                            continue;
                        }
                        info!(transcript = %text, "final transcript");
                        if !sink.send(Event::final_transcript(text)).await {
                            break Ok(());
                        }
                    }
                    Some(Err(SpeechError::Malformed(detail))) => {
                        warn!(%detail, "skipping malformed stt message");
                    }
                    Some(Err(e)) => break Err(e),
                    None => {
                        debug!("stt event stream ended");
                        break Ok(());
                    }
                },
            }
        };

        if let Some(mut sender) = sender_task.stop().await {
            if let Err(e) = sender.close().await {
                debug!(error = %e, "stt close failed");
            }
        }
        drop(events);
        outcome
    }
}

/// Owned handle to the task forwarding audio into an STT connection.
///
/// [`stop`](Self::stop) hands the sender half back so the caller decides
/// when the connection is closed.
pub struct SenderTask {
    handle: JoinHandle<Option<Box<dyn SttSender>>>,
    cancel: CancellationToken,
    handoff: CancellationToken,
}

impl SenderTask {
    /// Start forwarding `audio` into `sender` until `stage` is cancelled.
    ///
    /// When the audio ends the collaborator is told end-of-audio and the
    /// task waits to be stopped. A failing audio source is reported through
    /// `errors`. If `stage` is cancelled and the task is never stopped, the
    /// task closes the connection on its own.
    pub fn start(
        sender: Box<dyn SttSender>,
        audio: AudioStream,
        errors: StreamSink<Event>,
        stage: &CancellationToken,
    ) -> Self {
        let cancel = stage.child_token();
        let handoff = CancellationToken::new();
        let handle = tokio::spawn(
            forward_then_hand_off(sender, audio, errors, cancel.clone(), handoff.clone())
                .instrument(info_span!("stt_sender")),
        );
        Self {
            handle,
            cancel,
            handoff,
        }
    }

    /// Cancel the task, wait for it, and take back the sender half.
    ///
    /// Returns `None` if the task panicked or already closed the
    /// connection after its stage went away.
    pub async fn stop(self) -> Option<Box<dyn SttSender>> {
        self.handoff.cancel();
        self.cancel.cancel();
        match self.handle.await {
            Ok(sender) => sender,
            Err(e) => {
                warn!("stt sender task failed: {e}");
                None
            }
        }
    }
}

async fn forward_then_hand_off(
    sender: Box<dyn SttSender>,
    audio: AudioStream,
    errors: StreamSink<Event>,
    cancel: CancellationToken,
    handoff: CancellationToken,
) -> Option<Box<dyn SttSender>> {
    let mut sender = send_audio(sender, audio, errors, cancel.clone()).await;
    tokio::select! {
        biased;
        () = handoff.cancelled() => Some(sender),
        () = cancel.cancelled() => {
            debug!("transcription stage dropped, closing stt connection");
            if let Err(e) = sender.close().await {
                debug!(error = %e, "stt close failed");
            }
            None
        }
    }
}

async fn send_audio(
    mut sender: Box<dyn SttSender>,
    mut audio: AudioStream,
    errors: StreamSink<Event>,
    cancel: CancellationToken,
) -> Box<dyn SttSender> {
    let mut frames = 0u64;
    loop {
        let frame = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            frame = audio.next() => frame,
        };
        match frame {
            Some(Ok(frame)) => {
                if frame.is_empty() {
                    continue;
                }
                let sent = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    sent = sender.send_audio(frame) => sent,
                };
                if let Err(e) = sent {
                    // The receiver side reports real connection failures.
                    debug!(error = %e, "stt connection closed, audio sender stopping");
                    break;
                }
                frames += 1;
            }
            Some(Err(e)) => {
                warn!(error = %e, "audio source failed");
                errors.fail(e).await;
                break;
            }
            None => {
                debug!(frames, "audio input ended, signalling end-of-audio");
                if let Err(e) = sender.finish().await {
                    debug!(error = %e, "stt end-of-audio not delivered");
                }
                break;
            }
        }
    }
    audio.close().await;
    sender
}
