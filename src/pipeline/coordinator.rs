//! Turn coordinator: listen, respond, and let the user barge in.
//!
//! One cycle runs in two phases:
//!
//! ```text
//! Listening:  capture ─▶ final transcript ─▶ agent response text
//! Responding: playback(response)  ║  capture(next utterance)
//!             first to finish wins the race:
//!               capture with a transcript ─▶ stop playback, Interrupted
//!               playback                  ─▶ wait for capture, Completed
//! ```
//!
//! A transcript captured while responding is kept and answered by the next
//! cycle without listening again.

use crate::agent::AgentCollaborator;
use crate::audio::{AudioSink, AudioSource};
use crate::config::PipelineConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::agent_stage::AgentStage;
use crate::pipeline::messages::{Event, EventKind};
use crate::pipeline::stream::TaskStream;
use crate::pipeline::synthesis::SynthesisStage;
use crate::pipeline::transcription::TranscriptionStage;
use crate::session::Session;
use crate::stt::SttCollaborator;
use crate::tts::TtsCollaborator;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Where the coordinator is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Waiting for the user to finish an utterance.
    Listening,
    /// Playing the response while listening for the next utterance.
    Responding,
    /// The user spoke over the response and playback was stopped.
    Interrupted,
    /// The response played out.
    Completed,
}

/// How one cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The response played to the end.
    Completed,
    /// The user spoke over the response. `transcript` is answered next.
    Interrupted {
        /// What the user said while the response was playing.
        transcript: String,
    },
    /// The audio source ended before anything was said.
    Silent,
    /// [`TurnCoordinator::shutdown`] was called.
    Cancelled,
}

/// Everything one coordinator talks to.
#[derive(Clone)]
pub struct TurnCollaborators {
    /// Microphone or network capture.
    pub source: Arc<dyn AudioSource>,
    /// Speaker or network playback.
    pub sink: Arc<dyn AudioSink>,
    /// Speech-to-text.
    pub stt: Arc<dyn SttCollaborator>,
    /// Conversational agent.
    pub agent: Arc<dyn AgentCollaborator>,
    /// Text-to-speech.
    pub tts: Arc<dyn TtsCollaborator>,
}

/// How a playback task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Playback {
    Finished,
    Stopped,
}

/// Drives listen/respond cycles for one conversation.
pub struct TurnCoordinator {
    config: Arc<PipelineConfig>,
    collaborators: TurnCollaborators,
    session: Session,
    cancel: CancellationToken,
    state: watch::Sender<TurnState>,
    pending: Option<String>,
}

impl TurnCoordinator {
    /// Create a coordinator answering within `session`.
    pub fn new(
        config: Arc<PipelineConfig>,
        collaborators: TurnCollaborators,
        session: Session,
    ) -> Self {
        let (state, _) = watch::channel(TurnState::Listening);
        Self {
            config,
            collaborators,
            session,
            cancel: CancellationToken::new(),
            state,
            pending: None,
        }
    }

    /// Use an externally owned shutdown token.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the coordinator when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the current cycle. Running capture and playback are cancelled
    /// and awaited before the cycle returns.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Current state.
    pub fn state(&self) -> TurnState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.state.subscribe()
    }

    /// The conversation this coordinator answers in.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Transcript captured during the last response, not yet answered.
    pub fn pending_transcript(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    fn set_state(&self, state: TurnState) {
        self.state.send_replace(state);
    }

    /// Run one listen/respond cycle.
    ///
    /// # Errors
    ///
    /// Returns the first collaborator failure. The session history keeps
    /// whatever was recorded before it.
    pub async fn run_cycle(&mut self) -> Result<TurnOutcome> {
        self.set_state(TurnState::Listening);
        let transcript = match self.pending.take() {
            Some(transcript) => {
                debug!(%transcript, "answering transcript captured during the last response");
                transcript
            }
            None => {
                let captured = capture_utterance(
                    Arc::clone(&self.config),
                    Arc::clone(&self.collaborators.source),
                    Arc::clone(&self.collaborators.stt),
                    self.cancel.child_token(),
                )
                .await?;
                match captured {
                    Some(transcript) => transcript,
                    None if self.cancel.is_cancelled() => return Ok(TurnOutcome::Cancelled),
                    None => return Ok(TurnOutcome::Silent),
                }
            }
        };

        let Some(response) = respond(
            Arc::clone(&self.config),
            Arc::clone(&self.collaborators.agent),
            self.session.clone(),
            transcript,
            &self.cancel,
        )
        .await?
        else {
            return Ok(TurnOutcome::Cancelled);
        };
        if response.trim().is_empty() {
            debug!("agent had nothing to say");
            self.set_state(TurnState::Completed);
            return Ok(TurnOutcome::Completed);
        }

        self.set_state(TurnState::Responding);
        let stop = self.cancel.child_token();
        let mut playback = AbortOnDropHandle::new(tokio::spawn(
            play(
                Arc::clone(&self.config),
                Arc::clone(&self.collaborators.tts),
                Arc::clone(&self.collaborators.sink),
                response,
                stop.clone(),
            )
            .instrument(info_span!("playback")),
        ));
        let mut capture = AbortOnDropHandle::new(tokio::spawn(
            capture_utterance(
                Arc::clone(&self.config),
                Arc::clone(&self.collaborators.source),
                Arc::clone(&self.collaborators.stt),
                self.cancel.child_token(),
            )
            .instrument(info_span!("barge_in_capture")),
        ));

        enum First {
            Captured(Result<Option<String>>),
            Played(Result<Playback>),
        }
        let first = tokio::select! {
            captured = &mut capture => First::Captured(joined(captured)),
            played = &mut playback => First::Played(joined(played)),
        };

        match first {
            First::Captured(Ok(Some(next))) if !self.cancel.is_cancelled() => {
                info!(transcript = %next, "user spoke over the response, stopping playback");
                stop.cancel();
                if let Err(e) = joined(playback.await) {
                    debug!(error = %e, "interrupted playback ended with an error");
                }
                self.pending = Some(next.clone());
                self.set_state(TurnState::Interrupted);
                Ok(TurnOutcome::Interrupted { transcript: next })
            }
            First::Captured(captured) => {
                let played = joined(playback.await);
                self.finish_response(captured, played)
            }
            First::Played(played) => {
                let captured = joined(capture.await);
                self.finish_response(captured, played)
            }
        }
    }

    fn finish_response(
        &mut self,
        captured: Result<Option<String>>,
        played: Result<Playback>,
    ) -> Result<TurnOutcome> {
        if let Ok(Some(next)) = &captured {
            self.pending = Some(next.clone());
        }
        self.set_state(TurnState::Completed);
        if self.cancel.is_cancelled() {
            return Ok(TurnOutcome::Cancelled);
        }
        played?;
        captured?;
        Ok(TurnOutcome::Completed)
    }

    /// Run cycles until shutdown or until the audio source ends.
    ///
    /// A turn-fatal error abandons the current turn and listening resumes.
    ///
    /// # Errors
    ///
    /// Returns any other error, which would fail every following cycle too.
    pub async fn run_forever(&mut self) -> Result<()> {
        info!(session = %self.session.key(), "turn coordinator started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.run_cycle().await {
                Ok(TurnOutcome::Cancelled) => break,
                Ok(TurnOutcome::Silent) => {
                    info!("audio source ended");
                    break;
                }
                Ok(outcome) => debug!(?outcome, "turn finished"),
                Err(e) if e.is_turn_fatal() => {
                    warn!(error = %e, "turn failed, listening again");
                }
                Err(e) => {
                    error!(error = %e, "turn coordinator stopping");
                    return Err(e);
                }
            }
        }
        info!("turn coordinator stopped");
        Ok(())
    }
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.unwrap_or_else(|e| Err(SpeechError::Channel(format!("turn task failed: {e}"))))
}

/// Capture audio until the first final transcript.
///
/// Returns `None` if the audio ran out or `cancel` fired first.
async fn capture_utterance(
    config: Arc<PipelineConfig>,
    source: Arc<dyn AudioSource>,
    stt: Arc<dyn SttCollaborator>,
    cancel: CancellationToken,
) -> Result<Option<String>> {
    let audio = tokio::select! {
        () = cancel.cancelled() => return Ok(None),
        audio = source.open() => audio?,
    };
    let mut transcripts = TranscriptionStage::new(config, stt).run(audio);
    let outcome = loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break Ok(None),
            item = transcripts.next() => item,
        };
        match item {
            Some(Ok(event)) => {
                if let EventKind::FinalTranscript { text } = event.into_kind() {
                    break Ok(Some(text));
                }
            }
            Some(Err(e)) => break Err(e),
            None => break Ok(None),
        }
    };
    transcripts.close().await;
    outcome
}

/// Ask the agent to answer `transcript` and collect the response text.
///
/// Returns `None` if `cancel` fired first.
async fn respond(
    config: Arc<PipelineConfig>,
    agent: Arc<dyn AgentCollaborator>,
    session: Session,
    transcript: String,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let mut answered = AgentStage::new(config, agent, session)
        .run(TaskStream::from_items(vec![Event::final_transcript(transcript)]));
    let mut response = String::new();
    let outcome = loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break Ok(None),
            item = answered.next() => item,
        };
        match item {
            Some(Ok(event)) => {
                if let EventKind::AgentTextChunk { text } = event.kind() {
                    response.push_str(text);
                }
            }
            Some(Err(e)) => break Err(e),
            None => break Ok(Some(std::mem::take(&mut response))),
        }
    };
    answered.close().await;
    outcome
}

/// Synthesize `text` into `sink` until it plays out or `stop` fires.
async fn play(
    config: Arc<PipelineConfig>,
    tts: Arc<dyn TtsCollaborator>,
    sink: Arc<dyn AudioSink>,
    text: String,
    stop: CancellationToken,
) -> Result<Playback> {
    let mut voiced = SynthesisStage::new(config, tts).run(TaskStream::from_items(vec![
        Event::agent_text(text),
        Event::agent_turn_end(),
    ]));
    let outcome = loop {
        let item = tokio::select! {
            biased;
            () = stop.cancelled() => break Ok(Playback::Stopped),
            item = voiced.next() => item,
        };
        let audio = match item {
            Some(Ok(event)) => match event.into_kind() {
                EventKind::AudioChunk { audio } => audio,
                _ => continue,
            },
            Some(Err(e)) => break Err(e),
            None => break Ok(Playback::Finished),
        };
        let written = tokio::select! {
            biased;
            () = stop.cancelled() => break Ok(Playback::Stopped),
            written = sink.write(audio) => written,
        };
        if let Err(e) = written {
            break Err(e);
        }
    };
    if let Ok(Playback::Stopped) = outcome {
        if let Err(e) = sink.stop().await {
            debug!(error = %e, "sink stop failed");
        }
    }
    voiced.close().await;
    debug!(?outcome, "playback ended");
    outcome
}
