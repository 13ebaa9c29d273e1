//! The three-stage voice pipeline and its turn coordinator.
//!
//! ```text
//! audio ─▶ TranscriptionStage ─▶ AgentStage ─▶ SynthesisStage ─▶ events
//!           partial/final          + tokens,      + audio chunks
//!           transcripts            tool events,
//!                                  turn end
//! ```
//!
//! Each stage is a task-backed [`EventStream`] owning the stream it reads
//! from, so closing the last stream tears the whole chain down in order.

pub mod agent_stage;
pub mod coordinator;
pub mod merge;
pub mod messages;
pub mod stream;
pub mod synthesis;
pub mod transcription;

use crate::agent::AgentCollaborator;
use crate::audio::AudioStream;
use crate::config::PipelineConfig;
use crate::session::Session;
use crate::stt::SttCollaborator;
use crate::tts::TtsCollaborator;
use agent_stage::AgentStage;
use messages::Event;
use std::sync::Arc;
use stream::TaskStream;
use synthesis::SynthesisStage;
use tracing::info;
use transcription::TranscriptionStage;

/// Stream of pipeline events.
pub type EventStream = TaskStream<Event>;

/// The external systems one pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Speech-to-text.
    pub stt: Arc<dyn SttCollaborator>,
    /// Conversational agent.
    pub agent: Arc<dyn AgentCollaborator>,
    /// Text-to-speech.
    pub tts: Arc<dyn TtsCollaborator>,
}

/// A configured pipeline for one conversation.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    session: Session,
}

impl Pipeline {
    /// Create a pipeline answering within `session`.
    pub fn new(config: Arc<PipelineConfig>, collaborators: Collaborators, session: Session) -> Self {
        Self {
            config,
            collaborators,
            session,
        }
    }

    /// The conversation this pipeline answers in.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Chain the three stages over `audio_in`.
    ///
    /// The result carries every transcript, agent and audio event. Each stage
    /// opens its own collaborator connection; none is shared.
    pub fn run(&self, audio_in: AudioStream) -> EventStream {
        info!(session = %self.session.key(), "starting pipeline");
        let transcripts =
            TranscriptionStage::new(Arc::clone(&self.config), Arc::clone(&self.collaborators.stt))
                .run(audio_in);
        let answered = AgentStage::new(
            Arc::clone(&self.config),
            Arc::clone(&self.collaborators.agent),
            self.session.clone(),
        )
        .run(transcripts);
        SynthesisStage::new(Arc::clone(&self.config), Arc::clone(&self.collaborators.tts))
            .run(answered)
    }
}

/// Run a one-off pipeline over `audio_in` in a fresh conversation.
pub fn run_pipeline(
    config: Arc<PipelineConfig>,
    collaborators: Collaborators,
    audio_in: AudioStream,
) -> EventStream {
    Pipeline::new(config, collaborators, Session::new()).run(audio_in)
}
