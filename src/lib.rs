//! Voxpipe: concurrency core for real-time voice conversations.
//!
//! Audio flows through speech-to-text, a conversational agent, and
//! text-to-speech, and the user can talk over a response to cut it short:
//! Audio in → STT → Agent → TTS → Audio out
//!
//! # Architecture
//!
//! The pipeline is built from task-backed streams that own their producers:
//! - **Transcription**: audio frames into partial and final transcripts
//! - **Agent**: final transcripts into streamed tokens, tool events and a turn end
//! - **Synthesis**: completed agent turns into audio chunks, merged with passthrough
//! - **Turn coordination**: races the next utterance against response playback
//! - **Relay**: serves the pipeline to websocket clients
//!
//! Vendor protocols and audio devices are collaborators behind the traits in
//! [`stt`], [`agent`], [`tts`] and [`audio`].

pub mod agent;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod session;
pub mod stt;
pub mod tts;


pub use config::PipelineConfig;
pub use error::{Result, SpeechError};
pub use pipeline::coordinator::{TurnCollaborators, TurnCoordinator, TurnOutcome, TurnState};
pub use pipeline::messages::{Event, EventKind};
pub use pipeline::stream::TaskStream;
pub use pipeline::{Collaborators, EventStream, Pipeline, run_pipeline};
pub use session::{Session, SessionKey};
