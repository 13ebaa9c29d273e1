//! Events passed between pipeline stages.
//!
//! Every stage speaks the same closed vocabulary. A turn looks like this on
//! the wire between the agent and synthesis stages:
//!
//! ```text
//! UserAudio* → PartialTranscript* → FinalTranscript
//!            → (AgentTextChunk | ToolCall → ToolResult)* → AgentTurnEnd
//!            → AudioChunk*
//! ```
//!
//! Events for turn *n* always precede events for turn *n + 1* in a single
//! stage's own output. Once built, an event is never mutated: fields are only
//! reachable through accessors and audio payloads are reference-counted
//! [`Bytes`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One pipeline event: a creation timestamp plus a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    ts: i64,
    #[serde(flatten)]
    kind: EventKind,
}

/// The payload of an [`Event`].
///
/// The set is closed: matching on it must be exhaustive, so a new variant is
/// a compile error at every consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Raw PCM16 mono frame from the user.
    UserAudio {
        /// Frame bytes.
        #[serde(with = "base64_bytes")]
        audio: Bytes,
    },
    /// Provisional STT hypothesis. Never input to the agent.
    PartialTranscript {
        /// Hypothesis text.
        text: String,
    },
    /// Committed utterance. Exactly one per turn.
    FinalTranscript {
        /// Transcript text.
        text: String,
    },
    /// Incremental agent output.
    AgentTextChunk {
        /// Token text.
        text: String,
    },
    /// A tool invocation started by the agent.
    ToolCall {
        /// Pairing id, echoed by the matching [`EventKind::ToolResult`].
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        args: serde_json::Value,
    },
    /// The result of an earlier [`EventKind::ToolCall`].
    ToolResult {
        /// Id of the call this answers.
        id: String,
        /// Tool name.
        name: String,
        /// Tool output.
        result: String,
    },
    /// The agent has nothing more to say for this turn.
    AgentTurnEnd,
    /// Synthesized speech fragment, playable as it arrives.
    AudioChunk {
        /// PCM16 bytes.
        #[serde(with = "base64_bytes")]
        audio: Bytes,
    },
}

impl Event {
    fn stamped(kind: EventKind) -> Self {
        Self { ts: now_ms(), kind }
    }

    /// A user audio frame.
    pub fn user_audio(audio: impl Into<Bytes>) -> Self {
        Self::stamped(EventKind::UserAudio {
            audio: audio.into(),
        })
    }

    /// A provisional transcript.
    pub fn partial_transcript(text: impl Into<String>) -> Self {
        Self::stamped(EventKind::PartialTranscript { text: text.into() })
    }

    /// A committed transcript.
    pub fn final_transcript(text: impl Into<String>) -> Self {
        Self::stamped(EventKind::FinalTranscript { text: text.into() })
    }

    /// An agent token.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::stamped(EventKind::AgentTextChunk { text: text.into() })
    }

    /// A tool call.
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::stamped(EventKind::ToolCall {
            id: id.into(),
            name: name.into(),
            args,
        })
    }

    /// A tool result.
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self::stamped(EventKind::ToolResult {
            id: id.into(),
            name: name.into(),
            result: result.into(),
        })
    }

    /// End-of-turn sentinel.
    pub fn agent_turn_end() -> Self {
        Self::stamped(EventKind::AgentTurnEnd)
    }

    /// A synthesized audio fragment.
    pub fn audio_chunk(audio: impl Into<Bytes>) -> Self {
        Self::stamped(EventKind::AudioChunk {
            audio: audio.into(),
        })
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn ts(&self) -> i64 {
        self.ts
    }

    /// The payload.
    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// Consume the event, keeping only the payload.
    pub fn into_kind(self) -> EventKind {
        self.kind
    }

    /// The serialized `type` tag, e.g. `"final_transcript"`.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::UserAudio { .. } => "user_audio",
            EventKind::PartialTranscript { .. } => "partial_transcript",
            EventKind::FinalTranscript { .. } => "final_transcript",
            EventKind::AgentTextChunk { .. } => "agent_text_chunk",
            EventKind::ToolCall { .. } => "tool_call",
            EventKind::ToolResult { .. } => "tool_result",
            EventKind::AgentTurnEnd => "agent_turn_end",
            EventKind::AudioChunk { .. } => "audio_chunk",
        }
    }

    /// JSON rendering for observers such as a browser UI.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Malformed`](crate::SpeechError::Malformed) if a
    /// tool argument cannot be rendered.
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::SpeechError::Malformed(e.to_string()))
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
