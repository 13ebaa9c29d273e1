//! Conversational agent collaborator seam.

use crate::error::Result;
use crate::session::SessionKey;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// One streamed item from an agent invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// A response token.
    Token(String),
    /// The agent started a tool.
    ToolCall {
        /// Pairing id.
        id: String,
        /// Tool name.
        name: String,
        /// Tool arguments.
        args: serde_json::Value,
    },
    /// A tool finished.
    ToolResult {
        /// Id of the matching call.
        id: String,
        /// Tool name.
        name: String,
        /// Tool output.
        result: String,
    },
}

/// Stream of agent output for one invocation.
pub type AgentEventStream = BoxStream<'static, Result<AgentEvent>>;

/// A conversational agent with per-session memory.
///
/// Callers never run two invocations for the same session key at once.
#[async_trait]
pub trait AgentCollaborator: Send + Sync {
    /// Whether asynchronous startup has finished.
    fn is_ready(&self) -> bool {
        true
    }

    /// Start answering `text` within the conversation `session`.
    async fn invoke(&self, session: SessionKey, text: &str) -> Result<AgentEventStream>;
}
