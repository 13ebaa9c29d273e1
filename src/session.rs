//! Per-conversation session state.
//!
//! A [`Session`] is built by whoever starts a conversation and handed to the
//! stages that need it. Its key is the handle the agent collaborator uses for
//! multi-turn memory; its history is append-only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Stable identifier for one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey(Uuid);

impl SessionKey {
    /// A fresh random key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

/// Who said something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The human speaker.
    User,
    /// The agent.
    Assistant,
}

/// One recorded utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Speaker.
    pub role: Role,
    /// What was said.
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
}

/// A conversation: key plus shared append-only history.
///
/// Clones share the same history.
#[derive(Debug, Clone, Default)]
pub struct Session {
    key: SessionKey,
    history: Arc<Mutex<Vec<HistoryEntry>>>,
}

impl Session {
    /// Start a new conversation with a fresh key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume a conversation under a known key with empty local history.
    pub fn with_key(key: SessionKey) -> Self {
        Self {
            key,
            history: Arc::default(),
        }
    }

    /// The conversation key.
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Append a user utterance.
    pub fn record_user(&self, text: &str) {
        self.append(Role::User, text);
    }

    /// Append an agent response.
    pub fn record_assistant(&self, text: &str) {
        self.append(Role::Assistant, text);
    }

    /// Snapshot of the history so far.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append(&self, role: Role, text: &str) {
        let entry = HistoryEntry {
            role,
            text: text.to_owned(),
            ts: crate::pipeline::messages::now_ms(),
        };
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}
