//! Configuration types for the voice pipeline.

use crate::error::{Result, SpeechError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for the voice pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounds for every inter-stage channel.
    pub channels: ChannelConfig,
    /// Speech-to-text collaborator settings.
    pub stt: SttConfig,
    /// Text-to-speech collaborator settings.
    pub tts: TtsConfig,
    /// Network relay settings.
    pub relay: RelayConfig,
}

/// Channel capacities. No channel in the core is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Audio frames buffered between a source and the STT sender.
    pub audio_capacity: usize,
    /// Events buffered between two stages.
    pub event_capacity: usize,
    /// Items buffered inside a fan-in merge.
    pub merge_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            audio_capacity: 64,
            event_capacity: 128,
            merge_capacity: 32,
        }
    }
}

/// Speech-to-text collaborator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Upper bound on the connection handshake.
    pub handshake_timeout_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
        }
    }
}

/// Text-to-speech collaborator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Upper bound on the connection handshake.
    pub handshake_timeout_ms: u64,
    /// How long a closing connection may keep delivering audio that was
    /// already requested.
    pub drain_timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 30_000,
        }
    }
}

/// Network relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Socket address to bind.
    pub bind: String,
    /// Websocket endpoint path.
    pub path: String,
    /// Also forward non-audio events to the client as JSON text frames.
    pub forward_events: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_owned(),
            path: "/ws".to_owned(),
            forward_events: false,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// [`validate`](Self::validate).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| SpeechError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| SpeechError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/voxpipe/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("voxpipe").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("voxpipe")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/voxpipe-config/config.toml")
        }
    }

    /// Reject values that would make a channel or wait unbounded or useless.
    ///
    /// # Errors
    ///
    /// Returns [`SpeechError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let checks: [(&str, bool); 5] = [
            ("channels.audio_capacity", self.channels.audio_capacity > 0),
            ("channels.event_capacity", self.channels.event_capacity > 0),
            ("channels.merge_capacity", self.channels.merge_capacity > 0),
            ("stt.handshake_timeout_ms", self.stt.handshake_timeout_ms > 0),
            ("tts.handshake_timeout_ms", self.tts.handshake_timeout_ms > 0),
        ];
        match checks.iter().find(|(_, ok)| !ok) {
            Some((field, _)) => Err(SpeechError::Config(format!("{field} must be non-zero"))),
            None => Ok(()),
        }
    }

    /// STT connection handshake bound.
    pub fn stt_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.stt.handshake_timeout_ms)
    }

    /// TTS connection handshake bound.
    pub fn tts_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tts.handshake_timeout_ms)
    }

    /// Upper bound on draining a closing TTS connection.
    pub fn tts_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.tts.drain_timeout_ms)
    }
}
