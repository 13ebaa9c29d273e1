//! Config files as a deployment would write them by hand.

use voxpipe::config::ChannelConfig;
use voxpipe::{PipelineConfig, SpeechError};

#[test]
fn handwritten_file_overrides_only_what_it_names() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxpipe.toml");
    std::fs::write(
        &path,
        r#"
[channels]
event_capacity = 16

[tts]
drain_timeout_ms = 1500

[relay]
bind = "0.0.0.0:9000"
forward_events = true
"#,
    )
    .unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    assert_eq!(config.channels.event_capacity, 16);
    assert_eq!(config.channels.audio_capacity, 64);
    assert_eq!(config.tts_drain_timeout().as_millis(), 1_500);
    assert_eq!(config.relay.bind, "0.0.0.0:9000");
    assert_eq!(config.relay.path, "/ws");
    assert!(config.relay.forward_events);
}

#[test]
fn zero_handshake_timeout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxpipe.toml");
    std::fs::write(&path, "[stt]\nhandshake_timeout_ms = 0\n").unwrap();

    let err = PipelineConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, SpeechError::Config(ref msg) if msg.contains("stt.handshake_timeout_ms")));
}

#[test]
fn default_path_lives_under_voxpipe() {
    let path = PipelineConfig::default_config_path();
    assert!(path.ends_with("voxpipe/config.toml"));
}

#[test]
fn unknown_sections_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("voxpipe.toml");
    std::fs::write(
        &path,
        "[audio]\nsample_rate = 48000\n\n[channels]\naudio_capacity = 8\n",
    )
    .unwrap();

    let config = PipelineConfig::from_file(&path).unwrap();
    let expected = PipelineConfig {
        channels: ChannelConfig {
            audio_capacity: 8,
            ..Default::default()
        },
        ..Default::default()
    };
    assert_eq!(config, expected);
}
