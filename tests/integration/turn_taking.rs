//! Standalone turn-taking with the channel-backed audio endpoints.

use crate::helpers::{Fakes, eventually, init_tracing};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use voxpipe::audio::{ChannelSink, ChannelSource};
use voxpipe::session::Role;
use voxpipe::{
    PipelineConfig, Session, TurnCollaborators, TurnCoordinator, TurnOutcome, TurnState,
};

struct Rig {
    coordinator: TurnCoordinator,
    mic: mpsc::Sender<Bytes>,
    speaker: mpsc::Receiver<Bytes>,
    sink: Arc<ChannelSink>,
    fakes: Fakes,
}

fn rig(tts_delay: Duration) -> Rig {
    let fakes = Fakes::new(tts_delay);
    let (mic, source) = ChannelSource::new(32);
    let (sink, speaker) = ChannelSink::new(1_024);
    let sink = Arc::new(sink);
    let collaborators = TurnCollaborators {
        source: Arc::new(source),
        sink: sink.clone(),
        stt: fakes.stt.clone(),
        agent: fakes.agent.clone(),
        tts: fakes.tts.clone(),
    };
    let coordinator = TurnCoordinator::new(
        Arc::new(PipelineConfig::default()),
        collaborators,
        Session::new(),
    );
    Rig {
        coordinator,
        mic,
        speaker,
        sink,
        fakes,
    }
}

async fn say(mic: &mpsc::Sender<Bytes>, sentence: &str) {
    for word in sentence.split_whitespace() {
        mic.send(Bytes::from(word.to_owned())).await.unwrap();
    }
}

fn drain(speaker: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut played = Vec::new();
    while let Ok(frame) = speaker.try_recv() {
        played.push(String::from_utf8_lossy(&frame).into_owned());
    }
    played
}

#[tokio::test]
async fn uninterrupted_response_plays_in_full() {
    init_tracing();
    let mut rig = rig(Duration::ZERO);
    say(&rig.mic, "good morning.").await;
    // With the microphone gone, listening during playback hears nothing.
    drop(rig.mic);

    let outcome = tokio::time::timeout(Duration::from_secs(5), rig.coordinator.run_cycle())
        .await
        .expect("cycle hung")
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(
        drain(&mut rig.speaker),
        vec!["You", "said:", "good", "morning."]
    );
    assert_eq!(rig.sink.stop_count(), 0);

    let history = rig.coordinator.session().history();
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].text, "good morning.");
    assert_eq!(history[1].text, "You said: good morning.");

    let outcome = rig.coordinator.run_cycle().await.unwrap();
    assert_eq!(outcome, TurnOutcome::Silent);
    assert_eq!(rig.fakes.stt.live.open(), 0);
    assert_eq!(rig.fakes.tts.live.open(), 0);
}

#[tokio::test]
async fn speaking_over_the_response_interrupts_it() {
    init_tracing();
    let mut rig = rig(Duration::from_millis(50));
    say(&rig.mic, "read me the whole menu please.").await;

    let mut states = rig.coordinator.subscribe();
    let mic = rig.mic.clone();
    let barge_in = tokio::spawn(async move {
        states
            .wait_for(|s| *s == TurnState::Responding)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        say(&mic, "stop.").await;
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), rig.coordinator.run_cycle())
        .await
        .expect("cycle hung")
        .unwrap();
    barge_in.await.unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Interrupted {
            transcript: "stop.".into()
        }
    );
    assert_eq!(rig.coordinator.state(), TurnState::Interrupted);
    assert_eq!(rig.sink.stop_count(), 1);
    let played = drain(&mut rig.speaker);
    assert!(!played.is_empty());
    assert!(played.len() < 8, "playback was not cut short: {played:?}");
    eventually(|| rig.fakes.tts.live.open() == 0).await;

    // The interruption is answered without listening again.
    let opened = rig.fakes.stt.live.opened();
    drop(rig.mic);
    let outcome = tokio::time::timeout(Duration::from_secs(5), rig.coordinator.run_cycle())
        .await
        .expect("cycle hung")
        .unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(
        rig.fakes.agent.heard(),
        vec!["read me the whole menu please.", "stop."]
    );
    // Only the capture that runs alongside the second response was opened.
    assert_eq!(rig.fakes.stt.live.opened(), opened + 1);
    assert_eq!(drain(&mut rig.speaker), vec!["You", "said:", "stop."]);
}

#[tokio::test]
async fn run_forever_stops_on_shutdown() {
    let rig = rig(Duration::ZERO);
    let mut coordinator = rig.coordinator;
    let cancel = coordinator.cancel_token();
    let mut states = coordinator.subscribe();

    let driver = tokio::spawn(async move {
        let result = coordinator.run_forever().await;
        (result, coordinator)
    });
    states
        .wait_for(|s| *s == TurnState::Listening)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let (result, coordinator) = tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("run_forever ignored shutdown")
        .unwrap();
    result.unwrap();
    assert!(coordinator.session().is_empty());
    assert_eq!(rig.fakes.stt.live.open(), 0);
    drop(rig.mic);
}
