//! Websocket relay driven by a real client.

use crate::helpers::{EchoAgent, Fakes, eventually, init_tracing};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use voxpipe::PipelineConfig;
use voxpipe::relay::{CollaboratorFactory, RelayServer};

fn relay_config(forward_events: bool) -> Arc<PipelineConfig> {
    let mut config = PipelineConfig::default();
    config.relay.bind = "127.0.0.1:0".into();
    config.relay.forward_events = forward_events;
    Arc::new(config)
}

fn factory(fakes: &Arc<Fakes>) -> Arc<dyn CollaboratorFactory> {
    let fakes = Arc::clone(fakes);
    Arc::new(move || fakes.collaborators())
}

#[tokio::test]
async fn client_audio_is_answered_with_audio_frames() {
    init_tracing();
    let fakes = Arc::new(Fakes::new(Duration::ZERO));
    let server = RelayServer::start(relay_config(false), factory(&fakes))
        .await
        .unwrap();

    let url = format!("ws://{}/ws", server.addr());
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    for word in ["where", "is", "my", "order."] {
        client
            .send(Message::Binary(word.as_bytes().to_vec()))
            .await
            .unwrap();
    }
    // Empty frames are ignored.
    client.send(Message::Binary(Vec::new())).await.unwrap();

    let mut spoken = Vec::new();
    while spoken.len() < 6 {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no reply from relay")
            .unwrap()
            .unwrap();
        match message {
            Message::Binary(frame) => spoken.push(String::from_utf8(frame).unwrap()),
            other => panic!("unexpected frame without forward_events: {other:?}"),
        }
    }
    assert_eq!(
        spoken,
        vec!["You", "said:", "where", "is", "my", "order."]
    );

    client.close(None).await.unwrap();
    eventually(|| fakes.stt.live.open() == 0 && fakes.tts.live.open() == 0).await;
    assert_eq!(fakes.agent.heard(), vec!["where is my order."]);
}

#[tokio::test]
async fn forwarded_events_arrive_as_json_text() {
    let fakes = Arc::new(Fakes::new(Duration::ZERO));
    let server = RelayServer::start(relay_config(true), factory(&fakes))
        .await
        .unwrap();

    let url = format!("ws://{}/ws", server.addr());
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
        .send(Message::Binary(b"thanks.".to_vec()))
        .await
        .unwrap();

    let mut types = Vec::new();
    let mut audio = 0;
    while !types.iter().any(|t| t == "agent_turn_end") || audio < 3 {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no reply from relay")
            .unwrap()
            .unwrap();
        match message {
            Message::Text(json) => {
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                types.push(value["type"].as_str().unwrap().to_owned());
            }
            Message::Binary(_) => audio += 1,
            _ => {}
        }
    }
    assert_eq!(
        types,
        vec![
            "final_transcript",
            "agent_text_chunk",
            "agent_text_chunk",
            "agent_turn_end",
        ]
    );
    assert_eq!(audio, 3);
}

#[tokio::test]
async fn failed_turn_leaves_the_connection_listening() {
    init_tracing();
    let fakes = Arc::new(Fakes::with_agent(EchoAgent::warming_up(1), Duration::ZERO));
    let server = RelayServer::start(relay_config(false), factory(&fakes))
        .await
        .unwrap();

    let url = format!("ws://{}/ws", server.addr());
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
        .send(Message::Binary(b"hello.".to_vec()))
        .await
        .unwrap();
    // The unready agent fails the first turn; the relay listens again.
    eventually(|| fakes.stt.live.opened() == 2 && fakes.stt.live.open() == 1).await;

    for word in ["are", "you", "up."] {
        client
            .send(Message::Binary(word.as_bytes().to_vec()))
            .await
            .unwrap();
    }
    let mut spoken = Vec::new();
    while spoken.len() < 5 {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no reply after the failed turn")
            .unwrap()
            .unwrap();
        if let Message::Binary(frame) = message {
            spoken.push(String::from_utf8(frame).unwrap());
        }
    }
    assert_eq!(spoken, vec!["You", "said:", "are", "you", "up."]);
    assert_eq!(fakes.agent.heard(), vec!["are you up."]);

    client.close(None).await.unwrap();
    eventually(|| fakes.stt.live.open() == 0 && fakes.tts.live.open() == 0).await;
}

#[tokio::test]
async fn every_connection_gets_its_own_pipeline() {
    let fakes = Arc::new(Fakes::new(Duration::ZERO));
    let server = RelayServer::start(relay_config(false), factory(&fakes))
        .await
        .unwrap();
    let url = format!("ws://{}/ws", server.addr());

    let (mut first, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    let (mut second, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    eventually(|| fakes.stt.live.open() == 2).await;

    first.close(None).await.unwrap();
    eventually(|| fakes.stt.live.open() == 1).await;
    second.close(None).await.unwrap();
    eventually(|| fakes.stt.live.open() == 0).await;
    assert_eq!(fakes.stt.live.opened(), 2);
}

#[tokio::test]
async fn unknown_path_is_not_upgraded() {
    let fakes = Arc::new(Fakes::new(Duration::ZERO));
    let mut server = RelayServer::start(relay_config(false), factory(&fakes))
        .await
        .unwrap();
    let url = format!("ws://{}/elsewhere", server.addr());
    assert!(tokio_tungstenite::connect_async(url).await.is_err());

    server.shutdown();
    tokio::time::timeout(Duration::from_secs(5), server.stopped())
        .await
        .expect("server did not stop");
}
