//! Agent stage: passes every event through and answers final transcripts.

use crate::agent::{AgentCollaborator, AgentEvent};
use crate::config::PipelineConfig;
use crate::error::{Result, SpeechError};
use crate::pipeline::EventStream;
use crate::pipeline::messages::{Event, EventKind};
use crate::pipeline::stream::{StreamSink, TaskStream};
use crate::session::Session;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Wraps an agent collaborator as a passthrough stage.
pub struct AgentStage {
    config: Arc<PipelineConfig>,
    agent: Arc<dyn AgentCollaborator>,
    session: Session,
}

/// How one agent turn ended.
enum TurnEnd {
    Done,
    Stopped,
}

impl AgentStage {
    /// Create a stage answering within `session`.
    pub fn new(
        config: Arc<PipelineConfig>,
        agent: Arc<dyn AgentCollaborator>,
        session: Session,
    ) -> Self {
        Self {
            config,
            agent,
            session,
        }
    }

    /// Re-emit every input event and, after each final transcript, the
    /// agent's answer followed by one [`EventKind::AgentTurnEnd`].
    ///
    /// Final transcripts are answered one at a time, in arrival order.
    pub fn run(self, events_in: EventStream) -> EventStream {
        let capacity = self.config.channels.event_capacity;
        let span = info_span!("agent_stage", session = %self.session.key());
        TaskStream::spawn(capacity, move |sink, cancel| {
            self.pump(events_in, sink, cancel).instrument(span)
        })
    }

    async fn pump(
        self,
        mut events_in: EventStream,
        sink: StreamSink<Event>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let outcome = loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                event = events_in.next() => event,
            };
            let event = match event {
                Some(Ok(event)) => event,
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            };

            let transcript = match event.kind() {
                EventKind::FinalTranscript { text } => Some(text.clone()),
                _ => None,
            };
            if !sink.send(event).await {
                break Ok(());
            }
            let Some(transcript) = transcript else {
                continue;
            };
            match self.answer(&transcript, &sink, &cancel).await {
                Ok(TurnEnd::Done) => {}
                Ok(TurnEnd::Stopped) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        events_in.close().await;
        outcome
    }

    async fn answer(
        &self,
        transcript: &str,
        sink: &StreamSink<Event>,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd> {
        if transcript.trim().is_empty() {
            return Ok(TurnEnd::Done);
        }
        if !self.agent.is_ready() {
            return Err(SpeechError::NotReady(
                "agent invoked before initialisation finished".into(),
            ));
        }

        self.session.record_user(transcript);
        info!(%transcript, "invoking agent");
        let mut reply = tokio::select! {
            () = cancel.cancelled() => return Ok(TurnEnd::Stopped),
            reply = self.agent.invoke(self.session.key(), transcript) => reply?,
        };

        let mut response = String::new();
        let mut open_calls: HashSet<String> = HashSet::new();
        loop {
            let item = tokio::select! {
                () = cancel.cancelled() => return Ok(TurnEnd::Stopped),
                item = reply.next() => item,
            };
            let event = match item {
                Some(Ok(AgentEvent::Token(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    response.push_str(&text);
                    Event::agent_text(text)
                }
                Some(Ok(AgentEvent::ToolCall { id, name, args })) => {
                    debug!(%id, %name, "tool call");
                    open_calls.insert(id.clone());
                    Event::tool_call(id, name, args)
                }
                Some(Ok(AgentEvent::ToolResult { id, name, result })) => {
                    if !open_calls.remove(&id) {
                        warn!(%id, %name, "skipping tool result without a matching call");
                        continue;
                    }
                    Event::tool_result(id, name, result)
                }
                Some(Err(SpeechError::Malformed(detail))) => {
                    warn!(%detail, "skipping malformed agent message");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => break,
            };
            if !sink.send(event).await {
                return Ok(TurnEnd::Stopped);
            }
        }

        if !response.is_empty() {
            self.session.record_assistant(&response);
        }
        if !sink.send(Event::agent_turn_end()).await {
            return Ok(TurnEnd::Stopped);
        }
        debug!(chars = response.len(), "agent turn complete");
        Ok(TurnEnd::Done)
    }
}
