//! Websocket relay: one pipeline per connected client.
//!
//! Binary frames from the client are PCM16 audio. Synthesized audio goes back
//! as binary frames; with `relay.forward_events` set, every other event is
//! also sent as a JSON text frame.
//!
//! A turn-fatal error rebuilds the pipeline in the same session over the
//! same inbound audio; any other error, or the client leaving, ends the
//! connection.

use crate::audio::{AudioSource, ChannelSource};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipeline::messages::EventKind;
use crate::pipeline::{Collaborators, EventStream, Pipeline};
use crate::session::Session;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Builds a fresh set of collaborators for each client connection.
pub trait CollaboratorFactory: Send + Sync + 'static {
    /// Collaborators for one new connection.
    fn collaborators(&self) -> Collaborators;
}

impl<F> CollaboratorFactory for F
where
    F: Fn() -> Collaborators + Send + Sync + 'static,
{
    fn collaborators(&self) -> Collaborators {
        self()
    }
}

/// Shared state for the websocket handler.
#[derive(Clone)]
pub struct RelayState {
    config: Arc<PipelineConfig>,
    factory: Arc<dyn CollaboratorFactory>,
}

impl RelayState {
    pub fn new(config: Arc<PipelineConfig>, factory: Arc<dyn CollaboratorFactory>) -> Self {
        Self { config, factory }
    }
}

/// Router serving the websocket endpoint at `relay.path`.
pub fn router(state: RelayState) -> Router {
    let path = state.config.relay.path.clone();
    Router::new()
        .route(&path, get(handle_upgrade))
        .with_state(state)
}

async fn handle_upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let session = Session::new();
    let span = info_span!("relay_connection", session = %session.key());
    relay(socket, state, session).instrument(span).await;
}

async fn relay(socket: WebSocket, state: RelayState, session: Session) {
    info!("client connected");
    let (mut outbound, inbound) = socket.split();

    // Inbound audio outlives every pipeline built for this socket.
    let disconnected = CancellationToken::new();
    let (frames, source) = ChannelSource::new(state.config.channels.audio_capacity);
    let _reader = AbortOnDropHandle::new(tokio::spawn(
        forward_client_audio(client_audio(inbound, disconnected.clone()), frames)
            .instrument(info_span!("client_audio")),
    ));
    let pipeline = Pipeline::new(Arc::clone(&state.config), state.factory.collaborators(), session);

    loop {
        let audio = match source.open().await {
            Ok(audio) => audio,
            Err(e) => {
                warn!(error = %e, "client audio unavailable");
                break;
            }
        };
        let events = pipeline.run(audio);
        let next = send_to_client(
            events,
            &mut outbound,
            state.config.relay.forward_events,
            &disconnected,
        )
        .await;
        if next == AfterPipeline::Hangup {
            break;
        }
        info!("listening again");
    }

    if let Err(e) = outbound.close().await {
        debug!(error = %e, "websocket close failed");
    }
    info!("client disconnected");
}

#[derive(Debug, PartialEq, Eq)]
enum AfterPipeline {
    /// The turn failed but the client is still there.
    Listen,
    Hangup,
}

/// Send pipeline output to the client until the pipeline or the client ends.
/// The pipeline is closed before returning.
async fn send_to_client(
    mut events: EventStream,
    outbound: &mut SplitSink<WebSocket, Message>,
    forward_events: bool,
    disconnected: &CancellationToken,
) -> AfterPipeline {
    let next = loop {
        let item = tokio::select! {
            () = disconnected.cancelled() => break AfterPipeline::Hangup,
            item = events.next() => item,
        };
        let event = match item {
            Some(Ok(event)) => event,
            Some(Err(e)) if e.is_turn_fatal() => {
                warn!(error = %e, "turn failed");
                break AfterPipeline::Listen;
            }
            Some(Err(e)) => {
                warn!(error = %e, "pipeline failed, closing connection");
                break AfterPipeline::Hangup;
            }
            None => break AfterPipeline::Hangup,
        };
        let message = match event.kind() {
            EventKind::AudioChunk { audio } => Message::Binary(audio.clone()),
            _ if forward_events => match event.to_json() {
                Ok(json) => Message::Text(json.into()),
                Err(e) => {
                    warn!(error = %e, "event not serializable, skipping");
                    continue;
                }
            },
            _ => continue,
        };
        if outbound.send(message).await.is_err() {
            debug!("client went away mid-send");
            break AfterPipeline::Hangup;
        }
    };
    events.close().await;
    next
}

async fn forward_client_audio(
    audio: impl Stream<Item = Bytes> + Send,
    frames: mpsc::Sender<Bytes>,
) {
    let mut audio = std::pin::pin!(audio);
    while let Some(frame) = audio.next().await {
        if frames.send(frame).await.is_err() {
            break;
        }
    }
}

/// Audio frames from the client. Cancels `disconnected` once the client
/// closes the socket.
fn client_audio(
    mut inbound: SplitStream<WebSocket>,
    disconnected: CancellationToken,
) -> impl Stream<Item = Bytes> + Send + 'static {
    async_stream::stream! {
        while let Some(message) = inbound.next().await {
            match message {
                Ok(Message::Binary(frame)) => {
                    if !frame.is_empty() {
                        yield frame;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "websocket receive failed");
                    break;
                }
            }
        }
        disconnected.cancel();
    }
}

/// A relay serving in a background task.
pub struct RelayServer {
    addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `relay.bind` (port `0` picks a free port) and start serving.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot bind.
    pub async fn start(
        config: Arc<PipelineConfig>,
        factory: Arc<dyn CollaboratorFactory>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(&config.relay.bind).await?;
        let addr = listener.local_addr()?;
        info!("relay listening on ws://{addr}{}", config.relay.path);

        let app = router(RelayState::new(config, factory));
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("relay server error: {e}");
            }
        });

        Ok(Self {
            addr,
            cancel,
            handle,
        })
    }

    /// Returns the address the server is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the port the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the server task to finish after [`shutdown`](Self::shutdown).
    pub async fn stopped(&mut self) {
        if let Err(e) = (&mut self.handle).await {
            debug!("relay server task ended abnormally: {e}");
        }
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve the relay until `cancel` fires.
///
/// # Errors
///
/// Returns an error if the listener cannot bind.
pub async fn serve(
    config: Arc<PipelineConfig>,
    factory: Arc<dyn CollaboratorFactory>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut server = RelayServer::start(config, factory).await?;
    cancel.cancelled().await;
    server.shutdown();
    server.stopped().await;
    info!("relay stopped");
    Ok(())
}
