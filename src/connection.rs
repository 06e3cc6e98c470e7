//! The persistent, authenticated WebSocket channel to Home Assistant.
//!
//! A [`Connection`] goes `Disconnected -> Connecting -> AwaitingAuth -> Ready`
//! exactly once and ends in `Closed`, after which it is never reused. Once
//! ready, the socket is split between a writer task fed by an mpsc queue
//! (so frames hit the wire in call order) and a reader task that routes every
//! correlated frame into the [`Correlator`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use strum_macros::{AsRefStr, Display};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::config::HomeAssistantConfig;
use crate::correlator::Correlator;
use crate::error::ClientError;
use crate::frame::{self, InboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingAuth,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub pending_requests: usize,
    pub ready_since: Option<DateTime<Utc>>,
    pub ha_version: Option<String>,
}

struct Link {
    outbound: mpsc::Sender<Message>,
    writer: JoinHandle<()>,
}

struct Inner {
    state: ConnectionState,
    link: Option<Link>,
    ready_since: Option<DateTime<Utc>>,
    ha_version: Option<String>,
}

/// State shared between the owner and the background I/O tasks.
struct Shared {
    inner: Mutex<Inner>,
    correlator: Arc<Correlator>,
    closed: CancellationToken,
}

impl Shared {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnectionState {
        self.inner().state
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<(), ClientError> {
        let mut inner = self.inner();
        if inner.state != from {
            return Err(ClientError::ConnectionClosed);
        }
        tracing::debug!(%from, %to, "connection state change");
        inner.state = to;
        Ok(())
    }

    /// Moves to `Closed`, stops the I/O tasks, and fails every pending
    /// request. Returns whether the connection was still open, plus the
    /// writer task, which finishes once the close frame is on the wire.
    fn close(&self) -> (bool, Option<JoinHandle<()>>) {
        let (was_open, link) = {
            let mut inner = self.inner();
            let was_open = inner.state != ConnectionState::Closed;
            inner.state = ConnectionState::Closed;
            inner.ready_since = None;
            (was_open, inner.link.take())
        };
        self.closed.cancel();
        self.correlator.purge_all(ClientError::ConnectionClosed);
        (was_open, link.map(|link| link.writer))
    }

    fn dispatch(&self, text: &str) {
        let decoded = InboundFrame::parse(text).map(InboundFrame::into_outcome);
        if let Ok(Some((id, outcome))) = decoded {
            self.correlator.resolve(id, Ok(outcome));
            return;
        }

        // A frame we cannot decode still settles the request it names.
        match frame::correlation_id(text) {
            Some(id) => {
                tracing::warn!(id, "undecodable response from Home Assistant: {}", text);
                self.correlator.reject(
                    id,
                    ClientError::Protocol(format!("undecodable response: {}", text)),
                );
            }
            None => tracing::debug!("ignoring uncorrelated frame: {}", text),
        }
    }
}

pub struct Connection {
    config: Arc<HomeAssistantConfig>,
    shared: Arc<Shared>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(config: Arc<HomeAssistantConfig>) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    link: None,
                    ready_since: None,
                    ha_version: None,
                }),
                correlator: Arc::new(Correlator::new()),
                closed: CancellationToken::new(),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.shared.correlator
    }

    pub fn pending_count(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.shared.inner();
        ConnectionStatus {
            state: inner.state,
            pending_requests: self.shared.correlator.pending_count(),
            ready_since: inner.ready_since,
            ha_version: inner.ha_version.clone(),
        }
    }

    /// Opens and authenticates the channel. Returns at once when already
    /// ready; concurrent callers wait on the attempt already in progress
    /// rather than opening a second socket.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.state() == ConnectionState::Ready {
            return Ok(());
        }

        let _lock = self.connect_lock.lock().await;
        match self.state() {
            ConnectionState::Ready => return Ok(()),
            ConnectionState::Closed => return Err(ClientError::ConnectionClosed),
            _ => {}
        }
        let mut attempt_guard = AttemptGuard {
            shared: &self.shared,
            settled: false,
        };
        self.shared
            .transition(ConnectionState::Disconnected, ConnectionState::Connecting)?;

        let attempt = tokio::select! {
            _ = self.shared.closed.cancelled() => Err(ClientError::ConnectionClosed),
            outcome = tokio::time::timeout(self.config.connect_timeout, self.handshake()) => {
                outcome.unwrap_or_else(|_| {
                    Err(ClientError::ConnectionFailed(format!(
                        "handshake did not complete within {:?}",
                        self.config.connect_timeout
                    )))
                })
            }
        };

        let established = attempt.and_then(|ws| self.establish(ws));
        attempt_guard.settled = true;
        match established {
            Ok(()) => {
                tracing::info!("Connected to Home Assistant at {}", self.config.url);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Home Assistant connection failed: {}", e);
                self.shared.close();
                Err(e)
            }
        }
    }

    /// Connect-on-demand step used before every send.
    pub async fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            _ => self.connect().await,
        }
    }

    async fn handshake(&self) -> Result<WsStream, ClientError> {
        let ws_url = self.config.websocket_url()?;
        let (mut ws_stream, _) = connect_async(ws_url.as_str()).await.map_err(|e| {
            ClientError::ConnectionFailed(format!("Failed to connect to {}: {}", ws_url, e))
        })?;
        self.shared
            .transition(ConnectionState::Connecting, ConnectionState::AwaitingAuth)?;

        while let Some(msg) = ws_stream.next().await {
            let msg = msg.map_err(|e| {
                ClientError::ConnectionFailed(format!("WebSocket error during auth: {}", e))
            })?;

            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            match InboundFrame::parse(&text) {
                Ok(InboundFrame::AuthRequired { ha_version }) => {
                    tracing::debug!(?ha_version, "authentication requested");
                    let auth = frame::auth_frame(&self.config.token);
                    ws_stream
                        .send(Message::Text(auth.to_string().into()))
                        .await
                        .map_err(|e| {
                            ClientError::ConnectionFailed(format!("Failed to send auth: {}", e))
                        })?;
                }
                Ok(InboundFrame::AuthOk { ha_version }) => {
                    self.shared.inner().ha_version = ha_version;
                    return Ok(ws_stream);
                }
                Ok(InboundFrame::AuthInvalid { message }) => {
                    let _ = ws_stream.close(None).await;
                    return Err(ClientError::AuthenticationFailed(
                        message.unwrap_or_else(|| "access token rejected".into()),
                    ));
                }
                Ok(other) => tracing::debug!(?other, "ignoring frame during handshake"),
                Err(e) => tracing::debug!("ignoring malformed handshake frame: {}", e),
            }
        }

        Err(ClientError::ConnectionFailed(
            "connection closed before authentication completed".into(),
        ))
    }

    fn establish(&self, ws_stream: WsStream) -> Result<(), ClientError> {
        let (sink, stream) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        {
            let mut inner = self.shared.inner();
            if inner.state != ConnectionState::AwaitingAuth {
                return Err(ClientError::ConnectionClosed);
            }
            inner.state = ConnectionState::Ready;
            inner.ready_since = Some(Utc::now());
            let writer = tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&self.shared)));
            inner.link = Some(Link { outbound, writer });
        }

        tokio::spawn(read_loop(stream, Arc::clone(&self.shared)));
        Ok(())
    }

    /// Queues a frame for the writer. Frames leave in the order they are sent.
    pub async fn send(&self, frame: Value) -> Result<(), ClientError> {
        let outbound = {
            let inner = self.shared.inner();
            match (&inner.state, &inner.link) {
                (ConnectionState::Ready, Some(link)) => link.outbound.clone(),
                (state, _) => return Err(ClientError::NotReady(state.to_string())),
            }
        };

        tracing::debug!(%frame, "sending frame");
        outbound
            .send(Message::Text(frame.to_string().into()))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Closes the channel. Every request still pending has been failed with
    /// [`ClientError::ConnectionClosed`] by the time this returns. The close
    /// frame is written by the writer task afterwards; use
    /// [`shutdown`](Self::shutdown) to wait for it.
    pub fn disconnect(&self) {
        let (was_open, _) = self.shared.close();
        if was_open {
            tracing::info!("Disconnected from Home Assistant");
        }
    }

    /// Like [`disconnect`](Self::disconnect), then waits (bounded) for the
    /// writer to send the close frame and release the socket.
    pub async fn shutdown(&self) {
        let (was_open, writer) = self.shared.close();
        if let Some(writer) = writer {
            if tokio::time::timeout(SHUTDOWN_GRACE, writer).await.is_err() {
                tracing::warn!("WebSocket writer did not finish within {:?}", SHUTDOWN_GRACE);
            }
        }
        if was_open {
            tracing::info!("Disconnected from Home Assistant");
        }
    }
}

/// Closes the connection when a connect attempt is dropped before it settles,
/// so an abandoned handshake never leaves the state stuck mid-way.
struct AttemptGuard<'a> {
    shared: &'a Shared,
    settled: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("connect attempt abandoned before completing");
            self.shared.close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close();
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
) {
    loop {
        tokio::select! {
            _ = shared.closed.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::error!("WebSocket send error: {}", e);
                    shared.close();
                    return;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(mut stream: SplitStream<WsStream>, shared: Arc<Shared>) {
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => return,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => shared.dispatch(&text),
            Some(Ok(Message::Close(reason))) => {
                tracing::warn!(?reason, "Home Assistant closed the WebSocket");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            None => break,
        }
    }
    shared.close();
}
