//! Long-lived push channel to the backend.
//!
//! Carries telemetry pushes, processing-state updates, and the legacy
//! command/response exchange over a single websocket. Frames are JSON
//! objects `{"event": <name>, "data": <payload>}` in both directions.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::events::{ChannelEvent, TurnState};
use shared::types::SystemStats;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// Channel lifecycle. Reconnection cycles through
/// `Disconnected -> Connecting -> Connected` automatically, bounded by the
/// configured attempt ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel url: {0}")]
    InvalidUrl(String),
    #[error("channel is not connected")]
    NotConnected,
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection timeout after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub connect_timeout: Duration,
    /// Reconnect attempt ceiling; after exhaustion the channel stays
    /// disconnected until `connect()` is called again.
    pub reconnect_attempts: u32,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_base_delay: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct ResponsePayload {
    response: Option<String>,
    message: Option<String>,
    intent: Option<String>,
    brain: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    state: TurnState,
}

#[derive(Debug, Serialize)]
struct CommandFrame<'a> {
    event: &'a str,
    data: CommandPayload<'a>,
}

#[derive(Debug, Serialize)]
struct CommandPayload<'a> {
    content: &'a str,
}

/// Seam for the coordinator's fallback path.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn send_command(&self, text: &str) -> Result<(), ChannelError>;
}

/// Persistent push connection. Create once, `connect()` on mount,
/// `disconnect()` on unmount; events arrive on the receiver handed out by
/// [`PersistentChannel::new`].
pub struct PersistentChannel {
    url: Url,
    config: ChannelConfig,
    state: Arc<RwLock<ChannelState>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    /// Set by `disconnect()`; suppresses any scheduled reconnect.
    closed: Arc<AtomicBool>,
    recv_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PersistentChannel {
    pub fn new(
        url: &str,
        config: ChannelConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let parsed = Url::parse(url).map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(ChannelError::InvalidUrl(format!(
                "expected ws:// or wss:// scheme, got {}",
                parsed.scheme()
            )));
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = Self {
            url: parsed,
            config,
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            events_tx,
            closed: Arc::new(AtomicBool::new(false)),
            recv_task: parking_lot::Mutex::new(None),
        };
        Ok((channel, events_rx))
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Open the channel and start the read loop. Emits `Opened` on success
    /// and `OpenFailed` on failure; subsequent drops reconnect automatically
    /// up to the attempt ceiling.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        {
            let mut state = self.state.write().await;
            if *state == ChannelState::Connected {
                return Ok(());
            }
            *state = ChannelState::Connecting;
        }
        self.closed.store(false, Ordering::SeqCst);

        match self.dial().await {
            Ok(reader) => {
                self.spawn_driver(reader);
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ChannelState::Disconnected;
                let _ = self.events_tx.send(ChannelEvent::OpenFailed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Tear the channel down. Deterministic: no events and no reconnection
    /// after this returns. Safe to call more than once.
    pub async fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.send(WsMessage::Close(None)).await {
                debug!("close frame not delivered: {}", e);
            }
        }
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }

        let was_connected = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ChannelState::Disconnected)
        };
        if was_connected != ChannelState::Disconnected {
            let _ = self.events_tx.send(ChannelEvent::Closed);
        }
    }

    /// One dial attempt; on success stores the writer, flips state to
    /// `Connected`, and emits `Opened`.
    async fn dial(&self) -> Result<WsReader, ChannelError> {
        let connected = timeout(self.config.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| ChannelError::Timeout(self.config.connect_timeout))?
            .map_err(|e| ChannelError::WebSocket(e.to_string()))?;

        let (stream, _response) = connected;
        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        *self.state.write().await = ChannelState::Connected;
        let _ = self.events_tx.send(ChannelEvent::Opened);
        Ok(reader)
    }

    /// Single driver task owning the read loop and the bounded reconnect
    /// cycle. Exits when the socket is torn down or attempts are exhausted.
    fn spawn_driver(self: &Arc<Self>, reader: WsReader) {
        let channel = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut reader = reader;
            loop {
                channel.read_until_drop(&mut reader).await;

                channel.writer.lock().await.take();
                *channel.state.write().await = ChannelState::Disconnected;
                let _ = channel.events_tx.send(ChannelEvent::Closed);

                if channel.closed.load(Ordering::SeqCst) {
                    return;
                }
                match channel.reconnect().await {
                    Some(next_reader) => reader = next_reader,
                    None => return,
                }
            }
        });

        if let Some(old) = self.recv_task.lock().replace(task) {
            old.abort();
        }
    }

    async fn read_until_drop(&self, reader: &mut WsReader) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.handle_frame(&text),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => {}
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("channel read error on {}: {}", self.url, e);
                    break;
                }
            }
        }
    }

    /// Bounded reconnect with exponential backoff. Returns the new reader on
    /// success; `None` once attempts are exhausted or the channel was closed.
    async fn reconnect(&self) -> Option<WsReader> {
        let mut delay = self.config.reconnect_base_delay;

        for attempt in 1..=self.config.reconnect_attempts {
            sleep(delay).await;
            delay = delay.saturating_mul(2);
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }

            *self.state.write().await = ChannelState::Connecting;
            match self.dial().await {
                Ok(reader) => {
                    debug!("channel reconnected on attempt {}", attempt);
                    return Some(reader);
                }
                Err(e) => {
                    warn!(
                        "reconnect attempt {}/{} failed: {}",
                        attempt, self.config.reconnect_attempts, e
                    );
                    *self.state.write().await = ChannelState::Disconnected;
                    let _ = self.events_tx.send(ChannelEvent::OpenFailed(e.to_string()));
                }
            }
        }
        None
    }

    /// Translate one inbound wire frame into a typed event. Unknown events
    /// and malformed payloads are dropped, never an error.
    fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping unparseable channel frame: {}", e);
                return;
            }
        };

        let event = match frame.event.as_str() {
            "system_stats" => match serde_json::from_value::<SystemStats>(frame.data) {
                Ok(stats) => ChannelEvent::Telemetry(stats),
                Err(e) => {
                    debug!("dropping malformed system_stats payload: {}", e);
                    return;
                }
            },
            "response" => {
                let payload: ResponsePayload = match serde_json::from_value(frame.data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        debug!("dropping malformed response payload: {}", e);
                        return;
                    }
                };
                // Even a textless response ends the turn's generating state.
                ChannelEvent::TurnCompleted {
                    text: payload.response.or(payload.message),
                    intent: payload.intent,
                    origin: payload.brain,
                }
            }
            "status" => match serde_json::from_value::<StatusPayload>(frame.data) {
                Ok(payload) => ChannelEvent::TurnState(payload.state),
                Err(e) => {
                    debug!("dropping malformed status payload: {}", e);
                    return;
                }
            },
            other => {
                debug!("ignoring channel event {:?}", other);
                return;
            }
        };

        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl CommandChannel for PersistentChannel {
    async fn is_connected(&self) -> bool {
        self.state().await == ChannelState::Connected
    }

    /// Emit a `command` frame. Returns `NotConnected` when the channel is
    /// down; commands are never dropped silently.
    async fn send_command(&self, text: &str) -> Result<(), ChannelError> {
        if !self.is_connected().await {
            return Err(ChannelError::NotConnected);
        }
        let frame = serde_json::to_string(&CommandFrame {
            event: "command",
            data: CommandPayload { content: text },
        })?;

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(ChannelError::NotConnected)?;
        writer
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ChannelError::WebSocket(e.to_string()))
    }
}

impl Drop for PersistentChannel {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().take() {
            task.abort();
        }
    }
}
