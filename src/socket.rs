use crate::config::WidgetConfig;
use crate::error::WidgetError;
use crate::protocol::{OutboundUserMessage, SocketInbound, SocketOutbound};
use crate::state::ConnectionState;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Everything the socket session reports to its owner.
#[derive(Debug)]
pub enum SocketEvent {
    ConnectionState(ConnectionState),
    Inbound(SocketInbound),
    /// Transport or framing problem that did not produce an inbound frame.
    Error(String),
}

#[derive(Debug)]
struct Inner {
    /// Bumped on every connect/disconnect; a task whose generation no longer
    /// matches is detached and must go silent.
    generation: u64,
    state: ConnectionState,
    room: Option<String>,
    writer: Option<mpsc::UnboundedSender<SocketOutbound>>,
    /// One reconnect attempt is armed per successful connection.
    reconnect_armed: bool,
}

/// Client for the human-handoff websocket channel.
///
/// `connect` is idempotent and non-blocking: it spawns a connection task that
/// joins the conversation room on open and forwards frames as [`SocketEvent`]s.
/// An unclean close triggers exactly one reconnect attempt after a fixed
/// delay; `disconnect` cancels any pending reconnect and detaches the running
/// task so late events from it are dropped.
#[derive(Clone)]
pub struct ConversationSocketClient {
    url: String,
    reconnect_delay: Duration,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<SocketEvent>,
}

impl ConversationSocketClient {
    pub fn new(config: &WidgetConfig) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let client = Self {
            url: config.socket_url.clone(),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            inner: Arc::new(Mutex::new(Inner {
                generation: 0,
                state: ConnectionState::Disconnected,
                room: None,
                writer: None,
                reconnect_armed: false,
            })),
            events,
        };
        (client, rx)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn emit(&self, generation: u64, event: SocketEvent) {
        if self.lock().generation != generation {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Open (or keep) a session for the given room. Calling this while a
    /// session for the same room is connecting or connected is a no-op.
    pub fn connect(&self, room: &str) {
        let generation = {
            let mut inner = self.lock();
            let same_room = inner.room.as_deref() == Some(room);
            if same_room
                && matches!(
                    inner.state,
                    ConnectionState::Connecting | ConnectionState::Connected
                )
            {
                return;
            }
            inner.generation += 1;
            inner.state = ConnectionState::Connecting;
            inner.room = Some(room.to_string());
            inner.writer = None;
            inner.reconnect_armed = true;
            inner.generation
        };
        let _ = self
            .events
            .send(SocketEvent::ConnectionState(ConnectionState::Connecting));
        self.spawn_connection(generation);
    }

    /// Tear the session down and drop anything still in flight.
    pub fn disconnect(&self) {
        {
            let mut inner = self.lock();
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            inner.room = None;
            inner.writer = None;
            inner.reconnect_armed = false;
        }
        let _ = self
            .events
            .send(SocketEvent::ConnectionState(ConnectionState::Disconnected));
    }

    /// Send a user message to the current room.
    ///
    /// When no session is up this kicks off a connection attempt for the last
    /// known room but still fails, so the caller can keep the message visible
    /// as undelivered.
    pub fn send(&self, data: OutboundUserMessage) -> Result<(), WidgetError> {
        let (writer, room) = {
            let inner = self.lock();
            (inner.writer.clone(), inner.room.clone())
        };
        match (writer, room) {
            (Some(writer), Some(room)) => {
                let frame = SocketOutbound::Message { room, data };
                writer
                    .send(frame)
                    .map_err(|_| WidgetError::SocketNotConnected)
            }
            (None, Some(room)) => {
                self.connect(&room);
                Err(WidgetError::SocketNotConnected)
            }
            _ => Err(WidgetError::SocketNotConnected),
        }
    }

    fn spawn_connection(&self, generation: u64) {
        let client = self.clone();
        tokio::spawn(async move {
            client.run_connection(generation).await;
        });
    }

    async fn run_connection(&self, generation: u64) {
        let stream = match connect_async(&self.url).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(error = %err, "websocket connect failed");
                self.emit(generation, SocketEvent::Error(err.to_string()));
                self.on_closed(generation, true);
                return;
            }
        };
        let (mut sink, mut source) = stream.split();

        let (writer, mut outbound) = mpsc::unbounded_channel::<SocketOutbound>();
        let room = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Connected;
            inner.writer = Some(writer.clone());
            inner.reconnect_armed = true;
            inner.room.clone()
        };
        self.emit(
            generation,
            SocketEvent::ConnectionState(ConnectionState::Connected),
        );

        // First frame after open: claim the conversation room.
        if let Some(room) = room {
            let _ = writer.send(SocketOutbound::Join { room });
        }
        drop(writer);

        let mut unclean = true;
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "failed to encode outbound frame");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(WsMessage::Text(text)).await {
                            self.emit(generation, SocketEvent::Error(err.to_string()));
                            break;
                        }
                    }
                    // Writer dropped: deliberate local shutdown.
                    None => {
                        unclean = false;
                        let _ = sink.close().await;
                        break;
                    }
                },
                message = source.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<SocketInbound>(&text) {
                            Ok(inbound) => self.emit(generation, SocketEvent::Inbound(inbound)),
                            Err(err) => {
                                // Malformed payloads flip the state to error
                                // but keep the socket open.
                                debug!(error = %err, "unrecognized socket frame");
                                {
                                    let mut inner = self.lock();
                                    if inner.generation == generation {
                                        inner.state = ConnectionState::Error;
                                    }
                                }
                                self.emit(
                                    generation,
                                    SocketEvent::ConnectionState(ConnectionState::Error),
                                );
                                self.emit(
                                    generation,
                                    SocketEvent::Error(format!("unrecognized frame: {err}")),
                                );
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        unclean = false;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.emit(generation, SocketEvent::Error(err.to_string()));
                        break;
                    }
                    None => break,
                },
            }
        }

        self.on_closed(generation, unclean);
    }

    /// Post-close bookkeeping: report the drop and, after an unclean close,
    /// burn the single armed reconnect attempt.
    fn on_closed(&self, generation: u64, unclean: bool) {
        let retry = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.state = ConnectionState::Disconnected;
            inner.writer = None;
            let retry = unclean && inner.reconnect_armed;
            inner.reconnect_armed = false;
            retry
        };
        self.emit(
            generation,
            SocketEvent::ConnectionState(ConnectionState::Disconnected),
        );

        if !retry {
            return;
        }

        let client = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(client.reconnect_delay).await;
            let next = {
                let mut inner = client.lock();
                // A disconnect or fresh connect during the delay wins.
                if inner.generation != generation
                    || inner.state != ConnectionState::Disconnected
                {
                    return;
                }
                inner.generation += 1;
                inner.state = ConnectionState::Connecting;
                inner.generation
            };
            debug!("attempting websocket reconnect");
            let _ = client
                .events
                .send(SocketEvent::ConnectionState(ConnectionState::Connecting));
            client.spawn_connection(next);
        });
    }
}
