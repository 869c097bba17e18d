//! Reconnecting control channel to the rendezvous service.
//!
//! [`SignalingChannel::spawn`] starts an actor task that owns the socket. It
//! identifies on every connect, flushes whatever was queued while offline,
//! pings every heartbeat interval and tears the socket down when a ping goes
//! unanswered. Any close leads to a fresh connect after the reconnect interval,
//! forever, until [`SignalingChannel::destroy`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{BusEvent, EventBus, Subscription};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

pub mod connector;
pub mod credentials;
pub mod messages;

pub use connector::{Connector, SocketHalves, WebSocketConnector};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use messages::{ClientMessage, PeerMessage, ServerMessage, SignalKind};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("credential mint failed: {0}")]
    Credentials(String),
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling channel closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTimings {
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
}

impl Default for ChannelTimings {
    fn default() -> Self {
        Self {
            heartbeat_interval: HEARTBEAT_INTERVAL,
            reconnect_interval: RECONNECT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(PeerMessage),
    StateChanged(ConnectionState),
    Reload,
}

impl BusEvent for ChannelEvent {
    fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Message(_) => "message",
            ChannelEvent::StateChanged(_) => "state",
            ChannelEvent::Reload => "reload",
        }
    }
}

const CHANNEL_EVENTS: &[&str] = &["message", "state", "reload"];

enum ChannelCommand {
    Send(ClientMessage),
    Destroy,
}

/// Handle to a running control channel. Dropping it stops the channel.
pub struct SignalingChannel {
    identity: String,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    events: Arc<EventBus<ChannelEvent>>,
    state_rx: watch::Receiver<ConnectionState>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Starts connecting as `identity`. Must be called inside a tokio runtime.
    pub fn spawn(
        identity: impl Into<String>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        timings: ChannelTimings,
    ) -> Self {
        let identity = identity.into();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let events = Arc::new(EventBus::new(CHANNEL_EVENTS));

        let actor = ChannelActor {
            identity: identity.clone(),
            connector,
            credentials,
            timings,
            commands: commands_rx,
            events: Arc::clone(&events),
            state_tx,
            outbound_queue: VecDeque::new(),
            heartbeat_acknowledged: true,
            epoch: 0,
        };
        let task = tokio::spawn(actor.run());

        Self {
            identity,
            commands,
            events,
            state_rx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Transmits now when connected, otherwise queues until the next
    /// successful identify. Only fails after [`destroy`](Self::destroy).
    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        self.commands
            .send(ChannelCommand::Send(message))
            .map_err(|_| SignalingError::Closed)
    }

    pub fn request_offer(&self, peer_id: &str) -> Result<(), SignalingError> {
        tracing::debug!(target: "huddle::signaling", peer_id = %peer_id, "-> request offer");
        self.send(ClientMessage::RequestOffer {
            to: peer_id.to_string(),
        })
    }

    pub fn assert_control(&self) -> Result<(), SignalingError> {
        tracing::debug!(target: "huddle::signaling", "-> assert control");
        self.send(ClientMessage::AssertControl)
    }

    pub fn signal(&self, peer_id: &str, data: Value) -> Result<(), SignalingError> {
        tracing::debug!(target: "huddle::signaling", peer_id = %peer_id, "-> signal");
        self.send(ClientMessage::Signal {
            to: peer_id.to_string(),
            data,
        })
    }

    pub fn on_message<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PeerMessage) + Send + Sync + 'static,
    {
        self.on_known("message", move |event| {
            if let ChannelEvent::Message(message) = event {
                listener(message);
            }
        })
    }

    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.on_known("state", move |event| {
            if let ChannelEvent::StateChanged(state) = event {
                listener(*state);
            }
        })
    }

    /// The service asked every client to restart itself.
    pub fn on_reload<F>(&self, listener: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_known("reload", move |event| {
            if matches!(event, ChannelEvent::Reload) {
                listener();
            }
        })
    }

    fn on_known<F>(&self, name: &str, listener: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        match self.events.on(name, listener) {
            Ok(subscription) => subscription,
            Err(err) => unreachable!("channel event table is static: {err}"),
        }
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.events.off(subscription)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Closes the socket and stops reconnecting. Safe to call repeatedly.
    pub fn destroy(&self) {
        if self.commands.send(ChannelCommand::Destroy).is_ok() {
            tracing::debug!(
                target: "huddle::signaling",
                identity = %self.identity,
                "destroying signaling channel"
            );
        }
        self.events.clear();
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SignalingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingChannel")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}

enum Flow {
    Closed,
    Destroyed,
}

struct ChannelActor {
    identity: String,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    timings: ChannelTimings,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: Arc<EventBus<ChannelEvent>>,
    state_tx: watch::Sender<ConnectionState>,
    outbound_queue: VecDeque<ClientMessage>,
    heartbeat_acknowledged: bool,
    epoch: u64,
}

impl ChannelActor {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let connector = Arc::clone(&self.connector);
            let flow = match self.until(async move { connector.connect().await }).await {
                None => Flow::Destroyed,
                Some(Ok(socket)) => self.run_connected(socket).await,
                Some(Err(err)) => {
                    tracing::warn!(
                        target: "huddle::signaling",
                        error = %err,
                        "signaling connect failed"
                    );
                    Flow::Closed
                }
            };
            if matches!(flow, Flow::Destroyed) {
                break;
            }

            self.set_state(ConnectionState::Disconnected);
            tracing::debug!(
                target: "huddle::signaling",
                queued = self.outbound_queue.len(),
                retry_in_ms = self.timings.reconnect_interval.as_millis() as u64,
                "scheduling reconnect"
            );
            if self
                .until(sleep(self.timings.reconnect_interval))
                .await
                .is_none()
            {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(
            target: "huddle::signaling",
            identity = %self.identity,
            "signaling channel stopped"
        );
    }

    /// Drives `fut` while offline, queueing sends. `None` means destroyed.
    async fn until<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Some(output),
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => self.outbound_queue.push_back(message),
                    Some(ChannelCommand::Destroy) | None => return None,
                },
            }
        }
    }

    async fn run_connected(&mut self, mut socket: SocketHalves) -> Flow {
        tracing::info!(target: "huddle::signaling", "<- websocket open");

        let credentials = Arc::clone(&self.credentials);
        let token = match self.until(async move { credentials.mint_token().await }).await {
            None => {
                let _ = socket.sink.close().await;
                return Flow::Destroyed;
            }
            Some(Ok(token)) => token,
            Some(Err(err)) => {
                tracing::warn!(
                    target: "huddle::signaling",
                    error = %err,
                    "unable to mint identify token"
                );
                let _ = socket.sink.close().await;
                return Flow::Closed;
            }
        };

        let identify = ClientMessage::Identify {
            token,
            uuid: self.identity.clone(),
        };
        tracing::debug!(target: "huddle::signaling", "-> websocket identify");
        if !self.transmit(&mut socket, &identify).await {
            return Flow::Closed;
        }

        self.epoch += 1;
        self.heartbeat_acknowledged = true;
        self.set_state(ConnectionState::Connected);

        let backlog = self.outbound_queue.len();
        while let Some(message) = self.outbound_queue.pop_front() {
            if !self.transmit(&mut socket, &message).await {
                return Flow::Closed;
            }
        }
        if backlog > 0 {
            tracing::debug!(
                target: "huddle::signaling",
                epoch = self.epoch,
                flushed = backlog,
                "flushed queued signaling messages"
            );
        }

        let heartbeat = sleep_until(Instant::now() + self.timings.heartbeat_interval);
        tokio::pin!(heartbeat);

        loop {
            tokio::select! {
                frame = socket.stream.next() => match frame {
                    Some(Ok(text)) => self.dispatch(&text),
                    Some(Err(err)) => {
                        tracing::warn!(
                            target: "huddle::signaling",
                            error = %err,
                            "<- websocket error"
                        );
                        return Flow::Closed;
                    }
                    None => {
                        tracing::info!(
                            target: "huddle::signaling",
                            epoch = self.epoch,
                            "<- websocket close"
                        );
                        return Flow::Closed;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => {
                        if !self.transmit(&mut socket, &message).await {
                            return Flow::Closed;
                        }
                    }
                    Some(ChannelCommand::Destroy) | None => {
                        let _ = socket.sink.close().await;
                        return Flow::Destroyed;
                    }
                },
                _ = &mut heartbeat => {
                    if !self.heartbeat_acknowledged {
                        tracing::warn!(
                            target: "huddle::signaling",
                            epoch = self.epoch,
                            "<- websocket heartbeat missed"
                        );
                        let _ = socket.sink.close().await;
                        return Flow::Closed;
                    }
                    tracing::trace!(target: "huddle::signaling", "-> websocket ping");
                    self.heartbeat_acknowledged = false;
                    if !self.transmit(&mut socket, &ClientMessage::Ping).await {
                        return Flow::Closed;
                    }
                    heartbeat
                        .as_mut()
                        .reset(Instant::now() + self.timings.heartbeat_interval);
                }
            }
        }
    }

    /// Writes one frame. A failed write loses that frame and ends the epoch.
    async fn transmit(&mut self, socket: &mut SocketHalves, message: &ClientMessage) -> bool {
        let text = match message.to_text() {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(
                    target: "huddle::signaling",
                    kind = message.kind(),
                    error = %err,
                    "dropping unencodable signaling message"
                );
                return true;
            }
        };
        match socket.sink.send(text).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(
                    target: "huddle::signaling",
                    kind = message.kind(),
                    error = %err,
                    "websocket write failed"
                );
                false
            }
        }
    }

    fn dispatch(&mut self, text: &str) {
        let message = match ServerMessage::parse(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                tracing::trace!(target: "huddle::signaling", "ignoring unknown event");
                return;
            }
            Err(err) => {
                tracing::debug!(
                    target: "huddle::signaling",
                    error = %err,
                    len = text.len(),
                    "dropping malformed signaling frame"
                );
                return;
            }
        };

        match message {
            ServerMessage::Signal { from, data } => {
                tracing::debug!(target: "huddle::signaling", from = %from, "<- websocket signal");
                self.events.fire(ChannelEvent::Message(PeerMessage {
                    event: SignalKind::Signal,
                    from,
                    data,
                }));
            }
            ServerMessage::RequestOffer { from } => {
                tracing::debug!(
                    target: "huddle::signaling",
                    from = %from,
                    "<- websocket request offer"
                );
                self.events.fire(ChannelEvent::Message(PeerMessage {
                    event: SignalKind::RequestOffer,
                    from,
                    data: Value::Null,
                }));
            }
            ServerMessage::Pong => {
                tracing::trace!(target: "huddle::signaling", "<- websocket pong");
                self.heartbeat_acknowledged = true;
            }
            ServerMessage::Reload => {
                tracing::warn!(target: "huddle::signaling", "<- reload requested by service");
                self.events.fire(ChannelEvent::Reload);
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        tracing::debug!(
            target: "huddle::signaling",
            state = ?state,
            epoch = self.epoch,
            "signaling state changed"
        );
        self.events.fire(ChannelEvent::StateChanged(state));
    }
}
