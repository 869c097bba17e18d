//! Session orchestration for every remote participant.
//!
//! [`StreamManager`] is a cheap handle to an actor task that owns the local
//! outbound stream, the signaling channel and one [`SessionState`] machine per
//! remote participant. Every input (API calls, signaling traffic, peer
//! callbacks, timer expiry, track notifications) is queued to that task, so a
//! session's state and its `stream_update` event always change together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use event_bus::{BusEvent, EventBus, Subscription};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

mod actor;
pub mod session;

pub use session::SessionState;

use crate::media::{MediaConfig, MediaDevices, MediaStream, TrackKind};
use crate::peer::{PeerConnector, RelayServer, default_relay_servers};
use crate::signaling::{ChannelTimings, Connector, CredentialProvider};

pub const INITIALIZING_TIMEOUT: Duration = Duration::from_secs(30);
pub const BROKEN_TIMEOUT: Duration = Duration::from_secs(30);
pub const CAPTURE_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("stream manager has shut down")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerTimings {
    pub initializing_timeout: Duration,
    pub broken_timeout: Duration,
    pub capture_retry: Duration,
    pub channel: ChannelTimings,
}

impl Default for ManagerTimings {
    fn default() -> Self {
        Self {
            initializing_timeout: INITIALIZING_TIMEOUT,
            broken_timeout: BROKEN_TIMEOUT,
            capture_retry: CAPTURE_RETRY_DELAY,
            channel: ChannelTimings::default(),
        }
    }
}

/// What the host process can do with media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Each peer gets its own copy of the local stream, released on reset.
    /// When false every peer shares the captured stream and resets leave it
    /// running.
    pub clone_media: bool,
}

impl Default for HostCapabilities {
    fn default() -> Self {
        Self { clone_media: true }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub relay_servers: Vec<RelayServer>,
    pub host: HostCapabilities,
    pub timings: ManagerTimings,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            relay_servers: default_relay_servers(),
            host: HostCapabilities::default(),
            timings: ManagerTimings::default(),
        }
    }
}

/// External capabilities the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerConnector>,
}

/// Events published for the application layer.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Local capture is ready (fired again on every restart of capture).
    StreamOut(MediaStream),
    StreamIn { id: String, stream: MediaStream },
    StreamUpdate { id: String, state: SessionState },
    MutedVideo(bool),
    MutedAudio(bool),
    /// The signaling service asked this client to restart.
    Reload,
}

impl BusEvent for StreamEvent {
    fn name(&self) -> &'static str {
        match self {
            StreamEvent::StreamOut(_) => "stream_out",
            StreamEvent::StreamIn { .. } => "stream_in",
            StreamEvent::StreamUpdate { .. } => "stream_update",
            StreamEvent::MutedVideo(_) => "muted_video",
            StreamEvent::MutedAudio(_) => "muted_audio",
            StreamEvent::Reload => "reload",
        }
    }
}

const STREAM_EVENTS: &[&str] = &[
    "stream_out",
    "stream_in",
    "stream_update",
    "muted_video",
    "muted_audio",
    "reload",
];

/// Operations deferred until local capture is ready, replayed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingAction {
    AddVideo(String),
    RemoveVideo(String),
    AssertControl,
}

pub(crate) enum Command {
    Start {
        identity: String,
        media_config: MediaConfig,
    },
    Action(PendingAction),
    RemoveAll,
    SetMute {
        peer_id: Option<String>,
        kind: TrackKind,
        muted: bool,
    },
    State {
        peer_id: String,
        reply: oneshot::Sender<SessionState>,
    },
    States {
        reply: oneshot::Sender<HashMap<String, SessionState>>,
    },
    Ready {
        reply: oneshot::Sender<bool>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct StreamManager {
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<EventBus<StreamEvent>>,
}

impl StreamManager {
    /// Spawns the manager task. Must be called inside a tokio runtime.
    pub fn new(collaborators: Collaborators, config: ManagerConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let events = Arc::new(EventBus::new(STREAM_EVENTS));
        actor::spawn(collaborators, config, commands_rx, Arc::clone(&events));
        Self { commands, events }
    }

    fn post(&self, command: Command) -> Result<(), ManagerError> {
        self.commands.send(command).map_err(|_| ManagerError::Closed)
    }

    async fn ask<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, response) = oneshot::channel();
        self.post(build(reply))?;
        response.await.map_err(|_| ManagerError::Closed)
    }

    /// Connects signaling as `identity` and captures local media. Calling it
    /// again while started only re-announces the current local stream.
    pub fn start(
        &self,
        identity: impl Into<String>,
        media_config: MediaConfig,
    ) -> Result<(), ManagerError> {
        self.post(Command::Start {
            identity: identity.into(),
            media_config,
        })
    }

    pub fn add_video(&self, peer_id: impl Into<String>) -> Result<(), ManagerError> {
        self.post(Command::Action(PendingAction::AddVideo(peer_id.into())))
    }

    pub fn remove_video(&self, peer_id: impl Into<String>) -> Result<(), ManagerError> {
        self.post(Command::Action(PendingAction::RemoveVideo(peer_id.into())))
    }

    pub fn remove_all(&self) -> Result<(), ManagerError> {
        self.post(Command::RemoveAll)
    }

    pub fn set_mute_video(
        &self,
        peer_id: impl Into<String>,
        muted: bool,
    ) -> Result<(), ManagerError> {
        self.post(Command::SetMute {
            peer_id: Some(peer_id.into()),
            kind: TrackKind::Video,
            muted,
        })
    }

    pub fn set_mute_audio(
        &self,
        peer_id: impl Into<String>,
        muted: bool,
    ) -> Result<(), ManagerError> {
        self.post(Command::SetMute {
            peer_id: Some(peer_id.into()),
            kind: TrackKind::Audio,
            muted,
        })
    }

    pub fn set_mute_video_all(&self, muted: bool) -> Result<(), ManagerError> {
        self.post(Command::SetMute {
            peer_id: None,
            kind: TrackKind::Video,
            muted,
        })
    }

    pub fn set_mute_audio_all(&self, muted: bool) -> Result<(), ManagerError> {
        self.post(Command::SetMute {
            peer_id: None,
            kind: TrackKind::Audio,
            muted,
        })
    }

    pub fn assert_control(&self) -> Result<(), ManagerError> {
        self.post(Command::Action(PendingAction::AssertControl))
    }

    /// Tears down signaling, every session and local capture. Resolves once
    /// everything is released; a later [`start`](Self::start) begins afresh.
    pub async fn destroy(&self) -> Result<(), ManagerError> {
        self.ask(|reply| Command::Destroy { reply }).await
    }

    pub async fn state(&self, peer_id: impl Into<String>) -> Result<SessionState, ManagerError> {
        let peer_id = peer_id.into();
        self.ask(|reply| Command::State { peer_id, reply }).await
    }

    pub async fn states(&self) -> Result<HashMap<String, SessionState>, ManagerError> {
        self.ask(|reply| Command::States { reply }).await
    }

    pub async fn is_ready(&self) -> Result<bool, ManagerError> {
        self.ask(|reply| Command::Ready { reply }).await
    }

    /// Registers a listener for one named event (see [`StreamEvent`]).
    pub fn on<F>(&self, event: &str, listener: F) -> Result<Subscription, event_bus::BusError>
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.events.on(event, listener)
    }

    pub fn off(&self, subscription: &Subscription) -> bool {
        self.events.off(subscription)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
