//! In-memory collaborators for exercising the channel and the manager without
//! a network, camera or peer-connection engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc as frames;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::media::{MediaConfig, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind};
use crate::peer::{PeerConnector, PeerError, PeerEvents, PeerHandle, PeerOptions, RelayServer};
use crate::signaling::{Connector, SignalingError, SocketHalves};

// ---- signaling ---------------------------------------------------------

struct ServerShared {
    reachable: AtomicBool,
    attempts: AtomicUsize,
    accepted: mpsc::UnboundedSender<ServerConnection>,
}

/// Client side of an in-memory rendezvous service.
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<ServerShared>,
}

/// Server side: hands out one [`ServerConnection`] per client connect.
pub struct SignalingServer {
    shared: Arc<ServerShared>,
    accepted: mpsc::UnboundedReceiver<ServerConnection>,
}

pub fn memory_signaling() -> (MemoryConnector, SignalingServer) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(ServerShared {
        reachable: AtomicBool::new(true),
        attempts: AtomicUsize::new(0),
        accepted: accepted_tx,
    });
    (
        MemoryConnector {
            shared: Arc::clone(&shared),
        },
        SignalingServer {
            shared,
            accepted: accepted_rx,
        },
    )
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<SocketHalves, SignalingError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(SignalingError::Connect("server unreachable".into()));
        }

        let (to_server, from_client) = frames::unbounded::<String>();
        let (to_client, from_server) = frames::unbounded::<String>();
        let connection = ServerConnection {
            incoming: from_client,
            outgoing: to_client,
        };
        self.shared
            .accepted
            .send(connection)
            .map_err(|_| SignalingError::Connect("server gone".into()))?;

        Ok(SocketHalves {
            sink: Box::pin(to_server.sink_map_err(|_| SignalingError::Closed)),
            stream: Box::pin(from_server.map(Ok::<String, SignalingError>)),
        })
    }
}

impl SignalingServer {
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.accepted.recv().await
    }

    /// While unreachable every connect attempt fails immediately.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

/// One accepted socket. Dropping it closes the socket from the server side.
pub struct ServerConnection {
    incoming: frames::UnboundedReceiver<String>,
    outgoing: frames::UnboundedSender<String>,
}

impl ServerConnection {
    /// Next frame from the client as JSON; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<Value> {
        let text = self.incoming.next().await?;
        serde_json::from_str(&text).ok()
    }

    /// Like [`recv`](Self::recv) but skips heartbeat pings.
    pub async fn recv_non_ping(&mut self) -> Option<Value> {
        loop {
            let frame = self.recv().await?;
            if frame["event"] != "ping" {
                return Some(frame);
            }
        }
    }

    pub fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.outgoing.unbounded_send(text.to_string());
    }
}

// ---- media -------------------------------------------------------------

#[derive(Default)]
struct DevicesState {
    fail_remaining: usize,
    calls: usize,
    last: Option<MediaStream>,
}

/// Capture that succeeds with fresh tracks unless told to fail.
#[derive(Clone, Default)]
pub struct FakeMediaDevices {
    state: Arc<Mutex<DevicesState>>,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` captures are refused.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_remaining = count;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    pub fn last_stream(&self) -> Option<MediaStream> {
        self.state.lock().last.clone()
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(&self, config: &MediaConfig) -> Result<MediaStream, MediaError> {
        let mut state = self.state.lock();
        state.calls += 1;
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = Vec::new();
        if config.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "fake-microphone"));
        }
        if config.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "fake-camera"));
        }
        let stream = MediaStream::new(tracks);
        state.last = Some(stream.clone());
        Ok(stream)
    }
}

/// A remote stream with one audio and one video track.
pub fn inbound_stream() -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(TrackKind::Audio, "remote-microphone"),
        MediaTrack::new(TrackKind::Video, "remote-camera"),
    ])
}

// ---- peers -------------------------------------------------------------

struct FakePeerInner {
    remote_id: String,
    initiator: bool,
    trickle: bool,
    relay_servers: Vec<RelayServer>,
    local_stream: MediaStream,
    events: PeerEvents,
    signals: Mutex<Vec<Value>>,
    destroyed: AtomicBool,
}

/// Test-side view of one peer connection created by the manager.
#[derive(Clone)]
pub struct FakePeer {
    inner: Arc<FakePeerInner>,
}

impl FakePeer {
    pub fn remote_id(&self) -> &str {
        &self.inner.remote_id
    }

    pub fn initiator(&self) -> bool {
        self.inner.initiator
    }

    pub fn trickle(&self) -> bool {
        self.inner.trickle
    }

    pub fn relay_servers(&self) -> &[RelayServer] {
        &self.inner.relay_servers
    }

    pub fn local_stream(&self) -> &MediaStream {
        &self.inner.local_stream
    }

    /// Remote descriptors applied so far.
    pub fn signals(&self) -> Vec<Value> {
        self.inner.signals.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn emit_connect(&self) {
        self.inner.events.connect();
    }

    pub fn emit_stream(&self, stream: MediaStream) {
        self.inner.events.stream(stream);
    }

    pub fn emit_signal(&self, descriptor: Value) {
        self.inner.events.signal(descriptor);
    }

    pub fn emit_close(&self) {
        self.inner.events.close();
    }

    pub fn emit_error(&self, message: &str) {
        self.inner.events.error(message);
    }
}

struct FakePeerHandle {
    peer: FakePeer,
}

impl PeerHandle for FakePeerHandle {
    fn signal(&mut self, descriptor: Value) -> Result<(), PeerError> {
        if self.peer.is_destroyed() {
            return Err(PeerError::Destroyed);
        }
        self.peer.inner.signals.lock().push(descriptor);
        Ok(())
    }

    fn destroy(&mut self) {
        self.peer.inner.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Records every peer connection the manager asks for.
#[derive(Clone, Default)]
pub struct FakePeerConnector {
    created: Arc<Mutex<Vec<FakePeer>>>,
}

impl FakePeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn peers_for(&self, remote_id: &str) -> Vec<FakePeer> {
        self.created
            .lock()
            .iter()
            .filter(|peer| peer.remote_id() == remote_id)
            .cloned()
            .collect()
    }

    /// Most recently created connection towards `remote_id`.
    pub fn latest(&self, remote_id: &str) -> Option<FakePeer> {
        self.peers_for(remote_id).pop()
    }
}

impl PeerConnector for FakePeerConnector {
    fn create(&self, options: PeerOptions) -> Box<dyn PeerHandle> {
        let peer = FakePeer {
            inner: Arc::new(FakePeerInner {
                remote_id: options.remote_id,
                initiator: options.initiator,
                trickle: options.trickle,
                relay_servers: options.relay_servers,
                local_stream: options.local_stream,
                events: options.events,
                signals: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        };
        self.created.lock().push(peer.clone());
        Box::new(FakePeerHandle { peer })
    }
}
