use std::collections::VecDeque;
use std::sync::Arc;

use event_bus::{EventBus, Subscription};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::session::{SessionTable, Timer, TimerKind};
use super::{
    Collaborators, Command, ManagerConfig, PendingAction, SessionState, StreamEvent,
};
use crate::media::{MediaConfig, MediaError, MediaStream, MediaTrack, TrackEvent, TrackKind};
use crate::peer::{PeerEvent, PeerEvents, PeerOptions, is_initiator};
use crate::signaling::{PeerMessage, SignalKind, SignalingChannel};

/// Inputs the actor posts to itself from callbacks and timers.
enum Internal {
    Channel(PeerMessage),
    Reload,
    Peer {
        peer_id: String,
        generation: u64,
        event: PeerEvent,
    },
    Timer {
        peer_id: String,
        kind: TimerKind,
        epoch: u64,
    },
    Captured {
        epoch: u64,
        result: Result<MediaStream, MediaError>,
    },
    RetryCapture {
        epoch: u64,
    },
    LocalTrackEnded {
        epoch: u64,
        track_id: String,
    },
    InboundTrack {
        peer_id: String,
        generation: u64,
        event: TrackEvent,
    },
}

pub(super) fn spawn(
    collaborators: Collaborators,
    config: ManagerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: Arc<EventBus<StreamEvent>>,
) {
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let actor = ManagerActor {
        collaborators,
        config,
        commands,
        internal_tx,
        internal_rx,
        events,
        my_id: String::new(),
        media_config: MediaConfig::default(),
        initialized: false,
        ready: false,
        pending_actions: VecDeque::new(),
        channel: None,
        stream_out: None,
        stream_out_listeners: Vec::new(),
        capture_epoch: 0,
        capturing: false,
        sessions: SessionTable::default(),
        global_video_enabled: true,
        global_audio_enabled: true,
    };
    tokio::spawn(actor.run());
}

struct ManagerActor {
    collaborators: Collaborators,
    config: ManagerConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: Arc<EventBus<StreamEvent>>,

    my_id: String,
    media_config: MediaConfig,
    initialized: bool,
    ready: bool,
    pending_actions: VecDeque<PendingAction>,
    channel: Option<SignalingChannel>,

    stream_out: Option<MediaStream>,
    stream_out_listeners: Vec<(MediaTrack, Subscription)>,
    /// Bumped on destroy so captures started before it are discarded.
    capture_epoch: u64,
    capturing: bool,

    sessions: SessionTable,
    global_video_enabled: bool,
    global_audio_enabled: bool,
}

impl ManagerActor {
    async fn run(mut self) {
        loop {
            // Internal inputs were caused by earlier commands; drain them first.
            tokio::select! {
                biased;
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        self.destroy();
        tracing::debug!(target: "huddle::manager", "stream manager stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                identity,
                media_config,
            } => self.start(identity, media_config),
            Command::Action(action) => self.apply(action),
            Command::RemoveAll => self.remove_all(),
            Command::SetMute {
                peer_id: Some(peer_id),
                kind,
                muted,
            } => self.set_mute(&peer_id, kind, muted),
            Command::SetMute {
                peer_id: None,
                kind,
                muted,
            } => self.set_mute_all(kind, muted),
            Command::State { peer_id, reply } => {
                let _ = reply.send(self.sessions.state(&peer_id));
            }
            Command::States { reply } => {
                let _ = reply.send(self.sessions.snapshot());
            }
            Command::Ready { reply } => {
                let _ = reply.send(self.ready);
            }
            Command::Destroy { reply } => {
                self.destroy();
                let _ = reply.send(());
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Channel(message) => self.on_channel_message(message),
            Internal::Reload => self.events.fire(StreamEvent::Reload),
            Internal::Peer {
                peer_id,
                generation,
                event,
            } => {
                if self.is_current(&peer_id, generation) {
                    self.on_peer_event(&peer_id, event);
                }
            }
            Internal::Timer {
                peer_id,
                kind,
                epoch,
            } => self.on_timer(&peer_id, kind, epoch),
            Internal::Captured { epoch, result } => self.on_captured(epoch, result),
            Internal::RetryCapture { epoch } => {
                if epoch == self.capture_epoch && self.initialized {
                    self.capture();
                }
            }
            Internal::LocalTrackEnded { epoch, track_id } => {
                let current = self
                    .stream_out
                    .as_ref()
                    .is_some_and(|stream| stream.tracks().iter().any(|t| t.id() == track_id));
                if epoch == self.capture_epoch && self.initialized && current {
                    tracing::info!(
                        target: "huddle::manager",
                        track_id = %track_id,
                        "<- local track ended; recapturing"
                    );
                    self.capture();
                }
            }
            Internal::InboundTrack {
                peer_id,
                generation,
                event,
            } => {
                if self.is_current(&peer_id, generation) {
                    self.on_inbound_track(&peer_id, event);
                }
            }
        }
    }

    fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|session| session.generation == generation && session.state.has_peer())
    }

    // ---- lifecycle -------------------------------------------------------

    fn start(&mut self, identity: String, media_config: MediaConfig) {
        if self.initialized {
            tracing::info!(target: "huddle::manager", "stream manager already started");
            if let Some(stream) = &self.stream_out {
                self.events.fire(StreamEvent::StreamOut(stream.clone()));
            }
            return;
        }
        tracing::info!(target: "huddle::manager", identity = %identity, "starting stream manager");
        self.my_id = identity;
        self.media_config = media_config;
        self.initialized = true;

        let channel = SignalingChannel::spawn(
            self.my_id.clone(),
            Arc::clone(&self.collaborators.connector),
            Arc::clone(&self.collaborators.credentials),
            self.config.timings.channel,
        );
        let tx = self.internal_tx.clone();
        channel.on_message(move |message| {
            let _ = tx.send(Internal::Channel(message.clone()));
        });
        let tx = self.internal_tx.clone();
        channel.on_reload(move || {
            let _ = tx.send(Internal::Reload);
        });
        self.channel = Some(channel);

        self.capture();
    }

    fn capture(&mut self) {
        if self.capturing {
            return;
        }
        self.capturing = true;
        let devices = Arc::clone(&self.collaborators.devices);
        let config = self.media_config.clone();
        let tx = self.internal_tx.clone();
        let epoch = self.capture_epoch;
        tokio::spawn(async move {
            let result = devices.get_user_media(&config).await;
            let _ = tx.send(Internal::Captured { epoch, result });
        });
    }

    fn on_captured(&mut self, epoch: u64, result: Result<MediaStream, MediaError>) {
        if epoch != self.capture_epoch || !self.initialized {
            if let Ok(stream) = result {
                stream.stop_all();
            }
            return;
        }
        self.capturing = false;

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(
                    target: "huddle::manager",
                    error = %err,
                    retry_in_ms = self.config.timings.capture_retry.as_millis() as u64,
                    "local capture failed"
                );
                let tx = self.internal_tx.clone();
                let delay = self.config.timings.capture_retry;
                tokio::spawn(async move {
                    sleep(delay).await;
                    let _ = tx.send(Internal::RetryCapture { epoch });
                });
                return;
            }
        };

        tracing::info!(
            target: "huddle::manager",
            tracks = stream.tracks().len(),
            "<- local stream initialized"
        );
        self.detach_local_listeners();
        for track in stream.tracks() {
            let tx = self.internal_tx.clone();
            let track_id = track.id().to_string();
            match track.on("ended", move |_| {
                let _ = tx.send(Internal::LocalTrackEnded {
                    epoch,
                    track_id: track_id.clone(),
                });
            }) {
                Ok(subscription) => self.stream_out_listeners.push((track.clone(), subscription)),
                Err(err) => tracing::warn!(target: "huddle::manager", error = %err, "track listener rejected"),
            }
        }
        // A shared stream may still be what live sessions are sending.
        if let Some(previous) = self.stream_out.replace(stream.clone()) {
            if self.config.host.clone_media {
                previous.stop_all();
            }
        }
        self.events.fire(StreamEvent::StreamOut(stream));

        self.ready = true;
        let pending: Vec<PendingAction> = self.pending_actions.drain(..).collect();
        if !pending.is_empty() {
            tracing::debug!(
                target: "huddle::manager",
                count = pending.len(),
                "replaying actions queued before ready"
            );
        }
        for action in pending {
            self.apply(action);
        }
    }

    fn detach_local_listeners(&mut self) {
        for (track, subscription) in self.stream_out_listeners.drain(..) {
            track.off(&subscription);
        }
    }

    fn destroy(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.destroy();
        }
        self.pending_actions.clear();
        for peer_id in self.sessions.ids() {
            if self.sessions.state(&peer_id) != SessionState::NotTracking {
                if let Some(session) = self.sessions.get_mut(&peer_id) {
                    session.audio_enabled = false;
                    session.video_enabled = false;
                }
                self.not_tracking(&peer_id);
            }
        }
        for (_, session) in self.sessions.iter_mut() {
            if let Some(stream) = session.stream_out.take() {
                stream.stop_all();
            }
        }
        self.sessions.clear();

        self.detach_local_listeners();
        if let Some(stream) = self.stream_out.take() {
            stream.stop_all();
        }
        if self.initialized {
            tracing::info!(target: "huddle::manager", "stream manager destroyed");
        }
        self.capture_epoch += 1;
        self.capturing = false;
        self.initialized = false;
        self.ready = false;
    }

    // ---- public operations ----------------------------------------------

    fn apply(&mut self, action: PendingAction) {
        if !self.ready {
            self.pending_actions.push_back(action);
            return;
        }
        match action {
            PendingAction::AddVideo(peer_id) => self.add_video(&peer_id),
            PendingAction::RemoveVideo(peer_id) => self.remove_video(&peer_id),
            PendingAction::AssertControl => {
                if let Some(channel) = &self.channel {
                    if let Err(err) = channel.assert_control() {
                        tracing::warn!(target: "huddle::manager", error = %err, "assert control failed");
                    }
                }
            }
        }
    }

    fn add_video(&mut self, peer_id: &str) {
        if self.sessions.state(peer_id) != SessionState::NotTracking {
            return;
        }
        let session = self.sessions.entry(peer_id);
        session.audio_enabled = true;
        session.video_enabled = true;
        self.initializing(peer_id);
    }

    fn remove_video(&mut self, peer_id: &str) {
        if self.sessions.state(peer_id) == SessionState::NotTracking {
            return;
        }
        let session = self.sessions.entry(peer_id);
        session.audio_enabled = false;
        session.video_enabled = false;
        self.not_tracking(peer_id);
    }

    fn remove_all(&mut self) {
        for peer_id in self.sessions.ids() {
            self.apply(PendingAction::RemoveVideo(peer_id));
        }
    }

    fn set_mute(&mut self, peer_id: &str, kind: TrackKind, muted: bool) {
        let global = self.global_enabled(kind);
        if peer_id == self.my_id {
            if let Some(stream) = &self.stream_out {
                stream.set_enabled(kind, !muted && global);
            }
            return;
        }
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        match kind {
            TrackKind::Video => session.video_enabled = !muted,
            TrackKind::Audio => session.audio_enabled = !muted,
        }
        if let Some(stream) = &session.stream_out {
            stream.set_enabled(kind, !muted && global);
        }
    }

    fn set_mute_all(&mut self, kind: TrackKind, muted: bool) {
        match kind {
            TrackKind::Video => self.global_video_enabled = !muted,
            TrackKind::Audio => self.global_audio_enabled = !muted,
        }
        if let Some(stream) = &self.stream_out {
            stream.set_enabled(kind, !muted);
        }
        let with_outbound: Vec<String> = self
            .sessions
            .ids()
            .into_iter()
            .filter(|id| {
                self.sessions
                    .get(id)
                    .is_some_and(|session| session.stream_out.is_some())
            })
            .collect();
        for peer_id in with_outbound {
            self.set_mute(&peer_id, kind, muted);
        }
        tracing::debug!(target: "huddle::manager", kind = ?kind, muted, "global mute changed");
        self.events.fire(match kind {
            TrackKind::Video => StreamEvent::MutedVideo(muted),
            TrackKind::Audio => StreamEvent::MutedAudio(muted),
        });
    }

    fn global_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.global_video_enabled,
            TrackKind::Audio => self.global_audio_enabled,
        }
    }

    // ---- inbound traffic -------------------------------------------------

    fn on_channel_message(&mut self, message: PeerMessage) {
        let PeerMessage { event, from, data } = message;
        let state = self.sessions.state(&from);
        match event {
            SignalKind::Signal => match state {
                SessionState::Initializing => {
                    self.arm_timer(&from, TimerKind::Initializing);
                    self.forward_signal(&from, data);
                }
                SessionState::NotTracking | SessionState::Resetting => {
                    tracing::debug!(
                        target: "huddle::manager",
                        peer_id = %from,
                        state = %state,
                        "buffering signal"
                    );
                    self.sessions.entry(&from).pending_signal = Some(data);
                }
                SessionState::Streaming | SessionState::Broken => {
                    self.sessions.entry(&from).pending_signal = Some(data);
                    self.initializing(&from);
                }
            },
            SignalKind::RequestOffer => {
                tracing::debug!(target: "huddle::manager", peer_id = %from, "<- peer request offer");
                if matches!(state, SessionState::Streaming | SessionState::Broken) {
                    self.initializing(&from);
                }
            }
        }
    }

    fn forward_signal(&mut self, peer_id: &str, data: Value) {
        let Some(handle) = self
            .sessions
            .get_mut(peer_id)
            .and_then(|session| session.handle.as_mut())
        else {
            tracing::debug!(
                target: "huddle::manager",
                peer_id = %peer_id,
                "dropping signal: no live peer"
            );
            return;
        };
        tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "<- peer signal");
        if let Err(err) = handle.signal(data) {
            tracing::debug!(
                target: "huddle::manager",
                peer_id = %peer_id,
                error = %err,
                "dropping signal (is peer destroyed?)"
            );
        }
    }

    fn on_peer_event(&mut self, peer_id: &str, event: PeerEvent) {
        match event {
            PeerEvent::Connect => {
                tracing::info!(target: "huddle::manager", peer_id = %peer_id, "<- peer connect");
            }
            PeerEvent::Stream(stream) => {
                tracing::debug!(
                    target: "huddle::manager",
                    peer_id = %peer_id,
                    stream_id = %stream.id(),
                    "<- peer stream"
                );
                self.streaming(peer_id, stream);
            }
            PeerEvent::Signal(data) => {
                tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "-> peer signal");
                if let Some(channel) = &self.channel {
                    if let Err(err) = channel.signal(peer_id, data) {
                        tracing::warn!(
                            target: "huddle::manager",
                            peer_id = %peer_id,
                            error = %err,
                            "unable to relay peer signal"
                        );
                    }
                }
            }
            PeerEvent::Close => {
                // The handle is gone; renegotiate immediately.
                tracing::info!(target: "huddle::manager", peer_id = %peer_id, "<- peer close");
                self.initializing(peer_id);
            }
            PeerEvent::Error(err) => {
                tracing::warn!(
                    target: "huddle::manager",
                    peer_id = %peer_id,
                    error = %err,
                    "<- peer error"
                );
            }
        }
    }

    fn on_inbound_track(&mut self, peer_id: &str, event: TrackEvent) {
        match event {
            TrackEvent::Muted => {
                tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "<- track mute");
                if self.sessions.state(peer_id) == SessionState::Streaming {
                    self.broken(peer_id);
                }
            }
            TrackEvent::Unmuted => {
                tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "<- track unmute");
                if let Some(session) = self.sessions.get_mut(peer_id) {
                    session.broken_timer = None;
                }
                if self.sessions.state(peer_id) == SessionState::Broken {
                    self.transition(peer_id, SessionState::Streaming);
                }
            }
            TrackEvent::Ended => {
                tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "<- track ended");
            }
        }
    }

    fn on_timer(&mut self, peer_id: &str, kind: TimerKind, epoch: u64) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        if session.timer_epoch != epoch || session.timer_slot(kind).take().is_none() {
            return;
        }
        tracing::info!(
            target: "huddle::manager",
            peer_id = %peer_id,
            timer = ?kind,
            state = %session.state,
            "session timed out"
        );
        self.initializing(peer_id);
    }

    // ---- state entry -----------------------------------------------------

    fn transition(&mut self, peer_id: &str, state: SessionState) {
        self.sessions.entry(peer_id).state = state;
        tracing::info!(target: "huddle::manager", peer_id = %peer_id, state = %state, "= session state");
        self.events.fire(StreamEvent::StreamUpdate {
            id: peer_id.to_string(),
            state,
        });
    }

    fn arm_timer(&mut self, peer_id: &str, kind: TimerKind) {
        let delay = match kind {
            TimerKind::Initializing => self.config.timings.initializing_timeout,
            TimerKind::Broken => self.config.timings.broken_timeout,
        };
        let session = self.sessions.entry(peer_id);
        session.clear_timers();
        let epoch = session.timer_epoch;
        let tx = self.internal_tx.clone();
        let target = peer_id.to_string();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Internal::Timer {
                peer_id: target,
                kind,
                epoch,
            });
        });
        *session.timer_slot(kind) = Some(Timer::new(task));
    }

    fn reset(&mut self, peer_id: &str) {
        self.transition(peer_id, SessionState::Resetting);
        let clone_media = self.config.host.clone_media;
        let session = self.sessions.entry(peer_id);
        session.clear_timers();
        session.generation += 1;
        session.detach_track_listeners();
        if let Some(mut handle) = session.handle.take() {
            handle.destroy();
        }
        if let Some(stream) = session.stream_in.take() {
            stream.stop_all();
        }
        if clone_media {
            if let Some(stream) = session.stream_out.take() {
                stream.stop_all();
            }
        }
    }

    fn not_tracking(&mut self, peer_id: &str) {
        self.reset(peer_id);
        self.transition(peer_id, SessionState::NotTracking);
    }

    fn initializing(&mut self, peer_id: &str) {
        let Some(stream_out) = self.stream_out.clone() else {
            tracing::error!(
                target: "huddle::manager",
                peer_id = %peer_id,
                "cannot initialize session without a local stream"
            );
            return;
        };
        self.reset(peer_id);
        self.arm_timer(peer_id, TimerKind::Initializing);

        let initiator = is_initiator(&self.my_id, peer_id);
        if !initiator {
            if let Some(channel) = &self.channel {
                tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "-> peer request offer");
                if let Err(err) = channel.request_offer(peer_id) {
                    tracing::warn!(target: "huddle::manager", error = %err, "request offer failed");
                }
            }
        }

        let local_stream = if self.config.host.clone_media {
            stream_out.clone_stream()
        } else {
            stream_out
        };

        let generation = self.sessions.entry(peer_id).generation;
        let tx = self.internal_tx.clone();
        let target = peer_id.to_string();
        let events = PeerEvents::new(move |event| {
            let _ = tx.send(Internal::Peer {
                peer_id: target.clone(),
                generation,
                event,
            });
        });
        let mut handle = self.collaborators.peers.create(PeerOptions {
            remote_id: peer_id.to_string(),
            initiator,
            trickle: false,
            relay_servers: self.config.relay_servers.clone(),
            local_stream: local_stream.clone(),
            events,
        });

        let session = self.sessions.entry(peer_id);
        if let Some(signal) = session.pending_signal.take() {
            tracing::debug!(target: "huddle::manager", peer_id = %peer_id, "<- peer signal (buffered)");
            if let Err(err) = handle.signal(signal) {
                tracing::debug!(
                    target: "huddle::manager",
                    peer_id = %peer_id,
                    error = %err,
                    "buffered signal rejected"
                );
            }
        }
        session.stream_out = Some(local_stream);
        session.handle = Some(handle);
        tracing::debug!(target: "huddle::manager", peer_id = %peer_id, initiator, "peer handle created");
        self.transition(peer_id, SessionState::Initializing);
    }

    fn streaming(&mut self, peer_id: &str, stream_in: MediaStream) {
        self.transition(peer_id, SessionState::Streaming);
        let video_global = self.global_video_enabled;
        let audio_global = self.global_audio_enabled;
        let tx = self.internal_tx.clone();
        let session = self.sessions.entry(peer_id);
        session.clear_timers();
        session.detach_track_listeners();

        if let Some(stream_out) = &session.stream_out {
            stream_out.set_enabled(TrackKind::Video, session.video_enabled && video_global);
            stream_out.set_enabled(TrackKind::Audio, session.audio_enabled && audio_global);
        }

        let generation = session.generation;
        for track in stream_in.video_tracks() {
            for name in ["mute", "unmute", "ended"] {
                let tx = tx.clone();
                let target = peer_id.to_string();
                match track.on(name, move |event| {
                    let _ = tx.send(Internal::InboundTrack {
                        peer_id: target.clone(),
                        generation,
                        event: *event,
                    });
                }) {
                    Ok(subscription) => session.track_listeners.push((track.clone(), subscription)),
                    Err(err) => tracing::warn!(target: "huddle::manager", error = %err, "track listener rejected"),
                }
            }
        }
        session.stream_in = Some(stream_in.clone());

        self.events.fire(StreamEvent::StreamIn {
            id: peer_id.to_string(),
            stream: stream_in,
        });
    }

    fn broken(&mut self, peer_id: &str) {
        self.transition(peer_id, SessionState::Broken);
        self.arm_timer(peer_id, TimerKind::Broken);
    }
}
