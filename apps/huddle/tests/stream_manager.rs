use std::sync::Arc;
use std::time::Duration;

use huddle_core::manager::{
    Collaborators, ManagerConfig, SessionState, StreamEvent, StreamManager,
};
use huddle_core::media::{MediaConfig, MediaTrack, TrackKind};
use huddle_core::signaling::StaticCredentials;
use huddle_core::testing::{
    FakeMediaDevices, FakePeer, FakePeerConnector, ServerConnection, SignalingServer,
    inbound_stream, memory_signaling,
};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

struct Harness {
    manager: StreamManager,
    server: SignalingServer,
    devices: FakeMediaDevices,
    peers: FakePeerConnector,
    events: broadcast::Receiver<StreamEvent>,
}

/// Heartbeats pushed far out so they never interleave with session timers.
fn quiet_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.timings.channel.heartbeat_interval = Duration::from_secs(3600);
    config
}

fn harness(config: ManagerConfig) -> Harness {
    let (connector, server) = memory_signaling();
    let devices = FakeMediaDevices::new();
    let peers = FakePeerConnector::new();
    let manager = StreamManager::new(
        Collaborators {
            connector: Arc::new(connector),
            credentials: Arc::new(StaticCredentials::new("token")),
            devices: Arc::new(devices.clone()),
            peers: Arc::new(peers.clone()),
        },
        config,
    );
    let events = manager.subscribe();
    Harness {
        manager,
        server,
        devices,
        peers,
        events,
    }
}

impl Harness {
    async fn start(&mut self, identity: &str) -> ServerConnection {
        self.manager
            .start(identity, MediaConfig::default())
            .unwrap();
        let mut conn = self.server.accept().await.expect("signaling connection");
        assert_eq!(conn.recv().await.unwrap()["event"], "identify");
        self.next(|event| matches!(event, StreamEvent::StreamOut(_)))
            .await;
        conn
    }

    async fn next(&mut self, wanted: impl Fn(&StreamEvent) -> bool) -> StreamEvent {
        loop {
            let event = self.events.recv().await.expect("event stream open");
            if wanted(&event) {
                return event;
            }
        }
    }

    async fn reach(&mut self, peer_id: &str, state: SessionState) {
        self.next(|event| {
            matches!(event, StreamEvent::StreamUpdate { id, state: s } if id == peer_id && *s == state)
        })
        .await;
    }

    /// Every event fired so far that has not been consumed.
    fn drain(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn latest_peer(&self, peer_id: &str) -> FakePeer {
        self.peers.latest(peer_id).expect("peer created")
    }

    async fn streaming_with(&mut self, peer_id: &str) -> (FakePeer, MediaTrack) {
        self.manager.add_video(peer_id).unwrap();
        self.reach(peer_id, SessionState::Initializing).await;
        let peer = self.latest_peer(peer_id);
        let inbound = inbound_stream();
        let video = inbound.video_tracks().next().cloned().expect("video track");
        peer.emit_stream(inbound);
        self.reach(peer_id, SessionState::Streaming).await;
        (peer, video)
    }
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn smaller_id_requests_offer_and_streams() {
    let mut h = harness(quiet_config());
    let mut conn = h.start("A").await;

    h.manager.add_video("B").unwrap();
    h.reach("B", SessionState::Initializing).await;
    assert_eq!(
        conn.recv_non_ping().await.unwrap(),
        json!({"event": "request_offer", "data": {"to": "B"}})
    );

    let peer = h.latest_peer("B");
    assert!(!peer.initiator());
    assert!(!peer.trickle());
    assert_eq!(peer.relay_servers(), ManagerConfig::default().relay_servers);

    conn.push(json!({"event": "signal", "data": {"from": "B", "data": {"type": "offer"}}}));
    settle().await;
    assert_eq!(peer.signals(), vec![json!({"type": "offer"})]);

    peer.emit_signal(json!({"type": "answer"}));
    assert_eq!(
        conn.recv_non_ping().await.unwrap(),
        json!({"event": "signal", "data": {"to": "B", "data": {"type": "answer"}}})
    );

    let inbound = inbound_stream();
    peer.emit_stream(inbound.clone());
    let event = h
        .next(|event| matches!(event, StreamEvent::StreamIn { .. }))
        .await;
    assert_eq!(
        event,
        StreamEvent::StreamIn {
            id: "B".into(),
            stream: inbound
        }
    );
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Streaming);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn larger_id_initiates_without_requesting() {
    let mut h = harness(quiet_config());
    let mut conn = h.start("B").await;

    h.manager.add_video("A").unwrap();
    h.reach("A", SessionState::Initializing).await;
    assert!(h.latest_peer("A").initiator());

    h.manager.assert_control().unwrap();
    assert_eq!(
        conn.recv_non_ping().await.unwrap(),
        json!({"event": "assert_control"})
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn repeated_add_video_is_a_no_op() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;

    h.manager.add_video("B").unwrap();
    h.reach("B", SessionState::Initializing).await;
    h.manager.add_video("B").unwrap();
    settle().await;

    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Initializing);
    assert_eq!(h.peers.created_count(), 1);
    assert!(h.drain().is_empty());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn remove_video_on_untracked_peer_is_silent() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;

    h.manager.remove_video("ghost").unwrap();
    settle().await;

    assert_eq!(
        h.manager.state("ghost").await.unwrap(),
        SessionState::NotTracking
    );
    assert!(h.manager.states().await.unwrap().is_empty());
    assert!(h.drain().is_empty());
    assert_eq!(h.peers.created_count(), 0);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn remove_video_tears_the_session_down() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (peer, _) = h.streaming_with("B").await;

    h.manager.remove_video("B").unwrap();
    h.reach("B", SessionState::Resetting).await;
    h.reach("B", SessionState::NotTracking).await;

    assert!(peer.is_destroyed());
    assert!(peer.local_stream().tracks().iter().all(|t| t.is_stopped()));
    // The captured stream itself keeps running.
    let local = h.devices.last_stream().unwrap();
    assert!(local.tracks().iter().all(|t| !t.is_stopped()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn signal_while_streaming_renegotiates_on_a_fresh_peer() {
    let mut h = harness(quiet_config());
    let conn = h.start("A").await;
    let (first, _) = h.streaming_with("B").await;

    conn.push(json!({"event": "signal", "data": {"from": "B", "data": {"type": "offer", "n": 2}}}));
    h.reach("B", SessionState::Initializing).await;

    assert!(first.is_destroyed());
    let second = h.latest_peer("B");
    assert_eq!(h.peers.created_count(), 2);
    assert_eq!(second.signals(), vec![json!({"type": "offer", "n": 2})]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn signal_before_add_video_is_replayed() {
    let mut h = harness(quiet_config());
    let conn = h.start("A").await;

    conn.push(json!({"event": "signal", "data": {"from": "B", "data": {"type": "offer"}}}));
    settle().await;
    assert_eq!(h.peers.created_count(), 0);
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::NotTracking);

    h.manager.add_video("B").unwrap();
    h.reach("B", SessionState::Initializing).await;
    assert_eq!(h.latest_peer("B").signals(), vec![json!({"type": "offer"})]);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn request_offer_while_streaming_restarts_negotiation() {
    let mut h = harness(quiet_config());
    let conn = h.start("A").await;
    let (first, _) = h.streaming_with("B").await;

    conn.push(json!({"event": "request_offer", "data": {"from": "B"}}));
    h.reach("B", SessionState::Initializing).await;
    assert!(first.is_destroyed());
    assert_eq!(h.peers.created_count(), 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn muted_inbound_video_breaks_then_times_out() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (first, video) = h.streaming_with("B").await;

    video.mute();
    h.reach("B", SessionState::Broken).await;
    let broken_at = Instant::now();

    h.reach("B", SessionState::Initializing).await;
    assert!(broken_at.elapsed() >= Duration::from_secs(30));
    assert!(first.is_destroyed());
    assert_eq!(h.peers.created_count(), 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unmute_before_timeout_recovers() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (peer, video) = h.streaming_with("B").await;

    video.mute();
    h.reach("B", SessionState::Broken).await;
    sleep(Duration::from_secs(10)).await;
    video.unmute();
    h.reach("B", SessionState::Streaming).await;

    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Streaming);
    assert!(!peer.is_destroyed());
    assert_eq!(h.peers.created_count(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn stalled_negotiation_retries_after_timeout() {
    let mut h = harness(quiet_config());
    let _conn = h.start("B").await;

    h.manager.add_video("A").unwrap();
    h.reach("A", SessionState::Initializing).await;
    let started = Instant::now();

    h.reach("A", SessionState::Resetting).await;
    h.reach("A", SessionState::Initializing).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(h.peers.created_count(), 2);
    assert!(h.peers.peers_for("A")[0].is_destroyed());
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn peer_close_self_heals() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (first, _) = h.streaming_with("B").await;

    first.emit_close();
    h.reach("B", SessionState::Initializing).await;
    assert_eq!(h.peers.created_count(), 2);

    // Callbacks from the torn-down connection are ignored.
    first.emit_stream(inbound_stream());
    settle().await;
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Initializing);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn peer_errors_are_not_fatal() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (peer, _) = h.streaming_with("B").await;

    peer.emit_error("ice failed");
    peer.emit_connect();
    settle().await;
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Streaming);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn global_audio_mute_applies_to_every_session() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (b, _) = h.streaming_with("B").await;
    let (c, _) = h.streaming_with("C").await;
    h.drain();

    h.manager.set_mute_audio_all(true).unwrap();
    settle().await;

    for peer in [&b, &c] {
        assert!(peer.local_stream().audio_tracks().all(|t| !t.is_enabled()));
        assert!(peer.local_stream().video_tracks().all(|t| t.is_enabled()));
    }
    let local = h.devices.last_stream().unwrap();
    assert!(local.audio_tracks().all(|t| !t.is_enabled()));

    let events = h.drain();
    assert_eq!(events, vec![StreamEvent::MutedAudio(true)]);

    // A per-peer unmute cannot override the global mute.
    h.manager.set_mute_audio("B", false).unwrap();
    settle().await;
    assert!(b.local_stream().audio_tracks().all(|t| !t.is_enabled()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn per_peer_video_mute_only_touches_that_peer() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let (b, _) = h.streaming_with("B").await;
    let (c, _) = h.streaming_with("C").await;

    h.manager.set_mute_video("B", true).unwrap();
    settle().await;
    assert!(b.local_stream().video_tracks().all(|t| !t.is_enabled()));
    assert!(c.local_stream().video_tracks().all(|t| t.is_enabled()));

    h.manager.set_mute_video("A", true).unwrap();
    settle().await;
    let local = h.devices.last_stream().unwrap();
    assert!(local.video_tracks().all(|t| !t.is_enabled()));
    assert!(c.local_stream().video_tracks().all(|t| t.is_enabled()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn actions_before_capture_are_replayed_in_order() {
    let mut h = harness(quiet_config());
    h.devices.fail_next(2);

    h.manager.start("A", MediaConfig::default()).unwrap();
    h.manager.add_video("B").unwrap();
    h.manager.assert_control().unwrap();
    assert!(!h.manager.is_ready().await.unwrap());

    let mut conn = h.server.accept().await.expect("signaling connection");
    assert_eq!(conn.recv().await.unwrap()["event"], "identify");

    let started = Instant::now();
    h.next(|event| matches!(event, StreamEvent::StreamOut(_)))
        .await;
    assert!(started.elapsed() >= Duration::from_secs(2));
    assert_eq!(h.devices.calls(), 3);
    assert!(h.manager.is_ready().await.unwrap());

    h.reach("B", SessionState::Initializing).await;
    assert_eq!(
        conn.recv_non_ping().await.unwrap(),
        json!({"event": "request_offer", "data": {"to": "B"}})
    );
    assert_eq!(
        conn.recv_non_ping().await.unwrap(),
        json!({"event": "assert_control"})
    );
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn ended_local_track_is_recaptured() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let first = h.devices.last_stream().unwrap();
    let (peer, _) = h.streaming_with("B").await;

    first.video_tracks().next().unwrap().end();
    let event = h
        .next(|event| matches!(event, StreamEvent::StreamOut(_)))
        .await;
    let StreamEvent::StreamOut(second) = event else {
        unreachable!()
    };
    assert_ne!(second.id(), first.id());
    assert_eq!(h.devices.calls(), 2);
    // Sessions send their own copies, so the old capture can be released.
    assert!(first.audio_tracks().all(|t| t.is_stopped()));
    assert!(peer.local_stream().tracks().iter().all(|t| !t.is_stopped()));
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Streaming);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn start_twice_only_reannounces_local_stream() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    let local = h.devices.last_stream().unwrap();

    h.manager.start("A", MediaConfig::default()).unwrap();
    let event = h
        .next(|event| matches!(event, StreamEvent::StreamOut(_)))
        .await;
    assert_eq!(event, StreamEvent::StreamOut(local));
    assert_eq!(h.devices.calls(), 1);
    assert_eq!(h.server.connect_attempts(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn shared_media_when_cloning_unsupported() {
    let mut config = quiet_config();
    config.host.clone_media = false;
    let mut h = harness(config);
    let _conn = h.start("A").await;
    let (peer, _) = h.streaming_with("B").await;

    let local = h.devices.last_stream().unwrap();
    assert_eq!(peer.local_stream(), &local);

    h.manager.remove_video("B").unwrap();
    h.reach("B", SessionState::NotTracking).await;
    assert!(local.tracks().iter().all(|t| !t.is_stopped()));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn recapture_keeps_shared_stream_running_for_live_sessions() {
    let mut config = quiet_config();
    config.host.clone_media = false;
    let mut h = harness(config);
    let _conn = h.start("A").await;
    let (peer, _) = h.streaming_with("B").await;
    let shared = h.devices.last_stream().unwrap();

    shared.video_tracks().next().unwrap().end();
    h.next(|event| matches!(event, StreamEvent::StreamOut(_)))
        .await;
    assert_eq!(h.devices.calls(), 2);

    // Only the track whose source went away is stopped.
    assert!(peer.local_stream().audio_tracks().all(|t| !t.is_stopped()));
    assert!(peer.local_stream().video_tracks().all(|t| t.is_stopped()));
    assert!(!peer.is_destroyed());
    assert_eq!(h.manager.state("B").await.unwrap(), SessionState::Streaming);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn reload_is_re_announced() {
    let mut h = harness(quiet_config());
    let conn = h.start("A").await;

    conn.push(json!({"event": "reload"}));
    let event = h.next(|event| matches!(event, StreamEvent::Reload)).await;
    assert_eq!(event, StreamEvent::Reload);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn remove_all_untracks_everyone() {
    let mut h = harness(quiet_config());
    let _conn = h.start("A").await;
    h.streaming_with("B").await;
    h.streaming_with("C").await;

    h.manager.remove_all().unwrap();
    h.reach("B", SessionState::NotTracking).await;
    h.reach("C", SessionState::NotTracking).await;
    let states = h.manager.states().await.unwrap();
    assert!(states.values().all(|s| *s == SessionState::NotTracking));
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn destroy_is_idempotent_and_releases_everything() {
    let mut h = harness(quiet_config());
    let mut conn = h.start("A").await;
    let (peer, _) = h.streaming_with("B").await;
    let local = h.devices.last_stream().unwrap();

    h.manager.destroy().await.unwrap();
    h.manager.destroy().await.unwrap();

    assert!(peer.is_destroyed());
    assert!(local.tracks().iter().all(|t| t.is_stopped()));
    assert!(h.manager.states().await.unwrap().is_empty());
    assert!(!h.manager.is_ready().await.unwrap());
    assert!(conn.recv_non_ping().await.is_none());

    // A destroyed manager can be started again from scratch.
    let _conn = h.start("A").await;
    assert_eq!(h.devices.calls(), 2);
}
