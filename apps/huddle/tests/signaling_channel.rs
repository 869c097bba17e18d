use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use huddle_core::signaling::{
    ChannelEvent, ChannelTimings, ConnectionState, SignalKind, SignalingChannel,
    StaticCredentials,
};
use huddle_core::testing::{MemoryConnector, memory_signaling};
use serde_json::json;
use tokio::time::{Instant, sleep};

fn spawn(identity: &str, connector: MemoryConnector) -> SignalingChannel {
    SignalingChannel::spawn(
        identity,
        Arc::new(connector),
        Arc::new(StaticCredentials::new("token-1")),
        ChannelTimings::default(),
    )
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn queued_messages_flush_in_order_after_reconnect() {
    let (connector, mut server) = memory_signaling();
    let channel = spawn("A", connector);
    let mut state = channel.watch_state();

    let conn = server.accept().await.expect("first connection");
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    drop(conn);
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    let dropped_at = Instant::now();

    channel.request_offer("B").unwrap();
    channel.signal("C", json!({"type": "offer", "sdp": "v=0"})).unwrap();
    channel.assert_control().unwrap();

    let mut conn = server.accept().await.expect("second connection");
    assert!(dropped_at.elapsed() >= Duration::from_secs(5));
    assert_eq!(
        conn.recv().await.unwrap(),
        json!({"event": "identify", "data": {"token": "token-1", "uuid": "A"}})
    );
    assert_eq!(
        conn.recv().await.unwrap(),
        json!({"event": "request_offer", "data": {"to": "B"}})
    );
    assert_eq!(
        conn.recv().await.unwrap(),
        json!({"event": "signal", "data": {"to": "C", "data": {"type": "offer", "sdp": "v=0"}}})
    );
    assert_eq!(
        conn.recv().await.unwrap(),
        json!({"event": "assert_control"})
    );
    assert_eq!(server.connect_attempts(), 2);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn unanswered_ping_closes_and_reconnects() {
    let (connector, mut server) = memory_signaling();
    let _channel = spawn("A", connector);

    let mut conn = server.accept().await.expect("connection");
    let opened_at = Instant::now();
    conn.recv().await.expect("identify");

    assert_eq!(conn.recv().await.unwrap(), json!({"event": "ping"}));
    let first_ping = opened_at.elapsed();
    assert!(first_ping >= Duration::from_secs(30) && first_ping < Duration::from_secs(31));

    // Never answer: the next tick closes the socket.
    assert!(conn.recv().await.is_none());
    let closed = opened_at.elapsed();
    assert!(closed >= Duration::from_secs(60) && closed < Duration::from_secs(61));

    let mut next = server.accept().await.expect("reconnect");
    let reconnected = opened_at.elapsed();
    assert!(reconnected >= Duration::from_secs(65) && reconnected < Duration::from_secs(66));
    assert_eq!(next.recv().await.unwrap()["event"], "identify");
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn answered_pings_keep_the_socket_open() {
    let (connector, mut server) = memory_signaling();
    let channel = spawn("A", connector);

    let mut conn = server.accept().await.expect("connection");
    conn.recv().await.expect("identify");
    for _ in 0..3 {
        assert_eq!(conn.recv().await.unwrap(), json!({"event": "ping"}));
        conn.push(json!({"event": "pong"}));
    }

    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(server.connect_attempts(), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn failed_connects_retry_on_the_reconnect_interval() {
    let (connector, mut server) = memory_signaling();
    server.set_reachable(false);
    let channel = spawn("A", connector);

    sleep(Duration::from_secs(12)).await;
    assert_eq!(server.connect_attempts(), 3);
    assert_ne!(channel.state(), ConnectionState::Connected);

    server.set_reachable(true);
    let mut conn = server.accept().await.expect("connection");
    assert_eq!(server.connect_attempts(), 4);
    assert_eq!(conn.recv().await.unwrap()["event"], "identify");
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn inbound_traffic_reaches_listeners() {
    let (connector, mut server) = memory_signaling();
    let channel = spawn("A", connector);

    let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let received = Arc::clone(&received);
        channel.on_message(move |message| received.lock().push(message.clone()));
    }
    let reloads = Arc::new(AtomicUsize::new(0));
    {
        let reloads = Arc::clone(&reloads);
        channel.on_reload(move || {
            reloads.fetch_add(1, Ordering::SeqCst);
        });
    }
    let mut events = channel.subscribe();

    let mut conn = server.accept().await.expect("connection");
    conn.recv().await.expect("identify");
    conn.push(json!({"event": "request_offer", "data": {"from": "B"}}));
    conn.push(json!({"event": "signal", "data": {"from": "C", "data": {"type": "answer"}}}));
    conn.push(json!({"event": "reload"}));

    loop {
        if let ChannelEvent::Reload = events.recv().await.unwrap() {
            break;
        }
    }

    let received = received.lock();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].event, SignalKind::RequestOffer);
    assert_eq!(received[0].from, "B");
    assert_eq!(received[1].event, SignalKind::Signal);
    assert_eq!(received[1].from, "C");
    assert_eq!(received[1].data, json!({"type": "answer"}));
    assert_eq!(reloads.load(Ordering::SeqCst), 1);
}

#[test_timeout::tokio_timeout_test(10, paused)]
async fn state_listeners_see_each_transition_once() {
    let (connector, mut server) = memory_signaling();
    let channel = spawn("A", connector);
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = Arc::clone(&seen);
        channel.on_state_change(move |state| seen.lock().push(state));
    }

    let mut conn = server.accept().await.expect("connection");
    conn.recv().await.expect("identify");
    let mut state = channel.watch_state();
    state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    channel.destroy();
    assert!(conn.recv().await.is_none());

    // Listeners are cleared by destroy, so only the live transitions land.
    assert_eq!(
        *seen.lock(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}
