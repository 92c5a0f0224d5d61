//! End-to-end streaming scenarios
//!
//! A bridge over the mock sensor, with mock peers attached to its gateway.
//! Frames are injected through the sensor callback and observed on the UI
//! bus and on the peers.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kinectron::config::BridgeConfig;
use kinectron::handlers::FEED_EVENT;
use kinectron::server::ManagerEvent;
use kinectron::test_utils::{MockPeer, MockSensor, MockTransport, SensorCall, frames};
use kinectron::ui::{BODY_FRAME, DEPTH_KEY_FRAME};
use kinectron::{Bridge, FeedKind, PeerServerManager, StreamState, UiEvent};
use tokio::sync::broadcast;

async fn bridge(config: BridgeConfig) -> (MockSensor, Bridge) {
    let sensor = MockSensor::new();
    let bridge = Bridge::new(sensor.factory(), config);
    bridge.initialize().await.unwrap();
    (sensor, bridge)
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn frame_events(ui: &mut broadcast::Receiver<UiEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = ui.try_recv() {
        if matches!(event, UiEvent::Frame { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test(start_paused = true)]
async fn body_frame_reaches_ui_and_every_peer_once() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let peers = [MockPeer::new("p1"), MockPeer::new("p2")];
    for peer in &peers {
        bridge.gateway().add_peer(peer.clone());
    }
    let mut ui = bridge.ui().subscribe();

    assert!(bridge.surface().invoke("start-body-tracking").await);
    assert!(sensor.emit(frames::body_frame(2)));
    settle().await;

    assert_eq!(frame_events(&mut ui), 1);
    for peer in &peers {
        let sent = peer.sent_events("bodyFrame");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["data"]["name"], "bodyFrame");
        assert_eq!(sent[0]["data"]["bodies"].as_array().unwrap().len(), 2);
        assert!(sent[0]["timestamp"].as_u64().unwrap() > 0);
    }
}

#[tokio::test(start_paused = true)]
async fn frames_without_bodies_are_not_delivered() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let peer = MockPeer::new("viewer");
    bridge.gateway().add_peer(peer.clone());
    let mut ui = bridge.ui().subscribe();

    assert!(bridge.start_feed(FeedKind::Body).await);
    let mut empty = frames::body_frame(1);
    empty.body.as_mut().unwrap().bodies.clear();
    sensor.emit(empty);
    settle().await;

    assert_eq!(frame_events(&mut ui), 0);
    assert_eq!(peer.send_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn depth_key_frame_without_body_index_map_is_dropped() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let peer = MockPeer::new("viewer");
    bridge.gateway().add_peer(peer.clone());
    let mut ui = bridge.ui().subscribe();

    assert!(bridge.surface().invoke("start-depth-key-stream").await);
    sensor.emit(frames::depth_key_frame(16, 16, false));
    settle().await;

    assert_eq!(frame_events(&mut ui), 0);
    assert!(peer.sent_events("depth-key").is_empty());
    assert_eq!(bridge.depth_key_handler().state(), StreamState::Active);
}

#[tokio::test]
async fn depth_key_frame_is_encoded_and_delivered() {
    let mut config = BridgeConfig::default();
    config.handlers.tracker_warmup_ms = 0;
    let (sensor, bridge) = bridge(config).await;
    let peer = MockPeer::new("viewer");
    bridge.gateway().add_peer(peer.clone());
    let mut packages = Box::pin(bridge.ui().frames(DEPTH_KEY_FRAME));

    assert!(bridge.start_feed(FeedKind::DepthKey).await);
    sensor.emit(frames::depth_key_frame(64, 48, true));

    let package = tokio::time::timeout(Duration::from_secs(5), packages.next())
        .await
        .expect("depth-key frame within 5s")
        .unwrap();
    assert_eq!(package.name, "depth-key");
    assert_eq!((package.width, package.height), (64, 48));

    settle().await;
    let sent = peer.sent_events("depth-key");
    assert_eq!(sent.len(), 1);
    let data = sent[0]["data"]["imageData"]["data"].as_str().unwrap();
    assert!(data.starts_with("data:image/webp;base64,"));
}

#[tokio::test(start_paused = true)]
async fn restart_request_stops_before_starting_again() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    assert!(bridge.surface().invoke("start-body-tracking").await);
    sensor.clear_calls();

    let started = tokio::time::Instant::now();
    assert!(bridge.surface().invoke("start-body-tracking").await);
    assert!(started.elapsed() >= Duration::from_millis(500));

    let calls = sensor.calls();
    let position = |wanted: fn(&SensorCall) -> bool| calls.iter().position(wanted).unwrap();
    let stop_listening = position(|c| *c == SensorCall::StopListening);
    let stop_cameras = position(|c| *c == SensorCall::StopCameras);
    let start_cameras = position(|c| matches!(c, SensorCall::StartCameras(_)));
    let start_listening = position(|c| *c == SensorCall::StartListening);
    assert!(stop_listening < stop_cameras);
    assert!(stop_cameras < start_cameras);
    assert!(start_cameras < start_listening);
    assert_eq!(sensor.count(&SensorCall::StartListening), 1);
}

#[tokio::test(start_paused = true)]
async fn back_pressured_peer_skips_frames_but_gets_stop_notice() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let slow = MockPeer::new("slow");
    let fast = MockPeer::new("fast");
    slow.set_buffered(64 * 1024);
    bridge.gateway().add_peer(slow.clone());
    bridge.gateway().add_peer(fast.clone());

    assert!(bridge.start_feed(FeedKind::Body).await);
    for _ in 0..3 {
        sensor.emit(frames::body_frame(1));
        settle().await;
    }
    assert!(bridge.stop_feed(FeedKind::Body).await);

    assert!(slow.sent_events("bodyFrame").is_empty());
    assert_eq!(fast.sent_events("bodyFrame").len(), 3);
    for peer in [&slow, &fast] {
        let stops = peer.sent_events(FEED_EVENT);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0]["data"]["type"], "body");
    }
}

#[tokio::test(start_paused = true)]
async fn stopping_a_displaced_feed_leaves_the_new_feed_streaming() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let peer = MockPeer::new("viewer");
    bridge.gateway().add_peer(peer.clone());

    assert!(bridge.start_feed(FeedKind::DepthKey).await);
    tokio::task::yield_now().await;
    assert!(bridge.start_feed(FeedKind::Body).await);
    assert!(bridge.stop_feed(FeedKind::DepthKey).await);

    assert_eq!(bridge.body_handler().state(), StreamState::Active);
    assert_eq!(bridge.depth_key_handler().state(), StreamState::Inactive);
    assert_eq!(bridge.controller().active_feed(), Some(FeedKind::Body));
    assert!(sensor.is_listening());
    assert!(sensor.cameras_started());

    sensor.emit(frames::body_frame(1));
    settle().await;
    assert_eq!(peer.sent_events("bodyFrame").len(), 1);
    let stops = peer.sent_events(FEED_EVENT);
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["data"]["type"], "depth-key");
}

#[tokio::test(start_paused = true)]
async fn ui_receives_frames_with_no_peers_connected() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let mut packages = Box::pin(bridge.ui().frames(BODY_FRAME));

    assert!(bridge.start_feed(FeedKind::Skeleton).await);
    sensor.emit(frames::body_frame(1));

    let package = packages.next().await.unwrap();
    assert_eq!(package.body_count(), 1);
    assert_eq!(bridge.gateway().peer_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_peer_is_pruned_while_others_keep_receiving() {
    let (sensor, bridge) = bridge(BridgeConfig::default()).await;
    let gone = MockPeer::new("gone");
    let stays = MockPeer::new("stays");
    gone.fail_with(kinectron::PeerSendError::Closed);
    bridge.gateway().add_peer(gone.clone());
    bridge.gateway().add_peer(stays.clone());

    assert!(bridge.start_feed(FeedKind::Body).await);
    sensor.emit(frames::body_frame(1));
    settle().await;
    sensor.emit(frames::body_frame(1));
    settle().await;

    assert!(!bridge.gateway().contains("gone"));
    assert_eq!(stays.sent_events("bodyFrame").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn peer_feed_requests_drive_the_bridge() {
    let (_sensor, bridge) = bridge(BridgeConfig::default()).await;
    let transport = MockTransport::new();
    let manager = PeerServerManager::new(
        transport.clone(),
        Default::default(),
        Arc::clone(bridge.gateway()),
    );
    let mut events = manager.subscribe();
    let routing = bridge.attach_server(&manager);
    manager.initialize().await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), ManagerEvent::Ready { .. }));

    let viewer = MockPeer::new("viewer");
    transport.connect(viewer.clone());
    transport.message("viewer", r#"{"event":"feed","data":{"feed":"body"}}"#);
    settle().await;
    assert_eq!(bridge.body_handler().state(), StreamState::Active);

    transport.message("viewer", r#"{"event":"feed","data":{"feed":"stop-all"}}"#);
    settle().await;
    assert_eq!(bridge.body_handler().state(), StreamState::Inactive);
    assert_eq!(viewer.sent_events(FEED_EVENT).len(), 1);

    manager.close().await;
    routing.abort();
}
