//! Test doubles for the sensor, peer and transport seams
//!
//! Everything here is in-memory and deterministic. The mocks record what the
//! bridge asked of them so tests can assert on call order, and expose knobs
//! to inject the failures the real SDK and network produce.

#![cfg(any(test, feature = "test-utils"))]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::PeerServerConfig;
use crate::error::{BridgeError, PeerSendError, Result, SensorError};
use crate::gateway::PeerChannel;
use crate::sensor::{DepthSensor, FrameCallback, SensorFactory, SensorResult};
use crate::server::{RelayTransport, TransportEvent};
use crate::types::{CameraOptions, DepthMode, DepthRange, SensorFrame, TrackerOptions};

/// A call made on a [`MockSensor`] handle.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorCall {
    Open,
    StartCameras(CameraOptions),
    CreateTracker(Option<TrackerOptions>),
    DestroyTracker,
    StopCameras,
    StartListening,
    StopListening,
    Close,
}

#[derive(Default)]
struct SensorState {
    calls: Vec<SensorCall>,
    callback: Option<FrameCallback>,
    started: bool,
    tracker: bool,
    refuse_open: bool,
    fail_next_start: Option<String>,
    fail_next_tracker: Option<String>,
    fail_next_stop_listening: Option<String>,
    fail_next_destroy_tracker: Option<String>,
    fail_next_stop_cameras: Option<String>,
}

/// In-memory depth sensor. Clones share state, so a test keeps one clone
/// while the controller owns the handles made by [`MockSensor::factory`].
#[derive(Clone, Default)]
pub struct MockSensor {
    state: Arc<Mutex<SensorState>>,
}

impl MockSensor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory handing out handles backed by this mock.
    pub fn factory(&self) -> impl SensorFactory + use<> {
        let state = Arc::clone(&self.state);
        move || -> SensorResult<Box<dyn DepthSensor>> {
            Ok(Box::new(MockHandle { state: Arc::clone(&state) }))
        }
    }

    /// Push a frame through the registered callback, if any.
    ///
    /// Returns whether a callback received it.
    pub fn emit(&self, frame: SensorFrame) -> bool {
        let callback = self.state.lock().callback.clone();
        match callback {
            Some(callback) => {
                callback(Arc::new(frame));
                true
            }
            None => false,
        }
    }

    pub fn calls(&self) -> Vec<SensorCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, call: &SensorCall) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn is_listening(&self) -> bool {
        self.state.lock().callback.is_some()
    }

    pub fn cameras_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn refuse_open(&self) {
        self.state.lock().refuse_open = true;
    }

    pub fn fail_next_start(&self, message: &str) {
        self.state.lock().fail_next_start = Some(message.to_string());
    }

    pub fn fail_next_tracker(&self, message: &str) {
        self.state.lock().fail_next_tracker = Some(message.to_string());
    }

    /// The next `stop_listening` fails and keeps the callback registered.
    pub fn fail_next_stop_listening(&self, message: &str) {
        self.state.lock().fail_next_stop_listening = Some(message.to_string());
    }

    pub fn fail_next_destroy_tracker(&self, message: &str) {
        self.state.lock().fail_next_destroy_tracker = Some(message.to_string());
    }

    /// The next `stop_cameras` fails, though the cameras still end up stopped.
    pub fn fail_next_stop_cameras(&self, message: &str) {
        self.state.lock().fail_next_stop_cameras = Some(message.to_string());
    }
}

struct MockHandle {
    state: Arc<Mutex<SensorState>>,
}

impl MockHandle {
    fn record(&self, call: SensorCall) -> parking_lot::MutexGuard<'_, SensorState> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state
    }
}

#[async_trait::async_trait]
impl DepthSensor for MockHandle {
    fn open(&mut self) -> SensorResult<bool> {
        let state = self.record(SensorCall::Open);
        Ok(!state.refuse_open)
    }

    fn start_cameras(&mut self, options: &CameraOptions) -> SensorResult {
        let mut state = self.record(SensorCall::StartCameras(options.clone()));
        if let Some(message) = state.fail_next_start.take() {
            return Err(SensorError::Failed(message));
        }
        state.started = true;
        Ok(())
    }

    fn create_tracker(&mut self, options: Option<&TrackerOptions>) -> SensorResult {
        let mut state = self.record(SensorCall::CreateTracker(options.cloned()));
        if let Some(message) = state.fail_next_tracker.take() {
            return Err(SensorError::Failed(message));
        }
        if !state.started {
            return Err(SensorError::NotStarted);
        }
        state.tracker = true;
        Ok(())
    }

    fn destroy_tracker(&mut self) -> SensorResult {
        let mut state = self.record(SensorCall::DestroyTracker);
        if let Some(message) = state.fail_next_destroy_tracker.take() {
            state.tracker = false;
            return Err(SensorError::Failed(message));
        }
        if !std::mem::take(&mut state.tracker) {
            return Err(SensorError::TrackerNotCreated);
        }
        Ok(())
    }

    fn stop_cameras(&mut self) -> SensorResult {
        let mut state = self.record(SensorCall::StopCameras);
        if let Some(message) = state.fail_next_stop_cameras.take() {
            state.started = false;
            return Err(SensorError::Failed(message));
        }
        if !std::mem::take(&mut state.started) {
            return Err(SensorError::NotStarted);
        }
        Ok(())
    }

    fn start_listening(&mut self, callback: FrameCallback) -> SensorResult {
        let mut state = self.record(SensorCall::StartListening);
        if state.callback.is_some() {
            return Err(SensorError::failed("already listening"));
        }
        state.callback = Some(callback);
        Ok(())
    }

    async fn stop_listening(&mut self) -> SensorResult {
        let mut state = self.record(SensorCall::StopListening);
        if let Some(message) = state.fail_next_stop_listening.take() {
            return Err(SensorError::Failed(message));
        }
        match state.callback.take() {
            Some(_) => Ok(()),
            None => Err(SensorError::NotListening),
        }
    }

    fn close(&mut self) -> SensorResult {
        let mut state = self.record(SensorCall::Close);
        state.callback = None;
        state.started = false;
        state.tracker = false;
        Ok(())
    }

    fn depth_mode_range(&self, mode: DepthMode) -> SensorResult<DepthRange> {
        match mode {
            DepthMode::Nfov2x2Binned => Ok(DepthRange { min: 500, max: 5460 }),
            DepthMode::NfovUnbinned => Ok(DepthRange { min: 500, max: 3860 }),
            DepthMode::Wfov2x2Binned => Ok(DepthRange { min: 250, max: 2880 }),
            DepthMode::WfovUnbinned => Ok(DepthRange { min: 250, max: 2210 }),
            DepthMode::Off | DepthMode::PassiveIr => Err(SensorError::failed("no depth range")),
        }
    }
}

/// In-memory peer channel.
#[derive(Debug)]
pub struct MockPeer {
    id: String,
    buffered: AtomicUsize,
    connected: AtomicBool,
    failure: Mutex<Option<PeerSendError>>,
    sent: Mutex<Vec<String>>,
}

impl MockPeer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            buffered: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            failure: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Make every following send fail with `error`.
    pub fn fail_with(&self, error: PeerSendError) {
        *self.failure.lock() = Some(error);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Sent envelopes, parsed.
    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent.lock().iter().filter_map(|text| serde_json::from_str(text).ok()).collect()
    }

    /// Sent envelopes whose `event` matches.
    pub fn sent_events(&self, event: &str) -> Vec<serde_json::Value> {
        self.sent().into_iter().filter(|envelope| envelope["event"] == event).collect()
    }

    pub fn send_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl PeerChannel for MockPeer {
    fn id(&self) -> &str {
        &self.id
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, text: Arc<str>) -> std::result::Result<(), PeerSendError> {
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        if !self.is_connected() {
            return Err(PeerSendError::NotConnected);
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        self.set_connected(false);
    }
}

#[derive(Default)]
struct TransportState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    listening: bool,
    clients: HashMap<String, Arc<MockPeer>>,
    listen_calls: usize,
    failing_listens: usize,
    fail_close_listener: bool,
    rejected: Vec<String>,
}

/// Scriptable relay transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `listen` fail.
    pub fn fail_next_listens(&self, count: usize) {
        self.state.lock().failing_listens = count;
    }

    pub fn fail_close_listener(&self) {
        self.state.lock().fail_close_listener = true;
    }

    pub fn listen_calls(&self) -> usize {
        self.state.lock().listen_calls
    }

    pub fn rejected(&self) -> Vec<String> {
        self.state.lock().rejected.clone()
    }

    /// Connect a client and report it to the manager.
    pub fn connect(&self, peer: Arc<MockPeer>) {
        let mut state = self.state.lock();
        state.clients.insert(peer.id().to_string(), Arc::clone(&peer));
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Connected { peer });
        }
    }

    /// Connect a client without telling the manager.
    pub fn connect_quietly(&self, peer: Arc<MockPeer>) {
        self.state.lock().clients.insert(peer.id().to_string(), peer);
    }

    /// Disconnect a client and report it.
    pub fn disconnect(&self, id: &str) {
        let mut state = self.state.lock();
        if let Some(peer) = state.clients.remove(id) {
            peer.set_connected(false);
        }
        if let Some(events) = &state.events {
            let _ = events.send(TransportEvent::Disconnected { client_id: id.to_string() });
        }
    }

    /// Kill a client's socket without any event, as a half-open connection would.
    pub fn drop_silently(&self, id: &str) {
        if let Some(peer) = self.state.lock().clients.get(id) {
            peer.set_connected(false);
        }
    }

    pub fn message(&self, id: &str, text: &str) {
        if let Some(events) = &self.state.lock().events {
            let _ = events.send(TransportEvent::Message {
                client_id: id.to_string(),
                text: text.to_string(),
            });
        }
    }

    /// Report a listener failure.
    pub fn push_error(&self, reason: &str) {
        if let Some(events) = &self.state.lock().events {
            let _ = events.send(TransportEvent::Error { error: BridgeError::transport(reason) });
        }
    }
}

#[async_trait::async_trait]
impl RelayTransport for MockTransport {
    async fn listen(
        &self,
        config: &PeerServerConfig,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.listen_calls += 1;
        if state.failing_listens > 0 {
            state.failing_listens -= 1;
            return Err(BridgeError::transport(format!("address {} in use", config.bind_addr())));
        }
        state.listening = true;
        state.events = Some(events);
        Ok(())
    }

    fn has_listener(&self) -> bool {
        self.state.lock().listening
    }

    fn is_client_connected(&self, client_id: &str) -> bool {
        self.state.lock().clients.get(client_id).is_some_and(|peer| peer.is_connected())
    }

    fn connected_clients(&self) -> Vec<Arc<dyn PeerChannel>> {
        self.state
            .lock()
            .clients
            .values()
            .filter(|peer| peer.is_connected())
            .map(|peer| Arc::clone(peer) as Arc<dyn PeerChannel>)
            .collect()
    }

    fn reject(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(peer) = state.clients.remove(client_id) {
            peer.close();
        }
        state.rejected.push(client_id.to_string());
    }

    async fn close_client_sockets(&self) -> Result<()> {
        let mut state = self.state.lock();
        for (_, peer) in state.clients.drain() {
            peer.close();
        }
        Ok(())
    }

    async fn close_listener(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.listening = false;
        state.events = None;
        if state.fail_close_listener {
            return Err(BridgeError::transport("listener already closed"));
        }
        Ok(())
    }
}

/// Synthetic sensor frames.
pub mod frames {
    use crate::types::{Body, BodyFrame, ImageFrame, Joint, JointConfidence, SensorFrame};

    /// Joints per skeleton reported by the tracker.
    pub const JOINT_COUNT: usize = 32;

    fn joint(body: u32, index: usize) -> Joint {
        let offset = body as f32 * 0.1 + index as f32 * 0.01;
        Joint {
            camera_x: offset,
            camera_y: -offset,
            camera_z: 1500.0 + offset,
            depth_x: 0.25 + offset / 10.0,
            depth_y: 0.5,
            color_x: 0.3,
            color_y: 0.6,
            orientation_w: 1.0,
            orientation_x: 0.0,
            orientation_y: 0.0,
            orientation_z: 0.0,
            confidence: JointConfidence::Medium,
        }
    }

    fn body(id: u32) -> Body {
        Body { id, joints: (0..JOINT_COUNT).map(|i| joint(id, i)).collect() }
    }

    /// Frame with `count` tracked bodies (ids from 1) and a small depth image.
    pub fn body_frame(count: usize) -> SensorFrame {
        SensorFrame {
            depth: Some(ImageFrame::depth16(4, 4, &[1000; 16])),
            body: Some(BodyFrame {
                bodies: (1..=count as u32).map(body).collect(),
                body_index_map: None,
            }),
            device_timestamp_usec: 33_333,
            ..SensorFrame::default()
        }
    }

    /// Depth frame whose left half is body 0, optionally with its body index map.
    ///
    /// Without the map there is no body frame at all.
    pub fn depth_key_frame(width: u32, height: u32, with_map: bool) -> SensorFrame {
        let depth: Vec<u16> =
            (0..width * height).map(|i| 500 + (i * 7 % 3500) as u16).collect();
        let body = with_map.then(|| {
            let indices = (0..width * height)
                .map(|i| if i % width < width / 2 { 0 } else { crate::types::BODY_INDEX_BACKGROUND })
                .collect();
            BodyFrame {
                bodies: vec![self::body(1)],
                body_index_map: Some(ImageFrame::body_index(width, height, indices)),
            }
        });
        SensorFrame {
            depth: Some(ImageFrame::depth16(width, height, &depth)),
            body,
            device_timestamp_usec: 66_666,
            ..SensorFrame::default()
        }
    }
}
