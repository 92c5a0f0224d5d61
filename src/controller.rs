//! Device session controller
//!
//! Owns the single sensor handle. Every start force-stops whatever was
//! running first, so at most one feed owns the device at a time. The current
//! owner is published on a watch channel; handlers use it to notice that
//! another feed took the device from them.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result, SensorError};
use crate::logging::targets;
use crate::sensor::{DepthSensor, FrameCallback, SensorFactory, SensorResult};
use crate::types::{
    CameraOptions, DepthMode, DepthRange, FeedKind, FramePresence, SensorFrame, TrackerOptions,
};

/// Rolling window for frame-rate statistics.
pub const FRAME_RATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Default)]
struct DeviceSlot {
    sensor: Option<Box<dyn DepthSensor>>,
    listening: bool,
    tracker: bool,
}

/// Frame counts over one statistics window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameRateReport {
    pub total: u64,
    pub depth: u64,
    pub color: u64,
    pub body: u64,
    pub elapsed: Duration,
}

impl FrameRateReport {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.total as f64 / secs } else { 0.0 }
    }
}

/// Counts frames by content and yields a report once per window.
#[derive(Debug)]
pub struct FrameRateStats {
    window: Duration,
    started: Instant,
    current: FrameRateReport,
}

impl FrameRateStats {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self { window, started: now, current: FrameRateReport::default() }
    }

    pub fn record(&mut self, presence: FramePresence, now: Instant) -> Option<FrameRateReport> {
        self.current.total += 1;
        self.current.depth += presence.depth as u64;
        self.current.color += presence.color as u64;
        self.current.body += presence.body as u64;

        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.window {
            return None;
        }
        let report = FrameRateReport { elapsed, ..self.current };
        self.current = FrameRateReport::default();
        self.started = now;
        Some(report)
    }
}

/// Serializes all access to the sensor handle.
pub struct DeviceController {
    factory: Box<dyn SensorFactory>,
    slot: Mutex<DeviceSlot>,
    owner: watch::Sender<Option<FeedKind>>,
}

impl DeviceController {
    pub fn new(factory: impl SensorFactory) -> Self {
        let (owner, _) = watch::channel(None);
        Self { factory: Box::new(factory), slot: Mutex::new(DeviceSlot::default()), owner }
    }

    /// Open a fresh sensor handle, closing any stale one first.
    pub async fn initialize(&self) -> Result<()> {
        let mut guard = self.slot.lock().await;
        let slot = &mut *guard;

        if let Some(mut stale) = slot.sensor.take() {
            info!("Closing stale device handle before re-initializing");
            Self::force_stop(stale.as_mut(), &mut slot.listening, &mut slot.tracker).await;
            best_effort("close", stale.close());
            self.owner.send_replace(None);
        }

        let mut sensor = self.factory.create().map_err(|e| BridgeError::device("create", e))?;
        match sensor.open() {
            Ok(true) => {
                info!("Depth sensor opened");
                slot.sensor = Some(sensor);
                Ok(())
            }
            Ok(false) => Err(BridgeError::device("open", SensorError::NoDevice)),
            Err(e) => Err(BridgeError::device("open", e)),
        }
    }

    /// Start the cameras (and tracker, where needed) for `kind`.
    ///
    /// Whatever was running is stopped first. Returns `false` on any failure;
    /// the cause is logged.
    pub async fn start(&self, kind: FeedKind, overrides: &CameraOptions) -> bool {
        let options = overrides.merged_over(&kind.default_options());
        let mut slot = self.slot.lock().await;
        let DeviceSlot { sensor, listening, tracker } = &mut *slot;
        let Some(sensor) = sensor.as_deref_mut() else {
            error!(feed = %kind, "Cannot start feed: {}", BridgeError::NotInitialized);
            return false;
        };

        Self::force_stop(sensor, listening, tracker).await;
        self.owner.send_replace(None);

        debug!(target: targets::HANDLERS, feed = %kind, ?options, "Starting cameras");
        if let Err(e) = sensor.start_cameras(&options) {
            error!(feed = %kind, "Failed to start cameras: {}", BridgeError::device("start_cameras", e));
            return false;
        }

        if kind.uses_tracker() {
            let tracker_options = (kind == FeedKind::Key).then(TrackerOptions::gpu);
            if let Err(e) = sensor.create_tracker(tracker_options.as_ref()) {
                error!(feed = %kind, "Failed to create body tracker: {}", BridgeError::device("create_tracker", e));
                best_effort("stop_cameras", sensor.stop_cameras());
                return false;
            }
            *tracker = true;
        }

        if let (true, Some(mode)) = (kind.reports_depth_range(), options.depth_mode) {
            match sensor.depth_mode_range(mode) {
                Ok(range) => {
                    debug!(target: targets::DATA, ?mode, min = range.min, max = range.max, "Depth mode range")
                }
                Err(e) => warn!(target: targets::DATA, ?mode, "Depth range unavailable: {}", e),
            }
        }

        self.owner.send_replace(Some(kind));
        info!(feed = %kind, "Feed started");
        true
    }

    pub async fn start_color_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::Color, overrides).await
    }

    pub async fn start_depth_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::Depth, overrides).await
    }

    pub async fn start_raw_depth_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::RawDepth, overrides).await
    }

    pub async fn start_body_tracking(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::Body, overrides).await
    }

    pub async fn start_key_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::Key, overrides).await
    }

    pub async fn start_depth_key_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::DepthKey, overrides).await
    }

    pub async fn start_rgbd_camera(&self, overrides: &CameraOptions) -> bool {
        self.start(FeedKind::Rgbd, overrides).await
    }

    /// Register the one frame callback. `false` if already listening.
    pub async fn start_listening(&self, callback: FrameCallback) -> bool {
        let mut slot = self.slot.lock().await;
        self.listen_locked(&mut slot, callback)
    }

    /// Like [`start_listening`](Self::start_listening), but only while `feed`
    /// still owns the device.
    pub async fn start_listening_for(&self, feed: FeedKind, callback: FrameCallback) -> bool {
        let mut slot = self.slot.lock().await;
        if *self.owner.borrow() != Some(feed) {
            warn!(feed = %feed, "Not listening: feed no longer owns the device");
            return false;
        }
        self.listen_locked(&mut slot, callback)
    }

    fn listen_locked(&self, slot: &mut DeviceSlot, callback: FrameCallback) -> bool {
        if slot.listening {
            warn!("Already listening for frames");
            return false;
        }
        let Some(sensor) = slot.sensor.as_deref_mut() else {
            error!("Cannot listen: {}", BridgeError::NotInitialized);
            return false;
        };

        match sensor.start_listening(with_frame_stats(callback)) {
            Ok(()) => {
                slot.listening = true;
                debug!(target: targets::HANDLERS, "Listening for frames");
                true
            }
            Err(e) => {
                error!("Failed to start listening: {}", BridgeError::device("start_listening", e));
                false
            }
        }
    }

    /// Stop frame delivery. Idempotent; the listening flag is always cleared.
    pub async fn stop_listening(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let was_listening = std::mem::take(&mut slot.listening);
        let Some(sensor) = slot.sensor.as_deref_mut() else {
            return true;
        };
        if !was_listening {
            return true;
        }
        match sensor.stop_listening().await {
            Ok(()) => true,
            Err(e) => {
                best_effort("stop_listening", Err::<(), _>(e));
                false
            }
        }
    }

    /// Stop listening, the tracker and the cameras. Never propagates errors.
    pub async fn stop_cameras(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let DeviceSlot { sensor, listening, tracker } = &mut *slot;
        if let Some(sensor) = sensor.as_deref_mut() {
            Self::force_stop(sensor, listening, tracker).await;
        }
        self.owner.send_replace(None);
        true
    }

    /// Stop listening, the tracker and the cameras, but only while `feed`
    /// owns the device. Returns `false` and leaves the device alone when
    /// another feed (or none) holds it.
    pub async fn stop_for(&self, feed: FeedKind) -> bool {
        let mut slot = self.slot.lock().await;
        if *self.owner.borrow() != Some(feed) {
            debug!(target: targets::HANDLERS, feed = %feed, owner = ?self.active_feed(), "Not stopping: feed does not own the device");
            return false;
        }
        let DeviceSlot { sensor, listening, tracker } = &mut *slot;
        if let Some(sensor) = sensor.as_deref_mut() {
            Self::force_stop(sensor, listening, tracker).await;
        }
        self.owner.send_replace(None);
        true
    }

    /// Stop everything and release the device handle.
    pub async fn close(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let DeviceSlot { sensor, listening, tracker } = &mut *slot;
        if let Some(mut handle) = sensor.take() {
            Self::force_stop(handle.as_mut(), listening, tracker).await;
            best_effort("close", handle.close());
            info!("Depth sensor closed");
        }
        self.owner.send_replace(None);
        true
    }

    pub async fn depth_mode_range(&self, mode: DepthMode) -> Result<DepthRange> {
        let slot = self.slot.lock().await;
        let sensor = slot.sensor.as_deref().ok_or(BridgeError::NotInitialized)?;
        sensor.depth_mode_range(mode).map_err(|e| BridgeError::device("depth_mode_range", e))
    }

    pub async fn is_listening(&self) -> bool {
        self.slot.lock().await.listening
    }

    pub async fn is_initialized(&self) -> bool {
        self.slot.lock().await.sensor.is_some()
    }

    /// Feed that currently owns the device.
    pub fn active_feed(&self) -> Option<FeedKind> {
        *self.owner.borrow()
    }

    pub fn subscribe_owner(&self) -> watch::Receiver<Option<FeedKind>> {
        self.owner.subscribe()
    }

    async fn force_stop(sensor: &mut dyn DepthSensor, listening: &mut bool, tracker: &mut bool) {
        if std::mem::take(listening) {
            best_effort("stop_listening", sensor.stop_listening().await);
        }
        // Tracker must go before the cameras
        let had_tracker = std::mem::take(tracker);
        match sensor.destroy_tracker() {
            Err(SensorError::TrackerNotCreated) if !had_tracker => {}
            result => best_effort("destroy_tracker", result),
        }
        best_effort("stop_cameras", sensor.stop_cameras());
    }
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController").field("owner", &self.active_feed()).finish()
    }
}

fn with_frame_stats(callback: FrameCallback) -> FrameCallback {
    let stats = SyncMutex::new(FrameRateStats::new(FRAME_RATE_WINDOW, Instant::now()));
    Arc::new(move |frame: Arc<SensorFrame>| {
        if let Some(report) = stats.lock().record(frame.presence(), Instant::now()) {
            debug!(
                target: targets::PERFORMANCE,
                total = report.total,
                depth = report.depth,
                color = report.color,
                body = report.body,
                "Frame rate {:.1} fps",
                report.fps()
            );
        }
        callback(frame);
    })
}

/// Log a failed teardown step without propagating it.
fn best_effort(operation: &str, result: SensorResult) {
    match result {
        Ok(()) => {}
        Err(SensorError::TrackerNotCreated) => debug!("{}: tracker was not created", operation),
        Err(e) if e.is_teardown_noise() => warn!("{} during teardown: {}", operation, e),
        Err(e) => error!("{} failed: {}", operation, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockSensor, SensorCall, frames};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn ready(sensor: &MockSensor) -> DeviceController {
        let controller = DeviceController::new(sensor.factory());
        controller.initialize().await.unwrap();
        controller
    }

    #[tokio::test]
    async fn initialize_reports_refused_open() {
        let sensor = MockSensor::new();
        sensor.refuse_open();
        let controller = DeviceController::new(sensor.factory());
        let err = controller.initialize().await.unwrap_err();
        assert!(matches!(err, BridgeError::Device { .. }));
        assert!(!controller.is_initialized().await);
    }

    #[tokio::test]
    async fn reinitialize_closes_stale_handle() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        controller.initialize().await.unwrap();
        assert_eq!(sensor.count(&SensorCall::Close), 1);
        assert_eq!(sensor.count(&SensorCall::Open), 2);
    }

    #[tokio::test]
    async fn start_before_initialize_fails() {
        let sensor = MockSensor::new();
        let controller = DeviceController::new(sensor.factory());
        assert!(!controller.start_body_tracking(&CameraOptions::default()).await);
    }

    #[tokio::test]
    async fn body_tracking_stops_then_starts_with_tracker() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        sensor.clear_calls();

        assert!(controller.start_body_tracking(&CameraOptions::default()).await);
        assert_eq!(controller.active_feed(), Some(FeedKind::Body));

        let calls = sensor.calls();
        let start = calls.iter().position(|c| matches!(c, SensorCall::StartCameras(_))).unwrap();
        let stop = calls.iter().position(|c| *c == SensorCall::StopCameras).unwrap();
        assert!(stop < start, "force-stop must precede start: {calls:?}");
        assert_eq!(calls.last(), Some(&SensorCall::CreateTracker(None)));
        match &calls[start] {
            SensorCall::StartCameras(options) => {
                assert_eq!(options.depth_mode, Some(DepthMode::NfovUnbinned));
                assert_eq!(options.camera_fps, Some(crate::types::CameraFps::Fps30));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn key_camera_uses_gpu_tracker() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_key_camera(&CameraOptions::default()).await);
        assert!(sensor.calls().contains(&SensorCall::CreateTracker(Some(TrackerOptions::gpu()))));
    }

    #[tokio::test]
    async fn overrides_win_over_defaults() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        let overrides = CameraOptions { include_body_index_map: Some(true), ..Default::default() };
        assert!(controller.start_depth_key_camera(&overrides).await);
        let started = sensor
            .calls()
            .into_iter()
            .find_map(|c| match c {
                SensorCall::StartCameras(o) => Some(o),
                _ => None,
            })
            .unwrap();
        assert_eq!(started.include_body_index_map, Some(true));
    }

    #[tokio::test]
    async fn start_failure_returns_false_and_clears_owner() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_color_camera(&CameraOptions::default()).await);
        sensor.fail_next_start("usb bandwidth");
        assert!(!controller.start_depth_camera(&CameraOptions::default()).await);
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn tracker_is_destroyed_before_cameras_stop() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_body_tracking(&CameraOptions::default()).await);
        sensor.clear_calls();

        assert!(controller.stop_cameras().await);
        assert_eq!(sensor.calls(), vec![SensorCall::DestroyTracker, SensorCall::StopCameras]);
        // Second stop tolerates "not started" noise
        assert!(controller.stop_cameras().await);
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn listening_is_exclusive_and_stop_is_idempotent() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_body_tracking(&CameraOptions::default()).await);

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let callback: FrameCallback = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(controller.start_listening(Arc::clone(&callback)).await);
        assert!(!controller.start_listening(callback).await);

        sensor.emit(frames::body_frame(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(controller.stop_listening().await);
        assert!(controller.stop_listening().await);
        assert!(!controller.is_listening().await);
        sensor.emit(frames::body_frame(1));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn listening_for_a_pre_empted_feed_is_refused() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_body_tracking(&CameraOptions::default()).await);
        assert!(controller.start_color_camera(&CameraOptions::default()).await);
        assert!(!controller.start_listening_for(FeedKind::Body, Arc::new(|_| {})).await);
        assert!(controller.start_listening_for(FeedKind::Color, Arc::new(|_| {})).await);
    }

    #[tokio::test]
    async fn stop_for_leaves_another_owner_running() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_depth_key_camera(&CameraOptions::default()).await);
        assert!(controller.start_body_tracking(&CameraOptions::default()).await);
        sensor.clear_calls();

        assert!(!controller.stop_for(FeedKind::DepthKey).await);
        assert!(sensor.calls().is_empty());
        assert_eq!(controller.active_feed(), Some(FeedKind::Body));

        assert!(controller.stop_for(FeedKind::Body).await);
        assert_eq!(sensor.calls(), vec![SensorCall::DestroyTracker, SensorCall::StopCameras]);
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn failed_teardown_step_does_not_skip_the_rest() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_body_tracking(&CameraOptions::default()).await);
        assert!(controller.start_listening(Arc::new(|_| {})).await);
        sensor.clear_calls();
        sensor.fail_next_stop_listening("sdk wedged");
        sensor.fail_next_destroy_tracker("tracker busy");

        assert!(controller.stop_cameras().await);
        assert_eq!(
            sensor.calls(),
            vec![SensorCall::StopListening, SensorCall::DestroyTracker, SensorCall::StopCameras]
        );
        assert!(!sensor.cameras_started());
        assert!(!controller.is_listening().await);
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn failed_camera_stop_still_clears_owner() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.start_color_camera(&CameraOptions::default()).await);
        sensor.fail_next_stop_cameras("usb reset");
        assert!(controller.stop_cameras().await);
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn tracker_failure_rolls_back_cameras() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        sensor.clear_calls();
        sensor.fail_next_tracker("no gpu");

        assert!(!controller.start_body_tracking(&CameraOptions::default()).await);
        let calls = sensor.calls();
        let tracker = calls.iter().position(|c| matches!(c, SensorCall::CreateTracker(_))).unwrap();
        assert_eq!(calls[tracker + 1..], [SensorCall::StopCameras]);
        assert!(!sensor.cameras_started());
        assert_eq!(controller.active_feed(), None);
    }

    #[tokio::test]
    async fn close_releases_handle() {
        let sensor = MockSensor::new();
        let controller = ready(&sensor).await;
        assert!(controller.close().await);
        assert!(controller.close().await);
        assert!(!controller.is_initialized().await);
        assert_eq!(sensor.count(&SensorCall::Close), 1);
    }

    #[test]
    fn frame_rate_window_reports_counts() {
        let start = Instant::now();
        let mut stats = FrameRateStats::new(Duration::from_secs(5), start);
        let body = FramePresence { depth: true, body: true, ..Default::default() };
        for i in 0..149 {
            assert!(stats.record(body, start + Duration::from_millis(i * 33)).is_none());
        }
        let report = stats.record(body, start + Duration::from_secs(5)).unwrap();
        assert_eq!(report.total, 150);
        assert_eq!(report.depth, 150);
        assert_eq!(report.body, 150);
        assert_eq!(report.color, 0);
        assert!((report.fps() - 30.0).abs() < 0.01);
    }
}
