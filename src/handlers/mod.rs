//! Stream handlers
//!
//! A [`StreamHandler`] turns a control request into a running feed: it asks
//! the [`DeviceController`] for the cameras, opens a delivery session and
//! pushes every packaged frame to the local UI and to peers. What a frame
//! becomes is up to the [`FeedPipeline`]; the handler only owns lifecycle.
//!
//! The sensor callback never does work itself. It hands the frame to a small
//! bounded queue drained by the session task, dropping frames when the queue
//! is full, so a slow encoder never stalls the SDK's delivery thread.

mod body;
mod depth_key;

pub use body::BodyPipeline;
pub use depth_key::DepthKeyPipeline;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::HandlerConfig;
use crate::control::{ControlEntry, ControlSurface};
use crate::controller::DeviceController;
use crate::error::BridgeError;
use crate::gateway::PeerGateway;
use crate::logging::targets;
use crate::processors::Skip;
use crate::sensor::FrameCallback;
use crate::types::{CameraOptions, FeedKind, ProcessedFrame, SensorFrame, StreamState};
use crate::ui::{LocalUi, UiEvent};

/// Body handler.
pub type BodyStreamHandler = StreamHandler<BodyPipeline>;
/// Depth-key handler.
pub type DepthKeyStreamHandler = StreamHandler<DepthKeyPipeline>;

/// Peer event announcing that a feed stopped.
pub const FEED_EVENT: &str = "feed";

/// Payload of the feed-stop notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedStopped {
    pub feed: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl FeedStopped {
    pub fn new(kind: FeedKind) -> Self {
        Self { feed: "stop", kind: kind.as_str() }
    }
}

/// Why a frame produced no package.
#[derive(Debug)]
pub enum PackageError {
    Skipped(Skip),
    Encode(BridgeError),
}

impl From<Skip> for PackageError {
    fn from(skip: Skip) -> Self {
        PackageError::Skipped(skip)
    }
}

impl fmt::Display for PackageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageError::Skipped(skip) => write!(f, "skipped: {skip}"),
            PackageError::Encode(e) => write!(f, "encoding failed: {e}"),
        }
    }
}

/// Feed-specific half of a stream handler.
#[async_trait::async_trait]
pub trait FeedPipeline: Send + Sync + 'static {
    /// Feed the device is started in.
    fn feed(&self) -> FeedKind;

    /// Control-surface channel that starts this stream.
    fn control_channel(&self) -> &'static str;

    /// Local UI event for packaged frames.
    fn ui_event(&self) -> &'static str;

    /// Peer event for packaged frames.
    fn peer_event(&self) -> &'static str;

    /// Delay between camera start and frame delivery.
    fn warmup(&self, _config: &HandlerConfig) -> Duration {
        Duration::ZERO
    }

    /// Process and encode one raw frame.
    async fn package(&self, frame: &SensorFrame) -> Result<ProcessedFrame, PackageError>;
}

struct Session {
    generation: u64,
    callback: FrameCallback,
    cancel: CancellationToken,
}

struct HandlerInner<P> {
    pipeline: P,
    controller: Arc<DeviceController>,
    gateway: Arc<PeerGateway>,
    ui: LocalUi,
    config: HandlerConfig,
    overrides: CameraOptions,
    state: watch::Sender<StreamState>,
    session: SyncMutex<Option<Session>>,
    generation: AtomicU64,
    op_lock: Mutex<()>,
    multi_frame: AtomicBool,
    delivered: AtomicU64,
}

/// Lifecycle of one feed. Cheap to clone; clones share state.
pub struct StreamHandler<P: FeedPipeline> {
    inner: Arc<HandlerInner<P>>,
}

impl<P: FeedPipeline> Clone for StreamHandler<P> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<P: FeedPipeline> StreamHandler<P> {
    pub fn new(
        pipeline: P,
        controller: Arc<DeviceController>,
        gateway: Arc<PeerGateway>,
        config: HandlerConfig,
        overrides: CameraOptions,
    ) -> Self {
        let (state, _) = watch::channel(StreamState::Inactive);
        let multi_frame = AtomicBool::new(config.multi_frame);
        Self {
            inner: Arc::new(HandlerInner {
                ui: gateway.ui().clone(),
                pipeline,
                controller,
                gateway,
                config,
                overrides,
                state,
                session: SyncMutex::new(None),
                generation: AtomicU64::new(0),
                op_lock: Mutex::new(()),
                multi_frame,
                delivered: AtomicU64::new(0),
            }),
        }
    }

    /// Register this handler's start channel. A second registration is a
    /// logged no-op.
    pub fn setup_handler(&self, surface: &ControlSurface) -> bool {
        surface.register(self.inner.pipeline.control_channel(), Arc::new(self.clone()))
    }

    /// Start (or restart) the stream. Returns whether it is now active.
    pub async fn start_stream(&self) -> bool {
        let _op = self.inner.op_lock.lock().await;
        let inner = &self.inner;
        let feed = inner.pipeline.feed();
        info!(target: targets::HANDLERS, feed = %feed, "Start requested");

        if inner.state().is_active() || inner.session.lock().is_some() {
            debug!(target: targets::HANDLERS, feed = %feed, "Stopping previous session");
            inner.stop_locked().await;
            tokio::time::sleep(inner.config.settle_delay()).await;
        }

        inner.set_state(StreamState::Starting);
        if !inner.controller.start(feed, &inner.overrides).await {
            error!(feed = %feed, "Failed to start stream");
            inner.set_state(StreamState::Inactive);
            return false;
        }

        let warmup = inner.pipeline.warmup(&inner.config);
        if !warmup.is_zero() {
            debug!(target: targets::HANDLERS, feed = %feed, "Waiting {:?} for body tracker", warmup);
            tokio::time::sleep(warmup).await;
        }

        let callback = inner.open_session();
        inner.set_state(StreamState::Active);

        if !inner.multi_frame.load(Ordering::SeqCst)
            && !inner.controller.start_listening_for(feed, callback).await
        {
            error!(feed = %feed, "Failed to listen for frames");
            inner.abort_start().await;
            return false;
        }

        info!(feed = %feed, "Stream started");
        true
    }

    /// Stop the stream and notify peers. No-op when already inactive.
    pub async fn stop_stream(&self) -> bool {
        let _op = self.inner.op_lock.lock().await;
        self.inner.stop_locked().await
    }

    /// In multi-frame mode the handler never calls `start_listening`; a
    /// dispatcher forwards frames to [`frame_callback`](Self::frame_callback).
    pub fn set_multi_frame(&self, enabled: bool) {
        self.inner.multi_frame.store(enabled, Ordering::SeqCst);
    }

    pub fn is_multi_frame(&self) -> bool {
        self.inner.multi_frame.load(Ordering::SeqCst)
    }

    /// Callback of the current session, if one is open.
    pub fn frame_callback(&self) -> Option<FrameCallback> {
        self.inner.session.lock().as_ref().map(|s| Arc::clone(&s.callback))
    }

    pub fn state(&self) -> StreamState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn feed(&self) -> FeedKind {
        self.inner.pipeline.feed()
    }

    pub fn control_channel(&self) -> &'static str {
        self.inner.pipeline.control_channel()
    }

    /// Frames delivered since the handler was created.
    pub fn delivered_frames(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }
}

impl<P: FeedPipeline> HandlerInner<P> {
    fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn set_state(&self, state: StreamState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            trace!(target: targets::HANDLERS, feed = %self.pipeline.feed(), "{:?} -> {:?}", previous, state);
        }
    }

    fn open_session(self: &Arc<Self>) -> FrameCallback {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Arc<SensorFrame>>(self.config.frame_queue_depth.max(1));

        let feed = self.pipeline.feed();
        let callback: FrameCallback = Arc::new(move |frame| match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!(target: targets::FRAMES, feed = %feed, "Session busy, dropping frame")
            }
            Err(TrySendError::Closed(_)) => {}
        });

        *self.session.lock() = Some(Session {
            generation,
            callback: Arc::clone(&callback),
            cancel: cancel.clone(),
        });
        tokio::spawn(Arc::clone(self).run_session(generation, rx, cancel));
        callback
    }

    async fn run_session(
        self: Arc<Self>,
        generation: u64,
        mut frames: mpsc::Receiver<Arc<SensorFrame>>,
        cancel: CancellationToken,
    ) {
        let feed = self.pipeline.feed();
        let mut owner = self.controller.subscribe_owner();
        if *owner.borrow_and_update() != Some(feed) {
            self.preempted(generation);
            return;
        }

        let mut reported_missing = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = owner.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *owner.borrow_and_update() != Some(feed) {
                        self.preempted(generation);
                        break;
                    }
                }
                frame = frames.recv() => match frame {
                    Some(frame) => self.deliver(&frame, &cancel, &mut reported_missing).await,
                    None => break,
                },
            }
        }
        trace!(target: targets::HANDLERS, feed = %feed, generation, "Session ended");
    }

    /// `reported_missing` keeps missing sub-frames to one warning per session.
    async fn deliver(&self, frame: &SensorFrame, cancel: &CancellationToken, reported_missing: &mut bool) {
        let feed = self.pipeline.feed();
        let package = match self.pipeline.package(frame).await {
            Ok(package) => Arc::new(package),
            Err(PackageError::Skipped(Skip::NoBodies)) => {
                trace!(target: targets::FRAMES, feed = %feed, "No bodies in frame");
                return;
            }
            Err(PackageError::Skipped(skip @ Skip::MissingSubFrames(_))) => {
                if std::mem::replace(reported_missing, true) {
                    debug!(target: targets::FRAMES, feed = %feed, "Frame skipped: {}", skip);
                } else {
                    warn!(feed = %feed, "Frame skipped: {}", skip);
                }
                return;
            }
            Err(PackageError::Skipped(skip)) => {
                warn!(feed = %feed, "Frame skipped: {}", skip);
                return;
            }
            Err(PackageError::Encode(e)) => {
                error!(feed = %feed, "Failed to package frame: {}", e);
                return;
            }
        };

        // Stopped while encoding
        if cancel.is_cancelled() {
            return;
        }

        self.ui.emit(UiEvent::Frame { event: self.pipeline.ui_event(), package: Arc::clone(&package) });
        match self.gateway.broadcast(self.pipeline.peer_event(), &*package, true) {
            Ok(report) => {
                let delivered = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(
                    target: targets::FRAMES,
                    feed = %feed,
                    sent = report.sent,
                    skipped = report.skipped,
                    "Frame {} delivered",
                    delivered
                );
            }
            Err(e) => warn!(feed = %feed, "Failed to broadcast frame: {}", e),
        }
    }

    /// Another feed took the device. The device is left alone.
    fn preempted(&self, generation: u64) {
        let session = {
            let mut session = self.session.lock();
            match session.as_ref() {
                Some(s) if s.generation == generation => session.take(),
                _ => None,
            }
        };
        if let Some(session) = session {
            session.cancel.cancel();
            self.set_state(StreamState::Inactive);
            warn!(feed = %self.pipeline.feed(), "Stream pre-empted by another feed");
            self.notify_stopped();
        }
    }

    /// Undo a start that got as far as the cameras.
    async fn abort_start(&self) {
        if let Some(session) = self.session.lock().take() {
            session.cancel.cancel();
        }
        self.controller.stop_for(self.pipeline.feed()).await;
        self.set_state(StreamState::Inactive);
    }

    /// Caller holds the operation lock.
    async fn stop_locked(&self) -> bool {
        let feed = self.pipeline.feed();
        let session = self.session.lock().take();
        if session.is_none() && self.state() == StreamState::Inactive {
            debug!(target: targets::HANDLERS, feed = %feed, "Stop requested while inactive");
            return true;
        }

        info!(target: targets::HANDLERS, feed = %feed, "Stopping stream");
        self.set_state(StreamState::Stopping);

        if let Some(session) = session {
            session.cancel.cancel();
        }
        // A pre-empted session must not tear down the new owner's device
        if !self.controller.stop_for(feed).await {
            debug!(target: targets::HANDLERS, feed = %feed, "Device held by another feed, left running");
        }

        self.set_state(StreamState::Inactive);
        self.notify_stopped();
        info!(feed = %feed, "Stream stopped");
        true
    }

    fn notify_stopped(&self) {
        let feed = self.pipeline.feed();
        if let Err(e) = self.gateway.broadcast(FEED_EVENT, &FeedStopped::new(feed), false) {
            warn!(feed = %feed, "Failed to notify peers: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl<P: FeedPipeline> ControlEntry for StreamHandler<P> {
    fn feed(&self) -> FeedKind {
        self.inner.pipeline.feed()
    }

    async fn start(&self) -> bool {
        self.start_stream().await
    }

    async fn stop(&self) -> bool {
        self.stop_stream().await
    }

    fn state(&self) -> StreamState {
        self.inner.state()
    }
}

impl<P: FeedPipeline> fmt::Debug for StreamHandler<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandler")
            .field("feed", &self.inner.pipeline.feed())
            .field("state", &self.inner.state())
            .finish()
    }
}
