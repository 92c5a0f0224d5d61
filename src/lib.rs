//! Bridge a depth-sensing camera to browser peers.
//!
//! Kinectron owns the camera through a single [`DeviceController`], turns raw
//! captures into body-tracking or depth-key packages and fans them out to a
//! local UI bus and to remote peers connected through a supervised relay
//! server.
//!
//! # Architecture
//!
//! - [`controller`]: device session, one active feed at a time
//! - [`processors`]: pure transforms from raw frames to packages
//! - [`handlers`]: per-feed start/stop lifecycle and frame delivery
//! - [`gateway`]: lossy peer broadcast with back-pressure
//! - [`server`]: relay server supervision with a bounded restart budget
//!
//! # Example
//!
//! ```rust,no_run
//! use kinectron::test_utils::MockSensor;
//! use kinectron::{Bridge, FeedKind, config::BridgeConfig};
//!
//! # #[tokio::main]
//! # async fn main() -> kinectron::Result<()> {
//! let sensor = MockSensor::new();
//! let bridge = Bridge::new(sensor.factory(), BridgeConfig::default());
//! bridge.initialize().await?;
//!
//! if bridge.start_feed(FeedKind::Body).await {
//!     let mut frames = bridge.ui().subscribe();
//!     let _ = frames.recv().await;
//! }
//! bridge.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod control;
pub mod controller;
mod error;
pub mod gateway;
pub mod handlers;
pub mod logging;
pub mod processors;
pub mod sensor;
pub mod server;
pub mod types;
pub mod ui;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::*;
pub use types::*;

pub use config::BridgeConfig;
pub use control::{ControlEntry, ControlSurface};
pub use controller::DeviceController;
pub use gateway::{PeerChannel, PeerGateway};
pub use handlers::{BodyStreamHandler, DepthKeyStreamHandler, StreamHandler};
pub use server::{PeerRequest, PeerServerManager, RelayTransport, WsRelayTransport};
pub use ui::{LocalUi, UiEvent};

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use codec::{ImageCodec, WebpCodec};
use handlers::{BodyPipeline, DepthKeyPipeline, FEED_EVENT};
use sensor::SensorFactory;

/// Peer request value that stops every running feed.
pub const STOP_ALL: &str = "stop-all";

/// Top-level wiring of controller, handlers, UI bus and peer gateway.
///
/// Cheap to clone; clones share the same device and handlers.
#[derive(Clone)]
pub struct Bridge {
    controller: Arc<DeviceController>,
    gateway: Arc<PeerGateway>,
    surface: Arc<ControlSurface>,
    body: BodyStreamHandler,
    depth_key: DepthKeyStreamHandler,
}

impl Bridge {
    /// Build a bridge that encodes depth-key frames with lossless WebP.
    pub fn new(factory: impl SensorFactory, config: BridgeConfig) -> Self {
        let codec = Arc::new(WebpCodec::new(config.codec));
        Self::with_codec(factory, config, codec)
    }

    pub fn with_codec(
        factory: impl SensorFactory,
        config: BridgeConfig,
        codec: Arc<dyn ImageCodec>,
    ) -> Self {
        let controller = Arc::new(DeviceController::new(factory));
        let gateway = Arc::new(PeerGateway::new(LocalUi::new()));

        let body = StreamHandler::new(
            BodyPipeline::new(),
            Arc::clone(&controller),
            Arc::clone(&gateway),
            config.handlers.clone(),
            config.feed_options(FeedKind::Body),
        );
        let depth_key = StreamHandler::new(
            DepthKeyPipeline::new(codec),
            Arc::clone(&controller),
            Arc::clone(&gateway),
            config.handlers.clone(),
            config.feed_options(FeedKind::DepthKey),
        );

        Self { controller, gateway, surface: Arc::new(ControlSurface::new()), body, depth_key }
    }

    /// Open the device and register the control channels.
    pub async fn initialize(&self) -> Result<()> {
        self.controller.initialize().await?;
        self.setup_handlers();
        Ok(())
    }

    /// Register both handlers on the control surface. Safe to call twice.
    pub fn setup_handlers(&self) {
        self.body.setup_handler(&self.surface);
        self.depth_key.setup_handler(&self.surface);
    }

    /// Start the handler serving `kind`. Feeds without a handler return `false`.
    pub async fn start_feed(&self, kind: FeedKind) -> bool {
        match kind {
            FeedKind::Body | FeedKind::Skeleton => self.body.start_stream().await,
            FeedKind::DepthKey => self.depth_key.start_stream().await,
            other => {
                warn!(feed = %other, "No stream handler for feed");
                false
            }
        }
    }

    pub async fn stop_feed(&self, kind: FeedKind) -> bool {
        match kind {
            FeedKind::Body | FeedKind::Skeleton => self.body.stop_stream().await,
            FeedKind::DepthKey => self.depth_key.stop_stream().await,
            other => {
                warn!(feed = %other, "No stream handler for feed");
                false
            }
        }
    }

    /// Stop every running handler.
    pub async fn stop_all(&self) -> bool {
        let body = self.body.stop_stream().await;
        let depth_key = self.depth_key.stop_stream().await;
        body && depth_key
    }

    /// Act on a `feed` request from a peer. Returns whether it was handled.
    pub async fn handle_peer_request(&self, request: &PeerRequest) -> bool {
        if request.event != FEED_EVENT {
            debug!(target: logging::targets::PEER, event = %request.event, "Ignoring peer request");
            return false;
        }

        let Some(feed) = request.data.get("feed").and_then(|v| v.as_str()) else {
            warn!(client = %request.client_id, "Feed request without a feed name");
            return false;
        };

        info!(client = %request.client_id, feed, "Peer requested feed");
        if feed == STOP_ALL {
            return self.stop_all().await;
        }
        match feed.parse::<FeedKind>() {
            Ok(kind) => self.start_feed(kind).await,
            Err(e) => {
                warn!(client = %request.client_id, "{}", e);
                false
            }
        }
    }

    /// Route peer requests from `manager` into this bridge until the manager
    /// is dropped or the returned task is aborted.
    pub fn attach_server<T: RelayTransport>(&self, manager: &PeerServerManager<T>) -> JoinHandle<()> {
        let mut requests = manager.requests();
        let bridge = self.clone();
        tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(request) => {
                        bridge.handle_peer_request(&request).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dropped {} peer requests", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Stop all feeds and close the device.
    pub async fn shutdown(&self) {
        self.stop_all().await;
        self.controller.close().await;
        info!("Bridge shut down");
    }

    pub fn controller(&self) -> &Arc<DeviceController> {
        &self.controller
    }

    pub fn gateway(&self) -> &Arc<PeerGateway> {
        &self.gateway
    }

    pub fn ui(&self) -> &LocalUi {
        self.gateway.ui()
    }

    pub fn surface(&self) -> &Arc<ControlSurface> {
        &self.surface
    }

    pub fn body_handler(&self) -> &BodyStreamHandler {
        &self.body
    }

    pub fn depth_key_handler(&self) -> &DepthKeyStreamHandler {
        &self.depth_key
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("active_feed", &self.controller.active_feed())
            .field("body", &self.body)
            .field("depth_key", &self.depth_key)
            .field("peers", &self.gateway.peer_count())
            .finish()
    }
}
