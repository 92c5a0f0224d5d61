//! Core types shared across the bridge.
//!
//! ## Architecture
//!
//! - [`FeedKind`] names a stream and owns its device defaults
//! - [`CameraOptions`] configures the device, merged key-by-key over defaults
//! - [`SensorFrame`] is the raw push payload, with optional sub-frames
//! - [`ProcessedFrame`] is the immutable package sent to the UI and peers
//! - [`StreamState`] / [`ServerState`] drive the handler and server state machines
//!
//! ## Usage Example
//!
//! ```rust
//! use kinectron::types::{CameraFps, CameraOptions, FeedKind};
//!
//! let overrides = CameraOptions { camera_fps: Some(CameraFps::Fps30), ..Default::default() };
//! let options = overrides.merged_over(&FeedKind::DepthKey.default_options());
//!
//! assert_eq!(options.camera_fps, Some(CameraFps::Fps30));
//! assert_eq!(options.include_body_index_map, Some(true));
//! ```

mod feed;
mod frame;
mod options;
mod package;
mod state;

pub use feed::{FeedKind, UnknownFeed};
pub use frame::{
    BODY_INDEX_BACKGROUND, Body, BodyFrame, FramePresence, ImageFrame, Joint, JointConfidence,
    PixelFormat, SensorFrame,
};
pub use options::{
    CameraFps, CameraOptions, ColorFormat, ColorResolution, DepthMode, DepthRange,
    ProcessingMode, SensorOrientation, TrackerOptions,
};
pub use package::{EncodedImage, FramePayload, ProcessedFrame, Skeleton, TrackedBody, now_millis};
pub use state::{ServerState, StreamState};
