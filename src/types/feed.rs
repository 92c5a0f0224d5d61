//! Feed kinds and their device defaults

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::options::{
    CameraFps, CameraOptions, ColorFormat, ColorResolution, DepthMode, ProcessingMode,
};

/// Category of stream a caller can request from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum FeedKind {
    Color,
    Depth,
    RawDepth,
    Body,
    Skeleton,
    Key,
    DepthKey,
    Rgbd,
}

impl FeedKind {
    /// Every feed kind, in wire-name order.
    pub const ALL: [FeedKind; 8] = [
        FeedKind::Color,
        FeedKind::Depth,
        FeedKind::RawDepth,
        FeedKind::Body,
        FeedKind::Skeleton,
        FeedKind::Key,
        FeedKind::DepthKey,
        FeedKind::Rgbd,
    ];

    /// Wire name used by peers and the UI.
    pub fn as_str(self) -> &'static str {
        match self {
            FeedKind::Color => "color",
            FeedKind::Depth => "depth",
            FeedKind::RawDepth => "raw-depth",
            FeedKind::Body => "body",
            FeedKind::Skeleton => "skeleton",
            FeedKind::Key => "key",
            FeedKind::DepthKey => "depth-key",
            FeedKind::Rgbd => "rgbd",
        }
    }

    /// Whether starting this feed also creates a body tracker.
    pub fn uses_tracker(self) -> bool {
        matches!(self, FeedKind::Body | FeedKind::Skeleton | FeedKind::Key | FeedKind::DepthKey)
    }

    /// Whether the depth range of the configured mode is worth logging on start.
    pub fn reports_depth_range(self) -> bool {
        matches!(self, FeedKind::Depth | FeedKind::RawDepth)
    }

    /// Kind that owns the device mode for this feed.
    ///
    /// Skeleton frames come from the same device mode as body frames.
    pub fn device_mode(self) -> FeedKind {
        match self {
            FeedKind::Skeleton => FeedKind::Body,
            other => other,
        }
    }

    /// Nominal image size produced by this feed, when it produces images.
    pub fn frame_dimensions(self) -> Option<(u32, u32)> {
        match self {
            FeedKind::Color | FeedKind::Key => Some((1280, 720)),
            FeedKind::Depth => Some((640, 576)),
            FeedKind::RawDepth | FeedKind::DepthKey => Some((320, 288)),
            FeedKind::Rgbd => Some((512, 512)),
            FeedKind::Body | FeedKind::Skeleton => None,
        }
    }

    /// Device defaults for this feed; caller options are merged over these.
    pub fn default_options(self) -> CameraOptions {
        match self.device_mode() {
            FeedKind::Color => CameraOptions {
                color_resolution: Some(ColorResolution::R720p),
                color_format: Some(ColorFormat::Bgra32),
                camera_fps: Some(CameraFps::Fps15),
                ..CameraOptions::default()
            },
            FeedKind::Depth => CameraOptions {
                depth_mode: Some(DepthMode::NfovUnbinned),
                camera_fps: Some(CameraFps::Fps15),
                ..CameraOptions::default()
            },
            FeedKind::RawDepth => CameraOptions {
                depth_mode: Some(DepthMode::Nfov2x2Binned),
                camera_fps: Some(CameraFps::Fps15),
                ..CameraOptions::default()
            },
            FeedKind::Body | FeedKind::Skeleton => CameraOptions {
                depth_mode: Some(DepthMode::NfovUnbinned),
                color_resolution: Some(ColorResolution::R720p),
                camera_fps: Some(CameraFps::Fps30),
                ..CameraOptions::default()
            },
            FeedKind::Key => CameraOptions {
                depth_mode: Some(DepthMode::NfovUnbinned),
                color_resolution: Some(ColorResolution::R720p),
                color_format: Some(ColorFormat::Bgra32),
                camera_fps: Some(CameraFps::Fps15),
                synchronized_images_only: Some(true),
                include_depth_to_color: Some(true),
                include_body_index_map: Some(true),
                processing_mode: Some(ProcessingMode::Gpu),
                ..CameraOptions::default()
            },
            FeedKind::DepthKey => CameraOptions {
                depth_mode: Some(DepthMode::Nfov2x2Binned),
                include_body_index_map: Some(true),
                camera_fps: Some(CameraFps::Fps15),
                ..CameraOptions::default()
            },
            FeedKind::Rgbd => CameraOptions {
                depth_mode: Some(DepthMode::Wfov2x2Binned),
                color_format: Some(ColorFormat::Bgra32),
                color_resolution: Some(ColorResolution::R720p),
                camera_fps: Some(CameraFps::Fps15),
                include_color_to_depth: Some(true),
                synchronized_images_only: Some(true),
                processing_mode: Some(ProcessingMode::Gpu),
                ..CameraOptions::default()
            },
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a wire name does not match any feed kind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown feed kind '{0}'")]
pub struct UnknownFeed(pub String);

impl FromStr for FeedKind {
    type Err = UnknownFeed;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FeedKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            // Older peers send camel-cased names
            .or(match s {
                "rawDepth" => Some(FeedKind::RawDepth),
                "depthKey" | "depthkey" => Some(FeedKind::DepthKey),
                _ => None,
            })
            .ok_or_else(|| UnknownFeed(s.to_string()))
    }
}
