//! Device configuration options
//!
//! Every key is optional. Unset keys fall back to the per-feed defaults from
//! [`FeedKind::default_options`](super::FeedKind::default_options).

use serde::{Deserialize, Serialize};

/// Depth sensor operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthMode {
    Off,
    Nfov2x2Binned,
    NfovUnbinned,
    Wfov2x2Binned,
    WfovUnbinned,
    PassiveIr,
}

/// Colour camera resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorResolution {
    Off,
    #[serde(rename = "720p")]
    R720p,
    #[serde(rename = "1080p")]
    R1080p,
    #[serde(rename = "1440p")]
    R1440p,
    #[serde(rename = "1536p")]
    R1536p,
    #[serde(rename = "2160p")]
    R2160p,
    #[serde(rename = "3072p")]
    R3072p,
}

/// Colour image pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorFormat {
    Mjpg,
    Nv12,
    Yuy2,
    Bgra32,
}

/// Camera capture rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CameraFps {
    #[serde(rename = "5")]
    Fps5,
    #[serde(rename = "15")]
    Fps15,
    #[serde(rename = "30")]
    Fps30,
}

impl CameraFps {
    pub fn hz(self) -> u32 {
        match self {
            CameraFps::Fps5 => 5,
            CameraFps::Fps15 => 15,
            CameraFps::Fps30 => 30,
        }
    }
}

/// Where depth processing and tracking run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    Cpu,
    Gpu,
    Cuda,
}

/// Camera start options understood by the sensor binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth_mode: Option<DepthMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_resolution: Option<ColorResolution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color_format: Option<ColorFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera_fps: Option<CameraFps>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_body_index_map: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_color_to_depth: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_depth_to_color: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synchronized_images_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_mode: Option<ProcessingMode>,
}

impl CameraOptions {
    /// Overlay `self` on top of `defaults`: keys set here win.
    pub fn merged_over(&self, defaults: &CameraOptions) -> CameraOptions {
        CameraOptions {
            depth_mode: self.depth_mode.or(defaults.depth_mode),
            color_resolution: self.color_resolution.or(defaults.color_resolution),
            color_format: self.color_format.or(defaults.color_format),
            camera_fps: self.camera_fps.or(defaults.camera_fps),
            include_body_index_map: self.include_body_index_map.or(defaults.include_body_index_map),
            include_color_to_depth: self.include_color_to_depth.or(defaults.include_color_to_depth),
            include_depth_to_color: self.include_depth_to_color.or(defaults.include_depth_to_color),
            synchronized_images_only: self
                .synchronized_images_only
                .or(defaults.synchronized_images_only),
            processing_mode: self.processing_mode.or(defaults.processing_mode),
        }
    }
}

/// Mounting orientation passed to the body tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorOrientation {
    #[default]
    Default,
    Clockwise90,
    CounterClockwise90,
    Flip180,
}

/// Body tracker creation options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerOptions {
    pub sensor_orientation: SensorOrientation,
    pub processing_mode: ProcessingMode,
    pub gpu_device_id: u32,
}

impl TrackerOptions {
    /// GPU tracker on the first device, used by the key feed.
    pub fn gpu() -> Self {
        Self {
            sensor_orientation: SensorOrientation::Default,
            processing_mode: ProcessingMode::Gpu,
            gpu_device_id: 0,
        }
    }
}

/// Valid distance range of a depth mode, in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthRange {
    pub min: u16,
    pub max: u16,
}
