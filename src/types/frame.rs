//! Raw sensor frames as pushed by the device
//!
//! A [`SensorFrame`] carries whichever sub-frames the current device mode
//! produces. Consumers check [`SensorFrame::presence`] or match on the
//! individual options rather than probing for fields.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body index value marking a pixel that belongs to no tracked body.
pub const BODY_INDEX_BACKGROUND: u8 = 255;

/// Pixel layout of an [`ImageFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, blue first.
    Bgra32,
    /// Little-endian u16 millimetres.
    Depth16,
    /// Little-endian u16 intensity.
    Ir16,
    /// One body index per pixel.
    BodyIndex8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgra32 => 4,
            PixelFormat::Depth16 | PixelFormat::Ir16 => 2,
            PixelFormat::BodyIndex8 => 1,
        }
    }
}

/// One image plane of a sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageFrame {
    pub width: u32,
    pub height: u32,
    pub stride_bytes: u32,
    pub format: PixelFormat,
    /// Pixel buffer (zero-copy via Arc)
    pub data: Arc<[u8]>,
}

impl ImageFrame {
    /// Create an image plane with a tightly packed stride.
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        let stride_bytes = width * format.bytes_per_pixel() as u32;
        Self { width, height, stride_bytes, format, data: data.into() }
    }

    /// Build a depth plane from millimetre samples.
    pub fn depth16(width: u32, height: u32, samples: &[u16]) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(width, height, PixelFormat::Depth16, data)
    }

    /// Build a body index plane.
    pub fn body_index(width: u32, height: u32, indices: Vec<u8>) -> Self {
        Self::new(width, height, PixelFormat::BodyIndex8, indices)
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Whether the buffer holds every row the header promises.
    pub fn is_complete(&self) -> bool {
        let row = self.width as usize * self.format.bytes_per_pixel();
        self.stride_bytes as usize >= row
            && self.data.len() >= self.stride_bytes as usize * self.height as usize
    }

    /// Depth sample at `(x, y)`, for u16 planes.
    pub fn sample_u16(&self, x: u32, y: u32) -> Option<u16> {
        if !matches!(self.format, PixelFormat::Depth16 | PixelFormat::Ir16)
            || x >= self.width
            || y >= self.height
        {
            return None;
        }
        let offset = y as usize * self.stride_bytes as usize + x as usize * 2;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Byte sample at `(x, y)`, for 8-bit planes.
    pub fn sample_u8(&self, x: u32, y: u32) -> Option<u8> {
        if self.format != PixelFormat::BodyIndex8 || x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride_bytes as usize + x as usize;
        self.data.get(offset).copied()
    }
}

/// Tracker confidence in a joint position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum JointConfidence {
    None,
    Low,
    Medium,
    High,
}

/// One skeleton joint as reported by the tracker.
///
/// Depth and colour coordinates are normalised to `0.0..=1.0` of the
/// respective image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Joint {
    pub camera_x: f32,
    pub camera_y: f32,
    pub camera_z: f32,
    pub depth_x: f32,
    pub depth_y: f32,
    pub color_x: f32,
    pub color_y: f32,
    pub orientation_w: f32,
    pub orientation_x: f32,
    pub orientation_y: f32,
    pub orientation_z: f32,
    pub confidence: JointConfidence,
}

/// A tracked body.
#[derive(Debug, Clone, PartialEq)]
pub struct Body {
    pub id: u32,
    pub joints: Vec<Joint>,
}

/// Output of the body tracker for one capture.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BodyFrame {
    pub bodies: Vec<Body>,
    pub body_index_map: Option<ImageFrame>,
}

impl BodyFrame {
    pub fn num_bodies(&self) -> usize {
        self.bodies.len()
    }
}

/// Which sub-frames a [`SensorFrame`] carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramePresence {
    pub color: bool,
    pub depth: bool,
    pub ir: bool,
    pub body: bool,
    pub body_index_map: bool,
}

/// Raw frame pushed by the sensor; transient, dropped after one processing cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SensorFrame {
    pub color: Option<ImageFrame>,
    pub depth: Option<ImageFrame>,
    pub ir: Option<ImageFrame>,
    pub body: Option<BodyFrame>,
    /// Device timestamp in microseconds
    pub device_timestamp_usec: u64,
}

impl SensorFrame {
    pub fn presence(&self) -> FramePresence {
        FramePresence {
            color: self.color.is_some(),
            depth: self.depth.is_some(),
            ir: self.ir.is_some(),
            body: self.body.is_some(),
            body_index_map: self.body_index_map().is_some(),
        }
    }

    /// Body index map, which the tracker attaches to the body frame.
    pub fn body_index_map(&self) -> Option<&ImageFrame> {
        self.body.as_ref().and_then(|b| b.body_index_map.as_ref())
    }
}
