//! Wire-ready frame packages

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::frame::Joint;

/// Skeleton of one tracked body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct Skeleton {
    pub joints: Vec<Joint>,
}

/// A tracked body as sent to the UI and peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct TrackedBody {
    pub id: u32,
    pub skeleton: Skeleton,
}

/// Compressed image, carried as a data URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct EncodedImage {
    pub data: String,
    pub width: u32,
    pub height: u32,
}

/// Feed-specific content of a [`ProcessedFrame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub enum FramePayload {
    Bodies {
        bodies: Vec<TrackedBody>,
    },
    Image {
        #[serde(rename = "imageData")]
        image: EncodedImage,
    },
}

/// Wire-ready frame package. Immutable once built; shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "tauri", derive(specta::Type))]
pub struct ProcessedFrame {
    pub name: String,
    #[serde(flatten)]
    pub payload: FramePayload,
    pub width: u32,
    pub height: u32,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl ProcessedFrame {
    pub fn bodies(name: impl Into<String>, bodies: Vec<TrackedBody>) -> Self {
        Self {
            name: name.into(),
            payload: FramePayload::Bodies { bodies },
            width: 0,
            height: 0,
            timestamp: now_millis(),
        }
    }

    pub fn image(name: impl Into<String>, image: EncodedImage) -> Self {
        let (width, height) = (image.width, image.height);
        Self {
            name: name.into(),
            payload: FramePayload::Image { image },
            width,
            height,
            timestamp: now_millis(),
        }
    }

    pub fn body_count(&self) -> usize {
        match &self.payload {
            FramePayload::Bodies { bodies } => bodies.len(),
            FramePayload::Image { .. } => 0,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
