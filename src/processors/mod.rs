//! Frame processors: raw sensor frame in, wire-ready payload out.
//!
//! Processors are pure. They do no I/O, keep no state between calls, and
//! produce identical output for identical input, so they can be exercised with
//! synthetic frames.

mod body;
mod depth_key;

pub use body::BodyProcessor;
pub use depth_key::{DepthKeyProcessor, RgbaFrame};

use std::fmt;

use crate::types::SensorFrame;

/// Why a processor produced nothing for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// The frame lacks a sub-frame this processor needs.
    MissingSubFrames(&'static str),
    /// Body frame present but nobody is tracked.
    NoBodies,
    /// Sub-frames present but inconsistent with each other.
    Malformed(String),
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skip::MissingSubFrames(what) => write!(f, "missing {what}"),
            Skip::NoBodies => f.write_str("no bodies tracked"),
            Skip::Malformed(details) => write!(f, "malformed frame: {details}"),
        }
    }
}

/// A transformation from one raw frame to one payload.
pub trait FrameProcessor: Send + Sync + 'static {
    type Output: Send;

    fn process(&self, frame: &SensorFrame) -> Result<Self::Output, Skip>;
}
