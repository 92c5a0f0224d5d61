//! Body skeleton processor

use super::{FrameProcessor, Skip};
use crate::types::{SensorFrame, Skeleton, TrackedBody};

/// Turns a tracker body frame into per-body skeleton joint arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyProcessor;

impl FrameProcessor for BodyProcessor {
    type Output = Vec<TrackedBody>;

    fn process(&self, frame: &SensorFrame) -> Result<Self::Output, Skip> {
        let body_frame = frame.body.as_ref().ok_or(Skip::MissingSubFrames("body frame"))?;
        if body_frame.num_bodies() == 0 {
            return Err(Skip::NoBodies);
        }

        Ok(body_frame
            .bodies
            .iter()
            .map(|body| TrackedBody {
                id: body.id,
                skeleton: Skeleton { joints: body.joints.clone() },
            })
            .collect())
    }
}
