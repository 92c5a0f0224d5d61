//! Body tracking feed

use super::{FeedPipeline, PackageError};
use crate::processors::{BodyProcessor, FrameProcessor};
use crate::types::{FeedKind, ProcessedFrame, SensorFrame};
use crate::ui::BODY_FRAME;

/// Package name and peer event for body frames.
pub const BODY_PACKAGE: &str = "bodyFrame";

/// Skeleton joints of every tracked body, once per frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct BodyPipeline {
    processor: BodyProcessor,
}

impl BodyPipeline {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl FeedPipeline for BodyPipeline {
    fn feed(&self) -> FeedKind {
        FeedKind::Body
    }

    fn control_channel(&self) -> &'static str {
        "start-body-tracking"
    }

    fn ui_event(&self) -> &'static str {
        BODY_FRAME
    }

    fn peer_event(&self) -> &'static str {
        BODY_PACKAGE
    }

    async fn package(&self, frame: &SensorFrame) -> Result<ProcessedFrame, PackageError> {
        let bodies = self.processor.process(frame)?;
        Ok(ProcessedFrame::bodies(BODY_PACKAGE, bodies))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::Skip;
    use crate::test_utils::frames;

    #[tokio::test]
    async fn packages_bodies_under_body_frame_name() {
        let package = BodyPipeline::new().package(&frames::body_frame(3)).await.unwrap();
        assert_eq!(package.name, "bodyFrame");
        assert_eq!(package.body_count(), 3);
        let json = serde_json::to_value(&package).unwrap();
        assert_eq!(json["bodies"][2]["id"], 3);
        assert!(json["bodies"][0]["skeleton"]["joints"][0]["cameraX"].is_number());
    }

    #[tokio::test]
    async fn empty_frames_are_skipped() {
        let mut frame = frames::body_frame(1);
        frame.body.as_mut().unwrap().bodies.clear();
        let result = BodyPipeline::new().package(&frame).await;
        assert!(matches!(result, Err(PackageError::Skipped(Skip::NoBodies))));
    }
}
