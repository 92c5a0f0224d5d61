//! Depth key feed
//!
//! Keys depth with the body index map and ships it as a lossless WebP data
//! URL. Encoding runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use super::{FeedPipeline, PackageError};
use crate::codec::{ImageCodec, WebpCodec, to_data_url};
use crate::config::HandlerConfig;
use crate::error::BridgeError;
use crate::logging::targets;
use crate::processors::{DepthKeyProcessor, FrameProcessor};
use crate::types::{EncodedImage, FeedKind, ProcessedFrame, SensorFrame};
use crate::ui::DEPTH_KEY_FRAME;

/// Package name and peer event for depth-key frames.
pub const DEPTH_KEY_PACKAGE: &str = "depth-key";

#[derive(Clone)]
pub struct DepthKeyPipeline {
    processor: DepthKeyProcessor,
    codec: Arc<dyn ImageCodec>,
}

impl DepthKeyPipeline {
    pub fn new(codec: Arc<dyn ImageCodec>) -> Self {
        Self { processor: DepthKeyProcessor, codec }
    }
}

impl Default for DepthKeyPipeline {
    fn default() -> Self {
        Self::new(Arc::new(WebpCodec::default()))
    }
}

#[async_trait::async_trait]
impl FeedPipeline for DepthKeyPipeline {
    fn feed(&self) -> FeedKind {
        FeedKind::DepthKey
    }

    fn control_channel(&self) -> &'static str {
        "start-depth-key-stream"
    }

    fn ui_event(&self) -> &'static str {
        DEPTH_KEY_FRAME
    }

    fn peer_event(&self) -> &'static str {
        DEPTH_KEY_PACKAGE
    }

    fn warmup(&self, config: &HandlerConfig) -> Duration {
        config.tracker_warmup()
    }

    async fn package(&self, frame: &SensorFrame) -> Result<ProcessedFrame, PackageError> {
        let rgba = self.processor.process(frame)?;
        let (width, height) = (rgba.width, rgba.height);

        let codec = Arc::clone(&self.codec);
        let encoded = tokio::task::spawn_blocking(move || codec.encode_rgba(&rgba))
            .await
            .map_err(|e| PackageError::Encode(BridgeError::codec(format!("encoder task failed: {e}"))))?
            .map_err(PackageError::Encode)?;

        tracing::trace!(target: targets::PERFORMANCE, bytes = encoded.len(), "Depth key frame compressed");

        Ok(ProcessedFrame::image(
            DEPTH_KEY_PACKAGE,
            EncodedImage { data: to_data_url(self.codec.mime_type(), &encoded), width, height },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::{RgbaFrame, Skip};
    use crate::test_utils::frames;

    struct FailingCodec;

    impl ImageCodec for FailingCodec {
        fn encode_rgba(&self, _frame: &RgbaFrame) -> crate::Result<Vec<u8>> {
            Err(BridgeError::codec("out of memory"))
        }

        fn mime_type(&self) -> &'static str {
            "image/webp"
        }
    }

    #[tokio::test]
    async fn packages_webp_data_url() {
        let package = DepthKeyPipeline::default()
            .package(&frames::depth_key_frame(32, 24, true))
            .await
            .unwrap();
        assert_eq!(package.name, "depth-key");
        assert_eq!((package.width, package.height), (32, 24));

        let json = serde_json::to_value(&package).unwrap();
        assert_eq!(json["imageData"]["width"], 32);
        assert!(json["imageData"]["data"].as_str().unwrap().starts_with("data:image/webp;base64,"));
    }

    #[tokio::test]
    async fn missing_body_index_map_is_skipped() {
        let result = DepthKeyPipeline::default().package(&frames::depth_key_frame(8, 8, false)).await;
        assert!(matches!(result, Err(PackageError::Skipped(Skip::MissingSubFrames(_)))));
    }

    #[tokio::test]
    async fn codec_failure_is_an_encode_error() {
        let pipeline = DepthKeyPipeline::new(Arc::new(FailingCodec));
        let result = pipeline.package(&frames::depth_key_frame(8, 8, true)).await;
        assert!(matches!(result, Err(PackageError::Encode(BridgeError::Codec { .. }))));
    }

    #[test]
    fn warmup_comes_from_config() {
        let config = HandlerConfig { tracker_warmup_ms: 250, ..HandlerConfig::default() };
        assert_eq!(DepthKeyPipeline::default().warmup(&config), Duration::from_millis(250));
    }
}
