//! Depth key processor
//!
//! Keys the depth image with the tracker's body index map: pixels that belong
//! to a body keep their depth, everything else becomes transparent. Depth is
//! packed into the red (low byte) and green (high byte) channels so the
//! client can rebuild the u16 sample after lossless decoding.

use super::{FrameProcessor, Skip};
use crate::types::{BODY_INDEX_BACKGROUND, ImageFrame, PixelFormat, SensorFrame};

/// Tightly packed RGBA buffer ready for image compression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbaFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RgbaFrame {
    pub const CHANNELS: usize = 4;

    /// RGBA value at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * Self::CHANNELS;
        let px = self.data.get(offset..offset + Self::CHANNELS)?;
        Some([px[0], px[1], px[2], px[3]])
    }

    /// Number of pixels that belong to a body.
    pub fn opaque_pixels(&self) -> usize {
        self.data.chunks_exact(Self::CHANNELS).filter(|px| px[3] != 0).count()
    }
}

/// Combines depth and body index map into a keyed RGBA frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DepthKeyProcessor;

impl DepthKeyProcessor {
    fn compose(depth: &ImageFrame, body_index: &ImageFrame) -> Result<RgbaFrame, Skip> {
        if depth.format != PixelFormat::Depth16 || body_index.format != PixelFormat::BodyIndex8 {
            return Err(Skip::Malformed("unexpected pixel format".to_string()));
        }
        if depth.width != body_index.width || depth.height != body_index.height {
            return Err(Skip::Malformed(format!(
                "depth is {}x{} but body index map is {}x{}",
                depth.width, depth.height, body_index.width, body_index.height
            )));
        }
        if !depth.is_complete() || !body_index.is_complete() {
            return Err(Skip::Malformed("truncated image buffer".to_string()));
        }

        let width = depth.width as usize;
        let height = depth.height as usize;
        let mut data = vec![0u8; width * height * RgbaFrame::CHANNELS];

        for y in 0..height {
            let depth_row = &depth.data[y * depth.stride_bytes as usize..][..width * 2];
            let index_row = &body_index.data[y * body_index.stride_bytes as usize..][..width];
            let out_row = &mut data[y * width * RgbaFrame::CHANNELS..][..width * RgbaFrame::CHANNELS];

            for (x, &index) in index_row.iter().enumerate() {
                if index == BODY_INDEX_BACKGROUND {
                    continue;
                }
                let px = &mut out_row[x * RgbaFrame::CHANNELS..][..RgbaFrame::CHANNELS];
                px[0] = depth_row[x * 2];
                px[1] = depth_row[x * 2 + 1];
                px[2] = 0;
                px[3] = 255;
            }
        }

        Ok(RgbaFrame { width: depth.width, height: depth.height, data })
    }
}

impl FrameProcessor for DepthKeyProcessor {
    type Output = RgbaFrame;

    fn process(&self, frame: &SensorFrame) -> Result<Self::Output, Skip> {
        match (frame.depth.as_ref(), frame.body_index_map()) {
            (Some(depth), Some(body_index)) => Self::compose(depth, body_index),
            (None, _) => Err(Skip::MissingSubFrames("depth image")),
            (Some(_), None) => Err(Skip::MissingSubFrames("body index map")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::frames;
    use crate::types::{BodyFrame, ImageFrame, SensorFrame};
    use proptest::prelude::*;

    fn keyed(depth: &[u16], indices: Vec<u8>, width: u32, height: u32) -> SensorFrame {
        SensorFrame {
            depth: Some(ImageFrame::depth16(width, height, depth)),
            body: Some(BodyFrame {
                bodies: vec![],
                body_index_map: Some(ImageFrame::body_index(width, height, indices)),
            }),
            ..SensorFrame::default()
        }
    }

    #[test]
    fn body_pixels_carry_depth_and_background_is_transparent() {
        let frame = keyed(&[0x0A0B, 1200, 3000, 0], vec![0, 255, 1, 255], 2, 2);
        let rgba = DepthKeyProcessor.process(&frame).unwrap();

        assert_eq!((rgba.width, rgba.height), (2, 2));
        assert_eq!(rgba.data.len(), 16);
        assert_eq!(rgba.pixel(0, 0), Some([0x0B, 0x0A, 0, 255]));
        assert_eq!(rgba.pixel(1, 0), Some([0, 0, 0, 0]));
        assert_eq!(rgba.pixel(0, 1), Some([(3000 & 0xff) as u8, (3000 >> 8) as u8, 0, 255]));
        assert_eq!(rgba.opaque_pixels(), 2);
    }

    #[test]
    fn missing_body_index_map_yields_nothing() {
        let frame = frames::depth_key_frame(8, 8, false);
        assert_eq!(
            DepthKeyProcessor.process(&frame),
            Err(Skip::MissingSubFrames("body index map"))
        );
    }

    #[test]
    fn missing_depth_yields_nothing() {
        let mut frame = frames::depth_key_frame(8, 8, true);
        frame.depth = None;
        assert_eq!(DepthKeyProcessor.process(&frame), Err(Skip::MissingSubFrames("depth image")));
    }

    #[test]
    fn mismatched_dimensions_are_malformed() {
        let mut frame = frames::depth_key_frame(8, 8, true);
        frame.body.as_mut().unwrap().body_index_map =
            Some(ImageFrame::body_index(4, 4, vec![0; 16]));
        assert!(matches!(DepthKeyProcessor.process(&frame), Err(Skip::Malformed(_))));
    }

    #[test]
    fn padded_rows_respect_stride() {
        let mut depth = ImageFrame::depth16(2, 2, &[100, 200, 300, 400]);
        // Re-pack with two bytes of padding per row
        let mut padded = Vec::new();
        for row in depth.data.chunks(4) {
            padded.extend_from_slice(row);
            padded.extend_from_slice(&[0xEE, 0xEE]);
        }
        depth.stride_bytes = 6;
        depth.data = padded.into();

        let frame = SensorFrame {
            depth: Some(depth),
            body: Some(BodyFrame {
                bodies: vec![],
                body_index_map: Some(ImageFrame::body_index(2, 2, vec![0, 0, 0, 0])),
            }),
            ..SensorFrame::default()
        };
        let rgba = DepthKeyProcessor.process(&frame).unwrap();
        assert_eq!(rgba.pixel(1, 1), Some([(400 & 0xff) as u8, (400 >> 8) as u8, 0, 255]));
    }

    proptest! {
        #[test]
        fn output_matches_depth_dimensions_and_is_deterministic(
            width in 1u32..24,
            height in 1u32..24,
            seed in any::<u16>(),
        ) {
            let n = (width * height) as usize;
            let depth: Vec<u16> = (0..n).map(|i| seed.wrapping_add(i as u16)).collect();
            let indices: Vec<u8> = (0..n).map(|i| if i % 3 == 0 { 255 } else { (i % 4) as u8 }).collect();
            let frame = keyed(&depth, indices.clone(), width, height);

            let first = DepthKeyProcessor.process(&frame).unwrap();
            let second = DepthKeyProcessor.process(&frame).unwrap();

            prop_assert_eq!(first.data.len(), n * 4);
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(first.opaque_pixels(), indices.iter().filter(|&&i| i != 255).count());
        }
    }
}
