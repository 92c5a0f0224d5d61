//! Image compression for keyed frames
//!
//! The depth key packs 16-bit depth into two colour channels, so only a
//! lossless codec keeps the values intact on the client.

use std::io::Cursor;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::ExtendedColorType;
use image::codecs::webp::WebPEncoder;

use crate::config::CodecConfig;
use crate::error::{BridgeError, Result};
use crate::processors::RgbaFrame;

/// Compresses RGBA frames for transport.
pub trait ImageCodec: Send + Sync + 'static {
    fn encode_rgba(&self, frame: &RgbaFrame) -> Result<Vec<u8>>;

    /// MIME type used in the data URL.
    fn mime_type(&self) -> &'static str;
}

/// Lossless WebP encoder.
///
/// The `image` encoder is lossless only and has no effort setting; the
/// configured quality and method are kept for logging and for bindings that
/// expose them.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebpCodec {
    settings: CodecConfig,
}

impl WebpCodec {
    pub fn new(settings: CodecConfig) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CodecConfig {
        &self.settings
    }
}

impl ImageCodec for WebpCodec {
    fn encode_rgba(&self, frame: &RgbaFrame) -> Result<Vec<u8>> {
        let expected = frame.width as usize * frame.height as usize * RgbaFrame::CHANNELS;
        if frame.data.len() != expected {
            return Err(BridgeError::codec(format!(
                "buffer holds {} bytes, {}x{} RGBA needs {}",
                frame.data.len(),
                frame.width,
                frame.height,
                expected
            )));
        }

        let mut out = Cursor::new(Vec::with_capacity(expected / 4));
        WebPEncoder::new_lossless(&mut out)
            .encode(&frame.data, frame.width, frame.height, ExtendedColorType::Rgba8)
            .map_err(|e| BridgeError::codec(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn mime_type(&self) -> &'static str {
        "image/webp"
    }
}

/// Wrap encoded bytes as a `data:` URL.
pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime, STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32) -> RgbaFrame {
        let data = (0..width * height)
            .flat_map(|i| {
                if i % 2 == 0 { [(i & 0xff) as u8, (i >> 8) as u8, 0, 255] } else { [0; 4] }
            })
            .collect();
        RgbaFrame { width, height, data }
    }

    #[test]
    fn encodes_webp_container() {
        let bytes = WebpCodec::default().encode_rgba(&frame(16, 8)).unwrap();
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
    }

    #[test]
    fn lossless_round_trip_preserves_depth_bytes() {
        let original = frame(12, 10);
        let bytes = WebpCodec::default().encode_rgba(&original).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::WebP)
            .unwrap()
            .to_rgba8();
        assert_eq!(decoded.dimensions(), (12, 10));
        // Transparent pixels may have their colour dropped; compare opaque ones
        for (px, expected) in decoded.as_raw().chunks(4).zip(original.data.chunks(4)) {
            if expected[3] == 255 {
                assert_eq!(px, expected);
            } else {
                assert_eq!(px[3], 0);
            }
        }
    }

    #[test]
    fn rejects_short_buffer() {
        let mut bad = frame(4, 4);
        bad.data.truncate(10);
        let err = WebpCodec::default().encode_rgba(&bad).unwrap_err();
        assert!(matches!(err, BridgeError::Codec { .. }));
    }

    #[test]
    fn data_url_prefix() {
        let url = to_data_url("image/webp", &[1, 2, 3]);
        assert_eq!(url, "data:image/webp;base64,AQID");
    }
}
