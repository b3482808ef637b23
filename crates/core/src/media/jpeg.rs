use bytes::Bytes;
use image::ImageFormat;
use image::codecs::jpeg::JpegEncoder;

use super::Transcoder;
use crate::error::{RelayError, Result};

/// Decode-then-encode JPEG transcoder.
///
/// Every frame is decoded to an RGB raster and encoded again at `quality`
/// (1–100). Lower quality trades detail for bandwidth; 70–80 keeps
/// surveillance footage legible at a fraction of the camera's bitrate.
#[derive(Debug, Clone)]
pub struct JpegTranscoder {
    quality: u8,
}

impl JpegTranscoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Transcoder for JpegTranscoder {
    fn reencode(&self, payload: &[u8]) -> Result<Bytes> {
        let image = image::load_from_memory_with_format(payload, ImageFormat::Jpeg)
            .map_err(|e| RelayError::Decode(e.to_string()))?;
        let rgb = image.to_rgb8();

        let mut out = Vec::with_capacity(payload.len() / 2);
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&rgb)
            .map_err(|e| RelayError::Decode(format!("re-encode failed: {e}")))?;

        tracing::trace!(
            width = rgb.width(),
            height = rgb.height(),
            in_bytes = payload.len(),
            out_bytes = out.len(),
            quality = self.quality,
            "frame re-encoded"
        );

        Ok(Bytes::from(out))
    }
}
