//! JPEG encoder for freeze frames
//!
//! Compresses a rendered BGRA/RGBA frame with turbojpeg. turbojpeg
//! consumes the packed 4-byte layouts directly, so no colour conversion
//! happens here.

use bytes::Bytes;

use crate::error::{AppError, Result};
use crate::video::format::PixelFormat;
use crate::video::frame::SourceFrame;

/// JPEG encoder using turbojpeg
///
/// Not thread-safe; use from one thread or wrap in a Mutex.
pub struct JpegEncoder {
    compressor: turbojpeg::Compressor,
    quality: u32,
}

impl JpegEncoder {
    /// Create an encoder with quality 1-100
    pub fn with_quality(quality: u32) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::Encoder(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        let quality = quality.clamp(1, 100);
        compressor
            .set_quality(quality as i32)
            .map_err(|e| AppError::Encoder(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| AppError::Encoder(format!("Failed to set JPEG subsampling: {}", e)))?;

        Ok(Self {
            compressor,
            quality,
        })
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    /// Set JPEG quality (1-100)
    pub fn set_quality(&mut self, quality: u32) -> Result<()> {
        let quality = quality.clamp(1, 100);
        self.compressor
            .set_quality(quality as i32)
            .map_err(|e| AppError::Encoder(format!("Failed to set JPEG quality: {}", e)))?;
        self.quality = quality;
        Ok(())
    }

    /// Compress a rendered frame
    pub fn encode(&mut self, frame: &SourceFrame) -> Result<Bytes> {
        if frame.resolution.is_empty() {
            return Err(AppError::Encoder(format!(
                "cannot compress empty {} frame",
                frame.resolution
            )));
        }
        let format = match frame.format {
            PixelFormat::Bgra8 => turbojpeg::PixelFormat::BGRA,
            PixelFormat::Rgba8 => turbojpeg::PixelFormat::RGBA,
        };
        let image = turbojpeg::Image {
            pixels: frame.data(),
            width: frame.width() as usize,
            pitch: frame.stride,
            height: frame.height() as usize,
            format,
        };

        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::Encoder(format!("JPEG compression failed: {}", e)))?;
        Ok(Bytes::from(jpeg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_encode_produces_jpeg_markers() {
        let mut encoder = JpegEncoder::with_quality(90).unwrap();
        let frame = SourceFrame::solid(Resolution::new(64, 48), PixelFormat::Bgra8, [0, 128, 255, 255]);
        let jpeg = encoder.encode(&frame).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_empty_frame_rejected() {
        let mut encoder = JpegEncoder::with_quality(90).unwrap();
        let frame = SourceFrame::solid(Resolution::new(0, 0), PixelFormat::Bgra8, [0, 0, 0, 255]);
        assert!(matches!(encoder.encode(&frame), Err(AppError::Encoder(_))));
    }

    #[test]
    fn test_quality_is_clamped() {
        let mut encoder = JpegEncoder::with_quality(250).unwrap();
        assert_eq!(encoder.quality(), 100);
        encoder.set_quality(0).unwrap();
        assert_eq!(encoder.quality(), 1);
    }
}
