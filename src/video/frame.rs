//! Source frame handed over by the renderer

use bytes::Bytes;
use std::sync::Arc;
use std::sync::OnceLock;

use super::format::{PixelFormat, Resolution};
use crate::error::{AppError, Result};

/// A rendered back buffer, read-only from the capturer's point of view
#[derive(Debug, Clone)]
pub struct SourceFrame {
    data: Bytes,
    /// Cached xxHash64 of the pixel data
    hash: Arc<OnceLock<u64>>,
    pub resolution: Resolution,
    pub format: PixelFormat,
    /// Bytes per row, at least `width * bytes_per_pixel`
    pub stride: usize,
}

impl SourceFrame {
    pub fn new(
        data: Bytes,
        resolution: Resolution,
        format: PixelFormat,
        stride: usize,
    ) -> Result<Self> {
        let min_stride = resolution.width as usize * format.bytes_per_pixel();
        if stride < min_stride {
            return Err(AppError::Capture(format!(
                "stride {} smaller than row size {}",
                stride, min_stride
            )));
        }
        let needed = stride * resolution.height as usize;
        if data.len() < needed {
            return Err(AppError::Capture(format!(
                "frame data too small: {} < {}",
                data.len(),
                needed
            )));
        }
        Ok(Self {
            data,
            hash: Arc::new(OnceLock::new()),
            resolution,
            format,
            stride,
        })
    }

    /// Tightly packed frame
    pub fn packed(data: impl Into<Bytes>, resolution: Resolution, format: PixelFormat) -> Result<Self> {
        let stride = resolution.width as usize * format.bytes_per_pixel();
        Self::new(data.into(), resolution, format, stride)
    }

    /// Frame filled with one colour given as (r, g, b, a)
    pub fn solid(resolution: Resolution, format: PixelFormat, rgba: [u8; 4]) -> Self {
        let offsets = format.channel_offsets();
        let mut pixel = [0u8; 4];
        for (channel, offset) in offsets.iter().enumerate() {
            pixel[*offset] = rgba[channel];
        }
        let data: Vec<u8> = pixel
            .iter()
            .copied()
            .cycle()
            .take(format.frame_size(resolution))
            .collect();
        Self {
            data: Bytes::from(data),
            hash: Arc::new(OnceLock::new()),
            resolution,
            format,
            stride: resolution.width as usize * format.bytes_per_pixel(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// One row of pixels without stride padding
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        let len = self.resolution.width as usize * self.format.bytes_per_pixel();
        &self.data[start..start + len]
    }

    pub fn is_packed(&self) -> bool {
        self.stride == self.resolution.width as usize * self.format.bytes_per_pixel()
    }

    /// Hash of the pixel data (computed once)
    pub fn content_hash(&self) -> u64 {
        *self
            .hash
            .get_or_init(|| xxhash_rust::xxh64::xxh64(self.data.as_ref(), 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_buffer() {
        let res = Resolution::new(4, 4);
        let err = SourceFrame::packed(vec![0u8; 10], res, PixelFormat::Rgba8).unwrap_err();
        assert!(matches!(err, AppError::Capture(_)));
    }

    #[test]
    fn test_solid_respects_channel_order() {
        let res = Resolution::new(2, 1);
        let bgra = SourceFrame::solid(res, PixelFormat::Bgra8, [255, 0, 0, 255]);
        assert_eq!(&bgra.data()[..4], &[0, 0, 255, 255]);
        let rgba = SourceFrame::solid(res, PixelFormat::Rgba8, [255, 0, 0, 255]);
        assert_eq!(&rgba.data()[..4], &[255, 0, 0, 255]);
    }

    #[test]
    fn test_row_skips_padding() {
        let res = Resolution::new(1, 2);
        let data = vec![1, 2, 3, 4, 9, 9, 5, 6, 7, 8, 9, 9];
        let frame = SourceFrame::new(Bytes::from(data), res, PixelFormat::Rgba8, 6).unwrap();
        assert!(!frame.is_packed());
        assert_eq!(frame.row(1), &[5, 6, 7, 8]);
    }

    #[test]
    fn test_content_hash_stable() {
        let frame = SourceFrame::solid(Resolution::new(8, 8), PixelFormat::Rgba8, [1, 2, 3, 4]);
        let clone = frame.clone();
        assert_eq!(frame.content_hash(), clone.content_hash());
    }
}
