//! Synthetic frame source
//!
//! Colour bars with a sweeping vertical line, used by the headless binary in
//! place of a renderer.

use bytes::BytesMut;

use super::format::{PixelFormat, Resolution};
use super::frame::SourceFrame;

/// 75% SMPTE colour bars (r, g, b)
const BARS: [[u8; 3]; 8] = [
    [191, 191, 191],
    [191, 191, 0],
    [0, 191, 191],
    [0, 191, 0],
    [191, 0, 191],
    [191, 0, 0],
    [0, 0, 191],
    [16, 16, 16],
];

/// Pixels the sweep line moves per frame
const SWEEP_STEP: u32 = 4;

pub struct TestPattern {
    resolution: Resolution,
    format: PixelFormat,
    frame: u64,
}

impl TestPattern {
    pub fn new(resolution: Resolution, format: PixelFormat) -> Self {
        Self {
            resolution,
            format,
            frame: 0,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    /// Render the next frame
    pub fn next_frame(&mut self) -> SourceFrame {
        let Resolution { width, height } = self.resolution;
        let offsets = self.format.channel_offsets();
        let bpp = self.format.bytes_per_pixel();
        let sweep_x = if width > 0 {
            ((self.frame * SWEEP_STEP as u64) % width as u64) as u32
        } else {
            0
        };
        self.frame += 1;

        let mut row = vec![0u8; width as usize * bpp];
        for x in 0..width {
            let rgb = if x == sweep_x {
                [255, 255, 255]
            } else {
                BARS[(x as usize * BARS.len()) / width.max(1) as usize]
            };
            let px = &mut row[x as usize * bpp..(x as usize + 1) * bpp];
            px[offsets[0]] = rgb[0];
            px[offsets[1]] = rgb[1];
            px[offsets[2]] = rgb[2];
            px[offsets[3]] = 255;
        }

        let mut data = BytesMut::with_capacity(row.len() * height as usize);
        for _ in 0..height {
            data.extend_from_slice(&row);
        }

        SourceFrame::packed(data.freeze(), self.resolution, self.format)
            .unwrap_or_else(|_| SourceFrame::solid(self.resolution, self.format, [0, 0, 0, 255]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_change_over_time() {
        let mut pattern = TestPattern::new(Resolution::new(64, 8), PixelFormat::Bgra8);
        let a = pattern.next_frame();
        let b = pattern.next_frame();
        assert_eq!(a.resolution, Resolution::new(64, 8));
        assert_eq!(a.data().len(), 64 * 8 * 4);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_first_bar_is_grey() {
        let mut pattern = TestPattern::new(Resolution::new(64, 8), PixelFormat::Rgba8);
        let frame = pattern.next_frame();
        // x=0 is the sweep line on the first frame
        assert_eq!(&frame.row(0)[4..8], &[191, 191, 191, 255]);
    }
}
