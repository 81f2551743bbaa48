//! Pixel format and resolution definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel layouts a render backend hands to the capturer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PixelFormat {
    /// 8-bit BGRA, the usual swapchain format
    Bgra8,
    /// 8-bit RGBA
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        4
    }

    /// Byte offsets of (r, g, b, a) within a pixel
    pub fn channel_offsets(&self) -> [usize; 4] {
        match self {
            PixelFormat::Bgra8 => [2, 1, 0, 3],
            PixelFormat::Rgba8 => [0, 1, 2, 3],
        }
    }

    /// Tightly packed frame size in bytes
    pub fn frame_size(&self, resolution: Resolution) -> usize {
        resolution.width as usize * resolution.height as usize * self.bytes_per_pixel()
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelFormat::Bgra8 => write!(f, "BGRA8"),
            PixelFormat::Rgba8 => write!(f, "RGBA8"),
        }
    }
}

/// Resolution (width x height)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Get total pixels
    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Largest even-sized resolution with the same aspect ratio and at most
    /// `max_pixels` pixels. Returns `self` when it already fits.
    pub fn scaled_to_fit(&self, max_pixels: u64) -> Resolution {
        if self.pixels() <= max_pixels || self.is_empty() {
            return *self;
        }
        let scale = (max_pixels as f64 / self.pixels() as f64).sqrt();
        let width = ((self.width as f64 * scale) as u32) & !1;
        let height = ((self.height as f64 * scale) as u32) & !1;
        Resolution::new(width.max(2), height.max(2))
    }

    /// Round down to even dimensions, at least 2x2. 4:2:0 chroma needs
    /// whole 2x2 blocks.
    pub fn to_even(&self) -> Resolution {
        Resolution::new((self.width & !1).max(2), (self.height & !1).max(2))
    }

    pub const VGA: Resolution = Resolution {
        width: 640,
        height: 480,
    };
    pub const HD720: Resolution = Resolution {
        width: 1280,
        height: 720,
    };
    pub const HD1080: Resolution = Resolution {
        width: 1920,
        height: 1080,
    };
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Bgra8.frame_size(Resolution::VGA), 640 * 480 * 4);
    }

    #[test]
    fn test_scaled_to_fit() {
        let hd = Resolution::HD1080;
        assert_eq!(hd.scaled_to_fit(u64::MAX), hd);

        let scaled = hd.scaled_to_fit(Resolution::HD720.pixels());
        assert!(scaled.pixels() <= Resolution::HD720.pixels());
        assert_eq!(scaled.width % 2, 0);
        assert_eq!(scaled.height % 2, 0);
        assert!(scaled.width >= 1278 && scaled.width <= 1280);
    }

    #[test]
    fn test_to_even() {
        assert_eq!(Resolution::new(1281, 721).to_even(), Resolution::HD720);
        assert_eq!(Resolution::HD720.to_even(), Resolution::HD720);
        assert_eq!(Resolution::new(1, 1).to_even(), Resolution::new(2, 2));
    }

    #[test]
    fn test_display() {
        assert_eq!(Resolution::HD720.to_string(), "1280x720");
        assert_eq!(PixelFormat::Rgba8.to_string(), "RGBA8");
    }
}
