//! Frame rate and resolution adaptation for the capturer
//!
//! The capturer asks the adapter, once per rendered frame, whether the frame
//! should be captured and at what size. Limits can be changed from any
//! thread through [`AdapterControl`]; the adapter itself lives on the render
//! thread.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::config::CapturePolicy;
use crate::video::format::Resolution;

/// Limits shared between the render thread and control paths
#[derive(Debug)]
pub struct AdapterControl {
    max_fps: AtomicU32,
    /// 0 means unlimited
    max_pixels: AtomicU64,
}

impl AdapterControl {
    fn new(max_fps: u32) -> Self {
        Self {
            max_fps: AtomicU32::new(max_fps),
            max_pixels: AtomicU64::new(0),
        }
    }

    pub fn max_fps(&self) -> u32 {
        self.max_fps.load(Ordering::Relaxed)
    }

    /// Set the target frame rate, 0 disables rate limiting
    pub fn set_max_fps(&self, fps: u32) {
        let old = self.max_fps.swap(fps, Ordering::Relaxed);
        if old != fps {
            debug!("Capture frame rate limit {} -> {}", old, fps);
        }
    }

    pub fn max_pixel_count(&self) -> Option<u64> {
        match self.max_pixels.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    /// Cap the capture size at `pixels` (scaled down preserving aspect)
    pub fn set_max_pixel_count(&self, pixels: Option<u64>) {
        self.max_pixels.store(pixels.unwrap_or(0), Ordering::Relaxed);
    }
}

/// Decides which frames to capture and at what size
#[derive(Debug)]
pub struct FrameAdapter {
    policy: CapturePolicy,
    control: Arc<AdapterControl>,
    last_accepted_us: Option<u64>,
}

impl FrameAdapter {
    pub fn new(policy: CapturePolicy, max_fps: u32) -> Self {
        Self {
            policy,
            control: Arc::new(AdapterControl::new(max_fps)),
            last_accepted_us: None,
        }
    }

    pub fn control(&self) -> Arc<AdapterControl> {
        self.control.clone()
    }

    pub fn policy(&self) -> CapturePolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: CapturePolicy) {
        self.policy = policy;
    }

    /// Adapted capture resolution for a frame rendered at `timestamp_us`, or
    /// `None` when the frame should be dropped.
    pub fn adapt(&mut self, timestamp_us: u64, source: Resolution) -> Option<Resolution> {
        if source.is_empty() {
            return None;
        }

        let fps = self.control.max_fps();
        if fps > 0 {
            if let Some(last) = self.last_accepted_us {
                let interval = 1_000_000 / fps as u64;
                // Render loops jitter around the target rate
                let tolerance = interval / 10;
                if timestamp_us.saturating_sub(last) + tolerance < interval {
                    return None;
                }
            }
        }
        self.last_accepted_us = Some(timestamp_us);

        let target = match self.policy {
            CapturePolicy::BackBuffer => source,
            CapturePolicy::Fixed(size) => size,
        };
        let target = match self.control.max_pixel_count() {
            Some(max) => target.scaled_to_fit(max),
            None => target,
        };
        Some(target.to_even())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Resolution = Resolution::HD1080;

    #[test]
    fn test_backbuffer_tracks_source() {
        let mut adapter = FrameAdapter::new(CapturePolicy::BackBuffer, 0);
        assert_eq!(adapter.adapt(0, SRC), Some(SRC));
        assert_eq!(adapter.adapt(1, Resolution::HD720), Some(Resolution::HD720));
    }

    #[test]
    fn test_fixed_policy() {
        let mut adapter = FrameAdapter::new(CapturePolicy::Fixed(Resolution::HD720), 0);
        assert_eq!(adapter.adapt(0, SRC), Some(Resolution::HD720));
    }

    #[test]
    fn test_rate_limit_drops_early_frames() {
        let mut adapter = FrameAdapter::new(CapturePolicy::BackBuffer, 30);
        assert!(adapter.adapt(0, SRC).is_some());
        // 10ms later at 30fps (33.3ms interval): dropped
        assert!(adapter.adapt(10_000, SRC).is_none());
        // Slightly early but within tolerance: accepted
        assert!(adapter.adapt(31_000, SRC).is_some());
        assert!(adapter.adapt(40_000, SRC).is_none());
        assert!(adapter.adapt(70_000, SRC).is_some());
    }

    #[test]
    fn test_pixel_cap_from_control() {
        let mut adapter = FrameAdapter::new(CapturePolicy::BackBuffer, 0);
        let control = adapter.control();
        control.set_max_pixel_count(Some(Resolution::HD720.pixels()));
        let adapted = adapter.adapt(0, SRC).unwrap();
        assert!(adapted.pixels() <= Resolution::HD720.pixels());
        assert_eq!(adapted.width % 2, 0);
        assert_eq!(adapted.height % 2, 0);

        control.set_max_pixel_count(None);
        assert_eq!(adapter.adapt(1, SRC), Some(SRC));
    }

    #[test]
    fn test_odd_sizes_rounded_to_even() {
        let mut adapter = FrameAdapter::new(CapturePolicy::BackBuffer, 0);
        assert_eq!(
            adapter.adapt(0, Resolution::new(801, 599)),
            Some(Resolution::new(800, 598))
        );

        adapter.set_policy(CapturePolicy::Fixed(Resolution::new(333, 211)));
        assert_eq!(adapter.adapt(1, SRC), Some(Resolution::new(332, 210)));
    }

    #[test]
    fn test_empty_source_dropped() {
        let mut adapter = FrameAdapter::new(CapturePolicy::BackBuffer, 0);
        assert!(adapter.adapt(0, Resolution::new(0, 0)).is_none());
    }
}
