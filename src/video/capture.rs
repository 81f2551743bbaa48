//! Frame capturer
//!
//! Samples the rendered back buffer once per application frame, adapts it to
//! the capture policy, copies it into a pooled encoder input buffer and hands
//! the result to the encode pipeline. Runs on the render thread and never
//! blocks: subscribers that cannot keep up miss frames.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::adapt::{AdapterControl, FrameAdapter};
use super::format::Resolution;
use super::frame::SourceFrame;
use super::input::InputFrame;
use super::input::InputPool;
use super::latency::LatencyTester;
use crate::config::CapturePolicy;
use crate::error::Result;
use crate::runtime::{ExecToken, StreamingContext, ThreadRole};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Colour written into the probe frame of a latency test
const LATENCY_PROBE_RGBA: [u8; 4] = [255, 0, 0, 255];

/// Frames queued per subscriber before new frames are dropped
pub const CAPTURE_QUEUE_DEPTH: usize = 4;

/// A captured frame ready for encoding
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub frame: InputFrame,
    /// Size of the back buffer this frame was captured from
    pub source_resolution: Resolution,
}

impl CapturedFrame {
    pub fn frame_id(&self) -> u32 {
        self.frame.frame_id()
    }

    pub fn timestamp_us(&self) -> u64 {
        self.frame.timestamp_us()
    }
}

/// Capturer source state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// No frame accepted yet
    Idle,
    /// At least one frame has been captured
    Live,
}

/// Result of offering a frame to the capturer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured { frame_id: u32 },
    /// Dropped by the rate limiter
    Skipped,
    /// Capture failed; already logged
    Failed,
}

/// Render-thread frame capturer
pub struct FrameCapturer {
    pool: InputPool,
    adapter: FrameAdapter,
    context: Arc<StreamingContext>,
    latency: Option<Arc<LatencyTester>>,
    subscribers: Vec<mpsc::Sender<CapturedFrame>>,
    capture_resolution: Option<Resolution>,
    state: CaptureState,
    throttler: LogThrottler,
}

impl FrameCapturer {
    pub fn new(
        pool: InputPool,
        policy: CapturePolicy,
        max_fps: u32,
        context: Arc<StreamingContext>,
    ) -> Self {
        Self {
            pool,
            adapter: FrameAdapter::new(policy, max_fps),
            context,
            latency: None,
            subscribers: Vec::new(),
            capture_resolution: None,
            state: CaptureState::Idle,
            throttler: LogThrottler::with_secs(5),
        }
    }

    /// Attach a latency probe
    pub fn with_latency_tester(mut self, tester: Arc<LatencyTester>) -> Self {
        self.latency = Some(tester);
        self
    }

    /// Receive every captured frame
    pub fn subscribe(&mut self) -> mpsc::Receiver<CapturedFrame> {
        let (tx, rx) = mpsc::channel(CAPTURE_QUEUE_DEPTH);
        self.subscribers.push(tx);
        rx
    }

    /// Limits adjustable from other threads
    pub fn adapter_control(&self) -> Arc<AdapterControl> {
        self.adapter.control()
    }

    pub fn set_policy(&mut self, policy: CapturePolicy) {
        self.adapter.set_policy(policy);
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn pool(&self) -> &InputPool {
        &self.pool
    }

    /// Capture one rendered frame
    pub fn on_frame_ready(
        &mut self,
        token: &ExecToken,
        source: &SourceFrame,
    ) -> Result<CaptureOutcome> {
        token.check(ThreadRole::Render, "FrameCapturer::on_frame_ready")?;

        let timestamp_us = self.context.now_us();
        let Some(resolution) = self.adapter.adapt(timestamp_us, source.resolution) else {
            return Ok(CaptureOutcome::Skipped);
        };

        if self.capture_resolution != Some(resolution) {
            self.set_capture_resolution(resolution);
        }

        let mut frame = match self.pool.obtain_input_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn_throttled!(self.throttler, "obtain", "Failed to obtain input frame: {}", e);
                return Ok(CaptureOutcome::Failed);
            }
        };
        frame.set_timestamp_us(timestamp_us);
        let frame_id = frame.frame_id();

        if let Some(latency) = &self.latency {
            latency.record_pre_capture(frame_id);
        }

        if let Err(e) = self.pool.copy_into(&mut frame, source) {
            warn_throttled!(self.throttler, "copy", "Failed to copy frame {}: {}", frame_id, e);
            return Ok(CaptureOutcome::Failed);
        }

        if let Some(latency) = &self.latency {
            if latency.record_post_capture(frame_id) {
                if let Err(e) = self.pool.fill(&mut frame, LATENCY_PROBE_RGBA) {
                    warn_throttled!(self.throttler, "probe", "Failed to mark latency probe frame: {}", e);
                }
            }
        }

        if self.state == CaptureState::Idle {
            info!("Capture live at {} (source {})", resolution, source.resolution);
            self.state = CaptureState::Live;
        }

        let captured = CapturedFrame {
            frame,
            source_resolution: source.resolution,
        };
        self.deliver(captured);
        Ok(CaptureOutcome::Captured { frame_id })
    }

    /// Resize the input pool for future frames. Frames still in flight keep
    /// their old buffers until released.
    pub fn set_capture_resolution(&mut self, resolution: Resolution) {
        match self.pool.set_resolution(resolution) {
            Ok(()) => {
                self.pool.flush();
                self.capture_resolution = Some(resolution);
            }
            Err(e) => {
                // Fixed pools resample every frame to their own size
                debug!("Keeping input pool at {}: {}", self.pool.resolution(), e);
                self.capture_resolution = Some(resolution);
            }
        }
    }

    fn deliver(&mut self, captured: CapturedFrame) {
        self.subscribers.retain(|tx| !tx.is_closed());
        for tx in &self.subscribers {
            if let Err(mpsc::error::TrySendError::Full(frame)) = tx.try_send(captured.clone()) {
                warn_throttled!(
                    self.throttler,
                    "queue_full",
                    "Encoder queue full, dropping frame {}",
                    frame.frame_id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use crate::video::format::PixelFormat;
    use crate::video::input::testing::CountingBackend;
    use crate::video::input::HostBackend;
    use crate::video::latency::LatencyTestStage;
    use std::sync::atomic::Ordering;

    fn capturer(policy: CapturePolicy) -> FrameCapturer {
        let pool = InputPool::with_backend(
            Box::new(HostBackend::new(PixelFormat::Bgra8)),
            Resolution::new(64, 32),
            true,
        );
        FrameCapturer::new(pool, policy, 0, StreamingContext::init().unwrap())
    }

    fn source(res: Resolution) -> SourceFrame {
        SourceFrame::solid(res, PixelFormat::Bgra8, [10, 20, 30, 255])
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let token = ExecToken::bind(ThreadRole::Render);
        let mut capturer = capturer(CapturePolicy::BackBuffer);
        let mut rx = capturer.subscribe();
        let src = source(Resolution::new(64, 32));

        let mut ids = Vec::new();
        for _ in 0..3 {
            match capturer.on_frame_ready(&token, &src).unwrap() {
                CaptureOutcome::Captured { frame_id } => ids.push(frame_id),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(capturer.state(), CaptureState::Live);

        let received: Vec<u32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.frame_id())
            .collect();
        assert_eq!(received, ids);
    }

    #[test]
    fn test_wrong_thread_rejected() {
        let token = ExecToken::bind(ThreadRole::Signalling);
        let mut capturer = capturer(CapturePolicy::BackBuffer);
        let err = capturer
            .on_frame_ready(&token, &source(Resolution::new(64, 32)))
            .unwrap_err();
        assert!(matches!(err, AppError::WrongThread { .. }));
        assert_eq!(capturer.state(), CaptureState::Idle);
    }

    #[test]
    fn test_resolution_change_resizes_pool() {
        let token = ExecToken::bind(ThreadRole::Render);
        let (backend, allocs, releases) = CountingBackend::new();
        let pool = InputPool::with_backend(Box::new(backend), Resolution::new(64, 32), true);
        let mut capturer = FrameCapturer::new(
            pool.clone(),
            CapturePolicy::BackBuffer,
            0,
            StreamingContext::init().unwrap(),
        );
        let mut rx = capturer.subscribe();

        capturer
            .on_frame_ready(&token, &source(Resolution::new(64, 32)))
            .unwrap();
        let in_flight = rx.try_recv().unwrap();

        capturer
            .on_frame_ready(&token, &source(Resolution::new(32, 16)))
            .unwrap();
        assert_eq!(pool.resolution(), Resolution::new(32, 16));
        assert_eq!(rx.try_recv().unwrap().frame.resolution(), Resolution::new(32, 16));

        // Old-size buffer survives until its frame is released
        assert_eq!(in_flight.frame.resolution(), Resolution::new(64, 32));
        drop(in_flight);
        assert_eq!(allocs.load(Ordering::SeqCst), 2);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let token = ExecToken::bind(ThreadRole::Render);
        let mut capturer = capturer(CapturePolicy::BackBuffer);
        let mut rx = capturer.subscribe();
        let src = source(Resolution::new(64, 32));
        for _ in 0..CAPTURE_QUEUE_DEPTH + 3 {
            capturer.on_frame_ready(&token, &src).unwrap();
        }
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, CAPTURE_QUEUE_DEPTH);
    }

    #[test]
    fn test_latency_probe_frame_is_red() {
        let token = ExecToken::bind(ThreadRole::Render);
        let tester = Arc::new(LatencyTester::new());
        let mut capturer = capturer(CapturePolicy::Fixed(Resolution::new(16, 16)))
            .with_latency_tester(tester.clone());
        let mut rx = capturer.subscribe();

        tester.start("p1");
        capturer
            .on_frame_ready(&token, &source(Resolution::new(64, 32)))
            .unwrap();
        assert_eq!(tester.stage(), LatencyTestStage::PostCapture);

        let captured = rx.try_recv().unwrap();
        let first_pixel = captured
            .frame
            .read(|buffer| buffer.as_host().map(|h| h.data[..4].to_vec()))
            .flatten()
            .unwrap();
        // BGRA red
        assert_eq!(first_pixel, vec![0, 0, 255, 255]);
    }
}
