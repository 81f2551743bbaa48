//! Encode pipeline
//!
//! A single encoder fed by the capturer and broadcasting to every session:
//!
//! ```text
//! FrameCapturer (render thread)
//!        |
//!        v (mpsc::Receiver<CapturedFrame>)
//! VideoPipeline worker (blocking task, one encoder)
//!        |
//!        v (VideoSource broadcast)
//! Session tracks
//! ```
//!
//! Frames are encoded in capture order, so packets for frame N always reach
//! the tracks before packets for frame N+1.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::adapt::AdapterControl;
use super::capture::CapturedFrame;
use super::encoder::{EncodeOptions, EncoderRegistry, LayerConfig, VideoEncoder};
use super::input::InputPool;
use super::latency::LatencyTester;
use crate::config::{EncoderSettings, WebRtcSettings};
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::warn_throttled;
use crate::webrtc::source::{MediaSources, VideoSource};

/// Pipeline configuration
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub encoder: EncoderSettings,
    pub webrtc: WebRtcSettings,
}

/// Pipeline statistics
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_encoded: AtomicU64,
    key_frames: AtomicU64,
    bytes_encoded: AtomicU64,
    frames_skipped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub frames_encoded: u64,
    pub key_frames: u64,
    pub bytes_encoded: u64,
    /// Frames not encoded because nobody was watching
    pub frames_skipped: u64,
    pub errors: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            frames_encoded: self.frames_encoded.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            bytes_encoded: self.bytes_encoded.load(Ordering::Relaxed),
            frames_skipped: self.frames_skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Running encode pipeline
pub struct VideoPipeline {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
}

impl VideoPipeline {
    /// Create the encoder and start the worker.
    ///
    /// Fails when no encoder is registered for the configured codec or the
    /// encoder cannot be set up on `pool`.
    pub fn start(
        registry: &EncoderRegistry,
        pool: InputPool,
        frames: mpsc::Receiver<CapturedFrame>,
        sources: Arc<MediaSources>,
        adapter: Arc<AdapterControl>,
        latency: Option<Arc<LatencyTester>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let codec = config.encoder.codec;
        if !registry.has_encoder_for_codec(codec) {
            return Err(AppError::NoEncoder(codec.to_string()));
        }
        let info = registry
            .best_encoder(codec)
            .ok_or_else(|| AppError::NoEncoder(codec.to_string()))?;

        let layer = LayerConfig::from_settings(
            &config.encoder,
            pool.resolution(),
            config.webrtc.max_fps,
            config.webrtc.max_bitrate as i32,
        );
        let encoder = registry.create(info.id, pool, layer).ok_or_else(|| {
            AppError::Encoder(format!("{} is unavailable for {}", info.name, layer.resolution()))
        })?;

        info!(
            "Starting {} pipeline with {} ({}x{} @ {} fps)",
            codec, info.name, layer.width, layer.height, layer.max_framerate
        );

        let cancel = CancellationToken::new();
        let stats = Arc::new(PipelineStats::default());
        let worker = EncodeWorker {
            encoder,
            layer,
            settings: config.encoder,
            frames,
            sources,
            adapter,
            latency,
            stats: stats.clone(),
            cancel: cancel.clone(),
            frames_since_key: 0,
            throttler: LogThrottler::with_secs(5),
        };
        let handle = tokio::task::spawn_blocking(move || worker.run());

        Ok(Self {
            cancel,
            handle: Some(handle),
            stats,
        })
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker and wait for it. The worker also stops on its own
    /// once the capturer is gone.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Encode worker ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for VideoPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct EncodeWorker {
    encoder: Box<dyn VideoEncoder>,
    layer: LayerConfig,
    settings: EncoderSettings,
    frames: mpsc::Receiver<CapturedFrame>,
    sources: Arc<MediaSources>,
    adapter: Arc<AdapterControl>,
    latency: Option<Arc<LatencyTester>>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    frames_since_key: u32,
    throttler: LogThrottler,
}

impl EncodeWorker {
    fn run(mut self) {
        while let Some(captured) = self.frames.blocking_recv() {
            if self.cancel.is_cancelled() {
                break;
            }

            // Nobody watching yet
            let Some(video) = self.sources.video_if_created() else {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            if video.subscriber_count() == 0 {
                self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.apply_requests(&video);
            self.encode_frame(&video, captured);
        }

        self.encoder.shutdown();
        info!("Encode pipeline stopped");
    }

    /// Fold viewer requests into the layer configuration
    fn apply_requests(&mut self, video: &VideoSource) {
        // Layer 0 follows the capture size
        if let Some(current) = self.encoder.layer_config(0) {
            self.layer.width = current.width;
            self.layer.height = current.height;
        }
        let mut layer = self.layer;
        if let Some(fps) = video.requested_max_fps() {
            layer.max_framerate = fps;
            self.adapter.set_max_fps(fps);
        }
        if let Some((min, max)) = video.requested_bitrate() {
            layer.max_bitrate = max;
            layer.target_bitrate = if self.settings.target_bitrate > 0 {
                self.settings.target_bitrate
            } else {
                (max / 2).max(min)
            };
        }
        if layer != self.layer {
            debug!(
                "Encoder layer update: {} fps, {} bps max, {} bps target",
                layer.max_framerate, layer.max_bitrate, layer.target_bitrate
            );
            match self.encoder.update_layer_config(0, layer) {
                Ok(()) => self.layer = layer,
                Err(e) => warn!("Failed to update encoder layer: {}", e),
            }
        }
    }

    fn encode_frame(&mut self, video: &VideoSource, captured: CapturedFrame) {
        let frame_id = captured.frame_id();

        let mut force_key_frame = video.take_key_frame_request();
        let interval = self.settings.keyframe_interval;
        if interval > 0 && self.frames_since_key >= interval {
            force_key_frame = true;
        }
        if let Some(latency) = &self.latency {
            latency.record_pre_encode(frame_id);
        }

        let packets = match self
            .encoder
            .encode(&captured.frame, EncodeOptions { force_key_frame })
        {
            Ok(packets) => packets,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn_throttled!(self.throttler, "encode", "Encoding frame {} failed: {}", frame_id, e);
                return;
            }
        };
        drop(captured);

        if let Some(latency) = &self.latency {
            latency.record_post_encode(frame_id);
        }

        let mut qp_sum = 0u32;
        let count = packets.len() as u32;
        for packet in packets {
            if packet.key_frame {
                self.frames_since_key = 0;
                self.stats.key_frames.fetch_add(1, Ordering::Relaxed);
            }
            qp_sum += packet.qp;
            self.stats
                .bytes_encoded
                .fetch_add(packet.data.len() as u64, Ordering::Relaxed);
            video.publish(packet);
        }
        if count > 0 {
            video.report_qp(qp_sum / count);
        }
        self.frames_since_key = self.frames_since_key.saturating_add(1);
        self.stats.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }
}
