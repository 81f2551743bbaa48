//! Streaming service
//!
//! The application-facing entry point. Wires the capturer, the encode
//! pipeline and the streamer together:
//!
//! ```text
//! render thread --on_back_buffer_ready--> FrameCapturer --> VideoPipeline
//!                                                                |
//! control thread --freeze/unfreeze/send_*--> Streamer <--- VideoSource
//! ```

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, CapturePolicy};
use crate::error::{AppError, Result};
use crate::events::{EventBus, StreamerEvent};
use crate::runtime::{ExecToken, StreamingContext};
use crate::utils::LogThrottler;
use crate::video::input::DeviceHandle;
use crate::video::latency::LatencyTestStage;
use crate::video::pipeline::PipelineStatsSnapshot;
use crate::video::{
    CaptureOutcome, EncoderRegistry, FrameCapturer, InputPool, JpegEncoder, LatencyTester,
    PipelineConfig, Resolution, SourceFrame, VideoPipeline,
};
use crate::warn_throttled;
use crate::webrtc::{
    ConnectionId, MediaSources, PeerFactory, Streamer, StreamerConfig, ToPlayerMessage,
    ToPlayerType,
};

pub struct StreamingService {
    capturer: Mutex<Option<FrameCapturer>>,
    pipeline: VideoPipeline,
    streamer: Streamer,
    jpeg: Mutex<JpegEncoder>,
    /// Freeze on the next back buffer
    freeze_next: AtomicBool,
    latency: Arc<LatencyTester>,
    events: Arc<EventBus>,
    throttler: LogThrottler,
}

impl StreamingService {
    /// Build the pipeline. Signalling starts with [`StreamingService::start`].
    ///
    /// Must be called inside a tokio runtime. `initial` is the render
    /// target size at startup.
    pub fn new(
        config: &AppConfig,
        registry: &EncoderRegistry,
        factory: Arc<dyn PeerFactory>,
        context: Arc<StreamingContext>,
        initial: Resolution,
    ) -> Result<Self> {
        let policy = config.capture.policy(initial);
        let (resolution, resizable) = match policy {
            CapturePolicy::BackBuffer => (initial.to_even(), true),
            CapturePolicy::Fixed(size) => (size.to_even(), false),
        };

        let sources = Arc::new(MediaSources::new());
        let events = Arc::new(EventBus::new());
        let latency = Arc::new(LatencyTester::new());

        let streamer = Streamer::new(
            StreamerConfig {
                signalling: config.signalling.clone(),
                encoder: config.encoder.clone(),
                webrtc: config.webrtc.clone(),
            },
            registry,
            factory,
            sources.clone(),
            events.clone(),
            latency.clone(),
            context.clone(),
        )?;

        let pool = InputPool::create_for_backend(
            config.capture.backend,
            DeviceHandle::default(),
            resolution,
            resizable,
        )?;
        let mut capturer = FrameCapturer::new(pool.clone(), policy, config.capture.max_fps, context)
            .with_latency_tester(latency.clone());
        let frames = capturer.subscribe();

        let pipeline = VideoPipeline::start(
            registry,
            pool,
            frames,
            sources,
            capturer.adapter_control(),
            Some(latency.clone()),
            PipelineConfig {
                encoder: config.encoder.clone(),
                webrtc: config.webrtc.clone(),
            },
        )?;

        let jpeg = JpegEncoder::with_quality(config.freeze_frame.quality)?;

        info!("Streaming service ready ({:?})", policy);
        Ok(Self {
            capturer: Mutex::new(Some(capturer)),
            pipeline,
            streamer,
            jpeg: Mutex::new(jpeg),
            freeze_next: AtomicBool::new(false),
            latency,
            events,
            throttler: LogThrottler::with_secs(5),
        })
    }

    /// Connect to the signalling server
    pub fn start(&mut self) -> Result<()> {
        self.streamer.start()
    }

    pub fn streamer(&self) -> &Streamer {
        &self.streamer
    }

    /// Hand a rendered frame to the capturer. Render thread only.
    ///
    /// `None` when the frame was not captured because nobody is streaming,
    /// the stream is frozen, or the frame became the freeze frame.
    pub fn on_back_buffer_ready(
        &self,
        token: &ExecToken,
        frame: &SourceFrame,
    ) -> Result<Option<CaptureOutcome>> {
        // Minimized windows render empty back buffers; keep waiting
        if !frame.resolution.is_empty() && self.freeze_next.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.freeze_with(frame) {
                warn_throttled!(self.throttler, "freeze", "Failed to freeze on back buffer: {}", e);
            }
            return Ok(None);
        }
        if !self.streamer.is_streaming() || self.streamer.is_frozen() {
            return Ok(None);
        }

        let mut capturer = self.capturer.lock();
        let capturer = capturer
            .as_mut()
            .ok_or_else(|| AppError::InvalidState("streaming service is shut down".to_string()))?;
        capturer.on_frame_ready(token, frame).map(Some)
    }

    /// Freeze viewers on `frame`, or on the next back buffer when `None`
    pub fn freeze_frame(&self, frame: Option<&SourceFrame>) -> Result<()> {
        match frame {
            Some(frame) => self.freeze_with(frame),
            None => {
                debug!("Freezing on the next back buffer");
                self.freeze_next.store(true, Ordering::Release);
                Ok(())
            }
        }
    }

    fn freeze_with(&self, frame: &SourceFrame) -> Result<()> {
        let jpeg = self.jpeg.lock().encode(frame)?;
        info!("Freezing stream ({} byte JPEG)", jpeg.len());
        self.streamer.send_freeze_frame(jpeg);
        Ok(())
    }

    pub fn unfreeze_frame(&self) {
        self.freeze_next.store(false, Ordering::Release);
        self.streamer.send_unfreeze_frame();
        self.streamer.force_key_frame();
    }

    /// Reply to a viewer's UI interaction, sent to every viewer
    pub fn send_response(&self, descriptor: &str) {
        self.streamer
            .send_player_message(ToPlayerType::Response, descriptor);
    }

    pub fn send_command(&self, descriptor: &str) {
        self.streamer
            .send_player_message(ToPlayerType::Command, descriptor);
    }

    /// Viewer input, UI interactions and connection changes
    pub fn subscribe(&self) -> broadcast::Receiver<StreamerEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.pipeline.stats()
    }

    /// Periodic housekeeping: ship finished latency results
    pub fn tick(&self) {
        if self.latency.stage() != LatencyTestStage::ResultsReady {
            return;
        }
        let Some((requester, results)) = self.latency.end() else {
            return;
        };
        let id = ConnectionId::new(requester);
        if !self
            .streamer
            .send_to(&id, ToPlayerMessage::LatencyTest(results.clone()))
        {
            debug!("Latency test requester {} has left", id);
        }
        self.events.publish(StreamerEvent::LatencyTestCompleted {
            connection_id: id.to_string(),
            results,
        });
    }

    /// Stop signalling and sessions, then the encode pipeline
    pub async fn shutdown(self) {
        let Self {
            capturer,
            mut pipeline,
            mut streamer,
            ..
        } = self;

        if let Err(e) = tokio::task::spawn_blocking(move || streamer.shutdown()).await {
            warn!("Streamer shutdown failed: {}", e);
        }
        // The worker exits once the capturer's queue closes
        drop(capturer);
        pipeline.stop().await;
        info!("Streaming service stopped");
    }
}
