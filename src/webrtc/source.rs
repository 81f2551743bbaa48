//! Shared media sources
//!
//! One video and one audio source per streamer, created on the first session
//! and shared by every session's tracks. The encode pipeline publishes into
//! the video source; each track subscribes to it.

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::video::encoder::EncodedPacket;

/// Packets buffered per track before a slow track lags
const VIDEO_CHANNEL_CAPACITY: usize = 16;
const AUDIO_CHANNEL_CAPACITY: usize = 64;

/// Encoded video fan-out plus the feedback path back to the encoder
pub struct VideoSource {
    packets: broadcast::Sender<EncodedPacket>,
    key_frame_requested: AtomicBool,
    /// Requested frame rate, 0 for none
    max_fps: AtomicU32,
    /// Requested bitrate bounds in bps, 0 for none
    min_bitrate: AtomicI32,
    max_bitrate: AtomicI32,
    avg_qp: Arc<watch::Sender<Option<u32>>>,
}

impl VideoSource {
    pub fn new() -> Self {
        let (avg_qp, _) = watch::channel(None);
        Self::with_qp_channel(Arc::new(avg_qp))
    }

    /// Report QP into a channel that outlives the source
    fn with_qp_channel(avg_qp: Arc<watch::Sender<Option<u32>>>) -> Self {
        let (packets, _) = broadcast::channel(VIDEO_CHANNEL_CAPACITY);
        Self {
            packets,
            key_frame_requested: AtomicBool::new(false),
            max_fps: AtomicU32::new(0),
            min_bitrate: AtomicI32::new(0),
            max_bitrate: AtomicI32::new(0),
            avg_qp,
        }
    }

    /// Publish a packet to every track. Packets without subscribers are
    /// dropped.
    pub fn publish(&self, packet: EncodedPacket) {
        let _ = self.packets.send(packet);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EncodedPacket> {
        self.packets.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.packets.receiver_count()
    }

    /// Ask the encoder for a key frame on the next frame
    pub fn request_key_frame(&self) {
        if !self.key_frame_requested.swap(true, Ordering::AcqRel) {
            debug!("Key frame requested");
        }
    }

    /// Consume a pending key frame request
    pub fn take_key_frame_request(&self) -> bool {
        self.key_frame_requested.swap(false, Ordering::AcqRel)
    }

    pub fn request_max_fps(&self, fps: u32) {
        self.max_fps.store(fps, Ordering::Relaxed);
    }

    pub fn requested_max_fps(&self) -> Option<u32> {
        match self.max_fps.load(Ordering::Relaxed) {
            0 => None,
            fps => Some(fps),
        }
    }

    /// Bitrate bounds requested by the quality controller, in bps
    pub fn request_bitrate(&self, min_bps: i32, max_bps: i32) {
        self.min_bitrate.store(min_bps.max(0), Ordering::Relaxed);
        self.max_bitrate.store(max_bps.max(0), Ordering::Relaxed);
    }

    pub fn requested_bitrate(&self) -> Option<(i32, i32)> {
        let max = self.max_bitrate.load(Ordering::Relaxed);
        if max == 0 {
            return None;
        }
        Some((self.min_bitrate.load(Ordering::Relaxed), max))
    }

    /// Record the encoder's average QP for the last frame
    pub fn report_qp(&self, qp: u32) {
        self.avg_qp.send_if_modified(|current| {
            if *current == Some(qp) {
                false
            } else {
                *current = Some(qp);
                true
            }
        });
    }

    pub fn watch_qp(&self) -> watch::Receiver<Option<u32>> {
        self.avg_qp.subscribe()
    }
}

impl Default for VideoSource {
    fn default() -> Self {
        Self::new()
    }
}

/// One Opus packet
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub data: Bytes,
    pub duration: Duration,
}

/// Application audio fan-out
pub struct AudioSource {
    packets: broadcast::Sender<AudioPacket>,
}

impl AudioSource {
    pub fn new() -> Self {
        let (packets, _) = broadcast::channel(AUDIO_CHANNEL_CAPACITY);
        Self { packets }
    }

    pub fn publish(&self, packet: AudioPacket) {
        let _ = self.packets.send(packet);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AudioPacket> {
        self.packets.subscribe()
    }
}

impl Default for AudioSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily created audio/video sources, one of each per streamer lifetime
pub struct MediaSources {
    video: OnceLock<Arc<VideoSource>>,
    audio: OnceLock<Arc<AudioSource>>,
    /// Average QP of the video source, watchable before it exists
    avg_qp: Arc<watch::Sender<Option<u32>>>,
}

impl MediaSources {
    pub fn new() -> Self {
        let (avg_qp, _) = watch::channel(None);
        Self {
            video: OnceLock::new(),
            audio: OnceLock::new(),
            avg_qp: Arc::new(avg_qp),
        }
    }

    /// Video source, created on first use
    pub fn video(&self) -> Arc<VideoSource> {
        self.video
            .get_or_init(|| {
                info!("Creating shared video source");
                Arc::new(VideoSource::with_qp_channel(self.avg_qp.clone()))
            })
            .clone()
    }

    /// Encoder QP reports. Does not create the video source.
    pub fn watch_qp(&self) -> watch::Receiver<Option<u32>> {
        self.avg_qp.subscribe()
    }

    /// Audio source, created on first use
    pub fn audio(&self) -> Arc<AudioSource> {
        self.audio
            .get_or_init(|| {
                info!("Creating shared audio source");
                Arc::new(AudioSource::new())
            })
            .clone()
    }

    /// Video source if a session has created it
    pub fn video_if_created(&self) -> Option<Arc<VideoSource>> {
        self.video.get().cloned()
    }

    pub fn audio_if_created(&self) -> Option<Arc<AudioSource>> {
        self.audio.get().cloned()
    }
}

impl Default for MediaSources {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(frame_id: u32) -> EncodedPacket {
        EncodedPacket {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65]),
            layer: 0,
            frame_id,
            timestamp_us: 0,
            key_frame: frame_id == 1,
            qp: 26,
        }
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let source = VideoSource::new();
        let mut a = source.subscribe();
        let mut b = source.subscribe();
        for id in 1..=3 {
            source.publish(packet(id));
        }
        for rx in [&mut a, &mut b] {
            for id in 1..=3 {
                assert_eq!(rx.recv().await.unwrap().frame_id, id);
            }
        }
    }

    #[test]
    fn test_subscriber_woken_by_publish() {
        let source = VideoSource::new();
        let mut rx = source.subscribe();
        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        source.publish(packet(9));
        assert!(recv.is_woken());
        let packet = tokio_test::assert_ready_ok!(recv.poll());
        assert_eq!(packet.frame_id, 9);
    }

    #[test]
    fn test_key_frame_request_consumed_once() {
        let source = VideoSource::new();
        assert!(!source.take_key_frame_request());
        source.request_key_frame();
        source.request_key_frame();
        assert!(source.take_key_frame_request());
        assert!(!source.take_key_frame_request());
    }

    #[test]
    fn test_requests() {
        let source = VideoSource::new();
        assert_eq!(source.requested_max_fps(), None);
        assert_eq!(source.requested_bitrate(), None);
        source.request_max_fps(30);
        source.request_bitrate(1_000_000, 5_000_000);
        assert_eq!(source.requested_max_fps(), Some(30));
        assert_eq!(source.requested_bitrate(), Some((1_000_000, 5_000_000)));
    }

    #[test]
    fn test_qp_watch() {
        let source = VideoSource::new();
        let rx = source.watch_qp();
        source.report_qp(30);
        assert_eq!(*rx.borrow(), Some(30));
    }

    #[test]
    fn test_sources_created_once() {
        let sources = MediaSources::new();
        assert!(sources.video_if_created().is_none());
        let a = sources.video();
        let b = sources.video();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(sources.video_if_created().is_some());
        assert!(sources.audio_if_created().is_none());
        let _ = sources.audio();
        assert!(sources.audio_if_created().is_some());
    }

    #[test]
    fn test_qp_watch_does_not_create_video() {
        let sources = MediaSources::new();
        let rx = sources.watch_qp();
        assert!(sources.video_if_created().is_none());

        sources.video().report_qp(31);
        assert_eq!(*rx.borrow(), Some(31));
    }
}
