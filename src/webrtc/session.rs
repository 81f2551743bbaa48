//! Per-viewer session
//!
//! A session owns one peer connection, buffers remote ICE candidates until
//! the offer has been applied, queues data channel messages until the
//! viewer's channel opens, and runs one forwarder per media track.
//!
//! ```text
//! Created --on_offer--> Negotiating --connected--> Connected
//!    \________________________|_______________________/
//!                             v
//!                           Closed   (close(), from any state)
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{ToPlayerMessage, ToPlayerType};
use super::signaling::{ConnectionId, IceCandidate};
use super::source::{AudioSource, MediaSources, VideoSource};
use super::transport::{ContentHint, MediaKind, MediaTrack, PeerTransport, TrackSpec};
use crate::config::DegradationPreference;
use crate::error::{AppError, Result};

/// Media stream id shared by the audio and video tracks
pub const STREAM_ID: &str = "stream_id";

/// Sample duration used until two timestamps are known
const DEFAULT_FRAME_DURATION: Duration = Duration::from_micros(16_667);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Negotiating,
    Connected,
    Closed,
}

/// A session's data channel failed; the owner should drop it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFault {
    pub id: ConnectionId,
    pub reason: String,
}

impl From<DegradationPreference> for ContentHint {
    fn from(preference: DegradationPreference) -> Self {
        match preference {
            DegradationPreference::MaintainFramerate => ContentHint::Fluid,
            DegradationPreference::MaintainResolution => ContentHint::Detailed,
            DegradationPreference::Balanced => ContentHint::None,
        }
    }
}

pub struct Session {
    id: ConnectionId,
    /// Creation order within the owning streamer
    seq: u64,
    transport: Arc<dyn PeerTransport>,
    state: watch::Sender<SessionState>,
    quality_controller: AtomicBool,
    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    outbox: mpsc::UnboundedSender<ToPlayerMessage>,
    media_enabled: watch::Sender<bool>,
    data_channel_open: watch::Sender<bool>,
    video: Mutex<Option<Arc<VideoSource>>>,
    /// Key frames requested on behalf of this viewer
    key_frame_requests: AtomicU64,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session and start its data channel writer on the current
    /// runtime. Send failures are reported on `faults`.
    pub fn new(
        id: ConnectionId,
        seq: u64,
        transport: Arc<dyn PeerTransport>,
        quality_controller: bool,
        faults: mpsc::UnboundedSender<SessionFault>,
    ) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Created);
        let (media_enabled, _) = watch::channel(true);
        let (data_channel_open, open_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        tokio::spawn(run_writer(
            id.clone(),
            transport.clone(),
            outbox_rx,
            open_rx,
            faults,
            cancel.clone(),
        ));

        Arc::new(Self {
            id,
            seq,
            transport,
            state,
            quality_controller: AtomicBool::new(quality_controller),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            outbox,
            media_enabled,
            data_channel_open,
            video: Mutex::new(None),
            key_frame_requests: AtomicU64::new(0),
            cancel,
        })
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Apply the viewer's offer and return the local answer
    pub async fn on_offer(&self, sdp: String) -> Result<String> {
        let moved = self.state.send_if_modified(|state| match state {
            SessionState::Created | SessionState::Negotiating => {
                *state = SessionState::Negotiating;
                true
            }
            _ => false,
        });
        if !moved {
            return Err(AppError::InvalidState(format!(
                "session {} cannot take an offer in state {:?}",
                self.id,
                self.state()
            )));
        }

        self.transport.set_remote_offer(sdp).await?;

        let pending = {
            let mut pending = self.pending_candidates.lock();
            self.remote_description_set.store(true, Ordering::Release);
            std::mem::take(&mut *pending)
        };
        if !pending.is_empty() {
            debug!("Applying {} buffered candidates for {}", pending.len(), self.id);
        }
        for candidate in pending {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                warn!("Buffered ICE candidate rejected for {}: {}", self.id, e);
            }
        }

        self.transport.create_answer().await
    }

    /// Apply a remote candidate, or buffer it until the offer is in
    pub async fn on_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.is_closed() {
            debug!("Ignoring ICE candidate for closed session {}", self.id);
            return Ok(());
        }
        {
            let mut pending = self.pending_candidates.lock();
            if !self.remote_description_set.load(Ordering::Acquire) {
                trace!("Buffering ICE candidate for {}", self.id);
                pending.push(candidate);
                return Ok(());
            }
        }
        self.transport.add_ice_candidate(candidate).await
    }

    /// Attach audio and video tracks bound to the shared sources.
    ///
    /// Returns `false` when the peer connection already has senders.
    pub async fn add_streams(
        &self,
        sources: &MediaSources,
        preference: DegradationPreference,
    ) -> Result<bool> {
        if self.transport.sender_count().await > 0 {
            debug!("Session {} already has media tracks", self.id);
            return Ok(false);
        }

        let audio_track = self
            .transport
            .add_track(TrackSpec {
                kind: MediaKind::Audio,
                track_id: format!("audio_label_{}", self.id),
                stream_id: STREAM_ID.to_string(),
                content_hint: ContentHint::None,
            })
            .await?;
        let video_track = self
            .transport
            .add_track(TrackSpec {
                kind: MediaKind::Video,
                track_id: format!("video_label_{}", self.id),
                stream_id: STREAM_ID.to_string(),
                content_hint: preference.into(),
            })
            .await?;

        let video = sources.video();
        *self.video.lock() = Some(video.clone());

        tokio::spawn(forward_video(
            self.id.clone(),
            video_track,
            video,
            self.state.subscribe(),
            self.media_enabled.subscribe(),
            self.cancel.clone(),
        ));
        tokio::spawn(forward_audio(
            audio_track,
            sources.audio(),
            self.state.subscribe(),
            self.media_enabled.subscribe(),
            self.cancel.clone(),
        ));

        info!("Added media tracks to session {}", self.id);
        Ok(true)
    }

    /// Peer connection reached `connected`; media starts flowing
    pub fn set_connected(&self) -> bool {
        let changed = self.state.send_if_modified(|state| match state {
            SessionState::Created | SessionState::Negotiating => {
                *state = SessionState::Connected;
                true
            }
            _ => false,
        });
        if changed {
            info!("Session {} connected", self.id);
        }
        changed
    }

    /// The viewer's data channel is open; queued messages are flushed
    pub fn on_data_channel_open(&self) {
        self.data_channel_open.send_replace(true);
    }

    /// `StartStreaming` / `StopStreaming` from the viewer
    pub fn set_media_enabled(&self, enabled: bool) {
        if self.media_enabled.send_replace(enabled) != enabled {
            info!(
                "Session {} {} media",
                self.id,
                if enabled { "resumed" } else { "paused" }
            );
        }
    }

    pub fn media_enabled(&self) -> bool {
        *self.media_enabled.borrow()
    }

    pub fn is_quality_controller(&self) -> bool {
        self.quality_controller.load(Ordering::Acquire)
    }

    /// Returns whether the flag changed
    pub fn set_quality_controller(&self, owner: bool) -> bool {
        self.quality_controller.swap(owner, Ordering::AcqRel) != owner
    }

    /// Queue a message for the data channel. Messages queued after the
    /// session closed are dropped.
    pub fn send(&self, message: ToPlayerMessage) {
        if self.outbox.send(message).is_err() {
            debug!("Session {} is closed, dropping message", self.id);
        }
    }

    pub fn send_message(&self, kind: ToPlayerType, descriptor: &str) {
        self.send(ToPlayerMessage::with_descriptor(kind, descriptor));
    }

    pub fn send_freeze_frame(&self, jpeg: Bytes) {
        self.send(ToPlayerMessage::FreezeFrame(jpeg));
    }

    pub fn send_unfreeze_frame(&self) {
        self.send(ToPlayerMessage::UnfreezeFrame);
    }

    /// Ask the encoder feeding this session for a key frame
    pub fn send_key_frame(&self) {
        if let Some(video) = self.video.lock().as_ref() {
            self.key_frame_requests.fetch_add(1, Ordering::Relaxed);
            video.request_key_frame();
        }
    }

    pub fn key_frame_requests(&self) -> u64 {
        self.key_frame_requests.load(Ordering::Relaxed)
    }

    pub fn send_quality_control_ownership(&self) {
        self.send(ToPlayerMessage::QualityControlOwnership(
            self.is_quality_controller(),
        ));
    }

    pub fn send_video_encoder_qp(&self, qp: u32) {
        self.send(ToPlayerMessage::VideoEncoderAvgQp(qp));
    }

    /// Tear down. Safe to call more than once.
    pub async fn close(&self) {
        if self.state.send_replace(SessionState::Closed) == SessionState::Closed {
            return;
        }
        self.cancel.cancel();
        self.pending_candidates.lock().clear();
        self.video.lock().take();
        if let Err(e) = self.transport.close().await {
            warn!("Failed to close peer connection for {}: {}", self.id, e);
        }
        info!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_writer(
    id: ConnectionId,
    transport: Arc<dyn PeerTransport>,
    mut outbox: mpsc::UnboundedReceiver<ToPlayerMessage>,
    mut open: watch::Receiver<bool>,
    faults: mpsc::UnboundedSender<SessionFault>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        opened = open.wait_for(|open| *open) => {
            if opened.is_err() {
                return;
            }
        }
    }
    debug!("Data channel writer for {} running", id);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = outbox.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let kind = message.kind();
        let result = match message.encode() {
            Ok(data) => transport.send_data(data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Failed to send {:?} to {}: {}", kind, id, e);
            let _ = faults.send(SessionFault {
                id: id.clone(),
                reason: format!("failed to send {:?}", kind),
            });
            break;
        }
    }
}

/// Wait until the session is connected. `false` once it closed instead.
async fn wait_connected(
    state: &mut watch::Receiver<SessionState>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        reached = state.wait_for(|s| matches!(s, SessionState::Connected | SessionState::Closed)) => {
            reached.map(|s| *s == SessionState::Connected).unwrap_or(false)
        }
    }
}

async fn forward_video(
    id: ConnectionId,
    track: Arc<dyn MediaTrack>,
    source: Arc<VideoSource>,
    mut state: watch::Receiver<SessionState>,
    mut enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    if !wait_connected(&mut state, &cancel).await {
        return;
    }

    let mut packets = source.subscribe();
    source.request_key_frame();
    let mut waiting_for_key = true;
    let mut last_timestamp: Option<u64> = None;

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            changed = enabled.changed() => {
                if changed.is_err() {
                    break;
                }
                if *enabled.borrow_and_update() {
                    source.request_key_frame();
                    waiting_for_key = true;
                }
                continue;
            }
            packet = packets.recv() => match packet {
                Ok(packet) => packet,
                Err(RecvError::Lagged(n)) => {
                    debug!("Video track for {} lagged by {} packets", id, n);
                    source.request_key_frame();
                    waiting_for_key = true;
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        if !*enabled.borrow() {
            continue;
        }
        if waiting_for_key {
            if !packet.key_frame {
                continue;
            }
            waiting_for_key = false;
        }

        let duration = match last_timestamp {
            Some(previous) if packet.timestamp_us > previous => {
                Duration::from_micros(packet.timestamp_us - previous)
            }
            _ => DEFAULT_FRAME_DURATION,
        };
        last_timestamp = Some(packet.timestamp_us);

        if let Err(e) = track.write_sample(packet.data, duration).await {
            debug!("Video write for {} failed: {}", id, e);
        }
    }
    debug!("Video forwarder for {} stopped", id);
}

async fn forward_audio(
    track: Arc<dyn MediaTrack>,
    source: Arc<AudioSource>,
    mut state: watch::Receiver<SessionState>,
    enabled: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    if !wait_connected(&mut state, &cancel).await {
        return;
    }

    let mut packets = source.subscribe();
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            packet = packets.recv() => match packet {
                Ok(packet) => packet,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };
        if *enabled.borrow() {
            let _ = track.write_sample(packet.data, packet.duration).await;
        }
    }
}
