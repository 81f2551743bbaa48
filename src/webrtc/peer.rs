//! webrtc-rs peer connections
//!
//! Production [`PeerFactory`]/[`PeerTransport`]. The viewer creates the data
//! channel in its offer; it is picked up in `on_data_channel`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::config::{RtcConfiguration, VideoCodec, AUDIO_CHANNELS, AUDIO_CLOCK_RATE, AUDIO_MIME_OPUS};
use super::signaling::{ConnectionId, ConnectionState, IceCandidate};
use super::transport::{
    MediaKind, MediaTrack, PeerEvent, PeerEventSender, PeerFactory, PeerTransport, TrackSpec,
};
use crate::error::{AppError, Result};

/// Creates webrtc-rs peer connections sharing one API instance
pub struct WebRtcPeerFactory {
    api: API,
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create_peer(
        &self,
        config: &RtcConfiguration,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let rtc_config = RTCConfiguration {
            ice_servers: config.rtc_ice_servers(),
            ..Default::default()
        };

        let pc = self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = WebRtcPeer {
            id: events.id().clone(),
            pc: Arc::new(pc),
            data_channel: Arc::new(RwLock::new(None)),
        };
        peer.setup_event_handlers(events);
        Ok(Arc::new(peer))
    }
}

/// One viewer's webrtc-rs peer connection
pub struct WebRtcPeer {
    id: ConnectionId,
    pc: Arc<RTCPeerConnection>,
    data_channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

impl WebRtcPeer {
    fn setup_event_handlers(&self, events: PeerEventSender) {
        let state_events = events.clone();
        let id = self.id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let new_state = match s {
                    RTCPeerConnectionState::New => Some(ConnectionState::New),
                    RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                    RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                    RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                    RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                    RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                    _ => None,
                };
                if let Some(new_state) = new_state {
                    info!("Peer {} connection state: {}", id, new_state);
                    state_events.emit(PeerEvent::StateChanged(new_state));
                }
                Box::pin(async {})
            }));

        let candidate_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(json) => {
                            debug!("Local ICE candidate: {}", json.candidate);
                            candidate_events.emit(PeerEvent::LocalCandidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                                username_fragment: None,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let data_channel = self.data_channel.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let data_channel = data_channel.clone();
                let events = events.clone();

                Box::pin(async move {
                    info!("Data channel '{}' from peer {}", dc.label(), events.id());

                    let message_events = events.clone();
                    dc.on_message(Box::new(move |msg: DataChannelMessage| {
                        message_events.emit(PeerEvent::DataMessage(msg.data));
                        Box::pin(async {})
                    }));

                    let open_events = events.clone();
                    dc.on_open(Box::new(move || {
                        open_events.emit(PeerEvent::DataChannelOpen);
                        Box::pin(async {})
                    }));

                    let already_open = dc.ready_state() == RTCDataChannelState::Open;
                    *data_channel.write().await = Some(dc);
                    if already_open {
                        events.emit(PeerEvent::DataChannelOpen);
                    }
                })
            }));
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)
            .map_err(|e| AppError::WebRtcError(format!("Invalid SDP offer: {}", e)))?;
        self.pc.set_remote_description(offer).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to create answer: {}", e)))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to set local description: {}", e)))?;
        Ok(sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn sender_count(&self) -> usize {
        self.pc.get_senders().await.len()
    }

    async fn add_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>> {
        let capability = match spec.kind {
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: VideoCodec::H264.mime_type().to_string(),
                clock_rate: VideoCodec::H264.clock_rate(),
                channels: 0,
                sdp_fmtp_line: VideoCodec::H264.sdp_fmtp(),
                rtcp_feedback: vec![],
            },
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: AUDIO_MIME_OPUS.to_string(),
                clock_rate: AUDIO_CLOCK_RATE,
                channels: AUDIO_CHANNELS,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            spec.track_id.clone(),
            spec.stream_id.clone(),
        ));
        self.pc
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                AppError::WebRtcError(format!("Failed to add {} to peer {}: {}", spec.track_id, self.id, e))
            })?;

        // webrtc-rs has no content hint; the encoder settings carry the preference
        debug!(
            "Added {:?} track {} to peer {} (hint {:?})",
            spec.kind, spec.track_id, self.id, spec.content_hint
        );

        Ok(Arc::new(SampleTrack {
            kind: spec.kind,
            track,
        }))
    }

    async fn send_data(&self, data: Bytes) -> Result<()> {
        let dc = self.data_channel.read().await;
        let channel = dc
            .as_ref()
            .ok_or_else(|| AppError::ChannelClosed(format!("peer {} has no data channel", self.id)))?;
        channel
            .send(&data)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Data channel send failed: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(dc) = self.data_channel.write().await.take() {
            let _ = dc.close().await;
        }
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Sample track (built-in payloader for H.264 and Opus)
struct SampleTrack {
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
}

#[async_trait]
impl MediaTrack for SampleTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("write_sample failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webrtc::transport::ContentHint;
    use tokio::sync::mpsc;

    fn events(id: &str) -> (PeerEventSender, mpsc::UnboundedReceiver<(ConnectionId, PeerEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerEventSender::new(ConnectionId::from(id), tx), rx)
    }

    #[tokio::test]
    async fn test_add_tracks_counts_senders() {
        let factory = WebRtcPeerFactory::new().unwrap();
        let (tx, _rx) = events("1");
        let peer = factory
            .create_peer(&RtcConfiguration::default(), tx)
            .await
            .unwrap();
        assert_eq!(peer.sender_count().await, 0);

        for (kind, id) in [(MediaKind::Audio, "audio_label_1"), (MediaKind::Video, "video_label_1")] {
            let track = peer
                .add_track(TrackSpec {
                    kind,
                    track_id: id.to_string(),
                    stream_id: "stream_id".to_string(),
                    content_hint: ContentHint::Detailed,
                })
                .await
                .unwrap();
            assert_eq!(track.kind(), kind);
        }
        assert_eq!(peer.sender_count().await, 2);
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_without_data_channel_fails() {
        let factory = WebRtcPeerFactory::new().unwrap();
        let (tx, _rx) = events("2");
        let peer = factory
            .create_peer(&RtcConfiguration::default(), tx)
            .await
            .unwrap();
        let err = peer.send_data(Bytes::from_static(&[4])).await.unwrap_err();
        assert!(matches!(err, AppError::ChannelClosed(_)));
        assert!(peer.set_remote_offer("not sdp".into()).await.is_err());
        peer.close().await.unwrap();
    }
}
