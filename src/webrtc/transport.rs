//! Peer connection seam
//!
//! Sessions talk to their peer connection through [`PeerTransport`] and are
//! created through a [`PeerFactory`]. The production implementation is in
//! [`super::peer`]; tests use the recording fakes in `testing`.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::config::RtcConfiguration;
use super::signaling::{ConnectionId, ConnectionState, IceCandidate};
use crate::error::Result;

/// Something that happened on a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate to trickle to the viewer
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    /// The viewer's data channel is open and can carry messages
    DataChannelOpen,
    DataMessage(Bytes),
}

/// Delivers peer events, tagged with their connection, to the streamer
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<(ConnectionId, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<(ConnectionId, PeerEvent)>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Events after the streamer is gone are dropped
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.id.clone(), event));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Video track content hint, derived from the degradation preference
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentHint {
    #[default]
    None,
    /// Motion matters more than detail
    Fluid,
    /// Detail matters more than motion
    Detailed,
}

/// Track to add to a peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackSpec {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
    pub content_hint: ContentHint,
}

/// Local media track on one peer connection
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Write one encoded access unit (video) or packet (audio)
    async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()>;
}

/// One viewer's peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn set_remote_offer(&self, sdp: String) -> Result<()>;

    /// Create the answer and set it as local description
    async fn create_answer(&self) -> Result<String>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Number of RTP senders already attached
    async fn sender_count(&self) -> usize;

    async fn add_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>>;

    /// Send on the viewer's data channel
    async fn send_data(&self, data: Bytes) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(
        &self,
        config: &RtcConfiguration,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::AppError;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Records what a session did to its peer connection
    #[derive(Default)]
    pub struct FakeTransport {
        pub remote_offer: Mutex<Option<String>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub tracks: Mutex<Vec<TrackSpec>>,
        pub sent: Mutex<Vec<Bytes>>,
        pub samples: Arc<AtomicUsize>,
        pub closed: AtomicBool,
        /// Make `send_data` fail
        pub fail_sends: AtomicBool,
        /// Make `add_track` fail
        pub fail_tracks: AtomicBool,
    }

    impl FakeTransport {
        pub fn sent_types(&self) -> Vec<u8> {
            self.sent.lock().iter().map(|b| b[0]).collect()
        }
    }

    pub struct FakeTrack {
        kind: MediaKind,
        samples: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MediaTrack for FakeTrack {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        async fn write_sample(&self, _data: Bytes, _duration: Duration) -> Result<()> {
            self.samples.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl PeerTransport for FakeTransport {
        async fn set_remote_offer(&self, sdp: String) -> Result<()> {
            if !sdp.starts_with("v=0") {
                return Err(AppError::WebRtcError("Invalid SDP offer".into()));
            }
            *self.remote_offer.lock() = Some(sdp);
            Ok(())
        }

        async fn create_answer(&self) -> Result<String> {
            if self.remote_offer.lock().is_none() {
                return Err(AppError::WebRtcError("no remote description".into()));
            }
            Ok("v=0 answer".to_string())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
            self.candidates.lock().push(candidate);
            Ok(())
        }

        async fn sender_count(&self) -> usize {
            self.tracks.lock().len()
        }

        async fn add_track(&self, spec: TrackSpec) -> Result<Arc<dyn MediaTrack>> {
            if self.fail_tracks.load(Ordering::SeqCst) {
                return Err(AppError::WebRtcError("add track failed".into()));
            }
            let kind = spec.kind;
            self.tracks.lock().push(spec);
            Ok(Arc::new(FakeTrack {
                kind,
                samples: self.samples.clone(),
            }))
        }

        async fn send_data(&self, data: Bytes) -> Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(AppError::WebRtcError("data channel closed".into()));
            }
            self.sent.lock().push(data);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Hands out [`FakeTransport`]s and remembers them by connection
    #[derive(Default)]
    pub struct FakeFactory {
        pub peers: Mutex<HashMap<ConnectionId, Arc<FakeTransport>>>,
        pub events: Mutex<HashMap<ConnectionId, PeerEventSender>>,
        pub created: AtomicUsize,
    }

    impl FakeFactory {
        pub fn peer(&self, id: &str) -> Arc<FakeTransport> {
            self.peers.lock()[&ConnectionId::from(id)].clone()
        }

        pub fn events(&self, id: &str) -> PeerEventSender {
            self.events.lock()[&ConnectionId::from(id)].clone()
        }
    }

    #[async_trait]
    impl PeerFactory for FakeFactory {
        async fn create_peer(
            &self,
            _config: &RtcConfiguration,
            events: PeerEventSender,
        ) -> Result<Arc<dyn PeerTransport>> {
            let transport = Arc::new(FakeTransport::default());
            self.created.fetch_add(1, Ordering::SeqCst);
            self.peers.lock().insert(events.id().clone(), transport.clone());
            self.events.lock().insert(events.id().clone(), events);
            Ok(transport)
        }
    }
}
