//! WebRTC fan-out to remote viewers
//!
//! ```text
//! signalling server <--JSON/ws--> signaling_client
//!                                      |
//!                                   Streamer  (session table, freeze cache)
//!                                      |
//!               +----------------------+----------------------+
//!               v                      v                      v
//!            Session                Session                Session
//!     (peer, data channel,     (one per viewer)
//!      audio/video tracks)
//!               ^
//!               | VideoSource / AudioSource broadcast
//!         encode pipeline
//! ```
//!
//! - `transport`: the peer connection seam, `peer` implements it on webrtc-rs
//! - `protocol`: binary data channel messages
//! - `signaling`: JSON signalling messages

pub mod config;
pub mod peer;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod signaling_client;
pub mod source;
pub mod streamer;
pub mod transport;

pub use config::{IceServerConfig, RtcConfiguration, VideoCodec};
pub use peer::WebRtcPeerFactory;
pub use protocol::{FromPlayerMessage, ToPlayerMessage, ToPlayerType};
pub use session::{Session, SessionFault, SessionState};
pub use signaling::{ClientMessage, ConnectionId, ConnectionState, IceCandidate, ServerMessage};
pub use signaling_client::{SignallingConnection, SignallingSender};
pub use source::{AudioPacket, AudioSource, MediaSources, VideoSource};
pub use streamer::{Streamer, StreamerConfig};
pub use transport::{PeerEvent, PeerEventSender, PeerFactory, PeerTransport};
