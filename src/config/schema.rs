use serde::{Deserialize, Serialize};
use tracing::error;

use crate::video::encoder::{EncoderCodec, MultipassMode, RateControlMode};
use crate::video::format::Resolution;
use crate::video::input::BackendKind;
use crate::webrtc::config::IceServerConfig;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signalling server connection
    pub signalling: SignallingConfig,
    /// Frame capture settings
    pub capture: CaptureConfig,
    /// Video encoder settings
    pub encoder: EncoderSettings,
    /// WebRTC transport settings
    pub webrtc: WebRtcSettings,
    /// Freeze frame settings
    pub freeze_frame: FreezeFrameConfig,
}

/// Signalling server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignallingConfig {
    /// WebSocket URL of the signalling server (ws:// or wss://)
    pub url: String,
    /// Identifier announced to the server in reply to `identify`
    pub streamer_id: String,
    /// Delay before reconnecting after the connection drops
    pub reconnect_interval_ms: u64,
    /// Keep-alive ping interval, 0 disables
    pub keepalive_interval_secs: u64,
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8888".to_string(),
            streamer_id: "DefaultStreamer".to_string(),
            reconnect_interval_ms: 2000,
            keepalive_interval_secs: 30,
        }
    }
}

/// Capture size policy as resolved at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Track the back buffer size 1:1
    BackBuffer,
    /// Scale every frame to a fixed resolution
    Fixed(Resolution),
}

/// Frame capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture at the back buffer size instead of `capture_size`
    pub use_back_buffer_size: bool,
    /// Fixed capture size in `WIDTHxHEIGHT` form
    pub capture_size: String,
    /// Upper bound on the accepted frame rate
    pub max_fps: u32,
    /// Encoder input buffer backend
    pub backend: BackendKind,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            use_back_buffer_size: true,
            capture_size: "1920x1080".to_string(),
            max_fps: 60,
            backend: BackendKind::Host,
        }
    }
}

impl CaptureConfig {
    /// Resolve the capture policy. An unparsable `capture_size` is logged
    /// and replaced by `current`.
    pub fn policy(&self, current: Resolution) -> CapturePolicy {
        if self.use_back_buffer_size {
            return CapturePolicy::BackBuffer;
        }
        match parse_capture_size(&self.capture_size) {
            Some(size) => CapturePolicy::Fixed(size),
            None => {
                error!(
                    "CaptureSize is not in the correct format (WIDTHxHEIGHT): '{}', using {}",
                    self.capture_size, current
                );
                CapturePolicy::Fixed(current)
            }
        }
    }

    /// Switch to a fixed capture size given as `WIDTHxHEIGHT`, or back to
    /// the back buffer size for `"backbuffer"`. Invalid values leave the
    /// config unchanged.
    pub fn override_capture_size(&mut self, value: &str) -> Option<CapturePolicy> {
        if value.trim().eq_ignore_ascii_case("backbuffer") {
            self.use_back_buffer_size = true;
            return Some(CapturePolicy::BackBuffer);
        }
        let size = parse_capture_size(value)?;
        self.use_back_buffer_size = false;
        self.capture_size = size.to_string();
        Some(CapturePolicy::Fixed(size))
    }
}

/// Parse `"1280x720"` into a resolution. Zero dimensions are rejected.
pub fn parse_capture_size(value: &str) -> Option<Resolution> {
    let (w, h) = value.trim().split_once(['x', 'X'])?;
    let width: u32 = w.trim().parse().ok()?;
    let height: u32 = h.trim().parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(Resolution::new(width, height))
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    pub codec: EncoderCodec,
    /// Fixed target bitrate in bps, -1 lets the transport decide
    pub target_bitrate: i32,
    /// Max bitrate in VBR mode (bps)
    pub max_bitrate_vbr: i32,
    /// Lower QP bound, -1 for none
    pub min_qp: i32,
    /// Upper QP bound, -1 for none
    pub max_qp: i32,
    pub rate_control: RateControlMode,
    pub multipass: MultipassMode,
    /// Pad the bitstream to hold a constant bitrate
    pub enable_filler_data: bool,
    /// Frames between forced key frames
    pub keyframe_interval: u32,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: EncoderCodec::H264,
            target_bitrate: -1,
            max_bitrate_vbr: 20_000_000,
            min_qp: -1,
            max_qp: -1,
            rate_control: RateControlMode::Cbr,
            multipass: MultipassMode::Full,
            enable_filler_data: false,
            keyframe_interval: 300,
        }
    }
}

/// What the transport sacrifices first under bandwidth pressure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DegradationPreference {
    Balanced,
    MaintainFramerate,
    #[default]
    MaintainResolution,
}

/// WebRTC transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcSettings {
    pub degradation_preference: DegradationPreference,
    pub max_fps: u32,
    /// bps
    pub min_bitrate: u32,
    /// bps
    pub max_bitrate: u32,
    pub low_qp_threshold: i32,
    pub high_qp_threshold: i32,
    /// ICE servers used until the signalling server sends its own
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for WebRtcSettings {
    fn default() -> Self {
        Self {
            degradation_preference: DegradationPreference::default(),
            max_fps: 60,
            min_bitrate: 100_000,
            max_bitrate: 20_000_000,
            low_qp_threshold: 25,
            high_qp_threshold: 37,
            ice_servers: vec![],
        }
    }
}

/// Freeze frame configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeFrameConfig {
    /// JPEG quality 1-100
    pub quality: u32,
}

impl Default for FreezeFrameConfig {
    fn default() -> Self {
        Self { quality: 100 }
    }
}
