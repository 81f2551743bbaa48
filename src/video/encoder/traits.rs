//! Encoder traits and common types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::EncoderSettings;
use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::input::{InputFrame, InputPool};

/// Codecs an encoder can be registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EncoderCodec {
    H264,
    H265,
    Vp8,
    Vp9,
}

impl fmt::Display for EncoderCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderCodec::H264 => write!(f, "H.264"),
            EncoderCodec::H265 => write!(f, "H.265/HEVC"),
            EncoderCodec::Vp8 => write!(f, "VP8"),
            EncoderCodec::Vp9 => write!(f, "VP9"),
        }
    }
}

/// Rate control strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RateControlMode {
    #[serde(rename = "ConstQP")]
    ConstQp,
    #[serde(rename = "VBR")]
    Vbr,
    #[default]
    #[serde(rename = "CBR")]
    Cbr,
}

/// Encoder multipass mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MultipassMode {
    Disabled,
    Quarter,
    #[default]
    Full,
}

/// Per-layer encoder configuration
///
/// Compared by value: any difference means the layer must be reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayerConfig {
    pub width: u32,
    pub height: u32,
    pub max_framerate: u32,
    /// bps
    pub max_bitrate: i32,
    /// bps
    pub target_bitrate: i32,
    /// -1 for no limit
    pub qp_max: i32,
    /// -1 for no limit
    pub qp_min: i32,
    pub rate_control: RateControlMode,
    pub multipass: MultipassMode,
    pub fill_data: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            max_framerate: 0,
            max_bitrate: 0,
            target_bitrate: 0,
            qp_max: -1,
            qp_min: -1,
            rate_control: RateControlMode::Cbr,
            multipass: MultipassMode::Full,
            fill_data: false,
        }
    }
}

impl LayerConfig {
    /// Build a layer from the operator's encoder settings
    pub fn from_settings(
        settings: &EncoderSettings,
        resolution: Resolution,
        max_framerate: u32,
        max_bitrate: i32,
    ) -> Self {
        let max_bitrate = if settings.rate_control == RateControlMode::Vbr {
            settings.max_bitrate_vbr
        } else {
            max_bitrate
        };
        let target_bitrate = if settings.target_bitrate > 0 {
            settings.target_bitrate
        } else {
            max_bitrate / 2
        };
        Self {
            width: resolution.width,
            height: resolution.height,
            max_framerate,
            max_bitrate,
            target_bitrate,
            qp_max: settings.max_qp,
            qp_min: settings.min_qp,
            rate_control: settings.rate_control,
            multipass: settings.multipass,
            fill_data: settings.enable_filler_data,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

/// One encoded access unit for one layer
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// Annex B bitstream
    pub data: Bytes,
    pub layer: u32,
    /// Id of the input frame this was produced from
    pub frame_id: u32,
    /// Capture timestamp of the input frame
    pub timestamp_us: u64,
    pub key_frame: bool,
    /// Average QP of the frame
    pub qp: u32,
}

impl EncodedPacket {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-call encode options
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions {
    pub force_key_frame: bool,
}

/// Registration record for an encoder backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInfo {
    /// Assigned by the registry
    pub id: u32,
    pub codec: EncoderCodec,
    pub name: String,
    pub hardware: bool,
}

impl EncoderInfo {
    pub fn new(codec: EncoderCodec, name: impl Into<String>, hardware: bool) -> Self {
        Self {
            id: 0,
            codec,
            name: name.into(),
            hardware,
        }
    }
}

/// Video encoder bound to an input pool
///
/// The vendor call sequence (open session, submit frame, retrieve
/// bitstream) lives behind `setup`, `encode` and `shutdown`.
/// Not `Sync`: one instance is driven by one encode worker.
pub trait VideoEncoder: Send {
    fn name(&self) -> &str;

    fn codec(&self) -> EncoderCodec;

    /// Bind to `input` and configure layer 0
    fn setup(&mut self, input: InputPool, layer: LayerConfig) -> Result<()>;

    /// Add a simulcast layer, returns its index
    fn add_layer(&mut self, layer: LayerConfig) -> Result<u32>;

    fn layer_count(&self) -> u32;

    fn layer_config(&self, layer: u32) -> Option<LayerConfig>;

    /// Replace a layer's configuration. Takes effect on the next frame.
    fn update_layer_config(&mut self, layer: u32, config: LayerConfig) -> Result<()>;

    /// Encode one frame on every layer, in layer order
    fn encode(&mut self, frame: &InputFrame, options: EncodeOptions) -> Result<Vec<EncodedPacket>>;

    fn shutdown(&mut self);
}
