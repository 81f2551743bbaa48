//! Data channel protocol
//!
//! Binary messages exchanged with the viewer over the data channel. The first
//! byte is the message type; strings are UTF-16LE.
//!
//! Outgoing (`ToPlayer`):
//!
//! | tag | message                 | payload                  |
//! |-----|-------------------------|--------------------------|
//! | 0   | QualityControlOwnership | u8 bool                  |
//! | 1   | Response                | utf16                    |
//! | 2   | Command                 | utf16                    |
//! | 3   | FreezeFrame             | i32 LE size, jpeg        |
//! | 4   | UnfreezeFrame           |                          |
//! | 5   | VideoEncoderAvgQP       | utf16 decimal            |
//! | 6   | LatencyTest             | utf16 json               |
//! | 7   | InitialSettings         | utf16 json               |
//!
//! Incoming (`FromPlayer`): see [`FromPlayerMessage`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{AppError, Result};

/// Outgoing message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ToPlayerType {
    QualityControlOwnership = 0,
    Response = 1,
    Command = 2,
    FreezeFrame = 3,
    UnfreezeFrame = 4,
    VideoEncoderAvgQp = 5,
    LatencyTest = 6,
    InitialSettings = 7,
}

/// Messages sent to a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToPlayerMessage {
    QualityControlOwnership(bool),
    Response(String),
    Command(String),
    FreezeFrame(Bytes),
    UnfreezeFrame,
    VideoEncoderAvgQp(u32),
    LatencyTest(String),
    InitialSettings(String),
}

impl ToPlayerMessage {
    /// Build a string-carrying message from a type tag and descriptor
    pub fn with_descriptor(kind: ToPlayerType, descriptor: &str) -> Self {
        match kind {
            ToPlayerType::QualityControlOwnership => {
                Self::QualityControlOwnership(descriptor == "true" || descriptor == "1")
            }
            ToPlayerType::Response => Self::Response(descriptor.to_string()),
            ToPlayerType::Command => Self::Command(descriptor.to_string()),
            ToPlayerType::FreezeFrame => Self::FreezeFrame(Bytes::copy_from_slice(descriptor.as_bytes())),
            ToPlayerType::UnfreezeFrame => Self::UnfreezeFrame,
            ToPlayerType::VideoEncoderAvgQp => {
                Self::VideoEncoderAvgQp(descriptor.trim().parse().unwrap_or_default())
            }
            ToPlayerType::LatencyTest => Self::LatencyTest(descriptor.to_string()),
            ToPlayerType::InitialSettings => Self::InitialSettings(descriptor.to_string()),
        }
    }

    pub fn kind(&self) -> ToPlayerType {
        match self {
            Self::QualityControlOwnership(_) => ToPlayerType::QualityControlOwnership,
            Self::Response(_) => ToPlayerType::Response,
            Self::Command(_) => ToPlayerType::Command,
            Self::FreezeFrame(_) => ToPlayerType::FreezeFrame,
            Self::UnfreezeFrame => ToPlayerType::UnfreezeFrame,
            Self::VideoEncoderAvgQp(_) => ToPlayerType::VideoEncoderAvgQp,
            Self::LatencyTest(_) => ToPlayerType::LatencyTest,
            Self::InitialSettings(_) => ToPlayerType::InitialSettings,
        }
    }

    /// Serialize for the data channel
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u8(self.kind() as u8);
        match self {
            Self::QualityControlOwnership(owner) => buf.put_u8(*owner as u8),
            Self::Response(s) | Self::Command(s) | Self::LatencyTest(s) | Self::InitialSettings(s) => {
                put_utf16(&mut buf, s)
            }
            Self::FreezeFrame(jpeg) => {
                let size = i32::try_from(jpeg.len()).map_err(|_| {
                    AppError::Protocol(format!("freeze frame too large: {} bytes", jpeg.len()))
                })?;
                buf.reserve(4 + jpeg.len());
                buf.put_i32_le(size);
                buf.put_slice(jpeg);
            }
            Self::UnfreezeFrame => {}
            Self::VideoEncoderAvgQp(qp) => put_utf16(&mut buf, &qp.to_string()),
        }
        Ok(buf.freeze())
    }
}

/// Incoming message type tags
pub mod from_player {
    pub const IFRAME_REQUEST: u8 = 0;
    pub const REQUEST_QUALITY_CONTROL: u8 = 1;
    pub const MAX_FPS_REQUEST: u8 = 2;
    pub const AVERAGE_BITRATE_REQUEST: u8 = 3;
    pub const START_STREAMING: u8 = 4;
    pub const STOP_STREAMING: u8 = 5;
    pub const LATENCY_TEST: u8 = 6;
    pub const REQUEST_INITIAL_SETTINGS: u8 = 7;
    pub const UI_INTERACTION: u8 = 50;
    pub const COMMAND: u8 = 51;
}

/// Messages received from a viewer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromPlayerMessage {
    IFrameRequest,
    RequestQualityControl,
    MaxFpsRequest(u8),
    /// kbps
    AverageBitrateRequest { min: u16, max: u16 },
    StartStreaming,
    StopStreaming,
    LatencyTest(String),
    RequestInitialSettings,
    UiInteraction(String),
    Command(String),
    /// Keyboard, mouse, touch and gamepad events, passed on untouched
    Input { message_type: u8, payload: Bytes },
}

impl FromPlayerMessage {
    pub fn decode(data: &[u8]) -> Result<Self> {
        use from_player::*;

        let mut buf = data;
        if !buf.has_remaining() {
            return Err(AppError::Protocol("empty data channel message".to_string()));
        }
        let tag = buf.get_u8();

        let message = match tag {
            IFRAME_REQUEST => Self::IFrameRequest,
            REQUEST_QUALITY_CONTROL => Self::RequestQualityControl,
            MAX_FPS_REQUEST => {
                ensure_len(buf, 1, "MaxFpsRequest")?;
                Self::MaxFpsRequest(buf.get_u8())
            }
            AVERAGE_BITRATE_REQUEST => {
                ensure_len(buf, 4, "AverageBitrateRequest")?;
                let min = buf.get_u16_le();
                let max = buf.get_u16_le();
                Self::AverageBitrateRequest { min, max }
            }
            START_STREAMING => Self::StartStreaming,
            STOP_STREAMING => Self::StopStreaming,
            LATENCY_TEST => Self::LatencyTest(get_utf16(buf)?),
            REQUEST_INITIAL_SETTINGS => Self::RequestInitialSettings,
            UI_INTERACTION => Self::UiInteraction(get_prefixed_utf16(buf, "UIInteraction")?),
            COMMAND => Self::Command(get_prefixed_utf16(buf, "Command")?),
            other => Self::Input {
                message_type: other,
                payload: Bytes::copy_from_slice(buf),
            },
        };
        Ok(message)
    }
}

fn ensure_len(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(AppError::Protocol(format!(
            "{} truncated: {} of {} bytes",
            what,
            buf.len(),
            needed
        )));
    }
    Ok(())
}

fn put_utf16(buf: &mut BytesMut, s: &str) {
    for unit in s.encode_utf16() {
        buf.put_u16_le(unit);
    }
}

/// Decode the rest of `buf` as UTF-16LE
fn get_utf16(buf: &[u8]) -> Result<String> {
    if buf.len() % 2 != 0 {
        return Err(AppError::Protocol(format!(
            "odd UTF-16 payload length {}",
            buf.len()
        )));
    }
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units).map_err(|e| AppError::Protocol(format!("invalid UTF-16: {}", e)))
}

/// `[u16 length in code units][utf16]`
fn get_prefixed_utf16(mut buf: &[u8], what: &str) -> Result<String> {
    ensure_len(buf, 2, what)?;
    let len = buf.get_u16_le() as usize * 2;
    ensure_len(buf, len, what)?;
    get_utf16(&buf[..len])
}
