//! pixelcast - real-time pixel streaming
//!
//! Captures frames rendered by an application, encodes them and fans the
//! stream out to browser viewers over WebRTC, negotiated through a
//! WebSocket signalling server.

pub mod config;
pub mod error;
pub mod events;
pub mod runtime;
pub mod service;
pub mod utils;
pub mod video;
pub mod webrtc;

pub use error::{AppError, Result};
