use thiserror::Error;

use crate::runtime::ThreadRole;
use crate::video::input::BackendKind;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Capture error: {0}")]
    Capture(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("No encoder registered for codec {0}")]
    NoEncoder(String),

    #[error("No encoder input implementation for backend {0}")]
    BackendUnavailable(BackendKind),

    #[error("Crypto initialisation failed: {0}")]
    Crypto(String),

    #[error("Signalling error: {0}")]
    Signalling(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{op} must run on the {expected} thread (called from {actual})")]
    WrongThread {
        op: &'static str,
        expected: ThreadRole,
        actual: String,
    },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl AppError {
    /// Startup failures leave the subsystem disabled; everything else is
    /// scoped to a frame or a single connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::NoEncoder(_)
                | AppError::BackendUnavailable(_)
                | AppError::Crypto(_)
                | AppError::WrongThread { .. }
        )
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
