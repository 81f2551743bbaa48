//! Process-wide streaming context
//!
//! Owns the one-time crypto initialisation needed by TLS signalling and DTLS,
//! plus the monotonic clock every timestamp in the pipeline is taken from.
//! Constructed once before any session exists and passed to constructors.
//! The streamer holds its reference until the signalling thread has joined.

use std::sync::Arc;
use std::time::Instant;

use rustls::crypto::{ring, CryptoProvider};
use tracing::{debug, info};

use crate::error::{AppError, Result};

pub struct StreamingContext {
    epoch: Instant,
}

impl StreamingContext {
    /// Initialise process-wide state. Installing the rustls provider is a
    /// no-op when another component already installed one.
    pub fn init() -> Result<Arc<Self>> {
        if CryptoProvider::get_default().is_none() {
            if CryptoProvider::install_default(ring::default_provider()).is_err()
                && CryptoProvider::get_default().is_none()
            {
                return Err(AppError::Crypto(
                    "failed to install rustls ring provider".to_string(),
                ));
            }
            info!("Installed rustls ring crypto provider");
        }

        Ok(Arc::new(Self {
            epoch: Instant::now(),
        }))
    }

    /// Microseconds since the context was created
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Wall-clock milliseconds since the Unix epoch, comparable with a
    /// browser's `Date.now()`
    pub fn unix_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        debug!("Streaming context released");
    }
}
