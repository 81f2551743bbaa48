//! Encoder registry - registration and instantiation of video encoders
//!
//! Every compiled-in backend registers a constructor at startup. The
//! pipeline gates on [`EncoderRegistry::has_encoder_for_codec`] before it
//! starts and instantiates through [`EncoderRegistry::create`], which binds
//! the new encoder to an input pool.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use super::software::SoftwareH264Encoder;
use super::traits::{EncoderCodec, EncoderInfo, LayerConfig, VideoEncoder};
use crate::video::input::InputPool;

/// Builds an unconfigured encoder
pub type EncoderConstructor = Arc<dyn Fn() -> Box<dyn VideoEncoder> + Send + Sync>;

/// Registered ids start after this value
const ENCODER_ID_BASE: u32 = 4711;

struct RegisteredEncoder {
    info: EncoderInfo,
    constructor: EncoderConstructor,
}

/// Registry of available encoder backends
pub struct EncoderRegistry {
    encoders: RwLock<Vec<RegisteredEncoder>>,
    next_id: AtomicU32,
}

impl EncoderRegistry {
    /// Process-wide registry with every compiled-in backend registered
    pub fn global() -> &'static Self {
        static INSTANCE: OnceLock<EncoderRegistry> = OnceLock::new();
        INSTANCE.get_or_init(EncoderRegistry::with_default_encoders)
    }

    /// Empty registry
    pub fn new() -> Self {
        Self {
            encoders: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(ENCODER_ID_BASE),
        }
    }

    /// Registry holding the compiled-in backends
    pub fn with_default_encoders() -> Self {
        let registry = Self::new();
        registry.register(
            EncoderInfo::new(EncoderCodec::H264, SoftwareH264Encoder::NAME, false),
            Arc::new(|| Box::new(SoftwareH264Encoder::new()) as Box<dyn VideoEncoder>),
        );
        registry
    }

    /// Register a backend, returns the id assigned to it
    pub fn register(&self, mut info: EncoderInfo, constructor: EncoderConstructor) -> u32 {
        info.id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "Registered encoder {} ({}, {}) id={}",
            info.name,
            info.codec,
            if info.hardware { "hardware" } else { "software" },
            info.id
        );
        let id = info.id;
        self.encoders.write().push(RegisteredEncoder { info, constructor });
        id
    }

    pub fn has_encoder_for_codec(&self, codec: EncoderCodec) -> bool {
        self.encoders.read().iter().any(|e| e.info.codec == codec)
    }

    /// All registered encoders in registration order
    pub fn available(&self) -> Vec<EncoderInfo> {
        self.encoders.read().iter().map(|e| e.info.clone()).collect()
    }

    /// Preferred encoder for a codec: hardware first, then registration order
    pub fn best_encoder(&self, codec: EncoderCodec) -> Option<EncoderInfo> {
        let encoders = self.encoders.read();
        encoders
            .iter()
            .filter(|e| e.info.codec == codec)
            .find(|e| e.info.hardware)
            .or_else(|| encoders.iter().find(|e| e.info.codec == codec))
            .map(|e| e.info.clone())
    }

    /// Instantiate encoder `id` and set it up on `input` with `layer`.
    ///
    /// `None` means the encoder is unavailable for this configuration,
    /// either because the id is unknown or because setup failed.
    pub fn create(
        &self,
        id: u32,
        input: InputPool,
        layer: LayerConfig,
    ) -> Option<Box<dyn VideoEncoder>> {
        let (name, constructor) = {
            let encoders = self.encoders.read();
            let entry = encoders.iter().find(|e| e.info.id == id)?;
            (entry.info.name.clone(), entry.constructor.clone())
        };

        let mut encoder = constructor();
        match encoder.setup(input, layer) {
            Ok(()) => {
                debug!("Created encoder {} (id={})", name, id);
                Some(encoder)
            }
            Err(e) => {
                warn!("Encoder {} setup failed: {}", name, e);
                None
            }
        }
    }
}

impl Default for EncoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, Result};
    use crate::video::encoder::traits::{EncodeOptions, EncodedPacket};
    use crate::video::format::{PixelFormat, Resolution};
    use crate::video::input::{HostBackend, InputFrame};

    /// Encoder whose setup always fails
    struct BrokenEncoder;

    impl VideoEncoder for BrokenEncoder {
        fn name(&self) -> &str {
            "broken"
        }
        fn codec(&self) -> EncoderCodec {
            EncoderCodec::H265
        }
        fn setup(&mut self, _input: InputPool, _layer: LayerConfig) -> Result<()> {
            Err(AppError::Encoder("no device".into()))
        }
        fn add_layer(&mut self, _layer: LayerConfig) -> Result<u32> {
            Ok(0)
        }
        fn layer_count(&self) -> u32 {
            0
        }
        fn layer_config(&self, _layer: u32) -> Option<LayerConfig> {
            None
        }
        fn update_layer_config(&mut self, _layer: u32, _config: LayerConfig) -> Result<()> {
            Ok(())
        }
        fn encode(&mut self, _frame: &InputFrame, _options: EncodeOptions) -> Result<Vec<EncodedPacket>> {
            Ok(vec![])
        }
        fn shutdown(&mut self) {}
    }

    fn pool() -> InputPool {
        InputPool::with_backend(
            Box::new(HostBackend::new(PixelFormat::Bgra8)),
            Resolution::new(32, 32),
            true,
        )
    }

    fn layer() -> LayerConfig {
        LayerConfig {
            width: 32,
            height: 32,
            max_framerate: 30,
            ..Default::default()
        }
    }

    #[test]
    fn test_ids_start_after_base() {
        let registry = EncoderRegistry::new();
        let a = registry.register(
            EncoderInfo::new(EncoderCodec::H264, "a", false),
            Arc::new(|| Box::new(SoftwareH264Encoder::new()) as Box<dyn VideoEncoder>),
        );
        let b = registry.register(
            EncoderInfo::new(EncoderCodec::H264, "b", true),
            Arc::new(|| Box::new(SoftwareH264Encoder::new()) as Box<dyn VideoEncoder>),
        );
        assert_eq!(a, 4712);
        assert_eq!(b, 4713);
        assert_eq!(registry.best_encoder(EncoderCodec::H264).unwrap().name, "b");
    }

    #[test]
    fn test_has_encoder_for_codec() {
        let registry = EncoderRegistry::with_default_encoders();
        assert!(registry.has_encoder_for_codec(EncoderCodec::H264));
        assert!(!registry.has_encoder_for_codec(EncoderCodec::Vp9));
        assert!(!EncoderRegistry::new().has_encoder_for_codec(EncoderCodec::H264));
    }

    #[test]
    fn test_create_sets_up_encoder() {
        let registry = EncoderRegistry::with_default_encoders();
        let info = registry.best_encoder(EncoderCodec::H264).unwrap();
        let encoder = registry.create(info.id, pool(), layer()).unwrap();
        assert_eq!(encoder.name(), SoftwareH264Encoder::NAME);
        assert_eq!(encoder.layer_count(), 1);
    }

    #[test]
    fn test_failed_setup_returns_none() {
        let registry = EncoderRegistry::new();
        let id = registry.register(
            EncoderInfo::new(EncoderCodec::H265, "broken", true),
            Arc::new(|| Box::new(BrokenEncoder) as Box<dyn VideoEncoder>),
        );
        assert!(registry.create(id, pool(), layer()).is_none());
        assert!(registry.create(9999, pool(), layer()).is_none());
    }

    #[test]
    fn test_global_registry_has_h264() {
        assert!(EncoderRegistry::global().has_encoder_for_codec(EncoderCodec::H264));
    }
}
