//! Video encoders
//!
//! - `traits`: the encoder contract, layer configuration and packets
//! - `registry`: registration by codec and instantiation on an input pool
//! - `software`: compiled-in lossless H.264 fallback
//! - `jpeg`: freeze-frame still images

pub mod bitstream;
pub mod jpeg;
pub mod registry;
pub mod software;
pub mod traits;

pub use jpeg::JpegEncoder;
pub use registry::{EncoderConstructor, EncoderRegistry};
pub use software::SoftwareH264Encoder;
pub use traits::{
    EncodeOptions, EncodedPacket, EncoderCodec, EncoderInfo, LayerConfig, MultipassMode,
    RateControlMode, VideoEncoder,
};
