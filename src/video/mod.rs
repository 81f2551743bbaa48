//! Video capture and encoding
//!
//! Frames flow from the renderer through the capturer into pooled encoder
//! input buffers, then through the encode pipeline into the shared video
//! source.

pub mod adapt;
pub mod capture;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod input;
pub mod latency;
pub mod pattern;
pub mod pipeline;

pub use adapt::{AdapterControl, FrameAdapter};
pub use capture::{CaptureOutcome, CaptureState, CapturedFrame, FrameCapturer};
pub use encoder::{EncoderRegistry, JpegEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::SourceFrame;
pub use input::{InputFrame, InputPool};
pub use latency::LatencyTester;
pub use pattern::TestPattern;
pub use pipeline::{PipelineConfig, VideoPipeline};
