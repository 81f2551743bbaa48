//! Process-wide streaming state and thread-affinity tokens

pub mod affinity;
pub mod context;

pub use affinity::{ExecToken, ThreadRole};
pub use context::StreamingContext;
