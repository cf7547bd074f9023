// src/pipeline/mod.rs

pub mod frame_context;
pub mod metrics;
pub mod orchestrator;
pub mod session;

pub use frame_context::FrameContext;
pub use orchestrator::FramePipeline;
pub use session::SessionState;
