//! Loop detection for the Agent Loop (spec §4.7): catches the agent
//! repeating the same action, repeating the same reasoning content, or
//! (via a periodic, adaptive-interval sidecar LLM call) getting cognitively
//! stuck in a way neither of the cheap checks would catch alone.

pub mod config;
pub mod content_detector;
pub mod llm_detector;
pub mod service;
pub mod tool_detector;
pub mod types;

pub use config::LoopDetectionConfig;
pub use service::LoopDetectionService;
pub use types::{LoopDetectedEvent, LoopDetectionError, LoopType};
