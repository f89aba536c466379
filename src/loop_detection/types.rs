//! Types for loop detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Types of detected loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopType {
    /// Repeated identical tool calls.
    ToolCallLoop,
    /// Repeated identical content chunks.
    ContentLoop,
    /// LLM-detected cognitive loop.
    CognitiveLoop,
}

/// Loop detection event metadata, logged to the event stream when a loop
/// trips so the budget-enforcing loop has a reason to cite.
#[derive(Debug, Clone)]
pub struct LoopDetectedEvent {
    pub loop_type: LoopType,
    pub session_id: String,
    pub iteration: usize,
    pub timestamp: DateTime<Utc>,
}

/// Errors produced by loop detection components.
#[derive(Debug, Error)]
pub enum LoopDetectionError {
    #[error("LLM loop check failed: {0}")]
    LlmFailure(String),
}
