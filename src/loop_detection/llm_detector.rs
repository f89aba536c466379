//! LLM-based cognitive loop detector: periodically asks a cheap model
//! whether the recent reasoning/action history looks stuck, widening its
//! check interval as confidence in "not stuck" grows.

use std::sync::Arc;

use serde::Deserialize;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::config::LoopDetectionConfig;
use super::types::LoopDetectionError;
use crate::llm::LlmClient;
use crate::narrator::truncate_chars;
use crate::utils::{extract_last_json, strip_code_fence};

const MIN_INTERVAL: usize = 3;
const MAX_INTERVAL: usize = 15;
const LLM_TIMEOUT_SECS: u64 = 30;

const SYSTEM_PROMPT: &str = "You are an AI diagnostic agent. Analyze the recent reasoning and action \
history for unproductive loops (repeated actions, cognitive loops, or alternating patterns). \
Differentiate legitimate incremental progress from looping. Respond with JSON only: \
{\"is_stuck\": bool, \"confidence\": 0.0-1.0, \"reasoning\": \"short explanation\"}.";

#[derive(Debug, Deserialize, Default)]
struct LlmLoopResponse {
    #[serde(default)]
    is_stuck: bool,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

/// LLM-based loop detector with adaptive check interval.
pub struct LlmLoopDetector {
    client: Arc<LlmClient>,
    check_after_turns: usize,
    check_interval: usize,
    last_check_turn: usize,
    confidence_threshold: f64,
    history_chars: usize,
}

impl LlmLoopDetector {
    #[must_use]
    pub fn new(client: Arc<LlmClient>, config: &LoopDetectionConfig) -> Self {
        Self {
            client,
            check_after_turns: config.llm_check_after_turns,
            check_interval: config.llm_check_interval.max(MIN_INTERVAL),
            last_check_turn: 0,
            confidence_threshold: config.llm_confidence_threshold,
            history_chars: config.llm_history_chars,
        }
    }

    /// Reset the internal counters and intervals for a new session.
    pub fn reset(&mut self, config: &LoopDetectionConfig) {
        self.check_after_turns = config.llm_check_after_turns;
        self.check_interval = config.llm_check_interval.max(MIN_INTERVAL);
        self.last_check_turn = 0;
        self.confidence_threshold = config.llm_confidence_threshold;
        self.history_chars = config.llm_history_chars;
    }

    /// Whether a check is due for this iteration.
    #[must_use]
    pub fn should_check(&self, iteration: usize) -> bool {
        let turn = iteration.saturating_add(1);
        if turn < self.check_after_turns {
            return false;
        }
        if self.last_check_turn == 0 {
            return true;
        }
        turn.saturating_sub(self.last_check_turn) >= self.check_interval
    }

    /// Runs the LLM check against `history`, a rendered tail of recent
    /// reasoning/action text. No-ops (returns `Ok(false)`) if a check isn't
    /// due yet or `history` is empty.
    ///
    /// # Errors
    ///
    /// Returns `LoopDetectionError::LlmFailure` on timeout, provider error,
    /// or a response with no parseable JSON object.
    pub async fn check(&mut self, history: &str, iteration: usize) -> Result<bool, LoopDetectionError> {
        if !self.should_check(iteration) || history.trim().is_empty() {
            return Ok(false);
        }

        let turn = iteration.saturating_add(1);
        self.last_check_turn = turn;

        let truncated = truncate_chars(history, self.history_chars);
        debug!(iteration, interval = self.check_interval, history_chars = truncated.len(), "LLM loop check triggered");

        let call = self.client.generate(SYSTEM_PROMPT, &truncated);
        let response = timeout(Duration::from_secs(LLM_TIMEOUT_SECS), call)
            .await
            .map_err(|err| LoopDetectionError::LlmFailure(format!("LLM timeout: {err}")))?
            .map_err(|err| LoopDetectionError::LlmFailure(err.to_string()))?;

        let parsed = Self::parse_response(&response.content)?;
        debug!(confidence = parsed.confidence, is_stuck = parsed.is_stuck, reasoning = %parsed.reasoning, "LLM loop check response");
        self.update_interval(parsed.confidence);

        Ok(parsed.is_stuck && parsed.confidence >= self.confidence_threshold)
    }

    fn update_interval(&mut self, confidence: f64) {
        let bounded = confidence.clamp(0.0, 1.0);
        let interval = MIN_INTERVAL as f64 + (MAX_INTERVAL - MIN_INTERVAL) as f64 * (1.0 - bounded);
        self.check_interval = (interval.round() as usize).clamp(MIN_INTERVAL, MAX_INTERVAL);
    }

    fn parse_response(raw: &str) -> Result<LlmLoopResponse, LoopDetectionError> {
        let cleaned = strip_code_fence(raw);
        extract_last_json(&cleaned)
            .ok()
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| {
                warn!(response = %raw, "LLM loop check returned non-JSON response");
                LoopDetectionError::LlmFailure("LLM response missing JSON object".to_string())
            })
    }
}
