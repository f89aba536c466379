//! Loop detection service coordinating the tool-call, content, and LLM
//! detectors behind one per-session handle.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::config::LoopDetectionConfig;
use super::content_detector::ContentLoopDetector;
use super::llm_detector::LlmLoopDetector;
use super::tool_detector::ToolCallDetector;
use super::types::{LoopDetectedEvent, LoopDetectionError, LoopType};
use crate::llm::LlmClient;

/// Central coordinator for loop detection, one instance per agent session.
pub struct LoopDetectionService {
    config: Arc<LoopDetectionConfig>,
    session_id: String,
    loop_detected: bool,
    disabled_for_session: bool,
    tool_detector: ToolCallDetector,
    content_detector: ContentLoopDetector,
    llm_detector: LlmLoopDetector,
}

impl LoopDetectionService {
    #[must_use]
    pub fn new(client: Arc<LlmClient>, config: Arc<LoopDetectionConfig>) -> Self {
        Self {
            tool_detector: ToolCallDetector::new(config.tool_call_threshold),
            content_detector: ContentLoopDetector::new(config.content_chunk_size, config.content_loop_threshold, config.max_history_length),
            llm_detector: LlmLoopDetector::new(client, &config),
            config,
            session_id: String::new(),
            loop_detected: false,
            disabled_for_session: false,
        }
    }

    /// Reset state for a new session.
    pub fn reset(&mut self, session_id: String) {
        self.session_id = session_id;
        self.tool_detector.reset();
        self.content_detector.reset();
        self.llm_detector.reset(&self.config);
        self.loop_detected = false;
        self.disabled_for_session = false;
    }

    /// Disable loop detection for the current session.
    pub fn disable_for_session(&mut self) {
        self.disabled_for_session = true;
    }

    /// Reset content tracking state without affecting the other detectors.
    pub fn reset_content_tracking(&mut self) {
        self.content_detector.reset_tracking();
    }

    /// Checks a just-routed action for repetition (spec §4.6's selection).
    pub fn check_action(&mut self, action_name: &str, parameters: &str) -> bool {
        if !self.is_enabled() {
            debug!(session_id = %self.session_id, "loop_service: detection disabled");
            return false;
        }
        if self.loop_detected {
            return true;
        }

        self.content_detector.reset_tracking();
        let detected = self.tool_detector.check(action_name, parameters);

        if detected {
            warn!(session_id = %self.session_id, action_name, loop_type = "ToolCallLoop", "loop_service: LOOP DETECTED via tool_detector");
        }

        self.loop_detected = detected;
        detected
    }

    /// Checks reasoning content for repetition loops.
    pub fn check_content(&mut self, content: &str) -> bool {
        if !self.is_enabled() {
            return false;
        }
        if self.loop_detected {
            return true;
        }

        let detected = self.content_detector.check(content);

        if detected {
            warn!(session_id = %self.session_id, loop_type = "ContentLoop", "loop_service: LOOP DETECTED via content_detector");
        }

        self.loop_detected = detected;
        detected
    }

    /// Runs the LLM loop detector if one is due for `iteration`, against
    /// `history` (rendered recent reasoning/action text).
    ///
    /// # Errors
    ///
    /// Returns `LoopDetectionError` if the LLM check itself fails; callers
    /// should treat this as non-fatal and continue the loop.
    pub async fn check_llm_periodic(&mut self, history: &str, iteration: usize) -> Result<bool, LoopDetectionError> {
        if !self.is_enabled() {
            return Ok(false);
        }
        if self.loop_detected {
            return Ok(true);
        }
        if !self.llm_detector.should_check(iteration) {
            return Ok(false);
        }

        debug!(session_id = %self.session_id, iteration, "loop_service: running LLM periodic check");
        let detected = self.llm_detector.check(history, iteration).await?;

        if detected {
            warn!(session_id = %self.session_id, iteration, loop_type = "CognitiveLoop", "loop_service: LOOP DETECTED via llm_detector");
        }

        self.loop_detected = detected;
        Ok(detected)
    }

    /// Creates a loop detection event for logging and UI.
    #[must_use]
    pub fn create_event(&self, loop_type: LoopType, iteration: usize) -> LoopDetectedEvent {
        LoopDetectedEvent { loop_type, session_id: self.session_id.clone(), iteration, timestamp: Utc::now() }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && !self.disabled_for_session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};
    use async_trait::async_trait;

    struct StubProvider;

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn archetype(&self) -> ProviderArchetype {
            ProviderArchetype::AutomaticCache
        }

        async fn generate(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _conversation: &[(String, String)],
            _directive: &CacheDirective,
        ) -> Result<GenerateResponse, LlmError> {
            Ok(GenerateResponse {
                content: r#"{"is_stuck":false,"confidence":0.1,"reasoning":"ok"}"#.to_string(),
                tokens_used: 5,
                cached_tokens: 0,
                provider_handle: None,
            })
        }
    }

    fn service() -> LoopDetectionService {
        let client = Arc::new(LlmClient::new(Arc::new(StubProvider)));
        LoopDetectionService::new(client, Arc::new(LoopDetectionConfig::default()))
    }

    #[test]
    fn disables_for_session() {
        let mut service = service();
        service.disable_for_session();
        assert!(!service.check_action("deploy", "{}"));
    }

    #[test]
    fn tool_call_detection_triggers() {
        let mut service = service();
        service.reset("session".to_string());
        for _ in 0..4 {
            assert!(!service.check_action("deploy", "{}"));
        }
        assert!(service.check_action("deploy", "{}"));
    }

    #[test]
    fn loop_detected_latches_until_reset() {
        let mut service = service();
        service.reset("session".to_string());
        for _ in 0..5 {
            service.check_action("deploy", "{}");
        }
        assert!(service.check_action("rollback", "{}"));
        service.reset("session".to_string());
        assert!(!service.check_action("rollback", "{}"));
    }
}
