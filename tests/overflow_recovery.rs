//! Scenario §8 "Overflow recovery": a mock gateway rejects a session call
//! with a context-overflow error; the Cache Manager must recreate the
//! session from just the current user prompt and succeed on the retry,
//! leaving exactly one session handle behind (not a stacked pair).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use agent_kernel::cache::{CacheConfig, CacheManager};
use agent_kernel::llm::{CacheDirective, GenerateResponse, LlmClient, LlmError, LlmProvider, ProviderArchetype};
use async_trait::async_trait;

struct OverflowOnceProvider {
    calls: AtomicU32,
}

#[async_trait]
impl LlmProvider for OverflowOnceProvider {
    fn archetype(&self) -> ProviderArchetype {
        ProviderArchetype::ResponsesApi
    }

    async fn generate(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        _directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            return Err(LlmError::ContextOverflow(
                "Input length 300000 exceeds the maximum length 229376".to_string(),
            ));
        }
        Ok(GenerateResponse {
            content: format!("{user_prompt} (history {})", conversation.len()),
            tokens_used: 50,
            cached_tokens: 0,
            provider_handle: Some(format!("handle-{call}")),
        })
    }
}

#[tokio::test]
async fn overflowing_session_recovers_on_retry_with_a_single_new_handle() {
    let provider = Arc::new(OverflowOnceProvider { calls: AtomicU32::new(0) });
    let manager = CacheManager::new(LlmClient::new(provider), "byteplus", CacheConfig::default());
    manager.create_session_cache("task-overflow", "reasoning", &"x".repeat(600));

    let response = manager
        .generate_with_session("task-overflow", "reasoning", "do the thing")
        .await
        .expect("recovery should succeed");

    assert!(response.content.starts_with("do the thing"));
    assert_eq!(response.provider_handle.as_deref(), Some("handle-1"));

    // The recreated session carries only the recovered turn (user+assistant)
    // forward: a second call sees exactly that one turn's history, proving
    // the registry holds one session entry for this (task, call_type), not
    // a stacked pair from the failed attempt plus the recovered one.
    let second = manager
        .generate_with_session("task-overflow", "reasoning", "next step")
        .await
        .expect("second call should succeed");
    assert!(second.content.contains("history 2"));
}
