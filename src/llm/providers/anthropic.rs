//! Anthropic provider: Ephemeral-cache style (spec §4.3). Caching is
//! requested via a `cache_control` marker on the system content block,
//! optionally with an extended TTL when a call_type drives a session.

use reqwest::Client as HttpClient;
use serde_json::json;

use crate::llm::http_utils::{create_http_client, extract_text_content, send_json_request};
use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};

const ANTHROPIC_API_VERSION: &str = "2023-06-01";
const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";

pub struct AnthropicProvider {
    http_client: HttpClient,
    api_key: String,
    model_id: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    #[must_use]
    pub fn new(api_key: String, model_id: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
            model_id: model_id.into(),
            max_tokens,
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn archetype(&self) -> ProviderArchetype {
        ProviderArchetype::EphemeralCache
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let extended_ttl = matches!(directive, CacheDirective::EphemeralCache { extended_ttl: true });

        let mut system_block = json!({
            "type": "text",
            "text": system_prompt,
            "cache_control": {"type": "ephemeral"},
        });
        if extended_ttl {
            system_block["cache_control"]["ttl"] = json!("1h");
        }

        let mut messages: Vec<serde_json::Value> = conversation
            .iter()
            .map(|(role, content)| json!({"role": role, "content": content}))
            .collect();
        messages.push(json!({"role": "user", "content": user_prompt}));

        let body = json!({
            "model": self.model_id,
            "max_tokens": self.max_tokens,
            "system": [system_block],
            "messages": messages,
        });

        let response = send_json_request(
            &self.http_client,
            ANTHROPIC_MESSAGES_URL,
            &body,
            None,
            &[("x-api-key", self.api_key.as_str()), ("anthropic-version", ANTHROPIC_API_VERSION)],
        )
        .await
        .map_err(reclassify_overflow)?;

        let content = extract_text_content(&response, &["content", "0", "text"])?;
        let usage = response.get("usage");
        let input_tokens = usage.and_then(|u| u.get("input_tokens")).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let output_tokens = usage.and_then(|u| u.get("output_tokens")).and_then(serde_json::Value::as_u64).unwrap_or(0);
        let cached_tokens = usage
            .and_then(|u| u.get("cache_read_input_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        Ok(GenerateResponse {
            content,
            tokens_used: input_tokens + output_tokens,
            cached_tokens,
            provider_handle: None,
        })
    }
}

/// Anthropic signals context overflow as a plain 400 `invalid_request_error`
/// whose message names the token limit; the generic HTTP helper only knows
/// "ApiError", so detect the overflow phrasing here and reclassify it for
/// the Cache Manager's overflow-recovery path.
fn reclassify_overflow(err: LlmError) -> LlmError {
    if let LlmError::ApiError(message) = &err {
        let lower = message.to_lowercase();
        if lower.contains("prompt is too long") || lower.contains("exceeds") && lower.contains("maximum") {
            return LlmError::ContextOverflow(message.clone());
        }
    }
    err
}
