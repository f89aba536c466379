//! Gemini provider: Implicit-cache style (spec §4.3). No explicit handle by
//! default; an explicit cache object is created per (call_type, hash of
//! system prompt) once the prompt clears the minimum size, mirroring
//! `original_source/core/llm/cache/gemini.py`'s `GeminiCacheManager`.

use reqwest::Client as HttpClient;
use serde_json::json;

use crate::llm::http_utils::{create_http_client, extract_text_content, send_json_request};
use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};

pub struct GeminiProvider {
    http_client: HttpClient,
    api_key: String,
    model_id: String,
    max_tokens: u32,
}

impl GeminiProvider {
    #[must_use]
    pub fn new(api_key: String, model_id: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
            model_id: model_id.into(),
            max_tokens,
        }
    }

    fn generate_content_url(&self) -> String {
        format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model_id, self.api_key
        )
    }

    fn create_cache_url(&self) -> String {
        format!("https://generativelanguage.googleapis.com/v1beta/cachedContents?key={}", self.api_key)
    }
}

#[async_trait::async_trait]
impl LlmProvider for GeminiProvider {
    fn archetype(&self) -> ProviderArchetype {
        ProviderArchetype::ImplicitCache
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let mut contents: Vec<serde_json::Value> = conversation
            .iter()
            .map(|(role, content)| {
                let role = if role == "assistant" { "model" } else { "user" };
                json!({"role": role, "parts": [{"text": content}]})
            })
            .collect();
        contents.push(json!({"role": "user", "parts": [{"text": user_prompt}]}));

        if let CacheDirective::ImplicitCache { cache_name: Some(cache_name), .. } = directive {
            let body = json!({
                "contents": contents,
                "cachedContent": cache_name,
                "generationConfig": {"maxOutputTokens": self.max_tokens},
            });
            let response = send_json_request(&self.http_client, &self.generate_content_url(), &body, None, &[]).await?;
            return self.parse_response(&response);
        }

        let body = json!({
            "contents": contents,
            "system_instruction": {"parts": [{"text": system_prompt}]},
            "generationConfig": {"maxOutputTokens": self.max_tokens},
            "safetySettings": [
                {"category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE"},
                {"category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE"},
            ],
        });
        let response = send_json_request(&self.http_client, &self.generate_content_url(), &body, None, &[]).await?;
        self.parse_response(&response)
    }

    async fn create_cache(&self, system_prompt: &str, ttl_seconds: u64) -> Result<Option<String>, LlmError> {
        self.create_explicit_cache(system_prompt, ttl_seconds).await.map(Some)
    }
}

impl GeminiProvider {
    fn parse_response(&self, response: &serde_json::Value) -> Result<GenerateResponse, LlmError> {
        let content = extract_text_content(response, &["candidates", "0", "content", "parts", "0", "text"])?;
        let tokens_used = response
            .get("usageMetadata")
            .and_then(|u| u.get("totalTokenCount"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let cached_tokens = response
            .get("usageMetadata")
            .and_then(|u| u.get("cachedContentTokenCount"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        Ok(GenerateResponse {
            content,
            tokens_used,
            cached_tokens,
            provider_handle: None,
        })
    }

    /// Creates an explicit cache object for `system_prompt`, returning its
    /// `name` handle. Called by the Cache Manager when a system prompt
    /// clears the minimum cacheable size.
    ///
    /// # Errors
    ///
    /// Returns `LlmError` if the API call fails or the response carries no
    /// `name` field.
    pub async fn create_explicit_cache(&self, system_prompt: &str, ttl_seconds: u64) -> Result<String, LlmError> {
        let body = json!({
            "model": format!("models/{}", self.model_id),
            "contents": [{"role": "user", "parts": [{"text": system_prompt}]}],
            "ttl": format!("{ttl_seconds}s"),
        });
        let response = send_json_request(&self.http_client, &self.create_cache_url(), &body, None, &[]).await?;
        response
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| LlmError::ApiError("cache creation returned no name".into()))
    }
}
