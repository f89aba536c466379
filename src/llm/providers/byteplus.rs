//! BytePlus provider: Responses-API style (spec §4.3). Prefix cache and
//! session cache both chain through `previous_response_id`; prefix calls
//! disable caching on repeat use (the prefix stays static), session calls
//! keep it enabled so context grows. Ported from
//! `original_source/core/llm/cache/byteplus.py`'s `BytePlusCacheManager`.

use reqwest::Client as HttpClient;
use serde_json::json;

use crate::llm::http_utils::{create_http_client, send_json_request};
use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};

pub struct BytePlusProvider {
    http_client: HttpClient,
    api_key: String,
    api_base: String,
    model_id: String,
    max_tokens: u32,
}

impl BytePlusProvider {
    #[must_use]
    pub fn new(api_key: String, api_base: impl Into<String>, model_id: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            http_client: create_http_client(),
            api_key,
            api_base: api_base.into(),
            model_id: model_id.into(),
            max_tokens,
        }
    }

    fn responses_url(&self) -> String {
        format!("{}/responses", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl LlmProvider for BytePlusProvider {
    fn archetype(&self) -> ProviderArchetype {
        ProviderArchetype::ResponsesApi
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let (previous_response_id, caching_enabled, caching_prefix) = match directive {
            CacheDirective::ResponsesApi {
                previous_response_id,
                caching_enabled,
                caching_prefix,
            } => (previous_response_id.clone(), *caching_enabled, *caching_prefix),
            _ => (None, false, false),
        };

        let input_messages = if previous_response_id.is_some() {
            vec![json!({"role": "user", "content": user_prompt})]
        } else {
            vec![
                json!({"role": "system", "content": system_prompt}),
                json!({"role": "user", "content": user_prompt}),
            ]
        };

        let mut body = json!({
            "model": self.model_id,
            "input": input_messages,
        });

        if !caching_prefix {
            body["max_output_tokens"] = json!(self.max_tokens);
        }
        if let Some(id) = previous_response_id {
            body["previous_response_id"] = json!(id);
        }

        let mut caching = json!({"type": if caching_enabled { "enabled" } else { "disabled" }});
        if caching_prefix {
            caching["prefix"] = json!(true);
        }
        body["caching"] = caching;

        let auth = format!("Bearer {}", self.api_key);
        let response = send_json_request(&self.http_client, &self.responses_url(), &body, Some(&auth), &[])
            .await
            .map_err(reclassify_overflow)?;

        let content = extract_output_text(&response)?;
        let response_id = response.get("id").and_then(serde_json::Value::as_str).map(ToString::to_string);
        let tokens_used = response
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        let cached_tokens = response
            .get("usage")
            .and_then(|u| u.get("cached_tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);

        Ok(GenerateResponse {
            content,
            tokens_used,
            cached_tokens,
            provider_handle: response_id,
        })
    }
}

fn extract_output_text(response: &serde_json::Value) -> Result<String, LlmError> {
    response
        .get("output")
        .and_then(|o| o.as_array())
        .and_then(|items| items.iter().find_map(|item| item.get("content")))
        .and_then(|content| content.as_array())
        .and_then(|parts| parts.iter().find_map(|p| p.get("text")))
        .and_then(serde_json::Value::as_str)
        .map(ToString::to_string)
        .ok_or_else(|| LlmError::ApiError("no output text in BytePlus response".into()))
}

/// BytePlus signals overflow as a 400 with `"exceeds the maximum length"` in
/// the error message (`BytePlusContextOverflowError` in the Python source).
fn reclassify_overflow(err: LlmError) -> LlmError {
    if let LlmError::ApiError(message) = &err {
        if message.contains("exceeds the maximum length") {
            return LlmError::ContextOverflow(message.clone());
        }
    }
    err
}
