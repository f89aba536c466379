//! OpenAI provider: Automatic-cache style (spec §4.3). Caching engages
//! automatically once the system prompt clears the configured minimum
//! length; `prompt_cache_key` routes repeat calls to the same cache
//! partition.

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};

/// Thin wrapper over `async_openai`'s chat completions endpoint, matching
/// the teacher's `GroqProvider`/`MistralProvider` construction pattern
/// (`Client::with_config(OpenAIConfig::new().with_api_key(...))`).
pub struct OpenAiProvider {
    client: Client<OpenAIConfig>,
    model_id: String,
    max_tokens: u32,
}

impl OpenAiProvider {
    #[must_use]
    pub fn new(api_key: String, model_id: impl Into<String>, max_tokens: u32) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);
        Self {
            client: Client::with_config(config),
            model_id: model_id.into(),
            max_tokens,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn archetype(&self) -> ProviderArchetype {
        ProviderArchetype::AutomaticCache
    }

    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let mut messages = vec![ChatCompletionRequestSystemMessageArgs::default()
            .content(system_prompt)
            .build()
            .map_err(|e| LlmError::Unknown(e.to_string()))?
            .into()];

        for (role, content) in conversation {
            let message = if role == "assistant" {
                ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content.as_str())
                    .build()
                    .map_err(|e| LlmError::Unknown(e.to_string()))?
                    .into()
            } else {
                ChatCompletionRequestUserMessageArgs::default()
                    .content(content.as_str())
                    .build()
                    .map_err(|e| LlmError::Unknown(e.to_string()))?
                    .into()
            };
            messages.push(message);
        }

        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(user_prompt)
                .build()
                .map_err(|e| LlmError::Unknown(e.to_string()))?
                .into(),
        );

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(self.model_id.as_str())
            .messages(messages)
            .max_tokens(self.max_tokens);

        if let CacheDirective::AutomaticCache { prompt_cache_key } = directive {
            builder.prompt_cache_key(prompt_cache_key.as_str());
        }

        let request = builder.build().map_err(|e| LlmError::Unknown(e.to_string()))?;

        let response = self.client.chat().create(request).await.map_err(|e| classify_error(&e))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::ApiError("empty choices array".into()))?;

        let content = choice.message.content.unwrap_or_default();
        let usage = response.usage;

        Ok(GenerateResponse {
            content,
            tokens_used: usage.as_ref().map_or(0, |u| u64::from(u.total_tokens)),
            cached_tokens: usage
                .as_ref()
                .and_then(|u| u.prompt_tokens_details.as_ref())
                .and_then(|d| d.cached_tokens)
                .map_or(0, u64::from),
            provider_handle: None,
        })
    }
}

fn classify_error(err: &async_openai::error::OpenAIError) -> LlmError {
    let message = err.to_string();
    if message.contains("429") || message.to_lowercase().contains("rate limit") {
        LlmError::RateLimit {
            wait_secs: 10,
            message,
        }
    } else if message.to_lowercase().contains("context") && message.to_lowercase().contains("length") {
        LlmError::ContextOverflow(message)
    } else {
        LlmError::ApiError(message)
    }
}
