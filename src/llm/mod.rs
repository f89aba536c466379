//! LLM Gateway: a single façade over pluggable provider strategies.
//!
//! Mirrors the teacher's `LlmClient` retry-with-backoff design
//! (`crates/oxide-agent-core/src/llm/mod.rs`) but trims the chat/vision/
//! tool-calling surface the kernel doesn't use — Action selection and
//! reasoning are both plain `generate(system, user) -> text` calls that the
//! caller parses as JSON, per spec §4.3/§4.6.

pub mod http_utils;
pub mod providers;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

/// Errors a provider or the gateway's retry loop can surface.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider API error: {0}")]
    ApiError(String),
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("response parse error: {0}")]
    JsonError(String),
    #[error("missing configuration: {0}")]
    MissingConfig(String),
    #[error("rate limited, retry after {wait_secs}s: {message}")]
    RateLimit { wait_secs: u64, message: String },
    /// The provider rejected a session request because accumulated context
    /// exceeds its limit. Drives the Cache Manager's overflow recovery path.
    #[error("context length exceeded: {0}")]
    ContextOverflow(String),
    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Which provider-shaped caching archetype a provider implements, per
/// spec §4.3's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderArchetype {
    /// BytePlus: `previous_response_id` chaining via the Responses API.
    ResponsesApi,
    /// Gemini: explicit cache object created per (call_type, prompt hash).
    ImplicitCache,
    /// Anthropic: `cache_control` marker on the system content block.
    EphemeralCache,
    /// OpenAI: automatic caching keyed by `prompt_cache_key`.
    AutomaticCache,
}

/// Caching instructions the Cache Manager computes for a single call and
/// hands to the provider; each provider only inspects the variant matching
/// its own archetype.
#[derive(Debug, Clone, Default)]
pub enum CacheDirective {
    #[default]
    None,
    ResponsesApi {
        previous_response_id: Option<String>,
        caching_enabled: bool,
        caching_prefix: bool,
    },
    ImplicitCache {
        cache_name: Option<String>,
        call_type: String,
    },
    EphemeralCache {
        extended_ttl: bool,
    },
    AutomaticCache {
        prompt_cache_key: String,
    },
}

/// Result of a single generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateResponse {
    pub content: String,
    pub tokens_used: u64,
    pub cached_tokens: u64,
    /// Provider-assigned response/cache handle to chain the next call
    /// (Responses-API `id`, Gemini cache `name`). `None` for providers that
    /// carry no server-side handle.
    pub provider_handle: Option<String>,
}

/// A pluggable provider strategy. Implementors own their HTTP client and
/// API-key configuration; the gateway only ever calls `generate`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Which caching archetype this provider implements.
    fn archetype(&self) -> ProviderArchetype;

    /// Runs one generation call, applying whatever caching `directive`
    /// requests. `conversation` carries prior turns for providers with no
    /// server-side session handle (ephemeral/automatic-cache style); it is
    /// ignored by providers that chain via `provider_handle` instead.
    async fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError>;

    /// Creates a provider-side explicit cache object for `system_prompt` and
    /// returns its handle, for archetypes that need one ([`ImplicitCache`]).
    /// The default no-op fits every other archetype.
    ///
    /// [`ImplicitCache`]: ProviderArchetype::ImplicitCache
    ///
    /// # Errors
    ///
    /// Returns `LlmError` if the provider attempted creation and it failed.
    async fn create_cache(&self, _system_prompt: &str, _ttl_seconds: u64) -> Result<Option<String>, LlmError> {
        Ok(None)
    }
}

const MAX_RETRIES: u32 = 5;

/// Exponential backoff for transient errors, matching the teacher's
/// `chat_with_tools` retry loop: 1s→16s general backoff, 10s→80s (or the
/// provider's own wait hint) for rate limits.
fn retry_delay(attempt: u32, err: &LlmError) -> Duration {
    match err {
        LlmError::RateLimit { wait_secs, .. } => {
            let backoff = 10u64.saturating_mul(1 << attempt.min(3));
            Duration::from_secs((*wait_secs + 1).max(backoff))
        }
        LlmError::NetworkError(_) | LlmError::ApiError(_) => {
            Duration::from_secs(1u64.saturating_mul(1 << attempt.min(4)))
        }
        _ => Duration::from_secs(1),
    }
}

fn is_retryable(err: &LlmError) -> bool {
    matches!(err, LlmError::RateLimit { .. } | LlmError::NetworkError(_) | LlmError::ApiError(_))
}

/// Single entry point the rest of the kernel calls into. Wraps one provider
/// with the gateway's retry-with-backoff policy.
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
}

impl LlmClient {
    #[must_use]
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    /// Stateless single-shot generation — no caching, no session.
    ///
    /// # Errors
    ///
    /// Returns the last `LlmError` after exhausting retries.
    pub async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<GenerateResponse, LlmError> {
        self.generate_with_directive(system_prompt, user_prompt, &[], &CacheDirective::None).await
    }

    /// Generation with an explicit caching directive and accumulated
    /// conversation, used by the Cache Manager.
    ///
    /// # Errors
    ///
    /// Returns the last `LlmError` after exhausting retries.
    pub async fn generate_with_directive(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        conversation: &[(String, String)],
        directive: &CacheDirective,
    ) -> Result<GenerateResponse, LlmError> {
        let mut attempt = 0;
        loop {
            match self
                .provider
                .generate(system_prompt, user_prompt, conversation, directive)
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if attempt < MAX_RETRIES && is_retryable(&err) => {
                    let delay = retry_delay(attempt, &err);
                    warn!(attempt, error = %err, delay_secs = delay.as_secs(), "LLM call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    #[must_use]
    pub fn archetype(&self) -> ProviderArchetype {
        self.provider.archetype()
    }

    /// Passthrough to the provider's explicit-cache creation, for
    /// archetypes that need one. See [`LlmProvider::create_cache`].
    ///
    /// # Errors
    ///
    /// Returns the provider's `LlmError` if cache creation fails.
    pub async fn create_cache(&self, system_prompt: &str, ttl_seconds: u64) -> Result<Option<String>, LlmError> {
        self.provider.create_cache(system_prompt, ttl_seconds).await
    }
}
