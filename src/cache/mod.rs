//! Cache Manager: provider-agnostic session/prefix caching on top of the
//! LLM Gateway (spec §4.3). Tracks one [`SessionCacheEntry`] per
//! `(task_id, call_type)` pair, computes the right [`CacheDirective`] for
//! the underlying provider's archetype, and recovers from context-overflow
//! errors by recreating the session once before falling back to a
//! stateless call.
//!
//! Grounded on `original_source/core/llm/cache/config.py` (`CacheConfig`),
//! `core/llm/cache/metrics.py` (`CacheMetrics`), and the call patterns in
//! `byteplus.py`/`gemini.py`'s session managers.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::llm::{CacheDirective, GenerateResponse, LlmClient, LlmError, ProviderArchetype};

/// Shared cache tuning, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for prefix caches in seconds (`BytePlus` only; Anthropic's
    /// ephemeral cache carries its own fixed/extended TTL).
    pub prefix_cache_ttl: u64,
    /// TTL for session caches in seconds.
    pub session_cache_ttl: u64,
    /// Minimum system-prompt length, in characters, below which caching
    /// does not engage (roughly 500 chars ~= 1024 tokens).
    pub min_cache_tokens: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix_cache_ttl: 3600,
            session_cache_ttl: 7200,
            min_cache_tokens: 500,
        }
    }
}

impl CacheConfig {
    /// Loads cache configuration from `CACHE_PREFIX_TTL`, `CACHE_SESSION_TTL`,
    /// and `CACHE_MIN_TOKENS`, falling back to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            prefix_cache_ttl: env_u64("CACHE_PREFIX_TTL", default.prefix_cache_ttl),
            session_cache_ttl: env_u64("CACHE_SESSION_TTL", default.session_cache_ttl),
            min_cache_tokens: env_u64("CACHE_MIN_TOKENS", default.min_cache_tokens as u64) as usize,
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Per `(provider, cache_type)` hit/miss counters, mirroring
/// `core/llm/cache/metrics.py`'s `CacheMetricsEntry`.
#[derive(Debug, Clone, Default)]
pub struct CacheMetricsEntry {
    pub total_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tokens_cached: u64,
    pub tokens_uncached: u64,
}

impl CacheMetricsEntry {
    /// Fraction of calls that hit the cache, in `[0.0, 1.0]`. `0.0` with no
    /// calls recorded yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_calls as f64
        }
    }

    /// Fraction of total tokens that were served from cache.
    #[must_use]
    pub fn token_cache_rate(&self) -> f64 {
        let total = self.tokens_cached + self.tokens_uncached;
        if total == 0 {
            0.0
        } else {
            self.tokens_cached as f64 / total as f64
        }
    }
}

/// Process-wide cache hit/miss tracker, keyed by `(provider, cache_type)`.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    entries: Mutex<HashMap<(String, String), CacheMetricsEntry>>,
}

impl CacheMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, provider: &str, cache_type: &str, cached_tokens: u64, total_tokens: u64) {
        let mut entries = self.entries.lock().expect("cache metrics mutex poisoned");
        let entry = entries.entry((provider.to_string(), cache_type.to_string())).or_default();
        entry.total_calls += 1;
        entry.cache_hits += 1;
        entry.tokens_cached += cached_tokens;
        entry.tokens_uncached += total_tokens.saturating_sub(cached_tokens);
    }

    pub fn record_miss(&self, provider: &str, cache_type: &str, total_tokens: u64) {
        let mut entries = self.entries.lock().expect("cache metrics mutex poisoned");
        let entry = entries.entry((provider.to_string(), cache_type.to_string())).or_default();
        entry.total_calls += 1;
        entry.cache_misses += 1;
        entry.tokens_uncached += total_tokens;
    }

    /// Snapshot of every tracked `(provider, cache_type)` entry plus its
    /// hit-rate and token-cache-rate, for diagnostics logging.
    #[must_use]
    pub fn summary(&self) -> Vec<(String, String, CacheMetricsEntry)> {
        let entries = self.entries.lock().expect("cache metrics mutex poisoned");
        entries
            .iter()
            .map(|((provider, cache_type), entry)| (provider.clone(), cache_type.clone(), entry.clone()))
            .collect()
    }

    pub fn reset(&self) {
        self.entries.lock().expect("cache metrics mutex poisoned").clear();
    }
}

/// State tracked for one live `(task_id, call_type)` caching session.
#[derive(Debug, Clone, Default)]
struct SessionCacheEntry {
    system_prompt: String,
    /// Provider-side handle: BytePlus `previous_response_id`, Gemini
    /// `cachedContent` name. `None` for archetypes with no handle
    /// (Anthropic, OpenAI) that instead replay `history` every call.
    provider_handle: Option<String>,
    /// Accumulated `(role, content)` turns, used by archetypes that carry
    /// no server-side handle.
    history: Vec<(String, String)>,
}

/// Ties an `LlmClient` to cache bookkeeping: session entries per
/// `(task_id, call_type)`, a prefix-cache registry keyed by a hash of the
/// system prompt, and hit/miss metrics.
pub struct CacheManager {
    client: LlmClient,
    provider_name: String,
    config: CacheConfig,
    sessions: Mutex<HashMap<(String, String), SessionCacheEntry>>,
    prefix_cache_names: Mutex<HashMap<String, String>>,
    metrics: CacheMetrics,
}

fn prompt_hash(system_prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(system_prompt.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl CacheManager {
    #[must_use]
    pub fn new(client: LlmClient, provider_name: impl Into<String>, config: CacheConfig) -> Self {
        Self {
            client,
            provider_name: provider_name.into(),
            config,
            sessions: Mutex::new(HashMap::new()),
            prefix_cache_names: Mutex::new(HashMap::new()),
            metrics: CacheMetrics::new(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn cache_type(&self) -> &'static str {
        match self.client.archetype() {
            ProviderArchetype::ResponsesApi => "responses_api",
            ProviderArchetype::ImplicitCache => "implicit",
            ProviderArchetype::EphemeralCache => "ephemeral",
            ProviderArchetype::AutomaticCache => "automatic",
        }
    }

    /// Registers a new caching session for `(task_id, call_type)`, seeding
    /// it with `system_prompt`. Does not make any provider call: the
    /// provider-side handle (if the archetype needs one) is created lazily
    /// on first [`generate_with_session`](Self::generate_with_session).
    pub fn create_session_cache(&self, task_id: &str, call_type: &str, system_prompt: &str) {
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        sessions.insert(
            (task_id.to_string(), call_type.to_string()),
            SessionCacheEntry {
                system_prompt: system_prompt.to_string(),
                provider_handle: None,
                history: Vec::new(),
            },
        );
    }

    /// Generates a response within the `(task_id, call_type)` session,
    /// growing its context across calls and reusing whatever provider-side
    /// cache handle applies to the underlying archetype.
    ///
    /// On a context-overflow error the handle is discarded and the session
    /// is recreated from the stored system prompt plus only the current
    /// user prompt; if that retry also overflows, falls back to a fully
    /// stateless call through the gateway.
    ///
    /// # Errors
    ///
    /// Returns the underlying `LlmError` if the stateless fallback also
    /// fails.
    pub async fn generate_with_session(
        &self,
        task_id: &str,
        call_type: &str,
        user_prompt: &str,
    ) -> Result<GenerateResponse, LlmError> {
        let (system_prompt, provider_handle, history) = {
            let sessions = self.sessions.lock().expect("session cache mutex poisoned");
            let entry = sessions.get(&(task_id.to_string(), call_type.to_string())).cloned();
            match entry {
                Some(entry) => (entry.system_prompt, entry.provider_handle, entry.history),
                None => (String::new(), None, Vec::new()),
            }
        };

        let directive = self.directive_for(&system_prompt, provider_handle.clone()).await?;

        match self.client.generate_with_directive(&system_prompt, user_prompt, &history, &directive).await {
            Ok(response) => {
                self.record_outcome(&directive, &response);
                self.append_turn(task_id, call_type, user_prompt, &response);
                Ok(response)
            }
            Err(LlmError::ContextOverflow(message)) => {
                warn!(task_id, call_type, %message, "session context overflow, recreating session");
                self.recover_from_overflow(task_id, call_type, &system_prompt, user_prompt).await
            }
            Err(err) => Err(err),
        }
    }

    async fn directive_for(&self, system_prompt: &str, provider_handle: Option<String>) -> Result<CacheDirective, LlmError> {
        if system_prompt.len() < self.config.min_cache_tokens {
            return Ok(CacheDirective::None);
        }

        Ok(match self.client.archetype() {
            ProviderArchetype::ResponsesApi => CacheDirective::ResponsesApi {
                previous_response_id: provider_handle,
                caching_enabled: true,
                caching_prefix: false,
            },
            ProviderArchetype::ImplicitCache => {
                let cache_name = self.explicit_cache_for(system_prompt).await?;
                CacheDirective::ImplicitCache {
                    cache_name,
                    call_type: "session".to_string(),
                }
            }
            ProviderArchetype::EphemeralCache => CacheDirective::EphemeralCache { extended_ttl: true },
            ProviderArchetype::AutomaticCache => CacheDirective::AutomaticCache {
                prompt_cache_key: prompt_hash(system_prompt),
            },
        })
    }

    /// Looks up or lazily creates an explicit provider cache object keyed by
    /// a hash of `system_prompt`, for [`ProviderArchetype::ImplicitCache`].
    async fn explicit_cache_for(&self, system_prompt: &str) -> Result<Option<String>, LlmError> {
        let key = prompt_hash(system_prompt);
        {
            let registry = self.prefix_cache_names.lock().expect("prefix cache mutex poisoned");
            if let Some(name) = registry.get(&key) {
                return Ok(Some(name.clone()));
            }
        }

        let created = self.client.create_cache(system_prompt, self.config.prefix_cache_ttl).await?;
        if let Some(name) = &created {
            let mut registry = self.prefix_cache_names.lock().expect("prefix cache mutex poisoned");
            registry.insert(key, name.clone());
        }
        Ok(created)
    }

    fn record_outcome(&self, directive: &CacheDirective, response: &GenerateResponse) {
        let cache_type = self.cache_type();
        if response.cached_tokens > 0 || !matches!(directive, CacheDirective::None) {
            self.metrics.record_hit(&self.provider_name, cache_type, response.cached_tokens, response.tokens_used);
        } else {
            self.metrics.record_miss(&self.provider_name, cache_type, response.tokens_used);
        }
    }

    fn append_turn(&self, task_id: &str, call_type: &str, user_prompt: &str, response: &GenerateResponse) {
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        if let Some(entry) = sessions.get_mut(&(task_id.to_string(), call_type.to_string())) {
            entry.history.push(("user".to_string(), user_prompt.to_string()));
            entry.history.push(("assistant".to_string(), response.content.clone()));
            if let Some(handle) = &response.provider_handle {
                entry.provider_handle = Some(handle.clone());
            }
        }
    }

    async fn recover_from_overflow(
        &self,
        task_id: &str,
        call_type: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<GenerateResponse, LlmError> {
        self.create_session_cache(task_id, call_type, system_prompt);

        match self.client.generate_with_directive(system_prompt, user_prompt, &[], &CacheDirective::None).await {
            Ok(response) => {
                self.append_turn(task_id, call_type, user_prompt, &response);
                Ok(response)
            }
            Err(LlmError::ContextOverflow(message)) => {
                warn!(task_id, call_type, %message, "session recreation also overflowed, falling back to stateless call");
                self.end_session_cache(task_id, call_type);
                self.client.generate(system_prompt, user_prompt).await
            }
            Err(err) => Err(err),
        }
    }

    /// Drops the `(task_id, call_type)` session, releasing its accumulated
    /// history. Does not revoke any provider-side cache object: prefix
    /// caches are shared across sessions and expire on their own TTL.
    pub fn end_session_cache(&self, task_id: &str, call_type: &str) {
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        sessions.remove(&(task_id.to_string(), call_type.to_string()));
    }

    /// Drops every session cache entry belonging to `task_id`, called when
    /// a task completes or is cancelled.
    pub fn end_all_session_caches(&self, task_id: &str) {
        let mut sessions = self.sessions.lock().expect("session cache mutex poisoned");
        sessions.retain(|(entry_task_id, _), _| entry_task_id != task_id);
        info!(task_id, "cleared all session caches for task");
    }
}
