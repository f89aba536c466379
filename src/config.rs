//! Configuration and settings management.
//!
//! Loads settings from environment variables and defines the budget floors
//! and tuning constants the rest of the kernel reads from.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Floor enforced on `MAX_ACTIONS_PER_TASK` (spec budget ceiling).
pub const MIN_MAX_ACTIONS_PER_TASK: u32 = 5;
/// Floor enforced on `MAX_TOKEN_PER_TASK` (spec budget ceiling).
pub const MIN_MAX_TOKENS_PER_TASK: u64 = 100_000;

/// Fraction of a budget at which the loop logs a non-fatal warning but
/// continues.
pub const BUDGET_WARN_FRACTION: f64 = 0.8;
/// Fraction of a budget at which the loop cancels the task.
pub const BUDGET_CANCEL_FRACTION: f64 = 1.0;

/// Default number of tail events that trigger summarization.
pub const DEFAULT_SUMMARIZE_AT: usize = 30;
/// Default number of trailing events kept after summarization.
pub const DEFAULT_TAIL_KEEP_AFTER_SUMMARIZE: usize = 15;
/// Minimum gap `summarize_at` must keep the tail above `tail_keep`, enforced
/// by coercion when a caller configures them too close together.
pub const MIN_SUMMARIZE_BUFFER: usize = 1;
/// Default externalization threshold, in characters, for event messages.
pub const DEFAULT_EXTERNALIZE_THRESHOLD: usize = 8000;
/// Actions allowed to read externalized files without triggering recursive
/// re-externalization of their own (large) output.
pub const STREAM_READER_ALLOWLIST: &[&str] = &["stream read", "grep"];

/// Default number of re-prompt retries on LLM schema/parse failures.
pub const DEFAULT_PARSE_RETRIES: u32 = 3;

/// Docker image action bodies execute in.
pub const SANDBOX_IMAGE: &str = "python:3.12-slim";
/// Memory limit, bytes, for an action sandbox container.
pub const SANDBOX_MEMORY_LIMIT: i64 = 512 * 1024 * 1024;
/// CFS CPU quota period, microseconds.
pub const SANDBOX_CPU_PERIOD: i64 = 100_000;
/// CFS CPU quota, microseconds per period (1 full core).
pub const SANDBOX_CPU_QUOTA: i64 = 100_000;
/// Wall-clock timeout, seconds, for a single action body execution.
pub const SANDBOX_EXEC_TIMEOUT_SECS: u64 = 120;

/// Timeout, in seconds, for raw-HTTP provider calls (`LLM_HTTP_TIMEOUT_SECS`
/// environment variable, default 120s to accommodate slow reasoning models).
#[must_use]
pub fn get_llm_http_timeout_secs() -> u64 {
    std::env::var("LLM_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(120)
}

/// Application settings loaded from environment variables.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AgentSettings {
    /// Root directory for JSONL logs, action/task-document stores.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Root directory for the vector index backing semantic search.
    #[serde(default = "default_chroma_path")]
    pub chroma_path: String,

    /// Selected LLM provider (openai, gemini, anthropic, byteplus).
    pub llm_provider: Option<String>,
    /// OpenAI API key (Automatic-cache style provider).
    pub openai_api_key: Option<String>,
    /// Google Gemini API key (Implicit-cache style provider).
    pub google_api_key: Option<String>,
    /// Anthropic API key (Ephemeral-cache style provider).
    pub anthropic_api_key: Option<String>,
    /// `BytePlus` API key (Responses-API style provider).
    pub byteplus_api_key: Option<String>,
    /// Optional base URL override for the `BytePlus` endpoint.
    pub byteplus_api_base: Option<String>,

    /// Chat/reasoning model id used by the agent loop.
    pub chat_model_id: Option<String>,
    /// Max output tokens for the chat/reasoning model.
    pub chat_model_max_tokens: Option<u32>,
    /// Narrator sidecar model id (cheap, used for display-message headlines).
    pub narrator_model_id: Option<String>,

    /// TTL, seconds, for provider prefix caches.
    pub cache_prefix_ttl: Option<u64>,
    /// TTL, seconds, for provider session caches.
    pub cache_session_ttl: Option<u64>,
    /// Minimum system-prompt length, in characters, for caching to engage.
    pub cache_min_tokens: Option<usize>,

    /// Budget ceiling: max actions executed within a single task.
    pub max_actions_per_task: Option<u32>,
    /// Budget ceiling: max cumulative tokens spent within a single task.
    pub max_token_per_task: Option<u64>,
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_chroma_path() -> String {
    "data/chroma".to_string()
}

impl AgentSettings {
    /// Create new settings by loading from environment and optional config
    /// files, then validate the budget floors.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading or validation fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("APP").separator("__"))
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validated()
    }

    /// Validate and normalize budget ceilings, enforcing the spec's floors.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError::Message` if `LLM_PROVIDER` is unset or names
    /// an unsupported provider.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.max_actions_per_task = Some(
            self.max_actions_per_task
                .unwrap_or(MIN_MAX_ACTIONS_PER_TASK)
                .max(MIN_MAX_ACTIONS_PER_TASK),
        );
        self.max_token_per_task = Some(
            self.max_token_per_task
                .unwrap_or(MIN_MAX_TOKENS_PER_TASK)
                .max(MIN_MAX_TOKENS_PER_TASK),
        );

        match self.llm_provider.as_deref() {
            Some("openai" | "gemini" | "anthropic" | "byteplus") | None => {}
            Some(other) => {
                return Err(ConfigError::Message(format!(
                    "Unsupported LLM_PROVIDER: {other}"
                )))
            }
        }

        Ok(self)
    }

    /// Returns the configured budget ceiling for actions per task.
    #[must_use]
    pub fn max_actions_per_task(&self) -> u32 {
        self.max_actions_per_task.unwrap_or(MIN_MAX_ACTIONS_PER_TASK)
    }

    /// Returns the configured budget ceiling for tokens per task.
    #[must_use]
    pub fn max_token_per_task(&self) -> u64 {
        self.max_token_per_task.unwrap_or(MIN_MAX_TOKENS_PER_TASK)
    }
}
