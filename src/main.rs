//! Agent kernel daemon: wires the Trigger Queue, LLM Gateway, Cache
//! Manager, Action Registry/Executor, Task Manager, Context Engine,
//! Action Router, Narrator, and loop detection into one `AgentLoop` and
//! runs it forever.

use std::io::{self, Write};
use std::sync::Arc;

use agent_kernel::action::executor::ActionExecutor;
use agent_kernel::action::registry::ActionRegistry;
use agent_kernel::agent_loop::{AgentLoop, AgentLoopDeps};
use agent_kernel::cache::{CacheConfig, CacheManager};
use agent_kernel::config::AgentSettings;
use agent_kernel::context::{ContextEngine, SystemFlags, UserFlags};
use agent_kernel::event_stream::{EventStream, LlmEventSummarizer};
use agent_kernel::llm::providers::{AnthropicProvider, BytePlusProvider, GeminiProvider, OpenAiProvider};
use agent_kernel::llm::{LlmClient, LlmProvider};
use agent_kernel::loop_detection::{LoopDetectionConfig, LoopDetectionService};
use agent_kernel::narrator::Narrator;
use agent_kernel::router::ActionRouter;
use agent_kernel::sandbox::manager::SandboxManager;
use agent_kernel::state::AgentState;
use agent_kernel::storage::{ActionStore, AgentLogStore, TaskDocumentStore, TfIdfIndex, VectorIndex};
use agent_kernel::task::manager::TaskManager;
use agent_kernel::task::planner::TaskPlanner;
use agent_kernel::trigger::TriggerQueue;
use dotenvy::dotenv;
use regex::Regex;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

const DEFAULT_SANDBOX_USER_ID: i64 = 0;
const NARRATOR_MAX_TOKENS: u32 = 256;
const DEFAULT_CHAT_MAX_TOKENS: u32 = 4096;

/// Redacts API keys from log output, mirroring the teacher's Telegram-token
/// scrubber but generalized to the providers this kernel speaks to.
struct RedactionPatterns {
    bearer: Regex,
    api_key_field: Regex,
}

impl RedactionPatterns {
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            bearer: Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9_\-.]{10,}")?,
            api_key_field: Regex::new(r#"(?i)("?(?:api[_-]?key|token)"?\s*[:=]\s*"?)[A-Za-z0-9_\-.]{10,}"#)?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let output = self.bearer.replace_all(input, "$1[REDACTED]").to_string();
        self.api_key_field.replace_all(&output, "$1[REDACTED]").to_string()
    }
}

#[derive(Clone)]
struct RedactingMakeWriter {
    patterns: Arc<RedactionPatterns>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter { patterns: Arc::clone(&self.patterns) }
    }
}

struct RedactingWriter {
    patterns: Arc<RedactionPatterns>,
}

impl Write for RedactingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&text);
        io::stderr().write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

fn init_logging(patterns: Arc<RedactionPatterns>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(RedactingMakeWriter { patterns }))
        .init();
}

fn init_settings() -> AgentSettings {
    match AgentSettings::new() {
        Ok(settings) => {
            info!("configuration loaded successfully");
            settings
        }
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    }
}

/// Builds the configured provider for `model_id`, selected by
/// `settings.llm_provider` (spec §4.3's archetype-per-provider table). Used
/// both for the main reasoning model and, with a cheaper `model_id`, for
/// the narrator/loop-detection/summarizer sidecar calls.
fn build_provider_for_model(settings: &AgentSettings, model_id: String, max_tokens: u32) -> Arc<dyn LlmProvider> {
    match settings.llm_provider.as_deref() {
        Some("gemini") => {
            let api_key = settings.google_api_key.clone().unwrap_or_else(|| {
                error!("GOOGLE_API_KEY is required for llm_provider=gemini");
                std::process::exit(1);
            });
            Arc::new(GeminiProvider::new(api_key, model_id, max_tokens))
        }
        Some("anthropic") => {
            let api_key = settings.anthropic_api_key.clone().unwrap_or_else(|| {
                error!("ANTHROPIC_API_KEY is required for llm_provider=anthropic");
                std::process::exit(1);
            });
            Arc::new(AnthropicProvider::new(api_key, model_id, max_tokens))
        }
        Some("byteplus") => {
            let api_key = settings.byteplus_api_key.clone().unwrap_or_else(|| {
                error!("BYTEPLUS_API_KEY is required for llm_provider=byteplus");
                std::process::exit(1);
            });
            let api_base = settings.byteplus_api_base.clone().unwrap_or_default();
            Arc::new(BytePlusProvider::new(api_key, api_base, model_id, max_tokens))
        }
        Some("openai") | None => {
            let api_key = settings.openai_api_key.clone().unwrap_or_else(|| {
                error!("OPENAI_API_KEY is required for llm_provider=openai");
                std::process::exit(1);
            });
            Arc::new(OpenAiProvider::new(api_key, model_id, max_tokens))
        }
        Some(other) => {
            error!(provider = other, "unsupported llm_provider");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let patterns = Arc::new(RedactionPatterns::new().map_err(|err| {
        eprintln!("failed to compile redaction patterns: {err}");
        anyhow::anyhow!(err)
    })?);
    init_logging(patterns);

    info!("starting agent kernel...");

    let settings = init_settings();
    let chat_model_id = settings.chat_model_id.clone().unwrap_or_else(|| "default".to_string());
    let chat_max_tokens = settings.chat_model_max_tokens.unwrap_or(DEFAULT_CHAT_MAX_TOKENS);
    let provider = build_provider_for_model(&settings, chat_model_id, chat_max_tokens);

    let narrator_model_id = settings.narrator_model_id.clone().unwrap_or_else(|| "default".to_string());
    let sidecar_provider = build_provider_for_model(&settings, narrator_model_id, NARRATOR_MAX_TOKENS);

    let log_store = Arc::new(AgentLogStore::new(&settings.data_dir)?);
    let action_store = ActionStore::new(&settings.data_dir)?;
    let task_documents = Arc::new(TaskDocumentStore::new(&settings.data_dir)?);

    let registry = Arc::new(ActionRegistry::load(action_store)?);
    let index: Arc<tokio::sync::Mutex<dyn VectorIndex>> = Arc::new(tokio::sync::Mutex::new(TfIdfIndex::new()));

    let planner_client = Arc::new(LlmClient::new(Arc::clone(&provider)));
    let planner = Arc::new(TaskPlanner::new(planner_client, task_documents, index));

    let trigger_queue = Arc::new(TriggerQueue::with_identity_resolver());
    let state = Arc::new(AgentState::new());
    let task_manager = Arc::new(TaskManager::new(
        planner,
        Arc::clone(&log_store),
        Arc::clone(&trigger_queue),
        Arc::clone(&state),
        settings.clone(),
        std::path::PathBuf::from(&settings.data_dir).join("tasks"),
    ));

    let sandbox = SandboxManager::new(DEFAULT_SANDBOX_USER_ID).await?;
    let executor = Arc::new(ActionExecutor::new(sandbox, Arc::clone(&registry), Arc::clone(&log_store)));

    let router_client = Arc::new(LlmClient::new(Arc::clone(&provider)));
    let router = Arc::new(ActionRouter::new(router_client, Arc::clone(&registry)));

    let cache_config = CacheConfig {
        prefix_cache_ttl: settings.cache_prefix_ttl.unwrap_or(3600),
        session_cache_ttl: settings.cache_session_ttl.unwrap_or(1800),
        min_cache_tokens: settings.cache_min_tokens.unwrap_or(500),
    };
    let cache_client = LlmClient::new(Arc::clone(&provider));
    let provider_name = settings.llm_provider.clone().unwrap_or_else(|| "openai".to_string());
    let cache = Arc::new(CacheManager::new(cache_client, provider_name, cache_config));

    let summarizer_client = Arc::new(LlmClient::new(Arc::clone(&sidecar_provider)));
    let event_stream = Arc::new(EventStream::with_defaults(None, Arc::new(LlmEventSummarizer::new(summarizer_client))));

    let narrator_client = Arc::new(LlmClient::new(Arc::clone(&sidecar_provider)));
    let narrator = Arc::new(Narrator::new(narrator_client));

    let loop_detection_client = Arc::new(LlmClient::new(Arc::clone(&sidecar_provider)));
    let loop_detection = LoopDetectionService::new(loop_detection_client, Arc::new(LoopDetectionConfig::from_env()));

    let context_engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());

    let agent_loop = Arc::new(AgentLoop::new(AgentLoopDeps {
        trigger_queue,
        state,
        context_engine,
        router,
        registry,
        executor,
        task_manager,
        cache,
        event_stream,
        narrator,
        loop_detection,
        screen_observer: None,
        settings,
        platform: std::env::consts::OS.to_string(),
    }));

    info!("agent kernel is running");

    let shutdown_loop = Arc::clone(&agent_loop);
    tokio::select! {
        _ = shutdown_loop.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}
