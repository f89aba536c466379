//! Agent Loop (spec §4.7): the reactive ReAct loop that drains one
//! [`Trigger`] at a time and drives it through budget check, reasoning,
//! routing, execution, and rescheduling.
//!
//! Grounded on the teacher's `agent/runner/execution.rs` iteration shape
//! (budget gate before the LLM call, one action per turn, errors folded into
//! a recoverable follow-up rather than aborting the process) generalized
//! from a chat turn to a trigger-driven session.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::action::executor::{ActionExecutor, ExecutorError};
use crate::action::registry::ActionRegistry;
use crate::cache::CacheManager;
use crate::config::{AgentSettings, DEFAULT_PARSE_RETRIES};
use crate::context::{ContextEngine, ContextInputs};
use crate::event_stream::{EventStream, Severity};
use crate::llm::LlmError;
use crate::loop_detection::{LoopDetectionService, LoopType};
use crate::narrator::Narrator;
use crate::router::{ActionRouter, RouterError, RouterMode};
use crate::state::AgentState;
use crate::task::manager::{TaskManager, TaskManagerError};
use crate::task::Task;
use crate::trigger::{Trigger, TriggerQueue};
use crate::utils::strip_code_fence;

/// External collaborator seam for GUI-mode screen capture (spec §4.7 step
/// 3). The screen/VLM analysis pipeline itself is out of scope (spec's
/// Out-of-scope list names it as an external collaborator); this crate ships
/// only the trait the loop calls into, with no concrete implementation.
#[async_trait::async_trait]
pub trait ScreenObserver: Send + Sync {
    /// Captures the current screen and returns a natural-language
    /// description of it.
    async fn describe_screen(&self) -> anyhow::Result<String>;
}

const REASONING_CALL_TYPE: &str = "reasoning";
/// Delay before retrying a trigger that errored mid-iteration.
const RECOVERY_DELAY_SECS: i64 = 5;
/// Fallback reschedule delay when an action's output carries no
/// `fire_at_delay` field.
const DEFAULT_RESCHEDULE_DELAY_SECS: i64 = 2;

#[derive(Debug, Error)]
pub enum AgentLoopError {
    #[error("router error: {0}")]
    Router(#[from] RouterError),
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),
    #[error("task manager error: {0}")]
    TaskManager(#[from] TaskManagerError),
    #[error("action not found: {0}")]
    ActionNotFound(String),
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("reasoning failed after {0} attempts: {1}")]
    ReasoningFailed(u32, String),
}

#[derive(Debug, Deserialize, Default)]
struct ReasoningResponse {
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    action_query: String,
}

/// Dependencies wired into one [`AgentLoop`]. Bundled into a struct rather
/// than passed positionally so `AgentLoop::new` takes a single argument.
pub struct AgentLoopDeps {
    pub trigger_queue: Arc<TriggerQueue>,
    pub state: Arc<AgentState>,
    pub context_engine: ContextEngine,
    pub router: Arc<ActionRouter>,
    pub registry: Arc<ActionRegistry>,
    pub executor: Arc<ActionExecutor>,
    pub task_manager: Arc<TaskManager>,
    pub cache: Arc<CacheManager>,
    pub event_stream: Arc<EventStream>,
    pub narrator: Arc<Narrator>,
    pub loop_detection: LoopDetectionService,
    pub screen_observer: Option<Arc<dyn ScreenObserver>>,
    pub settings: AgentSettings,
    pub platform: String,
}

/// Drives the Trigger Queue: one Trigger in, one react() iteration, possibly
/// one follow-up Trigger out (spec §4.7, §5's single-threaded cooperative
/// scheduling model).
pub struct AgentLoop {
    trigger_queue: Arc<TriggerQueue>,
    state: Arc<AgentState>,
    context_engine: ContextEngine,
    router: Arc<ActionRouter>,
    registry: Arc<ActionRegistry>,
    executor: Arc<ActionExecutor>,
    task_manager: Arc<TaskManager>,
    cache: Arc<CacheManager>,
    event_stream: Arc<EventStream>,
    narrator: Arc<Narrator>,
    loop_detection: Mutex<LoopDetectionService>,
    current_loop_session: Mutex<Option<String>>,
    screen_observer: Option<Arc<dyn ScreenObserver>>,
    settings: AgentSettings,
    platform: String,
}

impl AgentLoop {
    #[must_use]
    pub fn new(deps: AgentLoopDeps) -> Self {
        Self {
            trigger_queue: deps.trigger_queue,
            state: deps.state,
            context_engine: deps.context_engine,
            router: deps.router,
            registry: deps.registry,
            executor: deps.executor,
            task_manager: deps.task_manager,
            cache: deps.cache,
            event_stream: deps.event_stream,
            narrator: deps.narrator,
            loop_detection: Mutex::new(deps.loop_detection),
            current_loop_session: Mutex::new(None),
            screen_observer: deps.screen_observer,
            settings: deps.settings,
            platform: deps.platform,
        }
    }

    /// Runs forever, draining the Trigger Queue one trigger at a time.
    /// Errors from a single iteration never stop the loop: they are logged
    /// to the event stream and a recovery trigger is enqueued (spec §4.7's
    /// error policy).
    pub async fn run(&self) -> ! {
        loop {
            let trigger = self.trigger_queue.get().await;
            let session_id = trigger.session_id.clone();
            let description = trigger.next_action_description.clone();

            if let Err(err) = self.react(trigger).await {
                error!(session_id = %session_id, %err, "agent loop iteration failed");
                self.event_stream.log(
                    "error",
                    format!("{description}: {err}"),
                    Severity::Error,
                    None,
                    None,
                );
                let recovery = Trigger::new(Utc::now() + ChronoDuration::seconds(RECOVERY_DELAY_SECS), 3, session_id, description);
                self.trigger_queue.put(recovery).await;
            }
        }
    }

    /// One pass of the 10-step loop (spec §4.7) for a single dequeued
    /// trigger.
    async fn react(&self, trigger: Trigger) -> Result<(), AgentLoopError> {
        // 1. current_task_id comes from the trigger's session.
        let session_id = trigger.session_id.clone();
        let task = self.task_manager.current_task().await;
        let in_task = task.as_ref().is_some_and(|t| t.id == session_id);

        self.sync_loop_detection_session(&session_id).await;

        let gui_mode = self.state.gui_mode().await;
        // 3. GUI mode: capture a screenshot and describe it, if a screen
        // observer is wired up (the concrete pipeline is an external
        // collaborator, spec's Out-of-scope list).
        if gui_mode {
            if let Some(observer) = &self.screen_observer {
                match observer.describe_screen().await {
                    Ok(description) => {
                        self.event_stream.log("screen", description, Severity::Info, None, None);
                    }
                    Err(err) => warn!(%err, "screen capture failed, continuing without it"),
                }
            }
        }

        // 4. Budget check.
        if in_task {
            if let Some(props) = self.state.agent_properties().await {
                if props.is_exhausted() {
                    let fraction = props.action_fraction().max(props.token_fraction());
                    self.event_stream.log(
                        "warning",
                        format!("budget at {:.0}% for task {session_id}, cancelling", fraction * 100.0),
                        Severity::Warn,
                        None,
                        None,
                    );
                    self.task_manager.mark_task_cancel(Some("budget exhausted")).await?;
                    return Ok(());
                }
                if props.is_warning() {
                    let fraction = props.action_fraction().max(props.token_fraction());
                    self.event_stream.log(
                        "warning",
                        format!("budget at {:.0}% for task {session_id}", fraction * 100.0),
                        Severity::Warn,
                        None,
                        None,
                    );
                }
            }
        }

        // 2. Start the session: rebuild and re-seed the cached system prompt.
        let system_prompt = self.build_system_prompt(task.as_ref(), &session_id).await;
        self.cache.create_session_cache(&session_id, REASONING_CALL_TYPE, &system_prompt);

        // 5. Reason, only if a task is running.
        let action_query = if in_task {
            let reasoning = self.reason(&session_id, &trigger).await?;

            if self.loop_detection.lock().await.check_content(&reasoning.reasoning) {
                return self.handle_loop_detected(&session_id, LoopType::ContentLoop).await;
            }

            if let Some(props) = self.state.agent_properties().await {
                let history = self.event_stream.to_prompt_snapshot(false);
                match self.loop_detection.lock().await.check_llm_periodic(&history, props.action_count as usize).await {
                    Ok(true) => return self.handle_loop_detected(&session_id, LoopType::CognitiveLoop).await,
                    Ok(false) => {}
                    Err(err) => warn!(%err, "cognitive loop check failed, continuing"),
                }
            }

            reasoning.action_query
        } else {
            trigger.next_action_description.clone()
        };

        // 6. Route.
        let mode = router_mode(task.as_ref(), gui_mode);
        let routed = self.router.route(mode, &action_query).await?;

        if routed.action_name.is_empty() {
            // Router signals "no existing action fits" — authoring new
            // action catalog entries is out of scope for the kernel (spec's
            // Out-of-scope list), so this surfaces as an operator-visible
            // event rather than attempting to synthesize one.
            self.event_stream.log(
                "warning",
                format!("router found no matching action for: {action_query}"),
                Severity::Warn,
                None,
                None,
            );
            return Ok(());
        }

        let parameters_text = routed.parameters.to_string();
        if self.loop_detection.lock().await.check_action(&routed.action_name, &parameters_text) {
            return self.handle_loop_detected(&session_id, LoopType::ToolCallLoop).await;
        }

        // 7. Fetch the concrete Action.
        let action = self
            .registry
            .get(&routed.action_name)
            .ok_or_else(|| AgentLoopError::ActionNotFound(routed.action_name.clone()))?;

        // 9 (start half). Log before executing so the event stream shows
        // intent even if the action hangs.
        self.event_stream.log(
            "action_start",
            format!("{}: {}", action.name, routed.parameters),
            Severity::Info,
            None,
            Some(action.name.as_str()),
        );

        // 8. Execute.
        let parent_action_id = trigger.payload.get("parent_action_id").and_then(Value::as_str).map(str::to_string);
        let outcome = self
            .executor
            .execute(&action, routed.parameters, &session_id, parent_action_id.as_deref(), &self.platform)
            .await?;

        if in_task {
            self.state.bump_action_count().await;
        }

        // 9 (end half). Bump state, log action_end.
        let headline = self.narrator.narrate("action_end", &outcome.output.to_string()).await;
        self.event_stream.log(
            "action_end",
            outcome.output.to_string(),
            Severity::Info,
            headline,
            Some(action.name.as_str()),
        );

        // 10. Reschedule if the task is still running.
        if in_task && self.task_manager.current_task().await.is_some() {
            let fire_at_delay = outcome
                .output
                .get("fire_at_delay")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_RESCHEDULE_DELAY_SECS);
            let mut next = Trigger::new(Utc::now() + ChronoDuration::seconds(fire_at_delay), 5, session_id, action_query);
            next.payload.insert("parent_action_id".to_string(), Value::String(outcome.run_id));
            self.trigger_queue.put(next).await;
        }

        Ok(())
    }

    /// Resets the loop detection state when the session the loop is acting
    /// on changes, so counters from a prior task or conversation turn never
    /// leak into the next one.
    async fn sync_loop_detection_session(&self, session_id: &str) {
        let mut current = self.current_loop_session.lock().await;
        if current.as_deref() != Some(session_id) {
            self.loop_detection.lock().await.reset(session_id.to_string());
            *current = Some(session_id.to_string());
        }
    }

    async fn handle_loop_detected(&self, session_id: &str, loop_type: LoopType) -> Result<(), AgentLoopError> {
        let event = self.loop_detection.lock().await.create_event(loop_type, 0);
        warn!(session_id, loop_type = ?event.loop_type, "loop detected, cancelling active task");
        self.event_stream.log(
            "warning",
            format!("loop detected ({:?}), cancelling task", event.loop_type),
            Severity::Warn,
            None,
            None,
        );
        if self.task_manager.current_task().await.is_some() {
            self.task_manager.mark_task_cancel(Some("loop detected")).await?;
        }
        Ok(())
    }

    /// Calls the LLM with a reasoning prompt and parses `{reasoning,
    /// action_query}`, re-prompting with a feedback block on schema
    /// violations up to `DEFAULT_PARSE_RETRIES + 1` attempts total.
    async fn reason(&self, session_id: &str, trigger: &Trigger) -> Result<ReasoningResponse, AgentLoopError> {
        let mut user_prompt = trigger.next_action_description.clone();
        let mut last_error = String::new();

        for attempt in 0..=DEFAULT_PARSE_RETRIES {
            let response = self.cache.generate_with_session(session_id, REASONING_CALL_TYPE, &user_prompt).await?;
            self.state.add_tokens(response.tokens_used).await;

            let cleaned = strip_code_fence(&response.content);
            match serde_json::from_str::<ReasoningResponse>(&cleaned) {
                Ok(parsed) if !parsed.action_query.is_empty() => return Ok(parsed),
                Ok(_) => last_error = "action_query was empty".to_string(),
                Err(err) => last_error = err.to_string(),
            }

            warn!(attempt, error = %last_error, "reasoning response invalid, retrying");
            user_prompt = format!(
                "{}\n\nYour previous response was invalid ({last_error}). Respond with JSON only: {{\"reasoning\": string, \"action_query\": string}}.",
                trigger.next_action_description
            );
        }

        Err(AgentLoopError::ReasoningFailed(DEFAULT_PARSE_RETRIES + 1, last_error))
    }

    async fn build_system_prompt(&self, task: Option<&Task>, session_id: &str) -> String {
        let agent_state = match self.state.agent_properties().await {
            Some(props) => format!(
                "task: {}, action {}/{}, tokens {}/{}",
                props.current_task_id, props.action_count, props.max_actions_per_task, props.token_count, props.max_tokens_per_task
            ),
            None => "no active task".to_string(),
        };

        let inputs = ContextInputs {
            role_info: "You are an autonomous agent executing tasks on behalf of a user.".to_string(),
            agent_info: format!("session: {session_id}, provider: {}", self.settings.llm_provider.as_deref().unwrap_or("default")),
            agent_state,
            conversation_history: String::new(),
            event_stream: self.event_stream.to_prompt_snapshot(true),
            task_state: task.map(render_task_state).unwrap_or_default(),
            policy: String::new(),
            environment: format!("platform: {}", self.platform),
            base_instruction: "Think step by step, then decide the single next action.".to_string(),
            query: String::new(),
            expected_output: String::new(),
        };

        self.context_engine.build_system_prompt(&inputs)
    }
}

/// Renders a task's current step and plan for the context engine's
/// `task_state` section.
fn render_task_state(task: &Task) -> String {
    let current = task.current_step().map_or_else(|| "none".to_string(), |s| format!("{} ({})", s.step_name, s.description));
    let steps = task
        .steps
        .iter()
        .map(|s| format!("- [{:?}] {}", s.status, s.step_name))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Goal: {}\nCurrent step: {current}\nPlan:\n{steps}", task.instruction)
}

/// Picks the Action Router mode for the current iteration (spec §4.6). A
/// task counts as "simple" when its plan currently has a single step —
/// matching the planner's fallback plan and any single-step re-plan — since
/// the kernel keeps no separate stored "simple" flag on `Task` (an Open
/// Question resolved this way; see `DESIGN.md`).
fn router_mode(task: Option<&Task>, gui_mode: bool) -> RouterMode {
    match task {
        None => RouterMode::Conversation,
        Some(_) if gui_mode => RouterMode::InTaskGui,
        Some(t) if t.steps.len() <= 1 => RouterMode::SimpleTask,
        Some(_) => RouterMode::InTaskCli,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionType, VisibilityMode};
    use crate::cache::CacheConfig;
    use crate::context::{SystemFlags, UserFlags};
    use crate::llm::{CacheDirective, GenerateResponse, LlmClient, LlmProvider, ProviderArchetype};
    use crate::sandbox::SandboxManager;
    use crate::storage::{ActionStore, AgentLogStore, TaskDocumentStore, TfIdfIndex, VectorIndex};
    use crate::task::planner::TaskPlanner;
    use crate::task::{Step, StepStatus, TaskStatus};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn router_mode_picks_conversation_with_no_task() {
        assert_eq!(router_mode(None, false), RouterMode::Conversation);
    }

    #[test]
    fn router_mode_picks_simple_task_for_single_step_plan() {
        let task = Task {
            id: "t".into(),
            name: "n".into(),
            instruction: "i".into(),
            steps: vec![Step {
                step_index: 0,
                step_name: "a".into(),
                description: "a".into(),
                action_instruction: "a".into(),
                validation_instruction: "a".into(),
                status: StepStatus::Current,
                failure_message: None,
            }],
            todos: vec![],
            temp_dir: "/tmp".into(),
            created_at: chrono::Utc::now(),
            status: TaskStatus::Running,
        };
        assert_eq!(router_mode(Some(&task), false), RouterMode::SimpleTask);
    }

    #[test]
    fn router_mode_picks_gui_over_cli_in_task() {
        let task = Task {
            id: "t".into(),
            name: "n".into(),
            instruction: "i".into(),
            steps: vec![
                Step { step_index: 0, step_name: "a".into(), description: "a".into(), action_instruction: "a".into(), validation_instruction: "a".into(), status: StepStatus::Current, failure_message: None },
                Step { step_index: 1, step_name: "b".into(), description: "b".into(), action_instruction: "b".into(), validation_instruction: "b".into(), status: StepStatus::Pending, failure_message: None },
            ],
            todos: vec![],
            temp_dir: "/tmp".into(),
            created_at: chrono::Utc::now(),
            status: TaskStatus::Running,
        };
        assert_eq!(router_mode(Some(&task), true), RouterMode::InTaskGui);
        assert_eq!(router_mode(Some(&task), false), RouterMode::InTaskCli);
    }

    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
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
                content: r#"{"reasoning":"thinking","action_query":"send message"}"#.to_string(),
                tokens_used: 5,
                cached_tokens: 0,
                provider_handle: None,
            })
        }
    }

    struct ScriptedRouterProvider {
        responses: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedRouterProvider {
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
            let mut responses = self.responses.lock().expect("lock");
            let content = if responses.is_empty() { String::new() } else { responses.remove(0) };
            Ok(GenerateResponse { content, tokens_used: 5, cached_tokens: 0, provider_handle: None })
        }
    }

    async fn build_loop(dir: &std::path::Path) -> AgentLoop {
        let registry_provider: Arc<dyn LlmProvider> = Arc::new(ScriptedRouterProvider {
            responses: std::sync::Mutex::new(vec![r#"{"action_name": "send message", "parameters": {"text": "hi"}}"#.to_string()]),
        });
        let router_client = Arc::new(LlmClient::new(Arc::clone(&registry_provider)));
        let registry = Arc::new(ActionRegistry::load(ActionStore::new(dir).expect("store")).expect("registry"));
        registry
            .register(Action {
                name: "send message".into(),
                description: "send a message".into(),
                action_type: ActionType::Atomic,
                body: String::new(),
                sub_actions: vec![],
                input_schema: HashMap::new(),
                output_schema: HashMap::new(),
                observer: None,
                mode: Some(VisibilityMode::All),
                platform_allowlist: vec![],
                platform_overrides: HashMap::new(),
                execution_mode: "sandboxed".into(),
            })
            .expect("register");

        let router = Arc::new(ActionRouter::new(router_client, Arc::clone(&registry)));
        let log_store = Arc::new(AgentLogStore::new(dir).expect("log store"));
        let sandbox = SandboxManager::new(0).await.expect("sandbox stub");
        let executor = Arc::new(ActionExecutor::new(sandbox, Arc::clone(&registry), Arc::clone(&log_store)));

        let planner_client = Arc::new(LlmClient::new(Arc::new(EchoProvider)));
        let docs = Arc::new(TaskDocumentStore::new(dir).expect("store"));
        let index: Arc<tokio::sync::Mutex<dyn VectorIndex>> = Arc::new(tokio::sync::Mutex::new(TfIdfIndex::new()));
        let planner = Arc::new(TaskPlanner::new(planner_client, docs, index));
        let trigger_queue = Arc::new(TriggerQueue::with_identity_resolver());
        let state = Arc::new(AgentState::new());
        let settings = AgentSettings { max_actions_per_task: Some(5), max_token_per_task: Some(100_000), ..Default::default() };
        let task_manager = Arc::new(TaskManager::new(planner, log_store, Arc::clone(&trigger_queue), Arc::clone(&state), settings.clone(), dir.to_path_buf()));

        let cache_client = LlmClient::new(Arc::new(EchoProvider));
        let cache = Arc::new(CacheManager::new(cache_client, "echo", CacheConfig::default()));

        let stream_client = Arc::new(LlmClient::new(Arc::new(EchoProvider)));
        let _ = stream_client;
        let event_stream = Arc::new(EventStream::with_defaults(None, Arc::new(NoopSummarizer)));

        let narrator = Arc::new(Narrator::new(Arc::new(LlmClient::new(Arc::new(EchoProvider)))));
        let loop_detection = LoopDetectionService::new(Arc::new(LlmClient::new(Arc::new(EchoProvider))), Arc::new(crate::loop_detection::LoopDetectionConfig::default()));

        let context_engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());

        AgentLoop::new(AgentLoopDeps {
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
            platform: "linux".to_string(),
        })
    }

    struct NoopSummarizer;

    #[async_trait]
    impl crate::event_stream::EventSummarizer for NoopSummarizer {
        async fn summarize(&self, _previous: Option<&str>, _chunk: &[crate::event_stream::Event]) -> anyhow::Result<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn react_in_conversation_mode_executes_the_routed_action_and_does_not_reschedule() {
        let dir = tempdir().expect("tempdir");
        let agent_loop = build_loop(dir.path()).await;

        let trigger = Trigger::new(Utc::now(), 1, "chat", "say hi to the user");
        agent_loop.react(trigger).await.expect("react should succeed");

        assert_eq!(agent_loop.trigger_queue.size().await, 0);
        assert!(agent_loop.event_stream.tail_len() >= 2);
    }

    #[tokio::test]
    async fn react_reports_action_not_found_as_an_error() {
        let dir = tempdir().expect("tempdir");
        let registry_provider: Arc<dyn LlmProvider> = Arc::new(ScriptedRouterProvider {
            responses: std::sync::Mutex::new(vec![r#"{"action_name": "send message", "parameters": {}}"#.to_string()]),
        });
        let router_client = Arc::new(LlmClient::new(registry_provider));
        let registry = Arc::new(ActionRegistry::load(ActionStore::new(dir.path()).expect("store")).expect("registry"));
        let router = Arc::new(ActionRouter::new(router_client, Arc::clone(&registry)));

        // Candidate list includes the fixed conversation allowlist, so
        // "send message" is offered even though no Action is registered for
        // it, reproducing the loop's "route succeeds, fetch fails" path.
        let log_store = Arc::new(AgentLogStore::new(dir.path()).expect("log store"));
        let sandbox = SandboxManager::new(0).await.expect("sandbox stub");
        let executor = Arc::new(ActionExecutor::new(sandbox, Arc::clone(&registry), Arc::clone(&log_store)));

        let planner_client = Arc::new(LlmClient::new(Arc::new(EchoProvider)));
        let docs = Arc::new(TaskDocumentStore::new(dir.path()).expect("store"));
        let index: Arc<tokio::sync::Mutex<dyn VectorIndex>> = Arc::new(tokio::sync::Mutex::new(TfIdfIndex::new()));
        let planner = Arc::new(TaskPlanner::new(planner_client, docs, index));
        let trigger_queue = Arc::new(TriggerQueue::with_identity_resolver());
        let state = Arc::new(AgentState::new());
        let settings = AgentSettings::default();
        let task_manager = Arc::new(TaskManager::new(planner, log_store, Arc::clone(&trigger_queue), Arc::clone(&state), settings.clone(), dir.path().to_path_buf()));
        let cache = Arc::new(CacheManager::new(LlmClient::new(Arc::new(EchoProvider)), "echo", CacheConfig::default()));
        let event_stream = Arc::new(EventStream::with_defaults(None, Arc::new(NoopSummarizer)));
        let narrator = Arc::new(Narrator::new(Arc::new(LlmClient::new(Arc::new(EchoProvider)))));
        let loop_detection = LoopDetectionService::new(Arc::new(LlmClient::new(Arc::new(EchoProvider))), Arc::new(crate::loop_detection::LoopDetectionConfig::default()));
        let context_engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());

        let agent_loop = AgentLoop::new(AgentLoopDeps {
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
            platform: "linux".to_string(),
        });

        let trigger = Trigger::new(Utc::now(), 1, "chat", "say hi");
        let result = agent_loop.react(trigger).await;
        assert!(matches!(result, Err(AgentLoopError::ActionNotFound(_))));
    }
}
