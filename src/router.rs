//! Action Router (spec §4.6): assembles a mode-scoped candidate list and
//! asks the LLM Gateway to pick one action name plus parameters.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::action::registry::ActionRegistry;
use crate::action::VisibilityMode;
use crate::config::DEFAULT_PARSE_RETRIES;
use crate::llm::{LlmClient, LlmError};
use crate::utils::strip_code_fence;

/// Fixed allowlist of actions available outside any running task.
const CONVERSATION_ALLOWLIST: &[&str] = &["send message", "ask question", "start task", "update todos", "end task", "ignore"];

/// Actions never offered once inside a task (spec §4.6's in-task denylist).
const IN_TASK_DENYLIST: &[&str] = &["ignore"];

/// Actions excluded from the simple-task candidate set (spec §4.6).
const TODO_MANAGEMENT_ACTIONS: &[&str] = &["update todos"];

/// Which routing mode the Agent Loop is currently in, driving candidate
/// assembly per spec §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// No task is running; the caller is conversing with the agent.
    Conversation,
    /// A task is running, CLI surface.
    InTaskCli,
    /// A task is running, GUI surface.
    InTaskGui,
    /// A task is running but marked "simple" (no todo-management actions).
    SimpleTask,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("router failed to select a valid action after {0} attempts: {1}")]
    SelectionFailed(u32, String),
}

/// The LLM's routing decision: an action name (empty means "create a new
/// action") plus its parameters.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RoutedAction {
    pub action_name: String,
    #[serde(default)]
    pub parameters: Value,
}

/// Picks the next action to run, given the current mode and a query
/// describing what the caller wants to do.
pub struct ActionRouter {
    client: Arc<LlmClient>,
    registry: Arc<ActionRegistry>,
    semantic_k: usize,
}

impl ActionRouter {
    #[must_use]
    pub fn new(client: Arc<LlmClient>, registry: Arc<ActionRegistry>) -> Self {
        Self { client, registry, semantic_k: 5 }
    }

    /// Assembles the candidate action name list for `mode` given
    /// `action_query`, per spec §4.6.
    pub fn candidates(&self, mode: RouterMode, action_query: &str) -> Vec<String> {
        match mode {
            RouterMode::Conversation => CONVERSATION_ALLOWLIST.iter().map(|s| (*s).to_string()).collect(),
            RouterMode::InTaskCli => self.in_task_candidates(action_query, VisibilityMode::Cli, &[]),
            RouterMode::InTaskGui => self
                .registry
                .search(action_query, self.semantic_k)
                .into_iter()
                .filter(|name| self.registry.get(name).is_some_and(|a| a.is_visible_for(VisibilityMode::Gui)))
                .collect(),
            RouterMode::SimpleTask => self.in_task_candidates(action_query, VisibilityMode::Cli, TODO_MANAGEMENT_ACTIONS),
        }
    }

    fn in_task_candidates(&self, action_query: &str, visibility: VisibilityMode, extra_denylist: &[&str]) -> Vec<String> {
        let mut names: Vec<String> = CONVERSATION_ALLOWLIST.iter().map(|s| (*s).to_string()).collect();
        for name in self.registry.search(action_query, self.semantic_k) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.retain(|name| {
            !IN_TASK_DENYLIST.contains(&name.as_str())
                && !extra_denylist.contains(&name.as_str())
                && self.registry.get(name).map_or(true, |a| a.is_visible_for(visibility))
        });
        names
    }

    /// Asks the LLM to pick one action (plus parameters) from the candidate
    /// set for `mode`, retrying on parse failure or an invalid
    /// `action_name` up to `DEFAULT_PARSE_RETRIES` times. An empty
    /// `action_name` is a valid "create a new action" signal and is never
    /// retried.
    ///
    /// # Errors
    ///
    /// Returns `RouterError::SelectionFailed` if no valid selection is made
    /// within the retry budget, or `RouterError::Llm` if the call itself
    /// fails.
    #[tracing::instrument(skip(self, action_query))]
    pub async fn route(&self, mode: RouterMode, action_query: &str) -> Result<RoutedAction, RouterError> {
        let candidates = self.candidates(mode, action_query);
        let system_prompt = format!(
            "You are an action router. Choose exactly one action from this list: {}. \
             If none fit, respond with an empty action_name to signal a new action should be created. \
             Respond with JSON only: {{\"action_name\": string, \"parameters\": object}}.",
            candidates.join(", ")
        );

        let mut user_prompt = action_query.to_string();
        let mut last_error = String::new();
        for attempt in 0..=DEFAULT_PARSE_RETRIES {
            let response = self.client.generate(&system_prompt, &user_prompt).await?;
            let cleaned = strip_code_fence(&response.content);
            match serde_json::from_str::<RoutedAction>(&cleaned) {
                Ok(routed) if routed.action_name.is_empty() || candidates.iter().any(|c| c == &routed.action_name) => {
                    return Ok(routed);
                }
                Ok(routed) => {
                    last_error = format!("action_name {:?} is not among the candidates", routed.action_name);
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            warn!(attempt, error = %last_error, "router selection invalid, retrying");
            user_prompt = format!("{action_query}\n\nYour previous response was invalid ({last_error}). Respond with JSON only, choosing from the candidate list.");
        }
        Err(RouterError::SelectionFailed(DEFAULT_PARSE_RETRIES + 1, last_error))
    }
}
