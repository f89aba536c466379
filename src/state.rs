//! Process-wide agent state: the single active task's budget counters.
//!
//! Single-user, single-process runtime — there is exactly one
//! [`AgentProperties`] in flight at a time, owned by the Agent Loop and
//! reset by the Task Manager at task boundaries.

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::{AgentSettings, MIN_MAX_ACTIONS_PER_TASK, MIN_MAX_TOKENS_PER_TASK};

/// Per-task budget counters the Agent Loop enforces at the top of every
/// iteration (spec: at most one `AgentProperties` active at a time).
#[derive(Debug, Clone)]
pub struct AgentProperties {
    /// Id of the task these counters belong to.
    pub current_task_id: String,
    /// Index of the step currently executing within that task.
    pub current_step_index: usize,
    /// Number of actions executed so far within the task.
    pub action_count: u32,
    /// Budget ceiling on actions per task (floor: [`MIN_MAX_ACTIONS_PER_TASK`]).
    pub max_actions_per_task: u32,
    /// Cumulative tokens spent so far within the task.
    pub token_count: u64,
    /// Budget ceiling on tokens per task (floor: [`MIN_MAX_TOKENS_PER_TASK`]).
    pub max_tokens_per_task: u64,
}

impl AgentProperties {
    /// Creates budget counters for a newly started task, applying the
    /// configured ceilings (already floor-clamped by `AgentSettings::validated`).
    #[must_use]
    pub fn new(task_id: impl Into<String>, settings: &AgentSettings) -> Self {
        let mut max_actions = settings.max_actions_per_task();
        if max_actions < MIN_MAX_ACTIONS_PER_TASK {
            warn!(
                max_actions,
                "max_actions_per_task below minimum, resetting to floor"
            );
            max_actions = MIN_MAX_ACTIONS_PER_TASK;
        }
        let mut max_tokens = settings.max_token_per_task();
        if max_tokens < MIN_MAX_TOKENS_PER_TASK {
            warn!(
                max_tokens,
                "max_token_per_task below minimum, resetting to floor"
            );
            max_tokens = MIN_MAX_TOKENS_PER_TASK;
        }

        Self {
            current_task_id: task_id.into(),
            current_step_index: 0,
            action_count: 0,
            max_actions_per_task: max_actions,
            token_count: 0,
            max_tokens_per_task: max_tokens,
        }
    }

    /// Fraction of the action budget consumed, in `[0.0, +inf)`.
    #[must_use]
    pub fn action_fraction(&self) -> f64 {
        f64::from(self.action_count) / f64::from(self.max_actions_per_task)
    }

    /// Fraction of the token budget consumed, in `[0.0, +inf)`.
    #[must_use]
    pub fn token_fraction(&self) -> f64 {
        self.token_count as f64 / self.max_tokens_per_task as f64
    }

    /// True once either budget has reached or exceeded 100%.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.action_fraction() >= crate::config::BUDGET_CANCEL_FRACTION
            || self.token_fraction() >= crate::config::BUDGET_CANCEL_FRACTION
    }

    /// True once either budget has crossed the warn threshold but not yet
    /// the cancel threshold.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        !self.is_exhausted()
            && (self.action_fraction() >= crate::config::BUDGET_WARN_FRACTION
                || self.token_fraction() >= crate::config::BUDGET_WARN_FRACTION)
    }
}

/// Authoritative runtime state for the agent process.
///
/// `current_task_id`/`gui_mode` are read by the Context Engine and Trigger
/// Queue session-reconciliation prompt; `agent_properties` is mutated only
/// by the Agent Loop and Task Manager.
#[derive(Debug)]
pub struct AgentState {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    current_task_id: Option<String>,
    gui_mode: bool,
    agent_properties: Option<AgentProperties>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    /// Creates empty process state (no active task).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Starts tracking a new active task, replacing any prior counters.
    pub async fn begin_task(&self, task_id: impl Into<String>, settings: &AgentSettings) {
        let task_id = task_id.into();
        let mut inner = self.inner.write().await;
        inner.current_task_id = Some(task_id.clone());
        inner.agent_properties = Some(AgentProperties::new(task_id, settings));
    }

    /// Clears the active task and its budget counters (task terminal state).
    pub async fn end_task(&self) {
        let mut inner = self.inner.write().await;
        inner.current_task_id = None;
        inner.agent_properties = None;
    }

    /// Returns the id of the currently active task, if any.
    pub async fn current_task_id(&self) -> Option<String> {
        self.inner.read().await.current_task_id.clone()
    }

    /// Returns a snapshot of the current budget counters, if a task is active.
    pub async fn agent_properties(&self) -> Option<AgentProperties> {
        self.inner.read().await.agent_properties.clone()
    }

    /// Sets GUI-mode flag for the active session.
    pub async fn set_gui_mode(&self, gui_mode: bool) {
        self.inner.write().await.gui_mode = gui_mode;
    }

    /// Returns whether the active session is in GUI mode.
    pub async fn gui_mode(&self) -> bool {
        self.inner.read().await.gui_mode
    }

    /// Increments the action counter by one, returning the post-increment
    /// snapshot.
    pub async fn bump_action_count(&self) -> Option<AgentProperties> {
        let mut inner = self.inner.write().await;
        if let Some(props) = inner.agent_properties.as_mut() {
            props.action_count += 1;
        }
        inner.agent_properties.clone()
    }

    /// Adds `tokens` to the cumulative token counter, returning the
    /// post-increment snapshot.
    pub async fn add_tokens(&self, tokens: u64) -> Option<AgentProperties> {
        let mut inner = self.inner.write().await;
        if let Some(props) = inner.agent_properties.as_mut() {
            props.token_count += tokens;
        }
        inner.agent_properties.clone()
    }

    /// Sets the current step index within the active task.
    pub async fn set_current_step_index(&self, index: usize) {
        let mut inner = self.inner.write().await;
        if let Some(props) = inner.agent_properties.as_mut() {
            props.current_step_index = index;
        }
    }
}

/// Shared handle to the process-wide agent state.
pub type SharedAgentState = Arc<AgentState>;

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AgentSettings {
        AgentSettings {
            max_actions_per_task: Some(5),
            max_token_per_task: Some(100_000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn begin_task_initializes_budget_counters() {
        let state = AgentState::new();
        state.begin_task("task-1", &settings()).await;
        let props = state.agent_properties().await.expect("task active");
        assert_eq!(props.current_task_id, "task-1");
        assert_eq!(props.action_count, 0);
        assert_eq!(props.max_actions_per_task, 5);
    }

    #[tokio::test]
    async fn bump_action_count_increments() {
        let state = AgentState::new();
        state.begin_task("task-1", &settings()).await;
        state.bump_action_count().await;
        state.bump_action_count().await;
        let props = state.agent_properties().await.expect("task active");
        assert_eq!(props.action_count, 2);
    }

    #[tokio::test]
    async fn end_task_clears_state() {
        let state = AgentState::new();
        state.begin_task("task-1", &settings()).await;
        state.end_task().await;
        assert!(state.agent_properties().await.is_none());
        assert!(state.current_task_id().await.is_none());
    }

    #[test]
    fn is_exhausted_trips_at_action_ceiling() {
        let mut props = AgentProperties::new("t", &settings());
        props.action_count = 5;
        assert!(props.is_exhausted());
    }

    #[test]
    fn is_warning_trips_at_eighty_percent() {
        let mut props = AgentProperties::new("t", &settings());
        props.action_count = 4; // 4/5 = 0.8
        assert!(props.is_warning());
        assert!(!props.is_exhausted());
    }

    #[test]
    fn new_enforces_floors_when_settings_below_minimum() {
        let settings = AgentSettings {
            max_actions_per_task: Some(1),
            max_token_per_task: Some(10),
            ..Default::default()
        };
        let props = AgentProperties::new("t", &settings);
        assert_eq!(props.max_actions_per_task, MIN_MAX_ACTIONS_PER_TASK);
        assert_eq!(props.max_tokens_per_task, MIN_MAX_TOKENS_PER_TASK);
    }
}
