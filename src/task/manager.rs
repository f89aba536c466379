//! Task Manager (spec §4.5): owns the single active [`Task`], drives its
//! step state machine, and keeps the Trigger Queue and budget counters in
//! sync with task lifecycle events. Grounded on
//! `original_source/core/task/task_manager.py`'s `create_task`/
//! `update_task_plan`/`start_task`/`start_next_step`/`mark_task_*` surface.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::AgentSettings;
use crate::state::AgentState;
use crate::storage::AgentLogStore;
use crate::task::planner::{PlannerError, TaskPlanner};
use crate::task::{Step, StepStatus, Task, TaskStatus};
use crate::trigger::{Trigger, TriggerQueue};
use crate::utils::slugify_with_suffix;

#[derive(Debug, Error)]
pub enum TaskManagerError {
    #[error("planner error: {0}")]
    Planner(#[from] PlannerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no active task")]
    NoActiveTask,
    #[error("a task is already active: {0}")]
    TaskAlreadyActive(String),
}

/// Drives the lifecycle of the single active [`Task`].
pub struct TaskManager {
    planner: Arc<TaskPlanner>,
    log_store: Arc<AgentLogStore>,
    trigger_queue: Arc<TriggerQueue>,
    state: Arc<AgentState>,
    settings: AgentSettings,
    workspace_root: PathBuf,
    active_task: Mutex<Option<Task>>,
}

impl TaskManager {
    #[must_use]
    pub fn new(
        planner: Arc<TaskPlanner>,
        log_store: Arc<AgentLogStore>,
        trigger_queue: Arc<TriggerQueue>,
        state: Arc<AgentState>,
        settings: AgentSettings,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            planner,
            log_store,
            trigger_queue,
            state,
            settings,
            workspace_root,
            active_task: Mutex::new(None),
        }
    }

    /// Returns a clone of the active task, if any.
    pub async fn current_task(&self) -> Option<Task> {
        self.active_task.lock().await.clone()
    }

    /// Plans and registers a new task, provisioning its temp workspace.
    /// Does not enqueue a trigger — call [`Self::start_task`] for that.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::TaskAlreadyActive` if one is already
    /// running (single-active-task invariant, spec §5), or `Io`/`Planner`
    /// errors from provisioning or planning.
    pub async fn create_task(&self, name: &str, instruction: &str) -> Result<String, TaskManagerError> {
        {
            let active = self.active_task.lock().await;
            if let Some(existing) = active.as_ref() {
                return Err(TaskManagerError::TaskAlreadyActive(existing.id.clone()));
            }
        }

        let task_id = slugify_with_suffix(name);
        let temp_dir = self.workspace_root.join("tmp").join(&task_id);
        fs::create_dir_all(&temp_dir)?;

        let plan = match self.planner.plan_task(name, instruction).await {
            Ok(plan) => plan,
            Err(err) => {
                warn!(%err, "task planner failed, using fallback plan");
                self.planner.fallback_plan(name, instruction)
            }
        };

        let mut task = Task {
            id: task_id.clone(),
            name: name.to_string(),
            instruction: instruction.to_string(),
            steps: plan.into_steps(),
            todos: Vec::new(),
            temp_dir: temp_dir.to_string_lossy().to_string(),
            created_at: Utc::now(),
            status: TaskStatus::Running,
        };
        task.sync_todos_from_steps();

        self.log_task(&task);
        *self.active_task.lock().await = Some(task);
        self.state.begin_task(task_id.clone(), &self.settings).await;
        info!(task_id = %task_id, "task created");

        Ok(task_id)
    }

    /// Re-plans the active task, preserving its id and temp dir, and
    /// ensures exactly one step ends up `Current`.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running, or
    /// `Planner` if re-planning fails outright.
    pub async fn update_task_plan(&self, progress_summary: &str) -> Result<(), TaskManagerError> {
        let mut active = self.active_task.lock().await;
        let task = active.as_mut().ok_or(TaskManagerError::NoActiveTask)?;

        let plan = self.planner.update_plan(&task.name, &task.instruction, &task.steps, progress_summary).await?;
        let mut steps = plan.into_steps();
        ensure_single_current(&mut steps);
        task.steps = steps;
        task.sync_todos_from_steps();
        self.log_task(task);
        Ok(())
    }

    /// Enqueues a trigger for the active task's current step.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running.
    pub async fn start_task(&self) -> Result<(), TaskManagerError> {
        let active = self.active_task.lock().await;
        let task = active.as_ref().ok_or(TaskManagerError::NoActiveTask)?;
        let description = task.current_step().map(|s| s.action_instruction.clone()).unwrap_or_else(|| task.instruction.clone());
        self.trigger_queue.put(Trigger::new(Utc::now(), 1, task.id.clone(), description)).await;
        Ok(())
    }

    /// Finalizes the current step as `Completed`, then either promotes the
    /// next pending step (enqueuing a trigger for it) or, if `replan` is
    /// set and no pending step remains, requests a re-plan; with neither a
    /// next step nor a replan, auto-completes the task.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running.
    pub async fn start_next_step(&self, replan: bool) -> Result<(), TaskManagerError> {
        {
            let mut active = self.active_task.lock().await;
            let task = active.as_mut().ok_or(TaskManagerError::NoActiveTask)?;
            if let Some(current) = task.current_step_mut() {
                current.status = StepStatus::Completed;
            }

            let next_index = task.steps.iter().position(|s| s.status == StepStatus::Pending);
            if let Some(index) = next_index {
                task.steps[index].status = StepStatus::Current;
                task.sync_todos_from_steps();
                self.log_task(task);
                let description = task.steps[index].action_instruction.clone();
                let task_id = task.id.clone();
                drop(active);
                self.trigger_queue.put(Trigger::new(Utc::now(), 5, task_id, description)).await;
                return Ok(());
            }

            task.sync_todos_from_steps();
            self.log_task(task);
        }

        if replan {
            self.update_task_plan("previous step completed, no pending steps remain").await?;
            let active = self.active_task.lock().await;
            let task = active.as_ref().ok_or(TaskManagerError::NoActiveTask)?;
            if task.current_step().is_some() {
                let description = task.current_step().expect("checked above").action_instruction.clone();
                let task_id = task.id.clone();
                drop(active);
                self.trigger_queue.put(Trigger::new(Utc::now(), 5, task_id, description)).await;
                return Ok(());
            }
        }

        self.mark_task_completed(None).await
    }

    /// Finalizes the task successfully: the current step is marked
    /// `Completed`, the task is marked `Completed`, pending triggers are
    /// purged, budget counters reset, and the temp dir removed.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running.
    pub async fn mark_task_completed(&self, message: Option<&str>) -> Result<(), TaskManagerError> {
        self.finalize_task(TaskStatus::Completed, StepStatus::Completed, message, true).await
    }

    /// Finalizes the task in error: the current step is marked `Failed`,
    /// the task is marked `Error`. The temp dir is preserved for debugging.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running.
    pub async fn mark_task_error(&self, message: Option<&str>) -> Result<(), TaskManagerError> {
        self.finalize_task(TaskStatus::Error, StepStatus::Failed, message, false).await
    }

    /// Finalizes the task as cancelled: the current step is marked
    /// `Cancelled`, the task is marked `Cancelled`. The temp dir is
    /// preserved for debugging.
    ///
    /// # Errors
    ///
    /// Returns `TaskManagerError::NoActiveTask` if no task is running.
    pub async fn mark_task_cancel(&self, message: Option<&str>) -> Result<(), TaskManagerError> {
        self.finalize_task(TaskStatus::Cancelled, StepStatus::Cancelled, message, false).await
    }

    async fn finalize_task(&self, task_status: TaskStatus, step_status: StepStatus, message: Option<&str>, cleanup_temp_dir: bool) -> Result<(), TaskManagerError> {
        let task_id;
        {
            let mut active = self.active_task.lock().await;
            let task = active.as_mut().ok_or(TaskManagerError::NoActiveTask)?;
            if let Some(current) = task.current_step_mut() {
                current.status = step_status;
                if let Some(message) = message {
                    current.failure_message = Some(message.to_string());
                }
            }
            task.status = task_status;
            task.sync_todos_from_steps();
            self.log_task(task);
            task_id = task.id.clone();

            if cleanup_temp_dir {
                if let Err(err) = fs::remove_dir_all(&task.temp_dir) {
                    warn!(task_id = %task_id, %err, "failed to clean up task temp dir");
                }
            }
        }

        self.trigger_queue.remove_sessions(&[task_id.clone()]).await;
        self.state.end_task().await;
        *self.active_task.lock().await = None;
        info!(task_id = %task_id, status = ?task_status, "task finalized");
        Ok(())
    }

    fn log_task(&self, task: &Task) {
        let steps_json = serde_json::to_value(&task.steps).unwrap_or_default();
        let status = match task.status {
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelled => "cancelled",
        };
        self.log_store.log_task(&task.id, &task.name, &task.instruction, &steps_json, status, None);
    }
}

/// Ensures exactly one step is `Current` after a re-plan: if none is, the
/// first `Pending` step is promoted.
fn ensure_single_current(steps: &mut [Step]) {
    let current_count = steps.iter().filter(|s| s.status == StepStatus::Current).count();
    if current_count == 1 {
        return;
    }
    if current_count > 1 {
        let mut seen_first = false;
        for step in steps.iter_mut().filter(|s| s.status == StepStatus::Current) {
            if seen_first {
                step.status = StepStatus::Pending;
            }
            seen_first = true;
        }
        return;
    }
    if let Some(first_pending) = steps.iter_mut().find(|s| s.status == StepStatus::Pending) {
        first_pending.status = StepStatus::Current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CacheDirective, GenerateResponse, LlmClient, LlmError, LlmProvider, ProviderArchetype};
    use crate::storage::{TaskDocumentStore, TfIdfIndex, VectorIndex};
    use crate::trigger::TriggerQueue;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StaticPlanProvider;

    #[async_trait]
    impl LlmProvider for StaticPlanProvider {
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
                content: r#"{"goal":"g","context":"","steps":[
                    {"step_name":"a","description":"do a","action_instruction":"do a","validation_instruction":"check a"},
                    {"step_name":"b","description":"do b","action_instruction":"do b","validation_instruction":"check b"}
                ]}"#
                .to_string(),
                tokens_used: 5,
                cached_tokens: 0,
                provider_handle: None,
            })
        }
    }

    async fn manager_with_tempdir() -> (TaskManager, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let client = Arc::new(LlmClient::new(Arc::new(StaticPlanProvider)));
        let docs = Arc::new(TaskDocumentStore::new(dir.path()).expect("store"));
        let index: Arc<Mutex<dyn VectorIndex>> = Arc::new(Mutex::new(TfIdfIndex::new()));
        let planner = Arc::new(TaskPlanner::new(client, docs, index));
        let log_store = Arc::new(AgentLogStore::new(dir.path()).expect("log store"));
        let trigger_queue = Arc::new(TriggerQueue::with_identity_resolver());
        let state = Arc::new(AgentState::new());
        let settings = AgentSettings { max_actions_per_task: Some(5), max_token_per_task: Some(100_000), ..Default::default() };
        let manager = TaskManager::new(planner, log_store, trigger_queue, state, settings, dir.path().to_path_buf());
        (manager, dir)
    }

    #[tokio::test]
    async fn create_task_marks_first_step_current_and_begins_budget() {
        let (manager, _dir) = manager_with_tempdir().await;
        let task_id = manager.create_task("demo", "do the demo").await.expect("create");
        let task = manager.current_task().await.expect("active");
        assert_eq!(task.id, task_id);
        assert_eq!(task.steps[0].status, StepStatus::Current);
        assert_eq!(task.steps[1].status, StepStatus::Pending);
        assert!(manager.state.agent_properties().await.is_some());
    }

    #[tokio::test]
    async fn create_task_rejects_second_task_while_one_is_active() {
        let (manager, _dir) = manager_with_tempdir().await;
        manager.create_task("demo", "do the demo").await.expect("create");
        let result = manager.create_task("other", "do other").await;
        assert!(matches!(result, Err(TaskManagerError::TaskAlreadyActive(_))));
    }

    #[tokio::test]
    async fn start_next_step_promotes_next_pending_step() {
        let (manager, _dir) = manager_with_tempdir().await;
        manager.create_task("demo", "do the demo").await.expect("create");
        manager.start_next_step(false).await.expect("advance");
        let task = manager.current_task().await.expect("active");
        assert_eq!(task.steps[0].status, StepStatus::Completed);
        assert_eq!(task.steps[1].status, StepStatus::Current);
    }

    #[tokio::test]
    async fn start_next_step_auto_completes_task_after_last_step() {
        let (manager, _dir) = manager_with_tempdir().await;
        manager.create_task("demo", "do the demo").await.expect("create");
        manager.start_next_step(false).await.expect("advance to step b");
        manager.start_next_step(false).await.expect("advance past last step");
        assert!(manager.current_task().await.is_none());
    }

    #[tokio::test]
    async fn mark_task_completed_clears_active_task_and_resets_budget() {
        let (manager, _dir) = manager_with_tempdir().await;
        manager.create_task("demo", "do the demo").await.expect("create");
        manager.mark_task_completed(None).await.expect("complete");
        assert!(manager.current_task().await.is_none());
        assert!(manager.state.agent_properties().await.is_none());
    }

    #[tokio::test]
    async fn mark_task_error_preserves_failure_message() {
        let (manager, _dir) = manager_with_tempdir().await;
        manager.create_task("demo", "do the demo").await.expect("create");
        manager.mark_task_error(Some("boom")).await.expect("error");
        assert!(manager.current_task().await.is_none());
    }

    #[test]
    fn ensure_single_current_promotes_first_pending_when_none_current() {
        let mut steps = vec![
            Step { step_index: 0, step_name: "a".into(), description: "a".into(), action_instruction: "a".into(), validation_instruction: "a".into(), status: StepStatus::Completed, failure_message: None },
            Step { step_index: 1, step_name: "b".into(), description: "b".into(), action_instruction: "b".into(), validation_instruction: "b".into(), status: StepStatus::Pending, failure_message: None },
        ];
        ensure_single_current(&mut steps);
        assert_eq!(steps[1].status, StepStatus::Current);
    }

    #[test]
    fn ensure_single_current_demotes_extra_current_steps() {
        let mut steps = vec![
            Step { step_index: 0, step_name: "a".into(), description: "a".into(), action_instruction: "a".into(), validation_instruction: "a".into(), status: StepStatus::Current, failure_message: None },
            Step { step_index: 1, step_name: "b".into(), description: "b".into(), action_instruction: "b".into(), validation_instruction: "b".into(), status: StepStatus::Current, failure_message: None },
        ];
        ensure_single_current(&mut steps);
        let current_count = steps.iter().filter(|s| s.status == StepStatus::Current).count();
        assert_eq!(current_count, 1);
        assert_eq!(steps[0].status, StepStatus::Current);
        assert_eq!(steps[1].status, StepStatus::Pending);
    }
}
