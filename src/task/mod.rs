//! Hierarchical task/todo state machine (spec §3, §4.5).
//!
//! Resolves the Task/Step vs. Task/Todo duplication in the original source
//! (`core/task/task.py`'s simplified `todos` list vs.
//! `core/task/task_manager.py`'s step-based planner output, see
//! `SPEC_FULL.md` §3) by keeping both on one [`Task`]: `steps` is the
//! authoritative planner output the Task Manager mutates; `todos` is a
//! derived checklist kept in lockstep for anything reading the todo view.

pub mod manager;
pub mod planner;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a single todo checklist item (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

/// One entry of a task's UI-facing checklist, derived from `steps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    pub active_form: String,
    pub status: TodoStatus,
}

/// Status of a single planner step (spec §4.5's state machine: only
/// `Pending` may become `Current`; only `Current` may become terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Current,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

/// One step of a task's plan, as produced by the Task Planner (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_index: usize,
    pub step_name: String,
    pub description: String,
    pub action_instruction: String,
    pub validation_instruction: String,
    pub status: StepStatus,
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// Overall lifecycle status of a [`Task`] (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Completed,
    Error,
    Paused,
    Cancelled,
}

/// A running unit of work the Agent Loop drives to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub instruction: String,
    pub steps: Vec<Step>,
    pub todos: Vec<TodoItem>,
    pub temp_dir: String,
    pub created_at: DateTime<Utc>,
    pub status: TaskStatus,
}

impl Task {
    /// Rebuilds `todos` from `steps`, one todo per step: `Current` collapses
    /// to `InProgress`, any terminal status collapses to `Completed`,
    /// `content`/`active_form` come from the step's
    /// `description`/`step_name` (spec §3's Task/Step resolution).
    pub fn sync_todos_from_steps(&mut self) {
        self.todos = self
            .steps
            .iter()
            .map(|step| TodoItem {
                content: step.description.clone(),
                active_form: step.step_name.clone(),
                status: match step.status {
                    StepStatus::Pending => TodoStatus::Pending,
                    StepStatus::Current => TodoStatus::InProgress,
                    StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled => {
                        TodoStatus::Completed
                    }
                },
            })
            .collect();
    }

    /// The step currently `Current`, if any.
    #[must_use]
    pub fn current_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.status == StepStatus::Current)
    }

    #[must_use]
    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.status == StepStatus::Current)
    }

    /// Returns the todo the agent should be working on: the one
    /// `in_progress`, else the first `pending`, else `None` (spec §3's
    /// `get_current_todo`, independent of the step machine).
    #[must_use]
    pub fn get_current_todo(&self) -> Option<&TodoItem> {
        self.todos
            .iter()
            .find(|t| t.status == TodoStatus::InProgress)
            .or_else(|| self.todos.iter().find(|t| t.status == TodoStatus::Pending))
    }

    #[must_use]
    pub fn all_todos_completed(&self) -> bool {
        !self.todos.is_empty() && self.todos.iter().all(|t| t.status == TodoStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(index: usize, status: StepStatus) -> Step {
        Step {
            step_index: index,
            step_name: format!("step-{index}"),
            description: format!("do thing {index}"),
            action_instruction: "do it".into(),
            validation_instruction: "check it".into(),
            status,
            failure_message: None,
        }
    }

    fn task_with_steps(steps: Vec<Step>) -> Task {
        let mut task = Task {
            id: "t1".into(),
            name: "demo".into(),
            instruction: "do stuff".into(),
            steps,
            todos: vec![],
            temp_dir: "/tmp/t1".into(),
            created_at: Utc::now(),
            status: TaskStatus::Running,
        };
        task.sync_todos_from_steps();
        task
    }

    #[test]
    fn sync_todos_maps_current_to_in_progress_and_terminal_to_completed() {
        let task = task_with_steps(vec![
            step(0, StepStatus::Completed),
            step(1, StepStatus::Current),
            step(2, StepStatus::Pending),
        ]);
        assert_eq!(task.todos[0].status, TodoStatus::Completed);
        assert_eq!(task.todos[1].status, TodoStatus::InProgress);
        assert_eq!(task.todos[2].status, TodoStatus::Pending);
    }

    #[test]
    fn get_current_todo_prefers_in_progress_then_first_pending_then_none() {
        let in_progress = task_with_steps(vec![step(0, StepStatus::Current), step(1, StepStatus::Pending)]);
        assert_eq!(in_progress.get_current_todo().unwrap().status, TodoStatus::InProgress);

        let pending_only = task_with_steps(vec![step(0, StepStatus::Completed), step(1, StepStatus::Pending)]);
        assert_eq!(pending_only.get_current_todo().unwrap().content, "do thing 1");

        let all_done = task_with_steps(vec![step(0, StepStatus::Completed)]);
        assert!(all_done.get_current_todo().is_none());
    }

    #[test]
    fn all_todos_completed_is_false_when_empty() {
        let task = task_with_steps(vec![]);
        assert!(!task.all_todos_completed());
    }

    #[test]
    fn step_status_terminal_classification() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(StepStatus::Cancelled.is_terminal());
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Current.is_terminal());
    }
}
