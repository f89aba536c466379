//! Task Planner (spec §4.5): turns a task name/instruction into an ordered
//! plan, using top-k semantically similar task documents as few-shot
//! examples. Grounded on `original_source/core/task/task_planner.py`'s
//! `plan_task`/`update_plan`/`ask_plan`/`_fallback_plan`/
//! `_retrieve_taskdoc_fewshots` shape, re-expressed against this crate's
//! `LlmClient`/`storage` types instead of a bespoke LLM wrapper.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::DEFAULT_PARSE_RETRIES;
use crate::llm::{LlmClient, LlmError};
use crate::storage::{TaskDocumentStore, VectorIndex};
use crate::task::{Step, StepStatus};
use crate::utils::strip_code_fence;

#[derive(Debug, Error)]
pub enum PlannerError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("planner returned invalid output after {0} attempts: {1}")]
    InvalidOutput(u32, String),
}

/// Raw planner output, deserialized directly from the LLM's JSON response.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerOutput {
    pub goal: String,
    #[serde(default)]
    pub inputs_params: serde_json::Value,
    #[serde(default)]
    pub context: String,
    pub steps: Vec<PlannerStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlannerStep {
    pub step_name: String,
    pub description: String,
    pub action_instruction: String,
    pub validation_instruction: String,
}

impl PlannerOutput {
    /// Converts raw planner steps into `Step`s, assigning indices and
    /// marking the first one `Current` (spec §4.5: `create_task` marks the
    /// first pending step as current if none is).
    #[must_use]
    pub fn into_steps(self) -> Vec<Step> {
        self.steps
            .into_iter()
            .enumerate()
            .map(|(i, s)| Step {
                step_index: i,
                step_name: s.step_name,
                description: s.description,
                action_instruction: s.action_instruction,
                validation_instruction: s.validation_instruction,
                status: if i == 0 { StepStatus::Current } else { StepStatus::Pending },
                failure_message: None,
            })
            .collect()
    }
}

/// Plans and re-plans tasks, backed by an LLM and a few-shot task-document
/// index.
pub struct TaskPlanner {
    client: Arc<LlmClient>,
    task_documents: Arc<TaskDocumentStore>,
    index: Arc<Mutex<dyn VectorIndex>>,
    fewshot_k: usize,
}

impl TaskPlanner {
    #[must_use]
    pub fn new(client: Arc<LlmClient>, task_documents: Arc<TaskDocumentStore>, index: Arc<Mutex<dyn VectorIndex>>) -> Self {
        Self {
            client,
            task_documents,
            index,
            fewshot_k: 1,
        }
    }

    /// Produces an initial plan for a new task.
    ///
    /// # Errors
    ///
    /// Returns `PlannerError::InvalidOutput` if the LLM never returns a
    /// schema-valid plan within `DEFAULT_PARSE_RETRIES + 1` attempts; the
    /// caller should fall back to [`Self::fallback_plan`] rather than abort.
    pub async fn plan_task(&self, name: &str, instruction: &str) -> Result<PlannerOutput, PlannerError> {
        let fewshots = self.retrieve_fewshots(instruction).await;
        let system_prompt = "You are a task planner. Given a task name and instruction, produce a JSON object \
            with fields goal, inputs_params, context, and steps (a list of objects with step_name, \
            description, action_instruction, validation_instruction). Respond with JSON only.";
        let mut user_prompt = format!("Task name: {name}\nInstruction: {instruction}");
        if !fewshots.is_empty() {
            user_prompt.push_str("\n\nSimilar past tasks for reference:\n");
            user_prompt.push_str(&fewshots.join("\n---\n"));
        }

        self.generate_with_retries(system_prompt, &user_prompt).await
    }

    /// Re-plans an existing task, given its current steps and a summary of
    /// what has happened since (typically the event stream's head summary).
    ///
    /// # Errors
    ///
    /// Returns `PlannerError::InvalidOutput` if no schema-valid plan is
    /// produced within the retry budget.
    pub async fn update_plan(&self, name: &str, instruction: &str, current_steps: &[Step], progress_summary: &str) -> Result<PlannerOutput, PlannerError> {
        let system_prompt = "You are a task planner revising an in-progress plan. Given the task, its current \
            steps, and a progress summary, produce an updated JSON plan with the same schema as before \
            (goal, inputs_params, context, steps). You may reorder, add, or drop steps. Respond with JSON only.";
        let steps_json = serde_json::to_string(current_steps).unwrap_or_default();
        let user_prompt = format!("Task name: {name}\nInstruction: {instruction}\nCurrent steps: {steps_json}\nProgress: {progress_summary}");

        self.generate_with_retries(system_prompt, &user_prompt).await
    }

    /// Asks a free-form question about the plan's intent or a step's
    /// rationale, without requiring a structured response. Used by the
    /// Agent Loop to get a human-readable explanation on replan requests.
    ///
    /// # Errors
    ///
    /// Returns `PlannerError::Llm` if the call itself fails; unlike
    /// `plan_task`/`update_plan` this has no schema to validate.
    pub async fn ask_plan(&self, name: &str, instruction: &str, question: &str) -> Result<String, PlannerError> {
        let system_prompt = "You are a task planner. Answer the question about this task's plan concisely.";
        let user_prompt = format!("Task name: {name}\nInstruction: {instruction}\nQuestion: {question}");
        let response = self.client.generate(system_prompt, &user_prompt).await?;
        Ok(response.content)
    }

    /// A single-step plan used when the LLM never produces valid JSON,
    /// guaranteeing `create_task` always has something to run.
    #[must_use]
    pub fn fallback_plan(&self, name: &str, instruction: &str) -> PlannerOutput {
        PlannerOutput {
            goal: instruction.to_string(),
            inputs_params: json!({}),
            context: String::new(),
            steps: vec![PlannerStep {
                step_name: format!("Complete {name}"),
                description: instruction.to_string(),
                action_instruction: instruction.to_string(),
                validation_instruction: "Confirm the instruction was carried out.".to_string(),
            }],
        }
    }

    async fn generate_with_retries(&self, system_prompt: &str, user_prompt: &str) -> Result<PlannerOutput, PlannerError> {
        let mut last_error = String::new();
        let mut prompt = user_prompt.to_string();
        for attempt in 0..=DEFAULT_PARSE_RETRIES {
            let response = self.client.generate(system_prompt, &prompt).await?;
            let cleaned = strip_code_fence(&response.content);
            match serde_json::from_str::<PlannerOutput>(&cleaned) {
                Ok(output) if !output.steps.is_empty() => return Ok(output),
                Ok(_) => {
                    last_error = "plan had zero steps".to_string();
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }
            warn!(attempt, error = %last_error, "planner output failed validation, retrying");
            prompt = format!("{user_prompt}\n\nYour previous response was invalid ({last_error}). Respond with JSON only, matching the schema exactly.");
        }
        Err(PlannerError::InvalidOutput(DEFAULT_PARSE_RETRIES + 1, last_error))
    }

    async fn retrieve_fewshots(&self, instruction: &str) -> Vec<String> {
        let ids = self.index.lock().await.search(instruction, self.fewshot_k);
        if ids.is_empty() {
            return Vec::new();
        }
        match self.task_documents.load_all() {
            Ok(documents) => documents.into_iter().filter(|(id, _)| ids.contains(id)).map(|(_, text)| text).collect(),
            Err(err) => {
                warn!(%err, "failed to load task documents for few-shot retrieval");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CacheDirective, GenerateResponse, ProviderArchetype};
    use crate::storage::TfIdfIndex;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::llm::LlmProvider for ScriptedProvider {
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
            Ok(GenerateResponse { content, tokens_used: 10, cached_tokens: 0, provider_handle: None })
        }
    }

    fn planner_with_responses(responses: Vec<&str>) -> TaskPlanner {
        let client = Arc::new(LlmClient::new(Arc::new(ScriptedProvider {
            responses: std::sync::Mutex::new(responses.into_iter().map(str::to_string).collect()),
        })));
        let dir = tempdir().expect("tempdir");
        let docs = Arc::new(TaskDocumentStore::new(dir.path()).expect("store"));
        let index: Arc<Mutex<dyn VectorIndex>> = Arc::new(Mutex::new(TfIdfIndex::new()));
        TaskPlanner::new(client, docs, index)
    }

    #[tokio::test]
    async fn plan_task_parses_valid_json_on_first_try() {
        let planner = planner_with_responses(vec![
            r#"{"goal":"ship it","context":"","steps":[{"step_name":"write","description":"write code","action_instruction":"write","validation_instruction":"check"}]}"#,
        ]);
        let output = planner.plan_task("ship", "ship the feature").await.expect("should parse");
        assert_eq!(output.goal, "ship it");
        assert_eq!(output.steps.len(), 1);
    }

    #[tokio::test]
    async fn plan_task_retries_then_succeeds_on_malformed_first_response() {
        let planner = planner_with_responses(vec![
            "not json at all",
            r#"{"goal":"ship it","context":"","steps":[{"step_name":"write","description":"write code","action_instruction":"write","validation_instruction":"check"}]}"#,
        ]);
        let output = planner.plan_task("ship", "ship the feature").await.expect("should eventually parse");
        assert_eq!(output.goal, "ship it");
    }

    #[tokio::test]
    async fn plan_task_exhausts_retries_and_errors() {
        let planner = planner_with_responses(vec!["nope", "still nope", "nope again", "nope once more"]);
        let result = planner.plan_task("ship", "ship the feature").await;
        assert!(matches!(result, Err(PlannerError::InvalidOutput(_, _))));
    }

    #[tokio::test]
    async fn fallback_plan_always_has_one_step() {
        let planner = planner_with_responses(vec![]);
        let fallback = planner.fallback_plan("ship", "ship the feature");
        assert_eq!(fallback.steps.len(), 1);
        assert_eq!(fallback.goal, "ship the feature");
    }

    #[test]
    fn into_steps_marks_only_first_step_current() {
        let output = PlannerOutput {
            goal: "g".into(),
            inputs_params: json!({}),
            context: String::new(),
            steps: vec![
                PlannerStep { step_name: "a".into(), description: "a".into(), action_instruction: "a".into(), validation_instruction: "a".into() },
                PlannerStep { step_name: "b".into(), description: "b".into(), action_instruction: "b".into(), validation_instruction: "b".into() },
            ],
        };
        let steps = output.into_steps();
        assert_eq!(steps[0].status, StepStatus::Current);
        assert_eq!(steps[1].status, StepStatus::Pending);
    }
}
