//! Action Executor (spec §4.4): runs atomic action bodies as sandboxed
//! subprocesses, sequences divisible actions, runs the post-execution
//! observer retry loop, and persists run history.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use crate::action::registry::ActionRegistry;
use crate::action::{Action, ActionType, RunStatus};
use crate::sandbox::SandboxManager;
use crate::storage::AgentLogStore;
use crate::utils::{extract_last_json, strip_ansi};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("action not found: {0}")]
    ActionNotFound(String),
    #[error("sandbox error: {0}")]
    Sandbox(#[from] anyhow::Error),
    #[error("execution cancelled")]
    Cancelled,
}

/// One action run's structured result, matching the executor-to-action
/// protocol's success/failure shapes.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub output: Value,
}

/// Runs Actions against a single sandbox, tracking in-flight runs so a
/// shutdown can cancel everything still executing.
pub struct ActionExecutor {
    sandbox: SandboxManager,
    registry: Arc<ActionRegistry>,
    log_store: Arc<AgentLogStore>,
    in_flight: StdMutex<HashMap<String, CancellationToken>>,
}

impl ActionExecutor {
    #[must_use]
    pub fn new(sandbox: SandboxManager, registry: Arc<ActionRegistry>, log_store: Arc<AgentLogStore>) -> Self {
        Self {
            sandbox,
            registry,
            log_store,
            in_flight: StdMutex::new(HashMap::new()),
        }
    }

    /// Cancels every run still in flight, for use during shutdown.
    pub fn cancel_all(&self) {
        let in_flight = self.in_flight.lock().expect("in_flight lock poisoned");
        for token in in_flight.values() {
            token.cancel();
        }
    }

    /// Executes `action` against `input_data`, dispatching on its
    /// `ActionType`, and logging one history row.
    ///
    /// # Errors
    ///
    /// Returns `ExecutorError` if the sandbox exec fails outright (not to be
    /// confused with the action body itself returning a non-zero exit code,
    /// which surfaces as an `{error, ...}` payload with `Ok`).
    #[instrument(skip(self, input_data), fields(action = %action.name, session_id))]
    pub async fn execute(
        &self,
        action: &Action,
        input_data: Value,
        session_id: &str,
        parent_id: Option<&str>,
        platform: &str,
    ) -> Result<ActionOutcome, ExecutorError> {
        let run_id = Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.in_flight.lock().expect("in_flight lock poisoned").insert(run_id.clone(), token.clone());

        let started_at = Utc::now();
        let result = match action.action_type {
            ActionType::Atomic => self.run_atomic(action, &input_data, platform, &token).await,
            ActionType::Divisible => self.run_divisible(action, &input_data, session_id, &run_id, platform, &token).await,
        };
        self.in_flight.lock().expect("in_flight lock poisoned").remove(&run_id);
        let ended_at = Utc::now();

        let (status, output) = match result {
            Ok(value) => (RunStatus::Success, value),
            Err(ExecutorError::Cancelled) => (RunStatus::Cancelled, json!({"error": "cancelled"})),
            Err(err) => (RunStatus::Error, json!({"error": err.to_string()})),
        };

        self.log_store.log_action_history(
            &run_id,
            session_id,
            parent_id,
            &action.name,
            match action.action_type {
                ActionType::Atomic => "atomic",
                ActionType::Divisible => "divisible",
            },
            match status {
                RunStatus::Running => "running",
                RunStatus::Success => "success",
                RunStatus::Error => "error",
                RunStatus::Cancelled => "cancelled",
            },
            &input_data,
            &output,
            started_at,
            Some(ended_at),
        );

        Ok(ActionOutcome { run_id, status, output })
    }

    async fn run_atomic(&self, action: &Action, input_data: &Value, platform: &str, token: &CancellationToken) -> Result<Value, ExecutorError> {
        let (body, _, _) = action.resolved_for_platform(platform);
        let exec_output = self.exec_body(&body, input_data, token).await?;

        let mut output = match extract_last_json(&exec_output.stdout) {
            Ok(value) if exec_output.success() => value,
            _ if exec_output.success() => json!({"stdout": strip_ansi(&exec_output.stdout)}),
            _ => json!({
                "error": "action exited non-zero",
                "stdout": strip_ansi(&exec_output.stdout),
                "stderr": strip_ansi(&exec_output.stderr),
                "returncode": exec_output.exit_code,
            }),
        };

        if exec_output.success() {
            if let Some(observer) = &action.observer {
                let observation = self.run_observer(observer, &output, token).await;
                match observation {
                    Ok(obs) => {
                        if let Value::Object(ref mut map) = output {
                            map.insert("observation".to_string(), obs);
                        }
                    }
                    Err(err) => {
                        return Ok(json!({
                            "error": format!("observer failed: {err}"),
                            "partial_output": output,
                        }));
                    }
                }
            }
        }

        Ok(output)
    }

    async fn exec_body(&self, body: &str, input_data: &Value, token: &CancellationToken) -> Result<crate::sandbox::ExecResult, ExecutorError> {
        let script_name = format!("/workspace/action_{}.py", Uuid::new_v4().simple());
        self.sandbox.write_file(&script_name, body.as_bytes()).await?;

        let input_json = serde_json::to_string(input_data).unwrap_or_else(|_| "{}".to_string());
        let encoded = base64::engine::general_purpose::STANDARD.encode(input_json.as_bytes());
        let cmd = format!("echo '{encoded}' | base64 -d | python3 {script_name}");

        if token.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        self.sandbox.exec_command(&cmd, Some(token)).await.map_err(|err| {
            if token.is_cancelled() {
                ExecutorError::Cancelled
            } else {
                ExecutorError::Sandbox(err)
            }
        })
    }

    async fn run_observer(&self, observer: &crate::action::ObserverSpec, action_output: &Value, token: &CancellationToken) -> Result<Value, String> {
        let deadline = Instant::now() + Duration::from_secs(observer.max_total_time_sec);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if Instant::now() >= deadline {
                return Err("observer exceeded max_total_time_sec".to_string());
            }

            let exec_result = self.exec_body(&observer.body, action_output, token).await;
            match exec_result {
                Ok(result) if result.success() => match extract_last_json(&result.stdout) {
                    Ok(value) => {
                        let explicit_failure = value.get("success").and_then(Value::as_bool) == Some(false);
                        if explicit_failure {
                            warn!(attempt, "observer reported explicit failure");
                        } else {
                            return Ok(value);
                        }
                    }
                    Err(_) => warn!(attempt, "observer output did not parse as JSON"),
                },
                Ok(result) => warn!(attempt, returncode = result.exit_code, "observer exited non-zero"),
                Err(err) => {
                    if matches!(err, ExecutorError::Cancelled) {
                        return Err("cancelled".to_string());
                    }
                    warn!(attempt, %err, "observer execution errored");
                }
            }

            if attempt > observer.max_retries {
                return Err(format!("observer failed after {attempt} attempts"));
            }
            tokio::time::sleep(Duration::from_secs(observer.retry_interval_sec)).await;
        }
    }

    async fn run_divisible(
        &self,
        action: &Action,
        input_data: &Value,
        session_id: &str,
        parent_run_id: &str,
        platform: &str,
        token: &CancellationToken,
    ) -> Result<Value, ExecutorError> {
        let mut results = serde_json::Map::new();
        for sub_name in &action.sub_actions {
            if token.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            let Some(sub_action) = self.registry.get(sub_name) else {
                error!(sub_action = %sub_name, "divisible action references unknown sub-action");
                return Err(ExecutorError::ActionNotFound(sub_name.clone()));
            };
            let sub_input = input_data.get(sub_name).cloned().unwrap_or_else(|| input_data.clone());
            let outcome = Box::pin(self.execute(&sub_action, sub_input, session_id, Some(parent_run_id), platform)).await?;
            results.insert(sub_name.clone(), json!({"status": format!("{:?}", outcome.status).to_lowercase(), "output": outcome.output}));
        }
        Ok(Value::Object(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::VisibilityMode;
    use crate::storage::ActionStore;
    use tempfile::tempdir;

    fn sample_action(name: &str, action_type: ActionType) -> Action {
        Action {
            name: name.into(),
            description: "test action".into(),
            action_type,
            body: "print('{\"ok\": true}')".into(),
            sub_actions: vec![],
            input_schema: HashMap::new(),
            output_schema: HashMap::new(),
            observer: None,
            mode: Some(VisibilityMode::All),
            platform_allowlist: vec![],
            platform_overrides: HashMap::new(),
            execution_mode: "sandboxed".into(),
        }
    }

    #[test]
    fn resolved_for_platform_falls_back_to_base_body() {
        let action = sample_action("do_thing", ActionType::Atomic);
        let (body, _, _) = action.resolved_for_platform("linux");
        assert_eq!(body, action.body);
    }

    #[test]
    fn divisible_action_without_sub_actions_is_empty_and_not_cancelled_up_front() {
        let dir = tempdir().expect("tempdir");
        let registry = ActionRegistry::load(ActionStore::new(dir.path()).expect("store")).expect("registry");
        let action = sample_action("composite", ActionType::Divisible);
        assert!(action.sub_actions.is_empty());
        assert!(registry.get("composite").is_none());
    }
}
