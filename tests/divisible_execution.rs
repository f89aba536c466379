//! Scenario §8 "Divisible execution": a divisible action sequencing two
//! sub-actions must fold their outputs under the sub-action name and leave
//! three history rows (parent + two children) sharing `parent_id`.
//!
//! Runs real sub-action bodies in the Docker sandbox, so it requires a
//! reachable Docker daemon, same as the executor's own in-crate test suite.

use std::collections::HashMap;
use std::sync::Arc;

use agent_kernel::action::executor::ActionExecutor;
use agent_kernel::action::registry::ActionRegistry;
use agent_kernel::action::{Action, ActionType, VisibilityMode};
use agent_kernel::sandbox::SandboxManager;
use agent_kernel::storage::{ActionStore, AgentLogStore};
use serde_json::json;
use tempfile::tempdir;

fn atomic_action(name: &str, body: &str) -> Action {
    Action {
        name: name.into(),
        description: "test sub-action".into(),
        action_type: ActionType::Atomic,
        body: body.into(),
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

#[tokio::test]
async fn divisible_action_runs_sub_actions_and_merges_their_outputs() {
    let dir = tempdir().expect("tempdir");
    let store = ActionStore::new(dir.path()).expect("action store");
    let registry = Arc::new(ActionRegistry::load(store).expect("registry"));

    registry
        .register(atomic_action(
            "a",
            "import json, sys\nprint(json.dumps({\"ok\": True, \"v\": 1}))\n",
        ))
        .expect("register a");
    registry
        .register(atomic_action(
            "b",
            "import json, sys\nprint(json.dumps({\"ok\": True, \"v\": 2}))\n",
        ))
        .expect("register b");

    let parent = Action {
        name: "x".into(),
        description: "runs a then b".into(),
        action_type: ActionType::Divisible,
        body: String::new(),
        sub_actions: vec!["a".to_string(), "b".to_string()],
        input_schema: HashMap::new(),
        output_schema: HashMap::new(),
        observer: None,
        mode: Some(VisibilityMode::All),
        platform_allowlist: vec![],
        platform_overrides: HashMap::new(),
        execution_mode: "sandboxed".into(),
    };

    let log_store = Arc::new(AgentLogStore::new(dir.path()).expect("log store"));
    let sandbox = SandboxManager::new(0).await.expect("docker daemon reachable");
    let executor = ActionExecutor::new(sandbox, Arc::clone(&registry), Arc::clone(&log_store));

    let outcome = executor
        .execute(&parent, json!({}), "session-divisible", None, "linux")
        .await
        .expect("divisible execution should succeed");

    let a_output = outcome.output.get("a").expect("a result present");
    let b_output = outcome.output.get("b").expect("b result present");
    assert_eq!(a_output["status"], "success");
    assert_eq!(a_output["output"]["v"], 1);
    assert_eq!(b_output["status"], "success");
    assert_eq!(b_output["output"]["v"], 2);

    // AgentLogStore is append-only; replay its JSONL file directly to check
    // the history rows it wrote (spec §6: replay is a reader concern, not
    // an API the store itself exposes).
    let log_text = std::fs::read_to_string(dir.path().join("agent_logs.txt")).expect("read log file");
    let rows: Vec<serde_json::Value> = log_text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .filter(|row: &serde_json::Value| row["entry_type"] == "action_history")
        .collect();
    assert_eq!(rows.len(), 3, "parent plus two children");

    let parent_row = rows.iter().find(|row| row["name"] == "x").expect("parent row");
    let parent_run_id = parent_row["runId"].as_str().expect("parent run id");
    let children: Vec<_> = rows.iter().filter(|row| row["parentId"] == parent_run_id).collect();
    assert_eq!(children.len(), 2);
}
