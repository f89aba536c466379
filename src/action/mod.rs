//! Action catalog types (spec §4.4): the typed unit the Router selects and
//! the Executor runs.

pub mod executor;
pub mod registry;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Whether an action runs opaque code directly or sequences other actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Atomic,
    Divisible,
}

/// Visibility scoping consumed by the Action Router's candidate assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VisibilityMode {
    Cli,
    Gui,
    All,
}

/// One field of an action's input or output schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    #[serde(rename = "type")]
    pub field_type: String,
    pub example: Option<serde_json::Value>,
    pub description: String,
}

/// Post-execution check for an atomic action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverSpec {
    /// Opaque observer program body, run with the action's output as input.
    pub body: String,
    pub max_retries: u32,
    pub retry_interval_sec: u64,
    pub max_total_time_sec: u64,
}

/// Per-OS replacement of an action's body or schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformOverride {
    pub body: Option<String>,
    pub input_schema: Option<HashMap<String, SchemaField>>,
    pub output_schema: Option<HashMap<String, SchemaField>>,
}

/// A named, typed, executable unit of work (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Opaque executable body for atomic actions. Empty for divisible
    /// actions, which instead carry `sub_actions`.
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub sub_actions: Vec<String>,
    #[serde(default)]
    pub input_schema: HashMap<String, SchemaField>,
    #[serde(default)]
    pub output_schema: HashMap<String, SchemaField>,
    pub observer: Option<ObserverSpec>,
    pub mode: Option<VisibilityMode>,
    #[serde(default)]
    pub platform_allowlist: Vec<String>,
    #[serde(default)]
    pub platform_overrides: HashMap<String, PlatformOverride>,
    #[serde(default = "default_execution_mode")]
    pub execution_mode: String,
}

fn default_execution_mode() -> String {
    "sandboxed".to_string()
}

impl Action {
    /// Applies `platform_overrides` for `platform`, if one is registered,
    /// returning the effective body/schemas for execution on that OS.
    #[must_use]
    pub fn resolved_for_platform(&self, platform: &str) -> (String, HashMap<String, SchemaField>, HashMap<String, SchemaField>) {
        match self.platform_overrides.get(platform) {
            Some(ov) => (
                ov.body.clone().unwrap_or_else(|| self.body.clone()),
                ov.input_schema.clone().unwrap_or_else(|| self.input_schema.clone()),
                ov.output_schema.clone().unwrap_or_else(|| self.output_schema.clone()),
            ),
            None => (self.body.clone(), self.input_schema.clone(), self.output_schema.clone()),
        }
    }

    #[must_use]
    pub fn is_visible_for(&self, mode: VisibilityMode) -> bool {
        match self.mode {
            None => true,
            Some(action_mode) => action_mode == VisibilityMode::All || action_mode == mode,
        }
    }

    #[must_use]
    pub fn is_allowed_on_platform(&self, platform: &str) -> bool {
        self.platform_allowlist.is_empty() || self.platform_allowlist.iter().any(|p| p == platform)
    }
}

/// Terminal/in-flight status of one action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_action() -> Action {
        Action {
            name: "do_thing".into(),
            description: "does a thing".into(),
            action_type: ActionType::Atomic,
            body: "print('{}')".into(),
            sub_actions: vec![],
            input_schema: HashMap::new(),
            output_schema: HashMap::new(),
            observer: None,
            mode: None,
            platform_allowlist: vec![],
            platform_overrides: HashMap::new(),
            execution_mode: default_execution_mode(),
        }
    }

    #[test]
    fn serde_round_trip_preserves_defaults() {
        let action = sample_action();
        let json = serde_json::to_string(&action).expect("serialize");
        let parsed: Action = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.name, action.name);
        assert_eq!(parsed.execution_mode, "sandboxed");
    }

    #[test]
    fn visibility_none_means_always_visible() {
        let action = sample_action();
        assert!(action.is_visible_for(VisibilityMode::Cli));
        assert!(action.is_visible_for(VisibilityMode::Gui));
    }

    #[test]
    fn platform_allowlist_empty_means_all_platforms() {
        let action = sample_action();
        assert!(action.is_allowed_on_platform("linux"));
    }
}
