//! Context Engine (spec §4.8): builds the system and user prompts the
//! Agent Loop sends to the LLM Gateway, from a fixed set of enable/disable
//! flags. The system portion is deterministic and timestamp-free so
//! provider prefix caches (spec §4.3) actually hit across calls.

/// Which sections appear in the system prompt. Order here is the order
/// sections are emitted, matching spec §4.8's flag list.
#[derive(Debug, Clone, Copy)]
pub struct SystemFlags {
    pub role_info: bool,
    pub agent_info: bool,
    pub agent_state: bool,
    pub conversation_history: bool,
    pub event_stream: bool,
    pub task_state: bool,
    /// Off by default to save tokens (spec §4.8).
    pub policy: bool,
    pub environment: bool,
    pub base_instruction: bool,
}

impl Default for SystemFlags {
    fn default() -> Self {
        Self {
            role_info: true,
            agent_info: true,
            agent_state: true,
            conversation_history: true,
            event_stream: true,
            task_state: true,
            policy: false,
            environment: true,
            base_instruction: true,
        }
    }
}

/// Which sections appear in the user prompt.
#[derive(Debug, Clone, Copy)]
pub struct UserFlags {
    pub query: bool,
    pub expected_output: bool,
}

impl Default for UserFlags {
    fn default() -> Self {
        Self { query: true, expected_output: true }
    }
}

/// Rendered text for every section the engine might emit. Callers leave a
/// field empty (`""`) for content they have none of; empty sections are
/// skipped regardless of whether their flag is on.
#[derive(Debug, Clone, Default)]
pub struct ContextInputs {
    pub role_info: String,
    pub agent_info: String,
    pub agent_state: String,
    pub conversation_history: String,
    pub event_stream: String,
    pub task_state: String,
    pub policy: String,
    pub environment: String,
    pub base_instruction: String,
    pub query: String,
    pub expected_output: String,
}

/// Builds system/user prompts from enabled flags and rendered section text.
pub struct ContextEngine {
    system_flags: SystemFlags,
    user_flags: UserFlags,
}

impl ContextEngine {
    #[must_use]
    pub fn new(system_flags: SystemFlags, user_flags: UserFlags) -> Self {
        Self { system_flags, user_flags }
    }

    /// Deterministic system prompt: sections are emitted in a fixed order,
    /// and the text never embeds a timestamp, so identical inputs always
    /// produce an identical prompt (prefix-cache hit).
    #[must_use]
    pub fn build_system_prompt(&self, inputs: &ContextInputs) -> String {
        let mut sections: Vec<(&str, bool, &str)> = vec![
            ("Role", self.system_flags.role_info, &inputs.role_info),
            ("Agent", self.system_flags.agent_info, &inputs.agent_info),
            ("State", self.system_flags.agent_state, &inputs.agent_state),
            ("Conversation history", self.system_flags.conversation_history, &inputs.conversation_history),
            ("Event stream", self.system_flags.event_stream, &inputs.event_stream),
            ("Task", self.system_flags.task_state, &inputs.task_state),
            ("Policy", self.system_flags.policy, &inputs.policy),
            ("Environment", self.system_flags.environment, &inputs.environment),
            ("Instructions", self.system_flags.base_instruction, &inputs.base_instruction),
        ];
        sections.retain(|(_, enabled, text)| *enabled && !text.is_empty());
        sections.into_iter().map(|(label, _, text)| format!("## {label}\n{text}")).collect::<Vec<_>>().join("\n\n")
    }

    /// Builds the user prompt from enabled sections.
    #[must_use]
    pub fn build_user_prompt(&self, inputs: &ContextInputs) -> String {
        let mut sections: Vec<(&str, bool, &str)> =
            vec![("Query", self.user_flags.query, &inputs.query), ("Expected output", self.user_flags.expected_output, &inputs.expected_output)];
        sections.retain(|(_, enabled, text)| *enabled && !text.is_empty());
        sections.into_iter().map(|(label, _, text)| format!("## {label}\n{text}")).collect::<Vec<_>>().join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_inputs() -> ContextInputs {
        ContextInputs {
            role_info: "You are an agent.".into(),
            agent_info: "Agent v1".into(),
            agent_state: "task: demo, step 2/3".into(),
            conversation_history: "user: hi\nagent: hello".into(),
            event_stream: "[INFO] started".into(),
            task_state: "goal: ship it".into(),
            policy: "never delete prod data".into(),
            environment: "linux, cwd /workspace".into(),
            base_instruction: "Respond concisely.".into(),
            query: "what's next?".into(),
            expected_output: "a single action".into(),
        }
    }

    #[test]
    fn default_flags_omit_policy_section() {
        let engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());
        let prompt = engine.build_system_prompt(&sample_inputs());
        assert!(!prompt.contains("never delete prod data"));
        assert!(prompt.contains("You are an agent."));
    }

    #[test]
    fn enabling_policy_includes_its_section() {
        let engine = ContextEngine::new(SystemFlags { policy: true, ..SystemFlags::default() }, UserFlags::default());
        let prompt = engine.build_system_prompt(&sample_inputs());
        assert!(prompt.contains("never delete prod data"));
    }

    #[test]
    fn empty_section_text_is_skipped_even_when_enabled() {
        let engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());
        let mut inputs = sample_inputs();
        inputs.environment = String::new();
        let prompt = engine.build_system_prompt(&inputs);
        assert!(!prompt.contains("## Environment"));
    }

    #[test]
    fn same_inputs_produce_identical_system_prompt_every_time() {
        let engine = ContextEngine::new(SystemFlags::default(), UserFlags::default());
        let inputs = sample_inputs();
        let first = engine.build_system_prompt(&inputs);
        let second = engine.build_system_prompt(&inputs);
        assert_eq!(first, second);
    }

    #[test]
    fn user_prompt_respects_disabled_expected_output_flag() {
        let engine = ContextEngine::new(SystemFlags::default(), UserFlags { expected_output: false, ..UserFlags::default() });
        let prompt = engine.build_user_prompt(&sample_inputs());
        assert!(prompt.contains("what's next?"));
        assert!(!prompt.contains("a single action"));
    }
}
