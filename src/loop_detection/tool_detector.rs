//! Tool call loop detector.

use sha2::{Digest, Sha256};

/// Detects consecutive identical tool calls using hashing.
pub struct ToolCallDetector {
    last_key: Option<String>,
    repetition_count: usize,
    threshold: usize,
}

impl ToolCallDetector {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            last_key: None,
            repetition_count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Check if the given action call forms a loop.
    pub fn check(&mut self, action_name: &str, parameters: &str) -> bool {
        let key = Self::hash_call(action_name, parameters);
        if self.last_key.as_deref() == Some(&key) {
            self.repetition_count = self.repetition_count.saturating_add(1);
        } else {
            self.last_key = Some(key);
            self.repetition_count = 1;
        }

        self.repetition_count >= self.threshold
    }

    pub fn reset(&mut self) {
        self.last_key = None;
        self.repetition_count = 0;
    }

    #[cfg(test)]
    fn repetition_count(&self) -> usize {
        self.repetition_count
    }

    fn hash_call(action_name: &str, parameters: &str) -> String {
        let normalized = Self::normalize_parameters(parameters);
        let mut hasher = Sha256::new();
        hasher.update(action_name.as_bytes());
        hasher.update(b":");
        hasher.update(normalized.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn normalize_parameters(parameters: &str) -> String {
        serde_json::from_str::<serde_json::Value>(parameters)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| parameters.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::ToolCallDetector;

    #[test]
    fn detects_at_threshold() {
        let mut detector = ToolCallDetector::new(5);
        for _ in 0..4 {
            assert!(!detector.check("deploy service", r#"{"env": "prod"}"#));
        }
        assert!(detector.check("deploy service", r#"{"env": "prod"}"#));
    }

    #[test]
    fn resets_on_action_change() {
        let mut detector = ToolCallDetector::new(3);
        assert!(!detector.check("deploy", r#"{"a":1}"#));
        assert!(!detector.check("deploy", r#"{"a":1}"#));
        assert!(!detector.check("rollback", r#"{"a":1}"#));
        assert_eq!(detector.repetition_count(), 1);
    }

    #[test]
    fn resets_on_parameters_change() {
        let mut detector = ToolCallDetector::new(3);
        assert!(!detector.check("deploy", r#"{"a":1}"#));
        assert!(!detector.check("deploy", r#"{"a":2}"#));
        assert_eq!(detector.repetition_count(), 1);
    }
}
