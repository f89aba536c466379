//! Narrator: a cheap sidecar LLM call that turns a raw event into a short
//! human headline for `Event.display_message` (spec §2). Best-effort only —
//! the event stream is fully usable without a headline, so failures are
//! logged and swallowed rather than propagated, mirroring the detached,
//! fire-and-forget summarization task in `event_stream::EventStream`.

use std::sync::Arc;

use tracing::warn;

use crate::llm::LlmClient;

/// Messages longer than this are truncated before being sent to the
/// narrator model; a headline doesn't need the full text to be accurate,
/// and keeping the call cheap is the point of using a sidecar model at all.
const MAX_INPUT_CHARS: usize = 2_000;

const MAX_HEADLINE_CHARS: usize = 120;

/// Produces short display headlines for event-stream entries.
pub struct Narrator {
    client: Arc<LlmClient>,
}

impl Narrator {
    #[must_use]
    pub fn new(client: Arc<LlmClient>) -> Self {
        Self { client }
    }

    /// Generates a one-line headline for an event of the given `kind`
    /// carrying `message`. Returns `None` if the model call fails or
    /// returns nothing usable; callers should fall back to no
    /// `display_message` rather than block on a retry.
    pub async fn narrate(&self, kind: &str, message: &str) -> Option<String> {
        let truncated = truncate_chars(message, MAX_INPUT_CHARS);
        let system_prompt = "You summarize one agent event into a single short headline for a human \
            watching a live log. Respond with the headline text only, no quotes, no punctuation at \
            the end, one line.";
        let user_prompt = format!("Event kind: {kind}\nEvent text:\n{truncated}");

        let response = match self.client.generate(system_prompt, &user_prompt).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%err, kind, "narrator call failed, leaving display_message unset");
                return None;
            }
        };

        let headline = response.content.trim();
        if headline.is_empty() {
            return None;
        }
        Some(truncate_chars(headline, MAX_HEADLINE_CHARS))
    }
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{CacheDirective, GenerateResponse, LlmError, LlmProvider, ProviderArchetype};
    use async_trait::async_trait;

    struct ScriptedProvider {
        responses: std::sync::Mutex<Vec<Result<String, LlmError>>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
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
            match responses.remove(0) {
                Ok(content) => Ok(GenerateResponse { content, tokens_used: 5, cached_tokens: 0, provider_handle: None }),
                Err(err) => Err(err),
            }
        }
    }

    fn narrator_with(responses: Vec<Result<&str, LlmError>>) -> Narrator {
        let client = Arc::new(LlmClient::new(Arc::new(ScriptedProvider {
            responses: std::sync::Mutex::new(responses.into_iter().map(|r| r.map(str::to_string)).collect()),
        })));
        Narrator::new(client)
    }

    #[tokio::test]
    async fn narrate_returns_trimmed_headline_on_success() {
        let narrator = narrator_with(vec![Ok("  Deployed the service  ")]);
        let headline = narrator.narrate("action_end", "deploy.sh exited 0").await;
        assert_eq!(headline.as_deref(), Some("Deployed the service"));
    }

    #[tokio::test]
    async fn narrate_returns_none_on_provider_error() {
        let narrator = narrator_with(vec![Err(LlmError::MissingConfig("no key".into()))]);
        let headline = narrator.narrate("action_end", "deploy.sh exited 0").await;
        assert!(headline.is_none());
    }

    #[tokio::test]
    async fn narrate_returns_none_on_empty_response() {
        let narrator = narrator_with(vec![Ok("   ")]);
        let headline = narrator.narrate("warning", "disk low").await;
        assert!(headline.is_none());
    }

    #[test]
    fn truncate_chars_respects_char_boundaries_not_byte_length() {
        let text = "é".repeat(200);
        let truncated = truncate_chars(&text, MAX_HEADLINE_CHARS);
        assert_eq!(truncated.chars().count(), MAX_HEADLINE_CHARS);
    }
}
