//! Per-session event log: a bounded tail plus a compacted head summary.
//!
//! [`EventStream::log`] is synchronous — it only schedules summarization,
//! which runs later as a detached task so a burst of rapid logging never
//! blocks the Agent Loop on an LLM round trip.

mod keywords;

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, warn};

use crate::config::{
    DEFAULT_EXTERNALIZE_THRESHOLD, DEFAULT_SUMMARIZE_AT, DEFAULT_TAIL_KEEP_AFTER_SUMMARIZE,
    MIN_SUMMARIZE_BUFFER, STREAM_READER_ALLOWLIST,
};

/// Severity tag for an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single entry in an [`EventStream`]'s tail.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic identifier assigned at log time; survives summarization
    /// folding the underlying vector entry away.
    pub index: u64,
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub severity: Severity,
    /// Possibly externalized (pointer-substituted) message text.
    pub message: String,
    /// Optional UI-only display text, never externalized.
    pub display_message: Option<String>,
    /// Coalescing counter for consecutive identical kind+message pairs.
    pub repeat_count: u32,
}

/// Produces a new head summary from the previous one plus a chunk of tail
/// events being folded away. Implemented by the LLM Gateway in production;
/// tests use a deterministic stub.
#[async_trait]
pub trait EventSummarizer: Send + Sync {
    /// Returns the new head summary, or an error/empty string to signal the
    /// stream should be left unchanged.
    async fn summarize(&self, previous_summary: Option<&str>, chunk: &[Event]) -> anyhow::Result<String>;
}

struct Inner {
    head_summary: Option<String>,
    tail: Vec<Event>,
    next_index: u64,
}

/// Bounded, summarizing event log for one session.
pub struct EventStream {
    inner: Mutex<Inner>,
    summarizing: AtomicBool,
    scratch_dir: Option<PathBuf>,
    summarize_at: usize,
    tail_keep_after_summarize: usize,
    externalize_threshold: usize,
    summarizer: Arc<dyn EventSummarizer>,
}

impl EventStream {
    /// Creates a new event stream. `tail_keep_after_summarize` is coerced
    /// downward if it would leave less than [`MIN_SUMMARIZE_BUFFER`] of
    /// headroom before `summarize_at`.
    #[must_use]
    pub fn new(
        scratch_dir: Option<PathBuf>,
        summarize_at: usize,
        tail_keep_after_summarize: usize,
        externalize_threshold: usize,
        summarizer: Arc<dyn EventSummarizer>,
    ) -> Self {
        let effective_tail_keep = if tail_keep_after_summarize + MIN_SUMMARIZE_BUFFER > summarize_at {
            let coerced = summarize_at.saturating_sub(MIN_SUMMARIZE_BUFFER);
            warn!(
                requested = tail_keep_after_summarize,
                coerced, summarize_at, "tail_keep_after_summarize too close to summarize_at, coercing down"
            );
            coerced
        } else {
            tail_keep_after_summarize
        };

        Self {
            inner: Mutex::new(Inner {
                head_summary: None,
                tail: Vec::new(),
                next_index: 0,
            }),
            summarizing: AtomicBool::new(false),
            scratch_dir,
            summarize_at,
            tail_keep_after_summarize: effective_tail_keep,
            externalize_threshold,
            summarizer,
        }
    }

    /// Creates an event stream with the spec's default tuning constants.
    #[must_use]
    pub fn with_defaults(scratch_dir: Option<PathBuf>, summarizer: Arc<dyn EventSummarizer>) -> Self {
        Self::new(
            scratch_dir,
            DEFAULT_SUMMARIZE_AT,
            DEFAULT_TAIL_KEEP_AFTER_SUMMARIZE,
            DEFAULT_EXTERNALIZE_THRESHOLD,
            summarizer,
        )
    }

    /// Logs an event, externalizing `message` to a scratch file with a
    /// TF-IDF keyword pointer if it exceeds the externalization threshold.
    /// Coalesces with the previous tail entry if kind and message match.
    /// Schedules summarization (detached) if the tail has grown past
    /// `summarize_at` and no summarization is currently in flight.
    ///
    /// Returns the logged event's stable index.
    pub fn log(
        self: &Arc<Self>,
        kind: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        display_message: Option<String>,
        action_name: Option<&str>,
    ) -> u64 {
        let kind = kind.into();
        let message = message.into();

        let final_message = self.externalize_if_needed(&message, action_name);

        let index = {
            let mut inner = self.inner.lock().expect("event stream lock poisoned");
            if let Some(last) = inner.tail.last_mut() {
                if last.kind == kind && last.message == final_message {
                    last.repeat_count += 1;
                    last.ts = Utc::now();
                    return last.index;
                }
            }
            let index = inner.next_index;
            inner.next_index += 1;
            inner.tail.push(Event {
                index,
                ts: Utc::now(),
                kind,
                severity,
                message: final_message,
                display_message,
                repeat_count: 1,
            });
            index
        };

        self.maybe_schedule_summarize();
        index
    }

    fn externalize_if_needed(&self, message: &str, action_name: Option<&str>) -> String {
        let allowlisted = action_name.is_some_and(|name| STREAM_READER_ALLOWLIST.contains(&name));
        let Some(scratch_dir) = self.scratch_dir.as_ref() else {
            return message.to_string();
        };
        if message.len() <= self.externalize_threshold || allowlisted {
            return message.to_string();
        }

        let file_name = format!("event-{}.txt", uuid::Uuid::new_v4().as_simple());
        let path = scratch_dir.join(&file_name);
        match std::fs::write(&path, message) {
            Ok(()) => {
                let keywords = keywords::extract_keywords(message);
                let keyword_list = if keywords.is_empty() {
                    "none".to_string()
                } else {
                    keywords.join(", ")
                };
                format!(
                    "Output externalized to {} ({} bytes, keywords: {keyword_list})",
                    path.display(),
                    message.len()
                )
            }
            Err(err) => {
                error!(error = %err, path = %path.display(), "failed to externalize event message, keeping inline");
                message.to_string()
            }
        }
    }

    fn maybe_schedule_summarize(self: &Arc<Self>) {
        let should_schedule = {
            let inner = self.inner.lock().expect("event stream lock poisoned");
            inner.tail.len() >= self.summarize_at
        };
        if !should_schedule {
            return;
        }
        if self
            .summarizing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_summarization().await;
            this.summarizing.store(false, Ordering::SeqCst);
        });
    }

    /// Concurrency protocol: snapshot the chunk to fold and the previous
    /// summary, release the lock, call the summarizer, then reacquire and
    /// drop exactly `cutoff` leading entries. Events appended during the
    /// await survive because they land after the snapshot's boundary.
    async fn run_summarization(&self) {
        let (cutoff, chunk, previous_summary) = {
            let inner = self.inner.lock().expect("event stream lock poisoned");
            let cutoff = inner.tail.len().saturating_sub(self.tail_keep_after_summarize);
            if cutoff == 0 {
                return;
            }
            (cutoff, inner.tail[..cutoff].to_vec(), inner.head_summary.clone())
        };

        let result = self.summarizer.summarize(previous_summary.as_deref(), &chunk).await;

        match result {
            Ok(summary) if !summary.trim().is_empty() => {
                let mut inner = self.inner.lock().expect("event stream lock poisoned");
                let drop_count = cutoff.min(inner.tail.len());
                inner.tail.drain(..drop_count);
                inner.head_summary = Some(summary);
            }
            Ok(_) => {
                warn!("summarizer returned empty summary, leaving event stream unchanged");
            }
            Err(err) => {
                warn!(error = %err, "summarization failed, leaving event stream unchanged");
            }
        }
    }

    /// Renders a compact text block for the LLM prompt: an optional folded
    /// summary section followed by the tail, one `HH:MM:SS [kind]: message`
    /// line per entry with a `[xN]` suffix when `repeat_count > 1`.
    #[must_use]
    pub fn to_prompt_snapshot(&self, include_summary: bool) -> String {
        let inner = self.inner.lock().expect("event stream lock poisoned");
        let mut out = String::new();

        if include_summary {
            if let Some(summary) = inner.head_summary.as_ref() {
                out.push_str("Summary of folded event stream:\n");
                out.push_str(summary);
                out.push('\n');
            }
        }

        out.push_str("Recent Event:\n");
        for event in &inner.tail {
            let suffix = if event.repeat_count > 1 {
                format!(" [x{}]", event.repeat_count)
            } else {
                String::new()
            };
            out.push_str(&format!(
                "{} [{}]: {}{suffix}\n",
                event.ts.format("%H:%M:%S"),
                event.kind,
                event.message
            ));
        }

        out
    }

    /// Resets both the head summary and the tail.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("event stream lock poisoned");
        inner.head_summary = None;
        inner.tail.clear();
    }

    /// Number of events currently in the tail (post any folding).
    #[must_use]
    pub fn tail_len(&self) -> usize {
        self.inner.lock().expect("event stream lock poisoned").tail.len()
    }

    /// Current head summary, if any folding has happened yet.
    #[must_use]
    pub fn head_summary(&self) -> Option<String> {
        self.inner.lock().expect("event stream lock poisoned").head_summary.clone()
    }
}

/// Production [`EventSummarizer`]: folds a chunk of events plus the prior
/// head summary into a new summary via a cheap sidecar LLM call.
pub struct LlmEventSummarizer {
    client: Arc<crate::llm::LlmClient>,
}

const SUMMARIZER_SYSTEM_PROMPT: &str = "You compact an agent's event log into a short running summary. \
Given the previous summary (if any) and a chunk of older events being folded away, write a new summary \
that preserves anything a future turn of the agent would still need to know (outcomes, errors, decisions) \
and drops routine noise. Respond with the summary text only.";

impl LlmEventSummarizer {
    #[must_use]
    pub fn new(client: Arc<crate::llm::LlmClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSummarizer for LlmEventSummarizer {
    async fn summarize(&self, previous_summary: Option<&str>, chunk: &[Event]) -> anyhow::Result<String> {
        let mut user_prompt = String::new();
        if let Some(previous) = previous_summary {
            user_prompt.push_str("Previous summary:\n");
            user_prompt.push_str(previous);
            user_prompt.push_str("\n\n");
        }
        user_prompt.push_str("Events to fold in:\n");
        for event in chunk {
            user_prompt.push_str(&format!("{} [{}]: {}\n", event.ts.format("%H:%M:%S"), event.kind, event.message));
        }

        let response = self.client.generate(SUMMARIZER_SYSTEM_PROMPT, &user_prompt).await?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct StubSummarizer {
        response: StdMutex<Option<anyhow::Result<String>>>,
    }

    impl StubSummarizer {
        fn once(result: anyhow::Result<String>) -> Arc<Self> {
            Arc::new(Self {
                response: StdMutex::new(Some(result)),
            })
        }
    }

    #[async_trait]
    impl EventSummarizer for StubSummarizer {
        async fn summarize(&self, _previous: Option<&str>, _chunk: &[Event]) -> anyhow::Result<String> {
            self.response
                .lock()
                .expect("lock")
                .take()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    fn stream(summarizer: Arc<dyn EventSummarizer>) -> Arc<EventStream> {
        Arc::new(EventStream::new(None, 5, 2, DEFAULT_EXTERNALIZE_THRESHOLD, summarizer))
    }

    #[tokio::test]
    async fn log_coalesces_consecutive_identical_events() {
        let s = stream(StubSummarizer::once(Ok("summary".into())));
        let i1 = s.log("warning", "disk low", Severity::Warn, None, None);
        let i2 = s.log("warning", "disk low", Severity::Warn, None, None);
        assert_eq!(i1, i2);
        assert_eq!(s.tail_len(), 1);
        let snapshot = s.to_prompt_snapshot(false);
        assert!(snapshot.contains("[x2]"));
    }

    #[tokio::test]
    async fn log_schedules_summarization_past_threshold() {
        let s = stream(StubSummarizer::once(Ok("folded".into())));
        for i in 0..5 {
            s.log("action_end", format!("step {i}"), Severity::Info, None, None);
        }
        // Summarization runs detached; give it a beat to complete.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(s.head_summary().as_deref(), Some("folded"));
        assert_eq!(s.tail_len(), 2);
    }

    #[tokio::test]
    async fn summarization_error_leaves_stream_unchanged() {
        let s = stream(StubSummarizer::once(Err(anyhow::anyhow!("llm down"))));
        for i in 0..5 {
            s.log("action_end", format!("step {i}"), Severity::Info, None, None);
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(s.head_summary().is_none());
        assert_eq!(s.tail_len(), 5);
    }

    #[tokio::test]
    async fn events_appended_during_summarization_survive() {
        let s = stream(StubSummarizer::once(Ok("folded".into())));
        for i in 0..5 {
            s.log("action_end", format!("step {i}"), Severity::Info, None, None);
        }
        s.log("action_end", "late arrival", Severity::Info, None, None);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let snapshot = s.to_prompt_snapshot(false);
        assert!(snapshot.contains("late arrival"));
    }

    #[tokio::test]
    async fn externalizes_oversized_messages_to_scratch_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Arc::new(EventStream::new(
            Some(dir.path().to_path_buf()),
            100,
            10,
            20,
            StubSummarizer::once(Ok(String::new())),
        ));
        let big = "x".repeat(50);
        s.log("screen", big, Severity::Info, None, None);
        let snapshot = s.to_prompt_snapshot(false);
        assert!(snapshot.contains("externalized to"));
    }

    #[tokio::test]
    async fn allowlisted_action_names_skip_externalization() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = Arc::new(EventStream::new(
            Some(dir.path().to_path_buf()),
            100,
            10,
            20,
            StubSummarizer::once(Ok(String::new())),
        ));
        let big = "x".repeat(50);
        s.log("screen", big.clone(), Severity::Info, None, Some("stream read"));
        let snapshot = s.to_prompt_snapshot(false);
        assert!(snapshot.contains(&big));
    }

    #[tokio::test]
    async fn clear_resets_head_and_tail() {
        let s = stream(StubSummarizer::once(Ok("folded".into())));
        s.log("info", "hello", Severity::Info, None, None);
        s.clear();
        assert_eq!(s.tail_len(), 0);
        assert!(s.head_summary().is_none());
    }
}
