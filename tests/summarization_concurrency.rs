//! Scenario §8 "Summarization concurrency": logging past `summarize_at`
//! schedules a detached summarization; events logged while that
//! summarization is awaiting the LLM must survive the fold, landing after
//! the retained tail.

use std::sync::Arc;
use std::time::Duration;

use agent_kernel::event_stream::{Event, EventStream, EventSummarizer, Severity};
use async_trait::async_trait;
use tokio::sync::Notify;

struct BlockingSummarizer {
    started: Notify,
    proceed: Notify,
}

impl BlockingSummarizer {
    fn new() -> Self {
        Self { started: Notify::new(), proceed: Notify::new() }
    }
}

#[async_trait]
impl EventSummarizer for BlockingSummarizer {
    async fn summarize(&self, _previous_summary: Option<&str>, chunk: &[Event]) -> anyhow::Result<String> {
        self.started.notify_one();
        self.proceed.notified().await;
        Ok(format!("folded {} events", chunk.len()))
    }
}

#[tokio::test]
async fn events_logged_during_summarization_survive_the_fold() {
    let summarizer = Arc::new(BlockingSummarizer::new());
    let stream = Arc::new(EventStream::with_defaults(None, summarizer.clone()));

    for i in 0..30 {
        stream.log("note", format!("event-{i}"), Severity::Info, None, None);
    }

    // Wait for the detached summarization task to snapshot its chunk and
    // start awaiting the (blocked) summarizer call.
    summarizer.started.notified().await;

    for i in 30..35 {
        stream.log("note", format!("event-{i}"), Severity::Info, None, None);
    }

    summarizer.proceed.notify_one();

    // Summarization finishes asynchronously once unblocked; poll briefly.
    let mut tail_len = stream.tail_len();
    for _ in 0..200 {
        if tail_len == 20 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        tail_len = stream.tail_len();
    }

    assert_eq!(tail_len, 20, "tail should settle at tail_keep(15) + 5 late events");

    let snapshot = stream.to_prompt_snapshot(false);
    assert!(snapshot.contains("event-34"), "newest late event must survive");
    assert!(snapshot.contains("event-29"), "newest pre-fold event must survive");
    assert!(!snapshot.contains("event-0"), "earliest folded event must be dropped");

    assert_eq!(stream.head_summary().as_deref(), Some("folded 15 events"));
}
