//! Priority/time-ordered trigger scheduler.
//!
//! A [`Trigger`] is a scheduled reason for the Agent Loop to wake up and act
//! on a session. [`TriggerQueue`] orders triggers by `(fire_at, priority)`
//! (earliest first, then lowest priority value first — 1 is highest
//! priority) and merges same-session triggers together so a burst of events
//! collapses into one wakeup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// A scheduled reason for the Agent Loop to act on a session.
///
/// Ordering (for the queue's min-heap) compares `fire_at` then `priority`;
/// `session_id`, `next_action_description` and `payload` never participate in
/// ordering, mirroring the source dataclass's `compare=False` fields.
#[derive(Debug, Clone)]
pub struct Trigger {
    /// When this trigger becomes eligible to fire.
    pub fire_at: DateTime<Utc>,
    /// Priority; 1 is highest. Lower values fire first when `fire_at` ties.
    pub priority: i32,
    /// Session this trigger belongs to.
    pub session_id: String,
    /// Human-readable description of the action the wakeup should take,
    /// merged (newline-joined, deduplicated) across same-session triggers.
    pub next_action_description: String,
    /// Free-form payload, shallow-merged across same-session triggers with
    /// later triggers' keys winning.
    pub payload: Map<String, Value>,
}

impl Trigger {
    /// Creates a new trigger with an empty payload.
    #[must_use]
    pub fn new(
        fire_at: DateTime<Utc>,
        priority: i32,
        session_id: impl Into<String>,
        next_action_description: impl Into<String>,
    ) -> Self {
        Self {
            fire_at,
            priority,
            session_id: session_id.into(),
            next_action_description: next_action_description.into(),
            payload: Map::new(),
        }
    }
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.priority == other.priority
    }
}

impl Eq for Trigger {}

impl PartialOrd for Trigger {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Trigger {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then_with(|| self.priority.cmp(&other.priority))
    }
}

/// Resolves which session an incoming trigger should be merged into when the
/// queue is non-empty, by asking the LLM Gateway to reconcile against the
/// sessions already pending.
#[async_trait]
pub trait TriggerSessionResolver: Send + Sync {
    /// Returns the session id the incoming trigger should be filed under.
    /// May return `incoming.session_id` unchanged, or the id of an existing
    /// pending session the gateway judges this trigger belongs to instead.
    async fn resolve_session(&self, incoming: &Trigger, pending: &[Trigger]) -> anyhow::Result<String>;
}

/// A resolver that never reconciles: every trigger keeps its own
/// `session_id`. Used when no LLM Gateway is wired up (tests, and the
/// single-session default).
#[derive(Debug, Default)]
pub struct IdentityResolver;

#[async_trait]
impl TriggerSessionResolver for IdentityResolver {
    async fn resolve_session(&self, incoming: &Trigger, _pending: &[Trigger]) -> anyhow::Result<String> {
        Ok(incoming.session_id.clone())
    }
}

/// Merges a group of same-session triggers into one: priority and fire_at
/// take the minimum across the group, descriptions are newline-joined in
/// first-seen order with duplicates dropped, and payloads are shallow-merged
/// with later triggers' keys overwriting earlier ones.
fn merge_trigger_group(mut group: Vec<Trigger>) -> Trigger {
    debug_assert!(!group.is_empty());
    group.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));

    let session_id = group[0].session_id.clone();
    let fire_at = group.iter().map(|t| t.fire_at).min().expect("non-empty group");
    let priority = group.iter().map(|t| t.priority).min().expect("non-empty group");

    let mut seen_descriptions: Vec<String> = Vec::new();
    let mut payload = Map::new();
    for trigger in &group {
        if !seen_descriptions
            .iter()
            .any(|d| d == &trigger.next_action_description)
            && !trigger.next_action_description.is_empty()
        {
            seen_descriptions.push(trigger.next_action_description.clone());
        }
        for (key, value) in &trigger.payload {
            payload.insert(key.clone(), value.clone());
        }
    }

    Trigger {
        fire_at,
        priority,
        session_id,
        next_action_description: seen_descriptions.join("\n"),
        payload,
    }
}

/// Groups ready triggers by session and merges each group, returning the
/// merged triggers ordered best-first by `(priority, fire_at)`.
fn merge_ready_triggers(ready: Vec<Trigger>) -> Vec<Trigger> {
    let mut by_session: HashMap<String, Vec<Trigger>> = HashMap::new();
    for trigger in ready {
        by_session.entry(trigger.session_id.clone()).or_default().push(trigger);
    }
    let mut merged: Vec<Trigger> = by_session.into_values().map(merge_trigger_group).collect();
    merged.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.fire_at.cmp(&b.fire_at)));
    merged
}

#[derive(Default)]
struct Heap(BinaryHeap<Reverse<HeapEntry>>);

/// Wraps a `Trigger` for heap storage; `Ord` on `HeapEntry` matches `Trigger`'s
/// so `Reverse<HeapEntry>` gives a min-heap by `(fire_at, priority)`.
struct HeapEntry(Trigger);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

/// Priority/time-ordered queue of pending triggers, shared across the Agent
/// Loop and whichever subsystems raise triggers (event stream, action
/// completions, external wakeups).
pub struct TriggerQueue {
    heap: Mutex<Heap>,
    notify: Notify,
    resolver: Box<dyn TriggerSessionResolver>,
}

impl TriggerQueue {
    /// Creates an empty queue using the given session resolver.
    #[must_use]
    pub fn new(resolver: Box<dyn TriggerSessionResolver>) -> Self {
        Self {
            heap: Mutex::new(Heap::default()),
            notify: Notify::new(),
            resolver,
        }
    }

    /// Creates an empty queue that never reconciles sessions across triggers.
    #[must_use]
    pub fn with_identity_resolver() -> Self {
        Self::new(Box::new(IdentityResolver))
    }

    /// Enqueues a trigger. If the queue is non-empty, asks the resolver
    /// whether this trigger actually belongs to one of the pending sessions
    /// before filing it, then reconciles it with any existing trigger for
    /// that (possibly rewritten) session via [`merge_trigger_group`] —
    /// fire_at and priority take the minimum, descriptions are newline-joined
    /// deduplicated, and payloads are shallow-merged with this trigger's
    /// keys winning. The queue keeps the latest reconciliation, not a stack.
    pub async fn put(&self, mut trigger: Trigger) {
        let pending_snapshot: Vec<Trigger> = {
            let heap = self.heap.lock().await;
            heap.0.iter().map(|e| e.0 .0.clone()).collect()
        };

        if !pending_snapshot.is_empty() {
            match self.resolver.resolve_session(&trigger, &pending_snapshot).await {
                Ok(session_id) => trigger.session_id = session_id,
                Err(err) => {
                    debug!(error = %err, "trigger session resolution failed, keeping original session_id");
                }
            }
        }

        let mut heap = self.heap.lock().await;
        let session_id = trigger.session_id.clone();
        let mut existing = Vec::new();
        let retained: BinaryHeap<Reverse<HeapEntry>> = std::mem::take(&mut heap.0)
            .into_iter()
            .filter(|e| {
                if e.0 .0.session_id == session_id {
                    existing.push(e.0 .0.clone());
                    false
                } else {
                    true
                }
            })
            .collect();
        heap.0 = retained;
        let reconciled = if existing.is_empty() {
            trigger
        } else {
            existing.push(trigger);
            merge_trigger_group(existing)
        };
        heap.0.push(Reverse(HeapEntry(reconciled)));
        drop(heap);
        self.notify.notify_one();
    }

    /// Waits until the earliest trigger's `fire_at` has passed, then drains
    /// and merges all triggers that are ready at that instant, returning the
    /// single best one (lowest priority, then earliest fire_at). Any other
    /// merged triggers are requeued.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self) -> Trigger {
        loop {
            let wait_for = {
                let heap = self.heap.lock().await;
                match heap.0.peek() {
                    Some(Reverse(entry)) => {
                        let now = Utc::now();
                        if entry.0.fire_at <= now {
                            None
                        } else {
                            Some(entry.0.fire_at - now)
                        }
                    }
                    None => Some(chrono::Duration::seconds(3600)),
                }
            };

            if let Some(delay) = wait_for {
                let delay_std = delay.to_std().unwrap_or(std::time::Duration::from_secs(3600));
                tokio::select! {
                    () = tokio::time::sleep(delay_std) => {},
                    () = self.notify.notified() => {},
                }
                continue;
            }

            let mut heap = self.heap.lock().await;
            let now = Utc::now();
            let mut ready = Vec::new();
            let mut remaining: BinaryHeap<Reverse<HeapEntry>> = BinaryHeap::new();
            for Reverse(entry) in std::mem::take(&mut heap.0) {
                if entry.0.fire_at <= now {
                    ready.push(entry.0);
                } else {
                    remaining.push(Reverse(entry));
                }
            }
            heap.0 = remaining;

            if ready.is_empty() {
                continue;
            }

            let mut merged = merge_ready_triggers(ready);
            let best = merged.remove(0);
            for trigger in merged {
                heap.0.push(Reverse(HeapEntry(trigger)));
            }
            return best;
        }
    }

    /// Rewrites every trigger matching `session_id` so its `fire_at` is now,
    /// waking any waiter immediately.
    pub async fn fire(&self, session_id: &str) {
        let mut heap = self.heap.lock().await;
        let now = Utc::now();
        let rewritten: BinaryHeap<Reverse<HeapEntry>> = std::mem::take(&mut heap.0)
            .into_iter()
            .map(|Reverse(mut entry)| {
                if entry.0.session_id == session_id {
                    entry.0.fire_at = now;
                }
                Reverse(entry)
            })
            .collect();
        heap.0 = rewritten;
        drop(heap);
        self.notify.notify_one();
    }

    /// Removes every trigger belonging to any of `session_ids`.
    pub async fn remove_sessions(&self, session_ids: &[String]) {
        let mut heap = self.heap.lock().await;
        let retained: BinaryHeap<Reverse<HeapEntry>> = std::mem::take(&mut heap.0)
            .into_iter()
            .filter(|e| !session_ids.iter().any(|id| id == &e.0 .0.session_id))
            .collect();
        heap.0 = retained;
    }

    /// Removes every pending trigger.
    pub async fn clear(&self) {
        let mut heap = self.heap.lock().await;
        heap.0.clear();
    }

    /// Number of pending triggers.
    pub async fn size(&self) -> usize {
        self.heap.lock().await.0.len()
    }

    /// Snapshot of all pending triggers, unordered.
    pub async fn list_triggers(&self) -> Vec<Trigger> {
        self.heap.lock().await.0.iter().map(|e| e.0 .0.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(offset_secs: i64) -> DateTime<Utc> {
        Utc::now() + Duration::seconds(offset_secs)
    }

    #[tokio::test]
    async fn get_returns_ready_trigger_by_priority_then_fire_at() {
        let queue = TriggerQueue::with_identity_resolver();
        queue.put(Trigger::new(at(-5), 5, "a", "low priority")).await;
        queue.put(Trigger::new(at(-5), 1, "b", "high priority")).await;

        let best = queue.get().await;
        assert_eq!(best.session_id, "b");
    }

    #[tokio::test]
    async fn put_supersedes_existing_triggers_for_same_session() {
        let queue = TriggerQueue::with_identity_resolver();
        queue.put(Trigger::new(at(-5), 5, "a", "first")).await;
        queue.put(Trigger::new(at(-5), 1, "a", "second")).await;

        assert_eq!(queue.size().await, 1);
        let best = queue.get().await;
        assert_eq!(best.next_action_description, "second");
        assert_eq!(best.priority, 1);
    }

    #[tokio::test]
    async fn merge_ready_triggers_joins_descriptions_and_merges_payload() {
        let mut t1 = Trigger::new(at(-5), 3, "s", "check email");
        t1.payload.insert("count".into(), serde_json::json!(1));
        let mut t2 = Trigger::new(at(-5), 1, "s", "check calendar");
        t2.payload.insert("count".into(), serde_json::json!(2));
        t2.payload.insert("flag".into(), serde_json::json!(true));

        let merged = merge_ready_triggers(vec![t1, t2]);
        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert_eq!(m.priority, 1);
        assert!(m.next_action_description.contains("check email"));
        assert!(m.next_action_description.contains("check calendar"));
        assert_eq!(m.payload.get("count"), Some(&serde_json::json!(2)));
        assert_eq!(m.payload.get("flag"), Some(&serde_json::json!(true)));
    }

    #[tokio::test]
    async fn fire_moves_matching_triggers_to_now() {
        let queue = TriggerQueue::with_identity_resolver();
        queue.put(Trigger::new(at(3600), 1, "s", "later")).await;
        queue.fire("s").await;

        let best = tokio::time::timeout(std::time::Duration::from_secs(1), queue.get())
            .await
            .expect("should fire promptly after fire()");
        assert_eq!(best.session_id, "s");
    }

    #[tokio::test]
    async fn remove_sessions_drops_matching_triggers() {
        let queue = TriggerQueue::with_identity_resolver();
        queue.put(Trigger::new(at(-5), 1, "a", "x")).await;
        queue.put(Trigger::new(at(-5), 1, "b", "y")).await;
        queue.remove_sessions(&["a".to_string()]).await;
        assert_eq!(queue.size().await, 1);
        let remaining = queue.list_triggers().await;
        assert_eq!(remaining[0].session_id, "b");
    }

    #[tokio::test]
    async fn clear_empties_the_queue() {
        let queue = TriggerQueue::with_identity_resolver();
        queue.put(Trigger::new(at(-5), 1, "a", "x")).await;
        queue.clear().await;
        assert_eq!(queue.size().await, 0);
    }
}
