//! Persistence: append-only JSONL audit log, action/task-document JSON
//! stores, and the vector-index abstraction used for few-shot and action
//! search (spec §6, design note "Vector search abstraction").
//!
//! Grounded on the teacher's `storage.rs` (R2-backed chat log, same
//! append/upsert vocabulary) and `examples/original_source/core/database_interface.py`'s
//! `log_task`/`log_action_history`/`get_task_document_texts` surface,
//! re-expressed as a local filesystem store since the kernel drops the R2
//! backend along with the Telegram bot.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;

/// Errors surfaced by the filesystem-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only JSONL audit log at `<data_dir>/agent_logs.txt`. Every method
/// appends one record; "upsert by id" is a read-time concern for whoever
/// replays the log, not a rewrite of this file (spec §6 describes the file
/// itself as append-only).
pub struct AgentLogStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl AgentLogStore {
    /// # Errors
    ///
    /// Returns `StorageError::Io` if `data_dir` cannot be created.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            path: data_dir.join("agent_logs.txt"),
            lock: Mutex::new(()),
        })
    }

    fn append(&self, record: &Value) -> Result<(), StorageError> {
        let _guard = self.lock.lock().expect("agent log mutex poisoned");
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{record}")?;
        Ok(())
    }

    /// Logs one LLM call: the full prompt, response, provider/model, and
    /// token counts.
    pub fn log_prompt(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        output: &str,
        provider: &str,
        model: &str,
        status: &str,
        tokens_input: u64,
        tokens_output: u64,
    ) {
        let record = json!({
            "entry_type": "prompt_log",
            "datetime": Utc::now().to_rfc3339(),
            "input": {"system_prompt": system_prompt, "user_prompt": user_prompt},
            "output": output,
            "provider": provider,
            "model": model,
            "status": status,
            "token_count_input": tokens_input,
            "token_count_output": tokens_output,
        });
        if let Err(err) = self.append(&record) {
            warn!(%err, "failed to append prompt_log record");
        }
    }

    /// Logs one action run's history row, upserted by `run_id` at
    /// replay-time.
    #[allow(clippy::too_many_arguments)]
    pub fn log_action_history(
        &self,
        run_id: &str,
        session_id: &str,
        parent_id: Option<&str>,
        name: &str,
        action_type: &str,
        status: &str,
        inputs: &Value,
        outputs: &Value,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
    ) {
        let record = json!({
            "entry_type": "action_history",
            "runId": run_id,
            "sessionId": session_id,
            "parentId": parent_id,
            "name": name,
            "action_type": action_type,
            "status": status,
            "inputs": inputs,
            "outputs": outputs,
            "startedAt": started_at.to_rfc3339(),
            "endedAt": ended_at.map(|t| t.to_rfc3339()),
        });
        if let Err(err) = self.append(&record) {
            warn!(%err, "failed to append action_history record");
        }
    }

    /// Logs a task's current plan snapshot, upserted by `task_id`.
    pub fn log_task(&self, task_id: &str, name: &str, instruction: &str, steps: &Value, status: &str, results: Option<&Value>) {
        let record = json!({
            "entry_type": "task_log",
            "task_id": task_id,
            "name": name,
            "instruction": instruction,
            "steps": steps,
            "created_at": Utc::now().to_rfc3339(),
            "status": status,
            "results": results,
            "updated_at": Utc::now().to_rfc3339(),
        });
        if let Err(err) = self.append(&record) {
            warn!(%err, "failed to append task_log record");
        }
    }
}

/// JSON-file store for serialized Actions, one file per action under
/// `<data_dir>/action/<name>.json`.
pub struct ActionStore {
    dir: PathBuf,
}

impl ActionStore {
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the store directory cannot be created.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().join("action");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_filename(name)))
    }

    /// # Errors
    ///
    /// Returns `StorageError` if serialization or the write fails.
    pub fn save<T: Serialize>(&self, name: &str, action: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(action)?;
        fs::write(self.path_for(name), json)?;
        Ok(())
    }

    /// Loads every action document in the store.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory cannot be read.
    pub fn load_all<T: for<'de> Deserialize<'de>>(&self) -> Result<Vec<T>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.path().extension().is_some_and(|ext| ext == "json") {
                let content = fs::read_to_string(entry.path())?;
                match serde_json::from_str(&content) {
                    Ok(value) => out.push(value),
                    Err(err) => warn!(path = %entry.path().display(), %err, "skipping malformed action document"),
                }
            }
        }
        Ok(out)
    }
}

/// Plain-text store for task documents (few-shot planner examples) under
/// `<data_dir>/task_document/<id>.txt`, each file containing
/// `"{name}\n\n{description}"`.
pub struct TaskDocumentStore {
    dir: PathBuf,
}

impl TaskDocumentStore {
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the store directory cannot be created.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = data_dir.as_ref().join("task_document");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// # Errors
    ///
    /// Returns `StorageError::Io` if the write fails.
    pub fn save(&self, id: &str, name: &str, description: &str) -> Result<(), StorageError> {
        let path = self.dir.join(format!("{}.txt", sanitize_filename(id)));
        fs::write(path, format!("{name}\n\n{description}"))?;
        Ok(())
    }

    /// Loads every `(id, text)` pair in the store, for re-indexing on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the directory cannot be read.
    pub fn load_all(&self) -> Result<Vec<(String, String)>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "txt") {
                let id = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                let text = fs::read_to_string(&path)?;
                out.push((id, text));
            }
        }
        Ok(out)
    }
}

fn sanitize_filename(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' }).collect()
}

/// Minimal similarity search over indexed `(id, text)` documents. Any
/// backend satisfying `index`/`search` suffices (design note "Vector
/// search abstraction"); this crate ships an in-process TF-IDF cosine
/// implementation rather than depending on a hosted embeddings API.
pub trait VectorIndex: Send + Sync {
    fn index(&mut self, id: String, text: &str);
    fn search(&self, query: &str, k: usize) -> Vec<String>;
}

/// TF-IDF cosine-similarity index, rebuilt from scratch on every `index()`
/// call batch (the stores are re-indexed wholesale on startup per spec
/// §6, not incrementally maintained under heavy write load).
#[derive(Default)]
pub struct TfIdfIndex {
    documents: Vec<(String, HashMap<String, f64>)>,
    document_frequency: HashMap<String, usize>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.unicode_words().map(|w| w.to_lowercase()).filter(|w| !w.is_empty()).collect()
}

impl TfIdfIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rebuild_document_frequency(&mut self) {
        self.document_frequency.clear();
        for (_, term_counts) in &self.documents {
            for term in term_counts.keys() {
                *self.document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
        }
    }

    fn vectorize(&self, tokens: &[String]) -> HashMap<String, f64> {
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token.clone()).or_insert(0.0) += 1.0;
        }
        let num_docs = self.documents.len().max(1) as f64;
        for (term, count) in &mut counts {
            let df = *self.document_frequency.get(term).unwrap_or(&1) as f64;
            *count *= (num_docs / df).ln() + 1.0;
        }
        counts
    }
}

fn cosine_similarity(a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
    let mut dot = 0.0;
    for (term, weight) in a {
        if let Some(other_weight) = b.get(term) {
            dot += weight * other_weight;
        }
    }
    let norm_a = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let norm_b = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl VectorIndex for TfIdfIndex {
    fn index(&mut self, id: String, text: &str) {
        let tokens = tokenize(text);
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0.0) += 1.0;
        }
        self.documents.retain(|(existing_id, _)| existing_id != &id);
        self.documents.push((id, counts));
        self.rebuild_document_frequency();
    }

    fn search(&self, query: &str, k: usize) -> Vec<String> {
        if self.documents.is_empty() {
            return Vec::new();
        }
        let query_vector = self.vectorize(&tokenize(query));
        let mut scored: Vec<(String, f64)> = self
            .documents
            .iter()
            .map(|(id, term_counts)| {
                let doc_vector = self.vectorize(&term_counts.keys().cloned().collect::<Vec<_>>());
                let weighted = term_counts.iter().map(|(t, c)| (t.clone(), c * doc_vector.get(t).copied().unwrap_or(1.0))).collect();
                (id.clone(), cosine_similarity(&query_vector, &weighted))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().take(k).map(|(id, _)| id).collect()
    }
}
