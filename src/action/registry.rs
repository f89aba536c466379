//! Action Registry: lookup by name plus semantic-similarity search over
//! the action store (spec §4.4/§4.6).

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;
use tracing::info;

use crate::action::Action;
use crate::storage::{ActionStore, StorageError, TfIdfIndex, VectorIndex};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("action not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// In-memory catalog of Actions, backed by `ActionStore` for persistence
/// and a `VectorIndex` for the Router's semantic candidate search.
pub struct ActionRegistry {
    store: ActionStore,
    actions: RwLock<HashMap<String, Action>>,
    index: RwLock<Box<dyn VectorIndex>>,
}

impl ActionRegistry {
    /// Builds a registry backed by `store`, re-indexing any actions
    /// already persisted on disk.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Storage` if the on-disk store can't be read.
    pub fn load(store: ActionStore) -> Result<Self, RegistryError> {
        let loaded: Vec<Action> = store.load_all()?;
        let mut actions = HashMap::new();
        let mut index = TfIdfIndex::new();
        for action in loaded {
            index.index(action.name.clone(), &format!("{}\n{}", action.name, action.description));
            actions.insert(action.name.clone(), action);
        }
        info!(count = actions.len(), "action registry loaded from disk");
        Ok(Self {
            store,
            actions: RwLock::new(actions),
            index: RwLock::new(Box::new(index)),
        })
    }

    /// Registers or replaces an action, persisting it and re-indexing its
    /// name/description text.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Storage` if persisting the action fails.
    pub fn register(&self, action: Action) -> Result<(), RegistryError> {
        self.store.save(&action.name, &action)?;
        self.index.write().expect("index lock poisoned").index(action.name.clone(), &format!("{}\n{}", action.name, action.description));
        self.actions.write().expect("actions lock poisoned").insert(action.name.clone(), action);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Action> {
        self.actions.read().expect("actions lock poisoned").get(name).cloned()
    }

    #[must_use]
    pub fn list(&self) -> Vec<Action> {
        self.actions.read().expect("actions lock poisoned").values().cloned().collect()
    }

    /// Returns up to `k` action names most similar to `query`.
    #[must_use]
    pub fn search(&self, query: &str, k: usize) -> Vec<String> {
        self.index.read().expect("index lock poisoned").search(query, k)
    }
}
