//! Per-model load state tracking.
//!
//! [`LoadManager`] keeps the latest [`ModelLoadState`] for every model the
//! local backend has touched and broadcasts each change. Subscribers that
//! fall behind miss intermediate progress updates but always see the latest
//! state through [`LoadManager::state`].

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Idle,
    Downloading,
    Compiling,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelLoadState {
    pub model_id: String,
    pub status: LoadStatus,
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ModelLoadState {
    fn idle(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: LoadStatus::Idle,
            progress: 0.0,
            error: None,
        }
    }
}

/// Records load state per model and broadcasts every change.
pub struct LoadManager {
    states: RwLock<HashMap<String, ModelLoadState>>,
    events: broadcast::Sender<ModelLoadState>,
}

impl std::fmt::Debug for LoadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("LoadManager")
            .field("models", &states.len())
            .field("subscribers", &self.events.receiver_count())
            .finish()
    }
}

impl Default for LoadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadManager {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Latest state, or `idle` for a model never seen.
    pub fn state(&self, model_id: &str) -> ModelLoadState {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| ModelLoadState::idle(model_id))
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.state(model_id).status == LoadStatus::Ready
    }

    /// Record a status change and broadcast the merged state.
    pub fn update(&self, model_id: &str, status: LoadStatus, progress: Option<f64>) {
        self.apply(model_id, |state| {
            state.status = status;
            if let Some(progress) = progress {
                state.progress = progress.clamp(0.0, 1.0);
            }
            if status != LoadStatus::Error {
                state.error = None;
            }
        });
    }

    pub fn fail(&self, model_id: &str, error: impl Into<String>) {
        let error = error.into();
        self.apply(model_id, move |state| {
            state.status = LoadStatus::Error;
            state.error = Some(error);
        });
    }

    /// Receive every subsequent state change.
    pub fn subscribe(&self) -> broadcast::Receiver<ModelLoadState> {
        self.events.subscribe()
    }

    pub fn clear(&self) {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn apply(&self, model_id: &str, change: impl FnOnce(&mut ModelLoadState)) {
        let next = {
            let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
            let state = states
                .entry(model_id.to_string())
                .or_insert_with(|| ModelLoadState::idle(model_id));
            change(state);
            state.clone()
        };
        tracing::debug!(
            "LoadManager: {} -> {:?} ({:.0}%)",
            next.model_id,
            next.status,
            next.progress * 100.0
        );
        // No subscribers is fine.
        let _ = self.events.send(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_is_idle() {
        let manager = LoadManager::new();
        let state = manager.state("phi");
        assert_eq!(state.status, LoadStatus::Idle);
        assert_eq!(state.progress, 0.0);
        assert!(!manager.is_loaded("phi"));
    }

    #[tokio::test]
    async fn test_updates_are_merged_and_broadcast() {
        let manager = LoadManager::new();
        let mut events = manager.subscribe();

        manager.update("phi", LoadStatus::Downloading, Some(0.4));
        manager.update("phi", LoadStatus::Compiling, None);

        let first = events.recv().await.unwrap();
        assert_eq!(first.status, LoadStatus::Downloading);
        let second = events.recv().await.unwrap();
        assert_eq!(second.status, LoadStatus::Compiling);
        assert_eq!(second.progress, 0.4);

        manager.update("phi", LoadStatus::Ready, Some(1.0));
        assert!(manager.is_loaded("phi"));
    }

    #[test]
    fn test_failure_records_message_until_next_attempt() {
        let manager = LoadManager::new();
        manager.fail("llama", "out of memory");
        assert_eq!(manager.state("llama").error.as_deref(), Some("out of memory"));

        manager.update("llama", LoadStatus::Downloading, Some(0.0));
        assert!(manager.state("llama").error.is_none());

        manager.clear();
        assert_eq!(manager.state("llama").status, LoadStatus::Idle);
    }
}
