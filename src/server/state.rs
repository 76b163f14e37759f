use std::sync::Arc;

use tracing::error;

use crate::fleet::FleetController;
use crate::store::StateStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<FleetController>,
    pub store: Option<StateStore>,
}

impl AppState {
    pub fn new(controller: Arc<FleetController>) -> Self {
        Self {
            controller,
            store: None,
        }
    }

    /// Persist fleet state after every successful mutation
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Save the current fleet if a store is configured. Failures are logged.
    pub fn persist(&self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&self.controller.snapshot()) {
                error!(path = %store.path().display(), "Failed to save fleet state: {}", e);
            }
        }
    }
}
