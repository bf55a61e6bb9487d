// src/pipeline/state_store.rs
//
// The latest state of every spot. Replaced wholesale once per classification
// cycle, patched per spot by recognition results. Readers get a copy.

use crate::types::{Snapshot, SpotRuntimeState};
use std::sync::{Mutex, PoisonError};

#[derive(Default)]
pub struct SpotStateStore {
    state: Mutex<Snapshot>,
}

impl SpotStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Apply `f` to one spot and return the resulting full snapshot, or None
    /// if the spot is not present.
    pub fn patch<F>(&self, spot: &str, f: F) -> Option<Snapshot>
    where
        F: FnOnce(&mut SpotRuntimeState),
    {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = state.get_mut(spot)?;
        f(entry);
        Some(state.clone())
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, spot: &str) -> Option<SpotRuntimeState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(spot)
            .cloned()
    }
}
