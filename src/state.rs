//! Key-value staging area for step arguments.
//!
//! Front-ends write values as the user edits them (`set_item`), promote the
//! ones they want to keep (`sync_item`), and snapshot the committed layer into
//! a step with [`StateStore::collect_step_args`].

use std::collections::HashMap;
use std::sync::RwLock;

use crate::jobs::{ArgValue, RawArgs};

#[derive(Debug, Default)]
struct Layers {
    staged: HashMap<String, ArgValue>,
    committed: HashMap<String, ArgValue>,
}

/// Two-layer argument store: staged edits and committed values.
#[derive(Debug, Default)]
pub struct StateStore {
    layers: RwLock<Layers>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value for `key`, falling back to the staged one.
    pub fn get_item(&self, key: &str) -> Option<ArgValue> {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        layers
            .committed
            .get(key)
            .or_else(|| layers.staged.get(key))
            .cloned()
    }

    /// Stage a value. It is not part of a step snapshot until synced.
    pub fn set_item(&self, key: impl Into<String>, value: impl Into<ArgValue>) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.staged.insert(key.into(), value.into());
    }

    /// Promote the staged value of `key` into the committed layer.
    ///
    /// Returns `false` if nothing is staged under `key`; the committed value,
    /// if any, is left as it was.
    pub fn sync_item(&self, key: &str) -> bool {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        let Some(value) = layers.staged.get(key).cloned() else {
            return false;
        };
        layers.committed.insert(key.to_string(), value);
        true
    }

    /// Remove `key` from both layers.
    pub fn clear_item(&self, key: &str) {
        let mut layers = self.layers.write().unwrap_or_else(|e| e.into_inner());
        layers.staged.remove(key);
        layers.committed.remove(key);
    }

    /// Snapshot the committed values of `keys`. Missing keys are skipped.
    pub fn collect_step_args<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> RawArgs {
        let layers = self.layers.read().unwrap_or_else(|e| e.into_inner());
        keys.into_iter()
            .filter_map(|key| {
                layers
                    .committed
                    .get(key)
                    .map(|value| (key.to_string(), value.clone()))
            })
            .collect()
    }
}
