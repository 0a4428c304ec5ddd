use std::collections::HashMap;

use serde::Serialize;
use servel_core::{ResourceKey, ResourceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detection {
    Changed,
    Unchanged,
}

/// Last committed iteration marker per resource.
///
/// A resource with no entry has never merged since startup and always reads as
/// changed; an entry holding `None` means the last merged payload carried no marker.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    seen: HashMap<ResourceKey, Option<String>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds markers committed by earlier processes.
    pub fn hydrate(&mut self, states: &[ResourceState]) {
        for state in states {
            self.seen.insert(state.key, state.last_marker.clone());
        }
    }

    pub fn detect(&self, key: ResourceKey, incoming: Option<&str>) -> Detection {
        match self.seen.get(&key) {
            Some(stored) if stored.as_deref() == incoming => Detection::Unchanged,
            _ => Detection::Changed,
        }
    }

    /// Call only once the payload carrying `marker` has fully merged.
    pub fn commit(&mut self, key: ResourceKey, marker: Option<String>) {
        self.seen.insert(key, marker);
    }

    pub fn last_marker(&self, key: ResourceKey) -> Option<&str> {
        self.seen.get(&key).and_then(|m| m.as_deref())
    }
}
