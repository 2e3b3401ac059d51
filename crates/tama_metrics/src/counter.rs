//! Named counters for tracking allocator events

use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Shared event counters. Safe to bump from concurrent fault handlers.
pub struct Counter {
    counters: Mutex<BTreeMap<&'static str, u64>>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn increment(&self, name: &'static str, value: u64) {
        *self.counters.lock().entry(name).or_insert(0) += value;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn reset_all(&self) {
        self.counters.lock().clear();
    }

    /// Point-in-time copy of every counter, sorted by name.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        self.counters
            .lock()
            .iter()
            .map(|(name, value)| (*name, *value))
            .collect()
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
