use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// In-process recorder of named monotonic counters.
///
/// The server is single-process and memory-only, so counters live in a map
/// and are read out through point-in-time snapshots; there is no external
/// metrics surface.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    counters: RwLock<BTreeMap<String, u64>>,
}

/// Point-in-time view of every counter.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub captured_at: DateTime<Utc>,
    pub counters: BTreeMap<String, u64>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    pub fn increment_by(&self, name: &str, delta: u64) {
        let mut counters = self.counters.write();
        *counters.entry(name.to_owned()).or_insert(0) += delta;
    }

    /// Current value of a counter; zero if it was never incremented.
    pub fn get(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured_at: Utc::now(),
            counters: self.counters.read().clone(),
        }
    }
}
