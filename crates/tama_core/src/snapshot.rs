//! Usage snapshots
//!
//! Snapshots are recomputed on every query and never cached.

use crate::error::{MemError, MemResult, Missing};
use crate::usage::{usage_percent, ProcessUsage, UsageTracker};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::SystemTime;
use tama_env::ProcessId;

/// Immutable point-in-time usage of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pid: ProcessId,
    virtual_bytes: u64,
    resident_bytes: u64,
    usage_percent: u8,
    oom_score_adj: i32,
    timestamp: SystemTime,
}

impl UsageSnapshot {
    fn capture(usage: ProcessUsage) -> Self {
        Self {
            pid: usage.pid,
            virtual_bytes: usage.virtual_bytes,
            resident_bytes: usage.resident_bytes,
            usage_percent: usage_percent(usage.virtual_bytes, usage.resident_bytes),
            oom_score_adj: usage.oom_score_adj,
            timestamp: SystemTime::now(),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn virtual_bytes(&self) -> u64 {
        self.virtual_bytes
    }

    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    pub fn virtual_kb(&self) -> u64 {
        self.virtual_bytes >> 10
    }

    pub fn resident_kb(&self) -> u64 {
        self.resident_bytes >> 10
    }

    pub fn usage_percent(&self) -> u8 {
        self.usage_percent
    }

    pub fn oom_score_adj(&self) -> i32 {
        self.oom_score_adj
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Sums over every included process, in whole MB. Each process's figure
/// is truncated before it is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub virtual_mb: u64,
    pub resident_mb: u64,
}

impl UsageTotals {
    fn add(&mut self, snapshot: &UsageSnapshot) {
        self.virtual_mb += snapshot.virtual_bytes >> 20;
        self.resident_mb += snapshot.resident_bytes >> 20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotScope {
    All,
    Process(ProcessId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub snapshots: Vec<UsageSnapshot>,
    /// Entries returned in `snapshots`.
    pub produced: usize,
    /// Entries that existed before truncation.
    pub available: usize,
    pub totals: UsageTotals,
}

impl SnapshotReport {
    pub fn is_truncated(&self) -> bool {
        self.produced < self.available
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub struct SnapshotReporter {
    usage: Arc<UsageTracker>,
}

impl SnapshotReporter {
    pub(crate) fn new(usage: Arc<UsageTracker>) -> Self {
        Self { usage }
    }

    /// Snapshot one process or every measurable process, returning at most
    /// `limit` entries. Totals always cover every included process.
    pub fn snapshot(&self, scope: SnapshotScope, limit: usize) -> MemResult<SnapshotReport> {
        if limit == 0 {
            return Err(MemError::invalid("snapshot limit must be at least 1"));
        }

        let mut snapshots = match scope {
            SnapshotScope::Process(pid) => vec![self.process(pid)?],
            SnapshotScope::All => self.collect_all(),
        };

        let mut totals = UsageTotals::default();
        for snapshot in &snapshots {
            totals.add(snapshot);
        }

        let available = snapshots.len();
        snapshots.truncate(limit);
        Ok(SnapshotReport {
            produced: snapshots.len(),
            available,
            snapshots,
            totals,
        })
    }

    pub fn process(&self, pid: ProcessId) -> MemResult<UsageSnapshot> {
        self.usage
            .measure(pid)
            .map(UsageSnapshot::capture)
            .ok_or(MemError::not_found(pid, Missing::Process))
    }

    /// Global totals only.
    pub fn aggregate(&self) -> UsageTotals {
        let mut totals = UsageTotals::default();
        for snapshot in self.collect_all() {
            totals.add(&snapshot);
        }
        totals
    }

    fn collect_all(&self) -> Vec<UsageSnapshot> {
        self.usage
            .known_pids()
            .into_par_iter()
            .filter_map(|pid| self.usage.measure(pid).map(UsageSnapshot::capture))
            .collect()
    }
}
