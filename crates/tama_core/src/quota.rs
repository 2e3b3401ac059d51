//! Per-process memory quotas
//!
//! Entries live in a sharded concurrent map: `admit` holds a shard read
//! guard only while it compares against the limit, `update` holds the shard
//! write guard while it swaps the limit, so an admission sees either the old
//! or the new limit. Usage is read before the guard is taken.

use crate::error::{MemError, MemResult, Missing};
use crate::usage::UsageTracker;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tama_env::{PrivilegeSource, ProcessId};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEntry {
    pub pid: ProcessId,
    pub limit_bytes: u64,
}

/// Result of `list`: the entries returned plus the true number registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaListing {
    pub entries: Vec<QuotaEntry>,
    pub returned: usize,
    pub total: usize,
}

impl QuotaListing {
    pub fn is_truncated(&self) -> bool {
        self.returned < self.total
    }
}

struct Slot {
    seq: u64,
    limit_bytes: u64,
}

pub struct QuotaRegistry {
    entries: DashMap<ProcessId, Slot>,
    next_seq: AtomicU64,
    usage: Arc<UsageTracker>,
    privilege: Arc<dyn PrivilegeSource>,
    prune_exited: bool,
}

impl QuotaRegistry {
    pub(crate) fn new(
        usage: Arc<UsageTracker>,
        privilege: Arc<dyn PrivilegeSource>,
        prune_exited: bool,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            next_seq: AtomicU64::new(0),
            usage,
            privilege,
            prune_exited,
        }
    }

    /// Set a limit for a process that has none yet.
    ///
    /// Fails `QuotaExceeded` if the process already uses more than
    /// `limit_bytes`.
    pub fn register(&self, pid: ProcessId, limit_bytes: u64) -> MemResult<()> {
        validate(pid, limit_bytes)?;
        self.require_admin("register a memory limit")?;
        self.usage.process(pid)?;

        let current = self.usage.committed_bytes(pid);
        if current > limit_bytes {
            return Err(MemError::QuotaExceeded {
                pid,
                current,
                requested: 0,
                limit: limit_bytes,
            });
        }

        match self.entries.entry(pid) {
            Entry::Occupied(_) => Err(MemError::AlreadyExists { pid }),
            Entry::Vacant(v) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                v.insert(Slot { seq, limit_bytes });
                info!(%pid, limit_bytes, "quota registered");
                Ok(())
            }
        }
    }

    /// Replace the limit of an existing entry. Already admitted regions are
    /// left alone even if they now exceed the new limit.
    pub fn update(&self, pid: ProcessId, new_limit_bytes: u64) -> MemResult<()> {
        validate(pid, new_limit_bytes)?;
        self.require_admin("update a memory limit")?;
        self.prune_if_exited(pid);

        let mut slot = self
            .entries
            .get_mut(&pid)
            .ok_or(MemError::not_found(pid, Missing::QuotaEntry))?;
        let old = std::mem::replace(&mut slot.limit_bytes, new_limit_bytes);
        drop(slot);

        info!(%pid, old_limit = old, limit_bytes = new_limit_bytes, "quota updated");
        Ok(())
    }

    pub fn remove(&self, pid: ProcessId) -> MemResult<()> {
        if pid.raw() == 0 {
            return Err(MemError::invalid("process id 0 is reserved"));
        }
        self.require_admin("remove a memory limit")?;
        self.entries
            .remove(&pid)
            .ok_or(MemError::not_found(pid, Missing::QuotaEntry))?;
        info!(%pid, "quota removed");
        Ok(())
    }

    /// `Ok` when `requested_bytes` more fit under the process's limit.
    /// Processes without an entry are unlimited.
    pub fn check_admission(&self, pid: ProcessId, requested_bytes: u64) -> MemResult<()> {
        self.prune_if_exited(pid);
        if !self.entries.contains_key(&pid) {
            return Ok(());
        }

        // Host figures may come from procfs; read them before taking the
        // shard guard. Only the limit must be read atomically with `update`.
        let current = self.usage.committed_bytes(pid);
        let Some(slot) = self.entries.get(&pid) else {
            return Ok(());
        };
        let fits = current
            .checked_add(requested_bytes)
            .is_some_and(|total| total <= slot.limit_bytes);
        if fits {
            Ok(())
        } else {
            Err(MemError::QuotaExceeded {
                pid,
                current,
                requested: requested_bytes,
                limit: slot.limit_bytes,
            })
        }
    }

    pub fn admit(&self, pid: ProcessId, requested_bytes: u64) -> bool {
        self.check_admission(pid, requested_bytes).is_ok()
    }

    /// Up to `max_entries` entries in registration order. `total` always
    /// counts every entry, so `list(0)` only reports the count.
    pub fn list(&self, max_entries: usize) -> QuotaListing {
        if self.prune_exited {
            self.prune();
        }

        let mut all: Vec<(u64, QuotaEntry)> = self
            .entries
            .iter()
            .map(|entry| {
                let slot = entry.value();
                (
                    slot.seq,
                    QuotaEntry {
                        pid: *entry.key(),
                        limit_bytes: slot.limit_bytes,
                    },
                )
            })
            .collect();
        all.sort_unstable_by_key(|(seq, _)| *seq);

        let total = all.len();
        let entries: Vec<QuotaEntry> = all
            .into_iter()
            .take(max_entries)
            .map(|(_, entry)| entry)
            .collect();
        QuotaListing {
            returned: entries.len(),
            entries,
            total,
        }
    }

    pub fn limit(&self, pid: ProcessId) -> Option<u64> {
        self.entries.get(&pid).map(|slot| slot.limit_bytes)
    }

    /// Drop entries whose process the host no longer knows.
    pub fn prune(&self) -> usize {
        let directory = self.usage.directory();
        let mut pruned = 0;
        self.entries.retain(|pid, _| {
            let keep = directory.contains(*pid);
            if !keep {
                pruned += 1;
            }
            keep
        });
        if pruned > 0 {
            debug!(pruned, "pruned quota entries of exited processes");
        }
        pruned
    }

    /// Implicit removal on process exit; needs no privilege.
    pub fn forget(&self, pid: ProcessId) -> bool {
        self.entries.remove(&pid).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_if_exited(&self, pid: ProcessId) {
        if self.prune_exited
            && !self.usage.directory().contains(pid)
            && self.entries.remove(&pid).is_some()
        {
            debug!(%pid, "pruned stale quota entry");
        }
    }

    fn require_admin(&self, action: &'static str) -> MemResult<()> {
        if self.privilege.is_admin() {
            Ok(())
        } else {
            Err(MemError::PermissionDenied { action })
        }
    }
}

fn validate(pid: ProcessId, limit_bytes: u64) -> MemResult<()> {
    if pid.raw() == 0 {
        return Err(MemError::invalid("process id 0 is reserved"));
    }
    if limit_bytes == 0 {
        return Err(MemError::invalid("limit must be greater than zero"));
    }
    Ok(())
}
