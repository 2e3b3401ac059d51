//! Usage tracking
//!
//! Combines the allocator's own counters with host-reported figures for
//! memory outside the allocator. The two sources are disjoint, so they add.

use crate::error::{MemError, MemResult, Missing};
use crate::region::RegionTable;
use std::sync::Arc;
use tama_env::{HostProcess, ProcessDirectory, ProcessId, ProcessState};

/// Point-in-time usage of one process, before it is stamped into a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUsage {
    pub pid: ProcessId,
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    pub oom_score_adj: i32,
}

pub struct UsageTracker {
    table: Arc<RegionTable>,
    directory: Arc<dyn ProcessDirectory>,
}

impl UsageTracker {
    pub(crate) fn new(table: Arc<RegionTable>, directory: Arc<dyn ProcessDirectory>) -> Self {
        Self { table, directory }
    }

    pub fn directory(&self) -> &dyn ProcessDirectory {
        self.directory.as_ref()
    }

    /// Host view of `pid`, or `NotFound` if the host does not know it.
    pub fn process(&self, pid: ProcessId) -> MemResult<HostProcess> {
        self.directory
            .lookup(pid)
            .ok_or(MemError::not_found(pid, Missing::Process))
    }

    /// Backed allocator pages plus host-resident memory outside the allocator.
    pub fn resident_bytes(&self, pid: ProcessId) -> u64 {
        let host = self.directory.lookup(pid).map_or(0, |p| p.resident_bytes);
        self.table.resident_bytes(pid).saturating_add(host)
    }

    /// Allocator region lengths, backed or not, plus host virtual size.
    pub fn virtual_bytes(&self, pid: ProcessId) -> u64 {
        let host = self.directory.lookup(pid).map_or(0, |p| p.virtual_bytes);
        self.table.reserved_bytes(pid).saturating_add(host)
    }

    /// The figure admission charges against: every byte the allocator has
    /// admitted for `pid` plus what the host already holds resident for it.
    /// Host virtual size is not charged.
    pub fn committed_bytes(&self, pid: ProcessId) -> u64 {
        let host = self.directory.lookup(pid).map_or(0, |p| p.resident_bytes);
        self.table.reserved_bytes(pid).saturating_add(host)
    }

    /// Usage for `pid`, or `None` if it has no measurable memory (unknown,
    /// zombie, or no address space and no allocator regions).
    pub fn measure(&self, pid: ProcessId) -> Option<ProcessUsage> {
        let host = self.directory.lookup(pid)?;
        let reserved = self.table.reserved_bytes(pid);
        // A process with allocator regions counts even without a host
        // address space.
        if !host.is_measurable() && (host.state == ProcessState::Zombie || reserved == 0) {
            return None;
        }
        Some(ProcessUsage {
            pid,
            virtual_bytes: reserved.saturating_add(host.virtual_bytes),
            resident_bytes: self.table.resident_bytes(pid).saturating_add(host.resident_bytes),
            oom_score_adj: host.oom_score_adj,
        })
    }

    pub fn known_pids(&self) -> Vec<ProcessId> {
        self.directory.pids()
    }
}

/// `resident * 100 / virtual`, clamped to 100; 0 when nothing is mapped.
pub fn usage_percent(virtual_bytes: u64, resident_bytes: u64) -> u8 {
    if virtual_bytes == 0 {
        return 0;
    }
    if resident_bytes >= virtual_bytes {
        return 100;
    }
    (resident_bytes as u128 * 100 / virtual_bytes as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use tama_env::StaticDirectory;

    fn tracker(dir: StaticDirectory) -> UsageTracker {
        UsageTracker::new(Arc::new(RegionTable::new(4096)), Arc::new(dir))
    }

    #[test]
    fn test_usage_percent() {
        assert_eq!(usage_percent(0, 0), 0);
        assert_eq!(usage_percent(0, 4096), 0);
        assert_eq!(usage_percent(400, 100), 25);
        assert_eq!(usage_percent(3, 1), 33);
        // Resident may briefly exceed virtual
        assert_eq!(usage_percent(100, 150), 100);
        assert_eq!(usage_percent(u64::MAX, u64::MAX - 1), 99);
    }

    #[test]
    fn test_host_figures_only() {
        let dir = StaticDirectory::new();
        dir.insert(HostProcess::alive(ProcessId(3)).with_usage(1 << 20, 1 << 16));
        let tracker = tracker(dir);

        assert_eq!(tracker.virtual_bytes(ProcessId(3)), 1 << 20);
        assert_eq!(tracker.resident_bytes(ProcessId(3)), 1 << 16);
        assert_eq!(tracker.committed_bytes(ProcessId(3)), 1 << 16);
        assert_eq!(tracker.resident_bytes(ProcessId(99)), 0);
        assert!(tracker.process(ProcessId(99)).is_err());
    }

    #[test]
    fn test_measure_skips_unmeasurable() {
        let dir = StaticDirectory::with_pids([1, 2]);
        dir.insert(HostProcess {
            has_address_space: false,
            ..HostProcess::alive(ProcessId(3))
        });
        dir.mark_zombie(ProcessId(2));
        let tracker = tracker(dir);

        assert!(tracker.measure(ProcessId(1)).is_some());
        assert!(tracker.measure(ProcessId(2)).is_none());
        assert!(tracker.measure(ProcessId(3)).is_none());
        assert!(tracker.measure(ProcessId(4)).is_none());
    }

    #[test]
    fn test_measure_counts_regions_without_host_address_space() {
        let dir = Arc::new(StaticDirectory::new());
        dir.insert(HostProcess {
            has_address_space: false,
            ..HostProcess::alive(ProcessId(3))
        });
        dir.insert(HostProcess::alive(ProcessId(4)));
        dir.mark_zombie(ProcessId(4));

        let table = Arc::new(RegionTable::new(4096));
        for pid in [3, 4] {
            let space = table.space_or_insert(ProcessId(pid));
            let mut inner = space.lock();
            space.insert(&mut inner, 0x10000, 8192);
        }
        let tracker = UsageTracker::new(table, dir);

        let usage = tracker.measure(ProcessId(3)).unwrap();
        assert_eq!(usage.virtual_bytes, 8192);
        // Zombies stay skipped even with regions.
        assert!(tracker.measure(ProcessId(4)).is_none());
    }
}
