//! Process registry
//!
//! Answers "does this process exist, and how much memory does the host
//! already account to it?". Figures reported here never include regions
//! managed by the allocator in `tama_core`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Host process identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl ProcessId {
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state as far as memory accounting cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Alive,
    Zombie,
}

/// Host-reported view of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProcess {
    pub pid: ProcessId,
    pub state: ProcessState,
    /// False for kernel threads and other tasks without a user address space.
    pub has_address_space: bool,
    pub virtual_bytes: u64,
    pub resident_bytes: u64,
    pub oom_score_adj: i32,
}

impl HostProcess {
    /// A live process with an (initially empty) address space.
    pub fn alive(pid: ProcessId) -> Self {
        Self {
            pid,
            state: ProcessState::Alive,
            has_address_space: true,
            virtual_bytes: 0,
            resident_bytes: 0,
            oom_score_adj: 0,
        }
    }

    pub fn with_usage(mut self, virtual_bytes: u64, resident_bytes: u64) -> Self {
        self.virtual_bytes = virtual_bytes;
        self.resident_bytes = resident_bytes;
        self
    }

    pub fn with_oom_score_adj(mut self, adj: i32) -> Self {
        self.oom_score_adj = adj;
        self
    }

    /// True when the process has memory worth reporting.
    pub fn is_measurable(&self) -> bool {
        self.state == ProcessState::Alive && self.has_address_space
    }
}

/// Source of process identity and host memory figures.
pub trait ProcessDirectory: Send + Sync {
    fn lookup(&self, pid: ProcessId) -> Option<HostProcess>;

    /// Every known process, ascending by id.
    fn pids(&self) -> Vec<ProcessId>;

    fn contains(&self, pid: ProcessId) -> bool {
        self.lookup(pid).is_some()
    }
}

/// In-memory process table, used when embedding the allocator in a
/// simulator and in tests.
pub struct StaticDirectory {
    processes: RwLock<BTreeMap<ProcessId, HostProcess>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            processes: RwLock::new(BTreeMap::new()),
        }
    }

    /// Build a directory of live processes with no host usage.
    pub fn with_pids(pids: impl IntoIterator<Item = u32>) -> Self {
        let dir = Self::new();
        for pid in pids {
            dir.insert(HostProcess::alive(ProcessId(pid)));
        }
        dir
    }

    pub fn insert(&self, process: HostProcess) {
        self.processes.write().insert(process.pid, process);
    }

    pub fn set_usage(&self, pid: ProcessId, virtual_bytes: u64, resident_bytes: u64) -> bool {
        match self.processes.write().get_mut(&pid) {
            Some(process) => {
                process.virtual_bytes = virtual_bytes;
                process.resident_bytes = resident_bytes;
                true
            }
            None => false,
        }
    }

    pub fn mark_zombie(&self, pid: ProcessId) -> bool {
        match self.processes.write().get_mut(&pid) {
            Some(process) => {
                process.state = ProcessState::Zombie;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, pid: ProcessId) -> Option<HostProcess> {
        self.processes.write().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.processes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.read().is_empty()
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessDirectory for StaticDirectory {
    fn lookup(&self, pid: ProcessId) -> Option<HostProcess> {
        self.processes.read().get(&pid).copied()
    }

    fn pids(&self) -> Vec<ProcessId> {
        self.processes.read().keys().copied().collect()
    }
}

/// Live host processes read from procfs.
///
/// Only Linux and Android expose procfs; elsewhere the directory is empty.
pub struct ProcFs {
    #[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
    page_size: u64,
}

impl ProcFs {
    pub fn new() -> Self {
        Self {
            page_size: crate::Memory::detect().page_size as u64,
        }
    }
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl ProcessDirectory for ProcFs {
    fn lookup(&self, pid: ProcessId) -> Option<HostProcess> {
        let base = format!("/proc/{}", pid.0);
        let statm = std::fs::read_to_string(format!("{base}/statm")).ok()?;
        let (virtual_bytes, resident_bytes) = parse_statm(&statm, self.page_size)?;
        let state = std::fs::read_to_string(format!("{base}/stat"))
            .ok()
            .and_then(|stat| parse_stat_state(&stat))
            .unwrap_or(ProcessState::Alive);
        let oom_score_adj = std::fs::read_to_string(format!("{base}/oom_score_adj"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        Some(HostProcess {
            pid,
            state,
            has_address_space: virtual_bytes > 0,
            virtual_bytes,
            resident_bytes,
            oom_score_adj,
        })
    }

    fn pids(&self) -> Vec<ProcessId> {
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };
        let mut pids: Vec<ProcessId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .map(ProcessId)
            .collect();
        pids.sort_unstable();
        pids
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl ProcessDirectory for ProcFs {
    fn lookup(&self, _pid: ProcessId) -> Option<HostProcess> {
        None
    }

    fn pids(&self) -> Vec<ProcessId> {
        Vec::new()
    }
}

/// `/proc/<pid>/statm`: "size resident shared text lib data dt", in pages.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn parse_statm(text: &str, page_size: u64) -> Option<(u64, u64)> {
    let mut fields = text.split_whitespace();
    let size: u64 = fields.next()?.parse().ok()?;
    let resident: u64 = fields.next()?.parse().ok()?;
    Some((size * page_size, resident * page_size))
}

/// `/proc/<pid>/stat`: the state letter follows the parenthesized command
/// name, which may itself contain spaces or parentheses.
#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn parse_stat_state(text: &str) -> Option<ProcessState> {
    let rest = &text[text.rfind(')')? + 1..];
    match rest.split_whitespace().next()? {
        "Z" | "X" => Some(ProcessState::Zombie),
        _ => Some(ProcessState::Alive),
    }
}
