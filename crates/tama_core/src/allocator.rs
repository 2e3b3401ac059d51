//! Demand-paged region allocator
//!
//! `create_region` admits and reserves address space only. Physical pages are
//! committed one at a time by `handle_access_fault`, the entry point the
//! host's trap delivery calls on first touch.

use crate::config::TamaConfig;
use crate::error::{MemError, MemResult, Missing};
use crate::page::{PageBackingProvider, PhysicalPage};
use crate::quota::QuotaRegistry;
use crate::region::{RegionHandle, RegionInfo, RegionTable};
use crate::usage::UsageTracker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tama_env::ProcessId;
use tama_metrics::{Counter, LatencyWindow};
use tracing::{debug, info, trace, warn};

/// A page made resident by a fault.
#[derive(Debug, Clone)]
pub struct CommittedPage {
    /// Page-aligned virtual address the page is mapped at.
    pub address: u64,
    pub page: Arc<PhysicalPage>,
}

pub struct RegionAllocator {
    config: TamaConfig,
    table: Arc<RegionTable>,
    usage: Arc<UsageTracker>,
    quota: Arc<QuotaRegistry>,
    provider: Arc<dyn PageBackingProvider>,
    counters: Counter,
    fault_latency: Mutex<LatencyWindow>,
}

impl RegionAllocator {
    pub(crate) fn new(
        config: TamaConfig,
        table: Arc<RegionTable>,
        usage: Arc<UsageTracker>,
        quota: Arc<QuotaRegistry>,
        provider: Arc<dyn PageBackingProvider>,
    ) -> Self {
        let fault_latency = Mutex::new(LatencyWindow::new(config.latency_window));
        Self {
            config,
            table,
            usage,
            quota,
            provider,
            counters: Counter::new(),
            fault_latency,
        }
    }

    #[inline]
    pub fn page_size(&self) -> u64 {
        self.config.page_size
    }

    /// Admit and reserve `requested_bytes` (rounded up to whole pages) for
    /// `pid`. No page is backed until it is faulted.
    pub fn create_region(&self, pid: ProcessId, requested_bytes: u64) -> MemResult<RegionHandle> {
        if pid.raw() == 0 {
            return Err(MemError::invalid("process id 0 is reserved"));
        }
        if requested_bytes == 0 {
            return Err(MemError::invalid("region size must be greater than zero"));
        }
        let len = self
            .config
            .round_to_page(requested_bytes)
            .ok_or(MemError::invalid("region size overflows the address space"))?;
        self.usage.process(pid)?;

        loop {
            let space = self.table.space_or_insert(pid);
            let mut inner = space.lock();
            if inner.retired {
                // Lost a race with process teardown; the table now holds a
                // fresh space (or none) for this pid.
                continue;
            }

            // Admission and reservation happen under the same lock, so two
            // creations for one process can never both pass the check.
            if let Err(err) = self.quota.check_admission(pid, len) {
                self.counters.increment("admission.denied", 1);
                warn!(%pid, len, error = %err, "region admission denied");
                return Err(err);
            }

            let base = inner
                .find_gap(len, self.config.address_base, self.config.address_limit)
                .ok_or(MemError::OutOfMemory {
                    reason: "no free virtual range large enough",
                })?;
            let region = space.insert(&mut inner, base, len);
            drop(inner);

            self.counters.increment("regions.created", 1);
            info!(%pid, base = format_args!("{base:#x}"), len, requested_bytes, "region reserved");
            return Ok(region.handle());
        }
    }

    /// Back the page containing `faulting_address`, or return the page
    /// already backing it. Never consults the quota registry.
    pub fn handle_access_fault(&self, pid: ProcessId, faulting_address: u64) -> MemResult<CommittedPage> {
        let missing = || MemError::not_found(pid, Missing::Address { address: faulting_address });
        let space = self.table.space(pid).ok_or_else(missing)?;
        let region = space.region_containing(faulting_address).ok_or_else(missing)?;

        let started = Instant::now();
        let fault = region.fault(faulting_address, self.provider.as_ref())?;

        if fault.fresh {
            self.counters.increment("faults.committed", 1);
            self.fault_latency.lock().record(started.elapsed());
            debug!(
                %pid,
                address = format_args!("{:#x}", fault.page_address),
                frame = fault.page.frame(),
                "page committed"
            );
        } else {
            self.counters.increment("faults.repeat", 1);
            trace!(%pid, address = format_args!("{:#x}", fault.page_address), "page already backed");
        }

        Ok(CommittedPage {
            address: fault.page_address,
            page: fault.page,
        })
    }

    /// Unmap every page of the region and forget it. The handle must belong
    /// to `pid`.
    pub fn release_region(&self, pid: ProcessId, handle: RegionHandle) -> MemResult<()> {
        let missing = || MemError::not_found(pid, Missing::Region { base: handle.base, len: handle.len });
        let space = self.table.space(pid).ok_or_else(missing)?;

        let region = {
            let mut inner = space.lock();
            let owned = inner
                .regions
                .get(&handle.base)
                .is_some_and(|region| region.handle() == handle);
            if owned {
                inner.regions.remove(&handle.base)
            } else {
                None
            }
        }
        .ok_or_else(missing)?;

        // Waits for in-flight faults on this region to finish.
        let backed = region.release().unwrap_or(0);
        self.counters.increment("regions.released", 1);
        info!(%pid, base = format_args!("{:#x}", handle.base), len = handle.len, backed, "region released");
        Ok(())
    }

    /// Tear down everything owned by an exited process, including its quota
    /// entry. Returns the number of regions released.
    pub fn release_process(&self, pid: ProcessId) -> usize {
        let quota_dropped = self.quota.forget(pid);
        let Some(space) = self.table.space(pid) else {
            return 0;
        };

        let regions = {
            let mut inner = space.lock();
            inner.retired = true;
            self.table.retire(pid, &space);
            std::mem::take(&mut inner.regions)
        };
        for region in regions.values() {
            region.release();
        }

        self.counters.increment("regions.released", regions.len() as u64);
        info!(%pid, regions = regions.len(), quota_dropped, "process memory released");
        regions.len()
    }

    /// Release the regions of every process the host no longer knows.
    pub fn prune_exited(&self) -> usize {
        let directory = self.usage.directory();
        self.table
            .pids()
            .into_iter()
            .filter(|pid| !directory.contains(*pid))
            .map(|pid| self.release_process(pid))
            .sum()
    }

    /// Live regions of `pid`, in address order.
    pub fn regions(&self, pid: ProcessId) -> Vec<RegionInfo> {
        self.table.space(pid).map_or_else(Vec::new, |space| {
            space.lock().regions.values().map(|region| region.info()).collect()
        })
    }

    pub fn counters(&self) -> &Counter {
        &self.counters
    }

    /// Average and worst commit latency over the recent window.
    pub fn fault_latency(&self) -> (std::time::Duration, std::time::Duration) {
        let window = self.fault_latency.lock();
        (window.average(), window.max())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;
    use crate::page::PagePool;
    use crate::region::PageState;
    use crate::{MemoryManager, RegionHandle, TamaConfig};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tama_env::{FixedPrivilege, ProcessId, StaticDirectory};

    const PAGE: u64 = 4096;

    struct Fixture {
        mm: MemoryManager,
        dir: Arc<StaticDirectory>,
        pool: Arc<PagePool>,
    }

    fn fixture_with(pids: &[u32], config: TamaConfig, frames: u64) -> Fixture {
        let dir = Arc::new(StaticDirectory::with_pids(pids.iter().copied()));
        let pool = Arc::new(PagePool::new(PAGE as usize, frames));
        let mm = MemoryManager::with_provider(
            config,
            dir.clone(),
            Arc::new(FixedPrivilege::granted()),
            pool.clone(),
        )
        .unwrap();
        Fixture { mm, dir, pool }
    }

    fn fixture(pids: &[u32]) -> Fixture {
        fixture_with(pids, TamaConfig::with_page_size(PAGE), 4096)
    }

    #[test]
    fn test_create_rounds_to_pages_without_backing() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 5000).unwrap();

        assert_eq!(handle.len, 2 * PAGE);
        assert_eq!(handle.base % PAGE, 0);
        assert_eq!(f.mm.usage().virtual_bytes(pid), 2 * PAGE);
        assert_eq!(f.mm.usage().resident_bytes(pid), 0);
        assert_eq!(f.pool.stats().handed_out, 0);

        let regions = f.mm.allocator().regions(pid);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].handle, handle);
        assert_eq!(regions[0].page_count, 2);
        assert_eq!(regions[0].backed_pages, 0);
    }

    #[test]
    fn test_create_argument_checks() {
        let f = fixture(&[7]);
        let alloc = f.mm.allocator();
        assert_eq!(alloc.create_region(ProcessId(0), PAGE).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(alloc.create_region(ProcessId(7), u64::MAX).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert_eq!(alloc.create_region(ProcessId(99), PAGE).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_faults_are_idempotent_and_zero_filled() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 4 * PAGE).unwrap();

        let first = f.mm.allocator().handle_access_fault(pid, handle.base + PAGE + 17).unwrap();
        assert_eq!(first.address, handle.base + PAGE);
        assert!(first.page.is_zeroed());
        first.page.write(17, b"tama").unwrap();

        let again = f.mm.allocator().handle_access_fault(pid, handle.base + 2 * PAGE - 1).unwrap();
        assert!(Arc::ptr_eq(&first.page, &again.page));
        let mut buf = [0u8; 4];
        again.page.read(17, &mut buf).unwrap();
        assert_eq!(&buf, b"tama");

        assert_eq!(f.mm.usage().resident_bytes(pid), PAGE);
        assert_eq!(f.pool.stats().handed_out, 1);
        assert_eq!(f.mm.allocator().regions(pid)[0].backed_pages, 1);
    }

    #[test]
    fn test_fault_outside_regions_not_found() {
        let f = fixture(&[7, 8]);
        let handle = f.mm.allocator().create_region(ProcessId(7), PAGE).unwrap();

        let past_end = f.mm.allocator().handle_access_fault(ProcessId(7), handle.end()).unwrap_err();
        assert_eq!(past_end.kind(), ErrorKind::NotFound);
        // Same address, other process.
        let foreign = f.mm.allocator().handle_access_fault(ProcessId(8), handle.base).unwrap_err();
        assert_eq!(foreign.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_regions_never_overlap() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        let alloc = f.mm.allocator();

        let mut live: Vec<RegionHandle> = Vec::new();
        for round in 0..40u64 {
            let handle = alloc.create_region(pid, (round % 5 + 1) * PAGE).unwrap();
            live.push(handle);
            if round % 3 == 0 {
                let victim = live.remove((round as usize / 3) % live.len());
                alloc.release_region(pid, victim).unwrap();
            }
        }

        for (i, a) in live.iter().enumerate() {
            for b in &live[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        let reserved: u64 = live.iter().map(|h| h.len).sum();
        assert_eq!(f.mm.usage().virtual_bytes(pid), reserved);
    }

    #[test]
    fn test_release_checks_owner() {
        let f = fixture(&[7, 8]);
        let handle = f.mm.allocator().create_region(ProcessId(7), PAGE).unwrap();

        let err = f.mm.allocator().release_region(ProcessId(8), handle).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(f.mm.allocator().regions(ProcessId(7)).len(), 1);

        // Right base, wrong length.
        let wrong = RegionHandle { len: 2 * PAGE, ..handle };
        assert!(f.mm.allocator().release_region(ProcessId(7), wrong).is_err());
        f.mm.allocator().release_region(ProcessId(7), handle).unwrap();
    }

    #[test]
    fn test_release_returns_usage() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 3 * PAGE).unwrap();
        for page in 0..3 {
            f.mm.allocator().handle_access_fault(pid, handle.base + page * PAGE).unwrap();
        }
        assert_eq!(f.mm.usage().resident_bytes(pid), 3 * PAGE);

        f.mm.allocator().release_region(pid, handle).unwrap();
        assert_eq!(f.mm.usage().resident_bytes(pid), 0);
        assert_eq!(f.mm.usage().virtual_bytes(pid), 0);
        let err = f.mm.allocator().handle_access_fault(pid, handle.base).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_pool_exhaustion_surfaces_out_of_memory() {
        let f = fixture_with(&[7], TamaConfig::with_page_size(PAGE), 1);
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 2 * PAGE).unwrap();

        f.mm.allocator().handle_access_fault(pid, handle.base).unwrap();
        let err = f.mm.allocator().handle_access_fault(pid, handle.base + PAGE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        assert_eq!(f.mm.usage().resident_bytes(pid), PAGE);
        let space = f.mm.allocator().table.space(pid).unwrap();
        let region = space.region_containing(handle.base + PAGE).unwrap();
        assert_eq!(region.page_state(handle.base + PAGE), Some(PageState::Unbacked));
    }

    #[test]
    fn test_address_window_exhaustion() {
        let config = TamaConfig::with_page_size(PAGE).address_window(0x10_0000, 0x10_0000 + 4 * PAGE);
        let f = fixture_with(&[7], config, 16);
        let pid = ProcessId(7);

        let a = f.mm.allocator().create_region(pid, 3 * PAGE).unwrap();
        assert_eq!(a.base, 0x10_0000);
        let err = f.mm.allocator().create_region(pid, 2 * PAGE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);

        // Windows are per process.
        f.dir.insert(tama_env::HostProcess::alive(ProcessId(8)));
        let b = f.mm.allocator().create_region(ProcessId(8), 4 * PAGE).unwrap();
        assert_eq!(b.base, 0x10_0000);
    }

    #[test]
    fn test_concurrent_creates_respect_quota() {
        let f = Arc::new(fixture(&[7]));
        let pid = ProcessId(7);
        f.mm.quota().register(pid, 10 * PAGE).unwrap();

        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let f = f.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    f.mm.allocator().create_region(pid, PAGE).is_ok()
                })
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(admitted, 10);
        assert_eq!(f.mm.usage().virtual_bytes(pid), 10 * PAGE);
    }

    #[test]
    fn test_concurrent_faults_commit_once() {
        let f = Arc::new(fixture(&[7]));
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, PAGE).unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let frames: Vec<u64> = (0..8u64)
            .map(|i| {
                let f = f.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let page = f.mm.allocator().handle_access_fault(pid, handle.base + i * 8).unwrap();
                    page.page.frame()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        assert!(frames.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(f.pool.stats().handed_out, 1);
        assert_eq!(f.mm.usage().resident_bytes(pid), PAGE);
    }

    #[test]
    fn test_release_racing_faults_leaves_no_residue() {
        let f = Arc::new(fixture(&[7]));
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 64 * PAGE).unwrap();

        let barrier = Arc::new(Barrier::new(5));
        let faulters: Vec<_> = (0..4u64)
            .map(|t| {
                let f = f.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for page in 0..64 {
                        let address = handle.base + ((page + t * 16) % 64) * PAGE;
                        match f.mm.allocator().handle_access_fault(pid, address) {
                            Ok(_) => {}
                            Err(err) => assert_eq!(err.kind(), ErrorKind::NotFound),
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        f.mm.allocator().release_region(pid, handle).unwrap();
        for t in faulters {
            t.join().unwrap();
        }

        assert_eq!(f.mm.usage().resident_bytes(pid), 0);
        assert_eq!(f.mm.usage().virtual_bytes(pid), 0);
        assert!(f.mm.allocator().regions(pid).is_empty());
    }

    #[test]
    fn test_lowered_limit_does_not_block_faults() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        f.mm.quota().register(pid, 8 * PAGE).unwrap();
        let handle = f.mm.allocator().create_region(pid, 4 * PAGE).unwrap();

        f.mm.quota().update(pid, PAGE).unwrap();
        for page in 0..4 {
            f.mm.allocator().handle_access_fault(pid, handle.base + page * PAGE).unwrap();
        }
        assert_eq!(f.mm.usage().resident_bytes(pid), 4 * PAGE);
        // New regions are still refused.
        let err = f.mm.allocator().create_region(pid, PAGE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_concurrent_creates_never_overlap() {
        let f = Arc::new(fixture(&[7]));
        let pid = ProcessId(7);

        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<RegionHandle> = (0..16u64)
            .map(|i| {
                let f = f.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    f.mm.allocator().create_region(pid, (i % 5 + 1) * PAGE - 1).unwrap()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();

        for (i, a) in handles.iter().enumerate() {
            for b in &handles[i + 1..] {
                assert!(!a.overlaps(b), "{a:?} overlaps {b:?}");
            }
        }
        assert_eq!(f.mm.allocator().regions(pid).len(), 16);
    }

    #[test]
    fn test_pool_budget_is_not_returned_on_release() {
        let f = fixture_with(&[7], TamaConfig::with_page_size(PAGE), 2);
        let pid = ProcessId(7);
        let handle = f.mm.allocator().create_region(pid, 2 * PAGE).unwrap();
        f.mm.allocator().handle_access_fault(pid, handle.base).unwrap();
        f.mm.allocator().release_region(pid, handle).unwrap();

        let stats = f.pool.stats();
        assert_eq!(stats.handed_out, 1);
        assert_eq!(stats.available, 1);
    }

    #[test]
    fn test_release_process_and_prune() {
        let f = fixture(&[7, 8]);
        let alloc = f.mm.allocator();
        f.mm.quota().register(ProcessId(7), 16 * PAGE).unwrap();
        alloc.create_region(ProcessId(7), PAGE).unwrap();
        alloc.create_region(ProcessId(7), PAGE).unwrap();
        alloc.create_region(ProcessId(8), PAGE).unwrap();

        f.dir.remove(ProcessId(7));
        assert_eq!(alloc.prune_exited(), 2);
        assert!(alloc.regions(ProcessId(7)).is_empty());
        assert_eq!(f.mm.quota().limit(ProcessId(7)), None);
        assert_eq!(alloc.regions(ProcessId(8)).len(), 1);

        assert_eq!(alloc.release_process(ProcessId(8)), 1);
        assert_eq!(alloc.release_process(ProcessId(8)), 0);
        assert_eq!(f.mm.usage().virtual_bytes(ProcessId(8)), 0);

        // A released process may allocate again.
        alloc.create_region(ProcessId(8), PAGE).unwrap();
        assert_eq!(alloc.regions(ProcessId(8)).len(), 1);
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn test_counters_track_activity() {
        let f = fixture(&[7]);
        let pid = ProcessId(7);
        f.mm.quota().register(pid, PAGE).unwrap();
        let handle = f.mm.allocator().create_region(pid, PAGE).unwrap();
        assert!(f.mm.allocator().create_region(pid, PAGE).is_err());
        f.mm.allocator().handle_access_fault(pid, handle.base).unwrap();
        f.mm.allocator().handle_access_fault(pid, handle.base).unwrap();
        f.mm.allocator().release_region(pid, handle).unwrap();

        let counters = f.mm.allocator().counters();
        assert_eq!(counters.get("regions.created"), 1);
        assert_eq!(counters.get("admission.denied"), 1);
        assert_eq!(counters.get("faults.committed"), 1);
        assert_eq!(counters.get("faults.repeat"), 1);
        assert_eq!(counters.get("regions.released"), 1);
    }
}
