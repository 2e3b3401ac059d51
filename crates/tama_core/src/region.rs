//! Regions and per-process region sets
//!
//! A region is a page-aligned virtual range whose pages start Unbacked and
//! become Backed on first fault. Each page slot is a `OnceCell`: a single
//! fault handler commits it, concurrent faulters block until it is set, and
//! a failed commit leaves the page Unbacked.

use crate::error::{MemError, MemResult, Missing};
use crate::page::{PageBackingProvider, PhysicalPage};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tama_env::ProcessId;

/// Identifies a region to its owner: base address plus length.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionHandle {
    pub base: u64,
    pub len: u64,
}

impl RegionHandle {
    #[inline]
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    #[inline]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    #[inline]
    pub fn overlaps(&self, other: &RegionHandle) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageState {
    Unbacked,
    Backed,
}

/// Read-only description of a live region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionInfo {
    pub owner: ProcessId,
    pub handle: RegionHandle,
    pub created_at: SystemTime,
    pub page_count: u64,
    pub backed_pages: u64,
}

/// Usage counters shared by every region of one process.
#[derive(Debug, Default)]
pub(crate) struct SpaceUsage {
    reserved_bytes: AtomicU64,
    resident_pages: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionState {
    Live,
    Released,
}

/// Outcome of a fault on a region page.
pub(crate) struct Fault {
    pub page: Arc<PhysicalPage>,
    pub page_address: u64,
    /// True when this call committed the page.
    pub fresh: bool,
}

type PageSlot = Arc<OnceCell<Arc<PhysicalPage>>>;

pub struct Region {
    owner: ProcessId,
    handle: RegionHandle,
    page_size: u64,
    created_at: SystemTime,
    // Sparse: only pages that were ever faulted have a slot.
    pages: DashMap<u64, PageSlot>,
    backed: AtomicU64,
    // Faults hold this shared; release takes it exclusively.
    state: RwLock<RegionState>,
    usage: Arc<SpaceUsage>,
}

impl Region {
    fn reserve(owner: ProcessId, handle: RegionHandle, page_size: u64, usage: Arc<SpaceUsage>) -> Self {
        usage.reserved_bytes.fetch_add(handle.len, Ordering::AcqRel);
        Self {
            owner,
            handle,
            page_size,
            created_at: SystemTime::now(),
            pages: DashMap::new(),
            backed: AtomicU64::new(0),
            state: RwLock::new(RegionState::Live),
            usage,
        }
    }

    #[inline]
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    #[inline]
    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    #[inline]
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    #[inline]
    pub fn page_count(&self) -> u64 {
        self.handle.len / self.page_size
    }

    #[inline]
    pub fn backed_pages(&self) -> u64 {
        self.backed.load(Ordering::Acquire)
    }

    pub fn page_state(&self, address: u64) -> Option<PageState> {
        if !self.handle.contains(address) {
            return None;
        }
        let index = self.page_index(address);
        let backed = self
            .pages
            .get(&index)
            .is_some_and(|slot| slot.get().is_some());
        Some(if backed { PageState::Backed } else { PageState::Unbacked })
    }

    pub fn info(&self) -> RegionInfo {
        RegionInfo {
            owner: self.owner,
            handle: self.handle,
            created_at: self.created_at,
            page_count: self.page_count(),
            backed_pages: self.backed_pages(),
        }
    }

    #[inline]
    fn page_index(&self, address: u64) -> u64 {
        (address - self.handle.base) / self.page_size
    }

    /// Commit the page containing `address` if it is still Unbacked.
    pub(crate) fn fault(&self, address: u64, provider: &dyn PageBackingProvider) -> MemResult<Fault> {
        let state = self.state.read();
        if *state == RegionState::Released || !self.handle.contains(address) {
            return Err(MemError::not_found(self.owner, Missing::Address { address }));
        }

        let index = self.page_index(address);
        let slot = self.pages.entry(index).or_default().clone();

        let mut fresh = false;
        let page = slot
            .get_or_try_init(|| {
                let page = provider.acquire_zeroed_page()?;
                self.backed.fetch_add(1, Ordering::AcqRel);
                self.usage.resident_pages.fetch_add(1, Ordering::AcqRel);
                fresh = true;
                Ok::<_, MemError>(Arc::new(page))
            })?
            .clone();
        drop(state);

        Ok(Fault {
            page,
            page_address: self.handle.base + index * self.page_size,
            fresh,
        })
    }

    /// Unmap every page and stop accepting faults. Returns the number of
    /// backed pages dropped, or `None` if the region was already released.
    pub(crate) fn release(&self) -> Option<u64> {
        let mut state = self.state.write();
        if *state == RegionState::Released {
            return None;
        }
        *state = RegionState::Released;

        let backed = self.backed.swap(0, Ordering::AcqRel);
        self.pages.clear();
        self.usage.resident_pages.fetch_sub(backed, Ordering::AcqRel);
        self.usage.reserved_bytes.fetch_sub(self.handle.len, Ordering::AcqRel);
        Some(backed)
    }
}

pub(crate) struct SpaceInner {
    pub regions: BTreeMap<u64, Arc<Region>>,
    /// Set once the owning process is gone; no region may be added after.
    pub retired: bool,
}

impl SpaceInner {
    /// First-fit search for `len` free bytes inside `[lo, hi)`.
    pub fn find_gap(&self, len: u64, lo: u64, hi: u64) -> Option<u64> {
        let mut cursor = lo;
        for region in self.regions.values() {
            let handle = region.handle();
            if handle.base >= cursor && handle.base - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(handle.end());
        }
        (hi.checked_sub(cursor)? >= len).then_some(cursor)
    }

    pub fn region_containing(&self, address: u64) -> Option<&Arc<Region>> {
        self.regions
            .range(..=address)
            .next_back()
            .map(|(_, region)| region)
            .filter(|region| region.handle().contains(address))
    }
}

/// All regions owned by one process.
pub(crate) struct ProcessSpace {
    owner: ProcessId,
    page_size: u64,
    inner: Mutex<SpaceInner>,
    usage: Arc<SpaceUsage>,
}

impl ProcessSpace {
    fn new(owner: ProcessId, page_size: u64) -> Self {
        Self {
            owner,
            page_size,
            inner: Mutex::new(SpaceInner {
                regions: BTreeMap::new(),
                retired: false,
            }),
            usage: Arc::new(SpaceUsage::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SpaceInner> {
        self.inner.lock()
    }

    /// Create a region at `base`. Caller holds the space lock and has
    /// checked the range is free.
    pub fn insert(&self, inner: &mut SpaceInner, base: u64, len: u64) -> Arc<Region> {
        let handle = RegionHandle { base, len };
        let region = Arc::new(Region::reserve(self.owner, handle, self.page_size, self.usage.clone()));
        inner.regions.insert(base, region.clone());
        region
    }

    pub fn region_containing(&self, address: u64) -> Option<Arc<Region>> {
        self.inner.lock().region_containing(address).cloned()
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.usage.reserved_bytes.load(Ordering::Acquire)
    }

    pub fn resident_pages(&self) -> u64 {
        self.usage.resident_pages.load(Ordering::Acquire)
    }
}

/// Process id to region set. Shared by the allocator (writer) and the
/// usage tracker (reader of the per-process counters).
pub(crate) struct RegionTable {
    spaces: DashMap<ProcessId, Arc<ProcessSpace>>,
    page_size: u64,
}

impl RegionTable {
    pub fn new(page_size: u64) -> Self {
        Self {
            spaces: DashMap::new(),
            page_size,
        }
    }

    pub fn space(&self, pid: ProcessId) -> Option<Arc<ProcessSpace>> {
        self.spaces.get(&pid).map(|space| space.clone())
    }

    pub fn space_or_insert(&self, pid: ProcessId) -> Arc<ProcessSpace> {
        self.spaces
            .entry(pid)
            .or_insert_with(|| Arc::new(ProcessSpace::new(pid, self.page_size)))
            .clone()
    }

    /// Drop `space` from the table if it is still the one registered.
    pub fn retire(&self, pid: ProcessId, space: &Arc<ProcessSpace>) {
        self.spaces.remove_if(&pid, |_, current| Arc::ptr_eq(current, space));
    }

    pub fn reserved_bytes(&self, pid: ProcessId) -> u64 {
        self.space(pid).map_or(0, |space| space.reserved_bytes())
    }

    pub fn resident_bytes(&self, pid: ProcessId) -> u64 {
        self.space(pid)
            .map_or(0, |space| space.resident_pages() * self.page_size)
    }

    pub fn pids(&self) -> Vec<ProcessId> {
        let mut pids: Vec<ProcessId> = self.spaces.iter().map(|entry| *entry.key()).collect();
        pids.sort_unstable();
        pids
    }
}
