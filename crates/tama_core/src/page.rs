//! Physical page backing
//!
//! Pages are handed out zero-filled and never returned to the pool within
//! the subsystem's lifetime, so zero-fill happens exactly once per page.

use crate::error::{MemError, MemResult};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// One page of physical backing.
pub struct PhysicalPage {
    frame: u64,
    bytes: RwLock<Box<[u8]>>,
}

impl PhysicalPage {
    /// Allocate and zero-fill `size` bytes. Reports `OutOfMemory` instead of
    /// aborting when the host heap cannot satisfy the request.
    pub fn zeroed(frame: u64, size: usize) -> MemResult<Self> {
        let mut buf: Vec<u8> = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| MemError::OutOfMemory {
            reason: "host allocation for page backing failed",
        })?;
        buf.resize(size, 0);
        Ok(Self {
            frame,
            bytes: RwLock::new(buf.into_boxed_slice()),
        })
    }

    /// Frame number, unique per pool.
    #[inline]
    pub fn frame(&self) -> u64 {
        self.frame
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) -> MemResult<()> {
        let bytes = self.bytes.read();
        let range = span(offset, buf.len(), bytes.len())?;
        buf.copy_from_slice(&bytes[range]);
        Ok(())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> MemResult<()> {
        let mut bytes = self.bytes.write();
        let range = span(offset, data.len(), bytes.len())?;
        bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn is_zeroed(&self) -> bool {
        self.bytes.read().iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalPage")
            .field("frame", &self.frame)
            .field("len", &self.len())
            .finish()
    }
}

fn span(offset: usize, len: usize, page_len: usize) -> MemResult<std::ops::Range<usize>> {
    match offset.checked_add(len) {
        Some(end) if end <= page_len => Ok(offset..end),
        _ => Err(MemError::invalid("access beyond end of page")),
    }
}

/// Source of zero-filled physical pages.
pub trait PageBackingProvider: Send + Sync {
    fn page_size(&self) -> usize;

    /// Never retried internally; exhaustion surfaces as `OutOfMemory`.
    fn acquire_zeroed_page(&self) -> MemResult<PhysicalPage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub page_size: usize,
    pub capacity: u64,
    /// Pages handed out over the pool's lifetime. Released regions free
    /// their pages to the heap without returning budget here.
    pub handed_out: u64,
    /// Budget left: `capacity - handed_out`.
    pub available: u64,
}

/// Bounded pool of heap-backed pages.
pub struct PagePool {
    page_size: usize,
    capacity: u64,
    handed_out: AtomicU64,
    next_frame: AtomicU64,
}

impl PagePool {
    pub fn new(page_size: usize, capacity: u64) -> Self {
        Self {
            page_size,
            capacity,
            handed_out: AtomicU64::new(0),
            next_frame: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let handed_out = self.handed_out.load(Ordering::Acquire);
        PoolStats {
            page_size: self.page_size,
            capacity: self.capacity,
            handed_out,
            available: self.capacity.saturating_sub(handed_out),
        }
    }
}

impl PageBackingProvider for PagePool {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn acquire_zeroed_page(&self) -> MemResult<PhysicalPage> {
        let capacity = self.capacity;
        self.handed_out
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .map_err(|_| MemError::OutOfMemory {
                reason: "physical page pool exhausted",
            })?;

        let frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        PhysicalPage::zeroed(frame, self.page_size).inspect_err(|_| {
            self.handed_out.fetch_sub(1, Ordering::AcqRel);
        })
    }
}
