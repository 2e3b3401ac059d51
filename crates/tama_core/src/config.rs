//! Subsystem configuration

use crate::error::{MemError, MemResult};
use serde::{Deserialize, Serialize};
use tama_env::Memory;

/// Lowest address handed out to regions unless configured otherwise.
pub const DEFAULT_ADDRESS_BASE: u64 = 0x1000_0000;
/// End (exclusive) of the per-process region window.
pub const DEFAULT_ADDRESS_LIMIT: u64 = 0x7f00_0000_0000;

/// Allocator, registry and reporter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TamaConfig {
    /// Page granularity in bytes; must be a power of two.
    pub page_size: u64,
    /// Pages the backing pool may hand out over its lifetime.
    pub physical_pages: u64,
    pub address_base: u64,
    pub address_limit: u64,
    /// Drop quota entries and regions of processes the host no longer knows.
    pub prune_exited: bool,
    /// Fault latency samples kept for metrics.
    pub latency_window: usize,
}

impl Default for TamaConfig {
    fn default() -> Self {
        let host = Memory::detect();
        Self {
            page_size: host.page_size as u64,
            physical_pages: host.total_pages(),
            address_base: DEFAULT_ADDRESS_BASE,
            address_limit: DEFAULT_ADDRESS_LIMIT,
            prune_exited: true,
            latency_window: 256,
        }
    }
}

impl TamaConfig {
    /// Default settings with an explicit page size, independent of the host.
    pub fn with_page_size(page_size: u64) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn physical_pages(mut self, pages: u64) -> Self {
        self.physical_pages = pages;
        self
    }

    pub fn address_window(mut self, base: u64, limit: u64) -> Self {
        self.address_base = base;
        self.address_limit = limit;
        self
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> MemResult<()> {
        if self.page_size == 0 || !self.page_size.is_power_of_two() {
            return Err(MemError::invalid("page size must be a power of two"));
        }
        if self.address_base % self.page_size != 0 || self.address_limit % self.page_size != 0 {
            return Err(MemError::invalid("address window must be page-aligned"));
        }
        if self.address_base >= self.address_limit {
            return Err(MemError::invalid("address window is empty"));
        }
        Ok(())
    }

    /// Round `bytes` up to page granularity. `None` on overflow.
    #[inline]
    pub fn round_to_page(&self, bytes: u64) -> Option<u64> {
        let mask = self.page_size - 1;
        bytes.checked_add(mask).map(|b| b & !mask)
    }

    #[inline]
    pub fn page_floor(&self, address: u64) -> u64 {
        address & !(self.page_size - 1)
    }
}
