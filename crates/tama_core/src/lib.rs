//! Tama Core
//!
//! Demand-paged memory regions with per-process quotas:
//! - Region allocator (lazy backing, zero-fill on first touch)
//! - Quota registry (admission control)
//! - Usage tracker (virtual / resident accounting)
//! - Snapshot reporter (per-process and global usage)
//! - Page backing pool

pub mod allocator;
pub mod config;
pub mod error;
pub mod page;
pub mod quota;
pub mod region;
pub mod snapshot;
pub mod usage;

pub use allocator::{CommittedPage, RegionAllocator};
pub use config::TamaConfig;
pub use error::{ErrorKind, MemError, MemResult, Missing};
pub use page::{PageBackingProvider, PagePool, PhysicalPage, PoolStats};
pub use quota::{QuotaEntry, QuotaListing, QuotaRegistry};
pub use region::{PageState, RegionHandle, RegionInfo};
pub use snapshot::{SnapshotReport, SnapshotReporter, SnapshotScope, UsageSnapshot, UsageTotals};
pub use usage::{usage_percent, ProcessUsage, UsageTracker};

pub use tama_env::{ProcessDirectory, ProcessId, PrivilegeSource};

use region::RegionTable;
use std::sync::Arc;
use tracing::info;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The wired subsystem: one allocator, one quota registry and one reporter
/// sharing the same usage figures.
pub struct MemoryManager {
    config: TamaConfig,
    allocator: RegionAllocator,
    quota: Arc<QuotaRegistry>,
    usage: Arc<UsageTracker>,
    reporter: SnapshotReporter,
}

impl MemoryManager {
    /// Build with a `PagePool` sized by `config.physical_pages`.
    pub fn new(
        config: TamaConfig,
        directory: Arc<dyn ProcessDirectory>,
        privilege: Arc<dyn PrivilegeSource>,
    ) -> MemResult<Self> {
        config.validate()?;
        let page_size = usize::try_from(config.page_size)
            .map_err(|_| MemError::invalid("page size does not fit in usize"))?;
        let pool = Arc::new(PagePool::new(page_size, config.physical_pages));
        Self::with_provider(config, directory, privilege, pool)
    }

    pub fn with_provider(
        config: TamaConfig,
        directory: Arc<dyn ProcessDirectory>,
        privilege: Arc<dyn PrivilegeSource>,
        provider: Arc<dyn PageBackingProvider>,
    ) -> MemResult<Self> {
        config.validate()?;
        if provider.page_size() as u64 != config.page_size {
            return Err(MemError::invalid("page provider and configuration disagree on page size"));
        }

        let table = Arc::new(RegionTable::new(config.page_size));
        let usage = Arc::new(UsageTracker::new(table.clone(), directory));
        let quota = Arc::new(QuotaRegistry::new(usage.clone(), privilege, config.prune_exited));
        let allocator = RegionAllocator::new(config.clone(), table, usage.clone(), quota.clone(), provider);
        let reporter = SnapshotReporter::new(usage.clone());

        info!(
            page_size = config.page_size,
            physical_pages = config.physical_pages,
            "memory manager initialized"
        );
        Ok(Self {
            config,
            allocator,
            quota,
            usage,
            reporter,
        })
    }

    pub fn config(&self) -> &TamaConfig {
        &self.config
    }

    pub fn allocator(&self) -> &RegionAllocator {
        &self.allocator
    }

    pub fn quota(&self) -> &QuotaRegistry {
        &self.quota
    }

    pub fn usage(&self) -> &UsageTracker {
        &self.usage
    }

    pub fn reporter(&self) -> &SnapshotReporter {
        &self.reporter
    }
}
