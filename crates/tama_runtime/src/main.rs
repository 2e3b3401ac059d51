//! Tama Runtime
//!
//! Boots the memory subsystem against the live host, reserves a region for
//! this process, touches one page and logs the resulting usage report.
//!
//! `TAMA_CONFIG` may point at a JSON settings file; `RUST_LOG` filters logs.

use anyhow::{Context, Result};
use std::sync::Arc;
use tama_core::{MemoryManager, SnapshotScope, TamaConfig};
use tama_env::{HostPrivilege, ProcFs, ProcessDirectory, ProcessId, StaticDirectory};
use tracing_subscriber::EnvFilter;

fn load_config() -> Result<TamaConfig> {
    let Ok(path) = std::env::var("TAMA_CONFIG") else {
        return Ok(TamaConfig::default());
    };
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
    TamaConfig::from_json(&text).with_context(|| format!("parsing config {path}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Tama v{}", tama_core::VERSION);

    let config = load_config()?;
    let pid = ProcessId(std::process::id());

    let procfs = ProcFs::new();
    let directory: Arc<dyn ProcessDirectory> = if procfs.contains(pid) {
        Arc::new(procfs)
    } else {
        tracing::warn!("procfs unavailable, tracking this process only");
        Arc::new(StaticDirectory::with_pids([pid.raw()]))
    };
    let mm = MemoryManager::new(config, directory, Arc::new(HostPrivilege))
        .context("initializing memory manager")?;

    let page_size = mm.allocator().page_size();
    let region = mm
        .allocator()
        .create_region(pid, 16 * page_size)
        .context("reserving demo region")?;
    let page = mm
        .allocator()
        .handle_access_fault(pid, region.base)
        .context("touching first page")?;
    page.page.write(0, b"tama").context("writing first page")?;

    let report = mm
        .reporter()
        .snapshot(SnapshotScope::Process(pid), 1)
        .context("taking snapshot")?;
    tracing::info!(snapshot = %report.to_json()?, "process usage");

    let totals = mm.reporter().aggregate();
    tracing::info!(virtual_mb = totals.virtual_mb, resident_mb = totals.resident_mb, "host totals");

    for (name, value) in mm.allocator().counters().snapshot() {
        tracing::debug!(counter = name, value, "metric");
    }

    mm.allocator()
        .release_region(pid, region)
        .context("releasing demo region")?;
    tracing::info!("Runtime shut down cleanly");
    Ok(())
}
