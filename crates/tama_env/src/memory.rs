// memory.rs
//! Cross-platform helpers to query the host page size and total RAM.
//! Falls back to conservative defaults when unavailable.

use std::sync::OnceLock;

pub const FALLBACK_PAGE_SIZE: usize = 4096;
pub const FALLBACK_TOTAL_RAM: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Memory {
    pub page_size: usize, // bytes, always a power of two
    pub total_ram: u64,   // bytes
}

impl Memory {
    pub fn detect() -> Self {
        static INSTANCE: OnceLock<Memory> = OnceLock::new();
        *INSTANCE.get_or_init(Self::detect_impl)
    }

    fn detect_impl() -> Self {
        let page_size = page_size()
            .filter(|size| size.is_power_of_two())
            .unwrap_or(FALLBACK_PAGE_SIZE);
        Self {
            page_size,
            total_ram: total_ram_bytes().unwrap_or(FALLBACK_TOTAL_RAM),
        }
    }

    /// Number of whole pages of host RAM.
    pub fn total_pages(&self) -> u64 {
        self.total_ram / self.page_size as u64
    }
}

/* -------------------------- Windows -------------------------- */

#[cfg(target_os = "windows")]
fn page_size() -> Option<usize> {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut info: SYSTEM_INFO = std::mem::zeroed();
        GetSystemInfo(&mut info);
        if info.dwPageSize == 0 { None } else { Some(info.dwPageSize as usize) }
    }
}

#[cfg(target_os = "windows")]
fn total_ram_bytes() -> Option<u64> {
    use windows_sys::Win32::System::SystemInformation::{GlobalMemoryStatusEx, MEMORYSTATUSEX};
    unsafe {
        let mut st: MEMORYSTATUSEX = std::mem::zeroed();
        st.dwLength = std::mem::size_of::<MEMORYSTATUSEX>() as u32;
        if GlobalMemoryStatusEx(&mut st) != 0 { Some(st.ullTotalPhys) } else { None }
    }
}

/* --------------------------- Unix ---------------------------- */

#[cfg(unix)]
fn page_size() -> Option<usize> {
    let rc = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if rc > 0 { Some(rc as usize) } else { None }
}

/* --------------------- macOS / iOS (Darwin) --------------------- */

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn total_ram_bytes() -> Option<u64> {
    use libc::{c_void, size_t, sysctlbyname};
    let cname = std::ffi::CString::new("hw.memsize").ok()?;
    let mut val: u64 = 0;
    let mut len: size_t = std::mem::size_of::<u64>() as _;
    let rc = unsafe { sysctlbyname(cname.as_ptr(), &mut val as *mut _ as *mut c_void, &mut len, std::ptr::null_mut(), 0) };
    if rc == 0 && val != 0 { Some(val) } else { None }
}

/* --------------------- Linux / Android --------------------- */

#[cfg(any(target_os = "linux", target_os = "android"))]
fn total_ram_bytes() -> Option<u64> {
    // /proc/meminfo: "MemTotal:  16367168 kB"
    let text = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total(&text)
}

#[cfg_attr(not(any(target_os = "linux", target_os = "android")), allow(dead_code))]
pub(crate) fn parse_meminfo_total(text: &str) -> Option<u64> {
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

/* --------------------- Other / WASM / Fallbacks --------------------- */

#[cfg(not(any(unix, target_os = "windows")))]
fn page_size() -> Option<usize> { None }

#[cfg(not(any(
    target_os = "windows",
    target_os = "macos",
    target_os = "ios",
    target_os = "linux",
    target_os = "android"
)))]
fn total_ram_bytes() -> Option<u64> { None }
