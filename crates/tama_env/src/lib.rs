//! Tama Environment
//!
//! Host collaborators consulted by the allocator core:
//! - Page size and RAM detection
//! - Process registry (identity and host-reported memory)
//! - Privilege source (administrative capability)

pub mod memory;
pub mod privilege;
pub mod process;

pub use memory::Memory;
pub use privilege::{FixedPrivilege, HostPrivilege, PrivilegeSource};
pub use process::{HostProcess, ProcFs, ProcessDirectory, ProcessId, ProcessState, StaticDirectory};
