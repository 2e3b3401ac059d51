//! Administrative capability checks

use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether the current caller may mutate quota configuration.
pub trait PrivilegeSource: Send + Sync {
    fn is_admin(&self) -> bool;
}

/// Privilege decided by the effective user of the host process.
pub struct HostPrivilege;

#[cfg(unix)]
impl PrivilegeSource for HostPrivilege {
    fn is_admin(&self) -> bool {
        unsafe { libc::geteuid() == 0 }
    }
}

#[cfg(not(unix))]
impl PrivilegeSource for HostPrivilege {
    fn is_admin(&self) -> bool {
        false
    }
}

/// Switchable privilege for embedding and tests.
pub struct FixedPrivilege {
    admin: AtomicBool,
}

impl FixedPrivilege {
    pub fn granted() -> Self {
        Self {
            admin: AtomicBool::new(true),
        }
    }

    pub fn denied() -> Self {
        Self {
            admin: AtomicBool::new(false),
        }
    }

    pub fn set_admin(&self, admin: bool) {
        self.admin.store(admin, Ordering::SeqCst);
    }
}

impl PrivilegeSource for FixedPrivilege {
    fn is_admin(&self) -> bool {
        self.admin.load(Ordering::SeqCst)
    }
}
