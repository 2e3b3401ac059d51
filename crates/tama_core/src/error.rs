use tama_env::ProcessId;
use thiserror::Error;

/// What a `NotFound` error failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Process,
    Region { base: u64, len: u64 },
    Address { address: u64 },
    QuotaEntry,
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::Process => write!(f, "process"),
            Missing::Region { base, len } => write!(f, "region {base:#x}+{len:#x}"),
            Missing::Address { address } => write!(f, "mapping for address {address:#x}"),
            Missing::QuotaEntry => write!(f, "quota entry"),
        }
    }
}

/// Errors reported by the allocator, quota registry and reporter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },

    #[error("{what} not found for process {pid}")]
    NotFound { pid: ProcessId, what: Missing },

    #[error("quota entry for process {pid} already exists")]
    AlreadyExists { pid: ProcessId },

    #[error("administrative capability required to {action}")]
    PermissionDenied { action: &'static str },

    #[error("process {pid} quota exceeded: {current} bytes in use + {requested} requested > {limit} limit")]
    QuotaExceeded {
        pid: ProcessId,
        current: u64,
        requested: u64,
        limit: u64,
    },

    #[error("out of memory: {reason}")]
    OutOfMemory { reason: &'static str },
}

/// Fieldless error category, for callers that only dispatch on the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    QuotaExceeded,
    OutOfMemory,
}

impl MemError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            MemError::NotFound { .. } => ErrorKind::NotFound,
            MemError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            MemError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            MemError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            MemError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    pub(crate) fn invalid(reason: &'static str) -> Self {
        MemError::InvalidArgument { reason }
    }

    pub(crate) fn not_found(pid: ProcessId, what: Missing) -> Self {
        MemError::NotFound { pid, what }
    }
}

pub type MemResult<T> = Result<T, MemError>;
