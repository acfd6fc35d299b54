//! Unified error types for nk_r using thiserror

use thiserror::Error;

use crate::ipc::PortType;

/// Broad classification of a [`KernError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A pool, allocator or the OS could not satisfy the request
    Exhausted,
    /// Bad argument, bad configuration, or operation on the wrong object
    Invalid,
    /// Called from the wrong execution context
    Context,
}

/// Errors reported by every fallible kernel entry point
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernError {
    #[error("out of memory")]
    NoMemory,

    #[error("failed to spawn worker thread")]
    SpawnFailed,

    #[error("stack size {requested} outside [{min}, {max}]")]
    InvalidStackSize {
        requested: usize,
        min: usize,
        max: usize,
    },

    #[error("invalid worker count {0}")]
    InvalidWorkerCount(usize),

    #[error("operation not valid on a {0} port")]
    WrongPortType(PortType),

    #[error("no DPC handler configured on port")]
    NoDpcHandler,

    #[error("port belongs to a different host")]
    ForeignPort,

    #[error("port has {0} blocked receiver(s)")]
    PortBusy(usize),

    #[error("host is running")]
    HostRunning,

    #[error("must be called from a thread or DPC context")]
    NoContext,

    #[error("must be called from a thread context")]
    NotThread,
}

impl KernError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            KernError::NoMemory | KernError::SpawnFailed => ErrorKind::Exhausted,
            KernError::NoContext | KernError::NotThread => ErrorKind::Context,
            KernError::InvalidStackSize { .. }
            | KernError::InvalidWorkerCount(_)
            | KernError::WrongPortType(_)
            | KernError::NoDpcHandler
            | KernError::ForeignPort
            | KernError::PortBusy(_)
            | KernError::HostRunning => ErrorKind::Invalid,
        }
    }
}

/// Result type for kernel operations
pub type KernResult<T> = Result<T, KernError>;
