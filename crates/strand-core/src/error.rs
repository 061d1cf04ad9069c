//! Error types for the strand runtime

use core::fmt;
use std::io;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by fallible runtime operations.
///
/// Invariant violations (resuming a non-ready fiber, stopping a scheduler
/// from the wrong thread) are programmer bugs and panic instead.
#[derive(Debug)]
pub enum RuntimeError {
    /// An underlying syscall failed
    Os {
        /// Which syscall (e.g. "epoll_ctl", "mmap")
        op: &'static str,
        source: io::Error,
    },

    /// The direction is already registered on this file descriptor
    AlreadyRegistered { fd: i32 },
}

impl RuntimeError {
    /// Wrap the thread's last OS error
    pub fn last_os(op: &'static str) -> RuntimeError {
        RuntimeError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an io::Error from a named syscall
    pub fn os(op: &'static str, source: io::Error) -> RuntimeError {
        RuntimeError::Os { op, source }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Os { op, source } => write!(f, "{} failed: {}", op, source),
            RuntimeError::AlreadyRegistered { fd } => {
                write!(f, "event already registered on fd {}", fd)
            }
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::Os { source, .. } => Some(source),
            RuntimeError::AlreadyRegistered { .. } => None,
        }
    }
}
