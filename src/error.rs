//! Error types shared by the public API and the backend worker threads.
//!
//! Errors are cloneable on purpose: a single failure may have to be delivered
//! to every callback registered on a watcher, and asynchronous errors cross
//! the boundary between an OS event thread and the debouncer thread.

use std::path::Path;

/// Errors surfaced by the watcher, both synchronously from the public API and
/// asynchronously through the error slot of subscription callbacks.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid options: a bad ignore regex, a missing directory, or a root
    /// that is not a directory. Always surfaced synchronously.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A syscall failed for a specific path in a recoverable way (for
    /// example, adding a kernel watch on a single subdirectory).
    #[error("i/o error on {path}: {message}")]
    Io {
        /// Path the operation failed on.
        path: String,
        /// OS error message.
        message: String,
    },

    /// The kernel event queue overflowed. Some events were lost, but the
    /// subscription remains active.
    #[error("event queue overflow; some events may have been lost")]
    Overflow,

    /// The selected backend cannot perform the requested operation.
    #[error("backend does not support {0}")]
    Unsupported(&'static str),

    /// The backend failed in a way that tears it down, or the external
    /// daemon reported a protocol-level error.
    #[error("backend error: {0}")]
    Backend(String),
}

impl Error {
    /// Wrap a syscall failure together with the path it occurred on.
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        Error::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub(crate) fn backend(message: impl std::fmt::Display) -> Self {
        Error::Backend(message.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
