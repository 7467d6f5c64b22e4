//! Typed errors returned by the cache API.
//!
//! The raw-file adapter and the replacement engine both propagate
//! [`std::io::Error`] internally; the public surface refines those into the
//! categories the cache actually distinguishes.

use std::io;

/// Error returned by the fallible operations of [`crate::Cache`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The caller supplied a descriptor slot that is out of range or not
    /// currently open.
    #[error("bad descriptor handle")]
    BadHandle,

    /// A seek whence/offset combination (or some other argument) is
    /// nonsensical.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The descriptor table has no free slots.
    #[error("too many open files")]
    TooManyOpen,

    /// An aligned allocation or store initialization failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A failure of the raw-file adapter (open, pread, pwrite, truncate,
    /// sync, close).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
