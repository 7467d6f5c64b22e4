//! This module is just a facade to the os-specific implementation.
//!
//! Only Unix-like platforms are supported: direct I/O (`O_DIRECT`) and
//! advisory `fcntl` locking are POSIX/Linux concepts with no faithful
//! Windows equivalent, and the design explicitly builds on them.

#[cfg(unix)]
pub use crate::unix::*;

/// Returns the alignment required for direct I/O buffers and offsets on
/// this platform.
///
/// The value is based on the page size reported by the OS, falling back to
/// 4096 bytes if the platform refuses to answer.
pub fn granularity() -> usize {
    get_alignment()
}
