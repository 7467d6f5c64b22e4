//! Alignment helpers for the direct-I/O buffers and offsets the cache deals
//! in.

use once_cell::sync::Lazy;

use crate::os;

/// The platform's direct-I/O alignment, queried once and cached for the
/// lifetime of the process.
pub static ALIGNMENT: Lazy<usize> = Lazy::new(os::get_alignment);

/// Returns whether `block_size` is a legal block size: non-zero and a
/// multiple of the platform's direct-I/O alignment.
pub fn is_block_size_aligned(block_size: usize) -> bool {
    block_size != 0 && block_size % *ALIGNMENT == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_alignment_check() {
        let alignment = os::get_alignment();
        assert!(is_block_size_aligned(alignment));
        assert!(is_block_size_aligned(4 * alignment));
        assert!(!is_block_size_aligned(0));
        assert!(!is_block_size_aligned(alignment + 1));
    }
}
