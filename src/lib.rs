//! A user-space block cache that sits between an application and files
//! opened for direct I/O.
//!
//! The kernel page cache already does LRU-ish caching of file data, but it
//! does so behind the application's back and is not reachable from
//! `O_DIRECT` file descriptors. This crate gives a process its own
//! fixed-block, `LRU-K`-replaced cache in front of such files, reached
//! through a small POSIX-flavored API: [`Cache::open`], [`Cache::read`],
//! [`Cache::write`], [`Cache::seek`], [`Cache::close`], [`Cache::fsync`].
//!
//! # Example
//!
//! ```no_run
//! use blockcache::Cache;
//!
//! let mut cache = Cache::new().unwrap();
//! let fd = cache.open("data.bin", libc::O_RDWR | libc::O_CREAT).unwrap();
//! cache.write(fd, b"hello").unwrap();
//! cache.seek(fd, 0, blockcache::Whence::Set).unwrap();
//!
//! let mut buf = [0u8; 5];
//! cache.read(fd, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! cache.close(fd).unwrap();
//! ```
//!
//! # Errors
//!
//! Every fallible method returns [`CacheError`]. I/O failures from the
//! underlying file are wrapped as [`CacheError::Io`]; everything else
//! (bad handles, malformed arguments, exhausted descriptor table or block
//! store) gets its own variant so callers can match on cause rather than
//! parse messages.
//!
//! # Concurrency
//!
//! A `Cache` has no internal locking: it is built to be owned and driven by
//! a single thread, the same way the file descriptors it wraps are not
//! implicitly safe to share. Wrap it behind a `Mutex` if more than one
//! thread needs it.

#![deny(missing_docs)]

mod align;
mod block;
mod config;
mod descriptor;
mod error;
mod os;
mod store;

#[cfg(unix)]
mod unix;

use std::path::Path;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use os::granularity;

use descriptor::DescriptorTable;
use os::{AlignedBuf, RawFile};
use store::{BlockStore, FileResolver};

/// The reference point a [`Cache::seek`] offset is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Relative to the start of the file.
    Set,
    /// Relative to the current position.
    Current,
    /// Relative to the end of the file.
    End,
}

/// Point-in-time counters describing how well the block store is absorbing
/// repeated access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found their block already resident.
    pub hits: u64,
    /// Lookups that had to load their block from disk.
    pub misses: u64,
    /// Blocks currently resident in the store.
    pub resident: usize,
    /// Capacity of the block store.
    pub capacity: usize,
}

/// The cache: a fixed-size descriptor table of open files sitting on top of
/// a fixed-capacity, LRU-K-replaced block store.
///
/// Construct one with [`Cache::new`] (reference tunables) or
/// [`Cache::with_config`] (custom [`CacheConfig`]). Dropping a `Cache`
/// flushes every dirty block it can reach on a best-effort basis; call
/// [`Cache::close_all`] first if flush failures must be observed.
pub struct Cache {
    config: CacheConfig,
    table: DescriptorTable,
    store: BlockStore,
}

impl Default for Cache {
    /// Builds a cache with the reference tunables. Panics if they are
    /// somehow alignment-invalid on this platform; use [`Cache::new`]
    /// directly to handle that case instead of panicking.
    fn default() -> Self {
        Self::new().expect("reference tunables are always alignment-valid")
    }
}

impl Cache {
    /// Builds a cache using the reference tunables (`B=4096`, `C=100`,
    /// `K=2`, `N=1024`).
    ///
    /// The reference tunables are always alignment-valid, so this cannot
    /// fail in practice; it still returns `Result` to match
    /// [`Cache::with_config`] and the `init` operation's documented
    /// `resource-exhausted` error category.
    pub fn new() -> Result<Self> {
        Self::with_config(CacheConfig::default())
    }

    /// Builds a cache using the given tunables.
    ///
    /// Fails with [`CacheError::ResourceExhausted`] if `block_size` is zero
    /// or not a multiple of the platform's direct-I/O alignment, since no
    /// block allocated at that size could ever be used for direct I/O.
    pub fn with_config(config: CacheConfig) -> Result<Self> {
        if !crate::align::is_block_size_aligned(config.block_size) {
            return Err(CacheError::ResourceExhausted(format!(
                "block size {} is not a multiple of the platform alignment",
                config.block_size
            )));
        }

        log::debug!(
            "initializing cache: block_size={} capacity={} lru_k={} max_open_files={}",
            config.block_size,
            config.capacity,
            config.lru_k,
            config.max_open_files
        );
        Ok(Cache {
            table: DescriptorTable::new(config.max_open_files),
            store: BlockStore::new(config.block_size, config.capacity, config.lru_k),
            config,
        })
    }

    /// Opens `path` with the given POSIX `flags` (e.g.
    /// `libc::O_RDWR | libc::O_CREAT`), returning a handle to use with the
    /// other methods. The file is created with mode `0o644` if `O_CREAT` is
    /// set and it does not already exist.
    ///
    /// Cached blocks are keyed by the raw OS descriptor underneath a handle,
    /// not by path: opening the same path twice yields two independent raw
    /// descriptors and therefore two independent sets of cached blocks for
    /// it. This is not coalesced into a single cached view.
    pub fn open(&mut self, path: impl AsRef<Path>, flags: libc::c_int) -> Result<i32> {
        let path = path.as_ref();
        let file = RawFile::open(path, flags, 0o644)?;
        let handle = self.table.insert(file, path.to_path_buf())?;
        log::debug!("opened {:?} as handle {}", path, handle);
        Ok(handle)
    }

    /// Flushes and closes `handle`. A failed flush is logged and does not
    /// prevent the underlying descriptor from being closed; the error is
    /// still returned to the caller.
    pub fn close(&mut self, handle: i32) -> Result<()> {
        let fd = self.table.raw_fd(handle)?;
        let flush_result = self.store.flush_file(fd, &self.table);
        self.store.discard_file(fd);

        let (file, path) = self.table.remove(handle)?;
        file.close()?;
        log::debug!("closed handle {} ({:?})", handle, path);

        if let Err(ref e) = flush_result {
            log::warn!("failed to flush dirty blocks for {:?} on close: {}", path, e);
        }
        flush_result
    }

    /// Reads up to `buf.len()` bytes starting at the handle's current
    /// position, advancing it by the number of bytes actually read. Returns
    /// `0` at end of file. A short read only happens at end of file; the
    /// return value is always the number of bytes placed into `buf`.
    pub fn read(&mut self, handle: i32, buf: &mut [u8]) -> Result<usize> {
        let fd = self.table.raw_fd(handle)?;
        let file_size = self.table.file(handle)?.size()?;
        let mut pos = self.table.pos(handle)?;

        if pos >= file_size {
            return Ok(0);
        }

        let mut remaining = std::cmp::min(buf.len() as u64, file_size - pos) as usize;
        let mut total = 0;

        while remaining > 0 {
            let block_size = self.store.block_size();
            let block_index = pos / block_size as u64;
            let offset_in_block = (pos % block_size as u64) as usize;
            let chunk = remaining.min(block_size - offset_in_block);

            let slot = self.load_for_read(fd, block_index)?;
            let data = self.store.data(slot);
            buf[total..total + chunk].copy_from_slice(&data[offset_in_block..offset_in_block + chunk]);

            total += chunk;
            remaining -= chunk;
            pos += chunk as u64;
        }

        self.table.set_pos(handle, pos)?;
        Ok(total)
    }

    /// Writes `buf` starting at the handle's current position, advancing it
    /// by `buf.len()`. Extends the underlying file first if the write would
    /// go past its current end.
    pub fn write(&mut self, handle: i32, buf: &[u8]) -> Result<usize> {
        let fd = self.table.raw_fd(handle)?;
        let mut pos = self.table.pos(handle)?;
        let file_size = self.table.file(handle)?.size()?;

        let end = pos + buf.len() as u64;
        if end > file_size {
            self.table.file(handle)?.truncate(end)?;
        }

        let mut remaining = buf.len();
        let mut total = 0;

        while remaining > 0 {
            let block_size = self.store.block_size();
            let block_index = pos / block_size as u64;
            let offset_in_block = (pos % block_size as u64) as usize;
            let chunk = remaining.min(block_size - offset_in_block);

            let slot = if chunk == block_size {
                // A full-block overwrite never needs the old contents.
                self.load_for_overwrite(fd, block_index)?
            } else {
                self.load_for_read(fd, block_index)?
            };

            let data = self.store.data_mut(slot);
            data[offset_in_block..offset_in_block + chunk]
                .copy_from_slice(&buf[total..total + chunk]);
            self.store.mark_dirty(slot);

            total += chunk;
            remaining -= chunk;
            pos += chunk as u64;
        }

        self.table.set_pos(handle, pos)?;
        Ok(total)
    }

    /// Repositions the handle and returns the new absolute position. A
    /// resulting negative position is rejected with
    /// [`CacheError::InvalidArgument`].
    pub fn seek(&mut self, handle: i32, offset: i64, whence: Whence) -> Result<u64> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Current => self.table.pos(handle)? as i64,
            Whence::End => self.table.file(handle)?.size()? as i64,
        };

        let new_pos = base
            .checked_add(offset)
            .ok_or_else(|| CacheError::InvalidArgument("seek overflow".to_string()))?;

        if new_pos < 0 {
            return Err(CacheError::InvalidArgument(
                "seek would move before the start of the file".to_string(),
            ));
        }

        self.table.set_pos(handle, new_pos as u64)?;
        Ok(new_pos as u64)
    }

    /// Flushes every dirty block belonging to `handle`'s file, then asks
    /// the OS to flush the file to the storage device.
    pub fn fsync(&mut self, handle: i32) -> Result<()> {
        let fd = self.table.raw_fd(handle)?;
        self.store.flush_file(fd, &self.table)?;
        self.table.file(handle)?.sync()?;
        log::debug!("fsynced handle {}", handle);
        Ok(())
    }

    /// Flushes and closes every open handle. Unlike `Drop`, failures are
    /// reported rather than only logged; the first one encountered is
    /// returned after every handle has been attempted.
    pub fn close_all(&mut self) -> Result<()> {
        let mut first_error = None;

        for handle in self.table.open_handles() {
            if let Err(e) = self.close(handle) {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Snapshot of the block store's hit/miss counters and occupancy.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.store.hits(),
            misses: self.store.misses(),
            resident: self.store.resident(),
            capacity: self.config.capacity,
        }
    }

    fn load_for_read(&mut self, fd: libc::c_int, block_index: u64) -> Result<usize> {
        if let Some(slot) = self.store.lookup((fd, block_index)) {
            log::trace!("hit on block {:?}", (fd, block_index));
            return Ok(slot);
        }
        log::trace!("miss on block {:?}", (fd, block_index));

        let block_size = self.store.block_size();
        let mut data = AlignedBuf::zeroed(block_size)?;
        let block_start = block_index * block_size as u64;

        {
            let file = self.table.resolve(fd).ok_or(CacheError::BadHandle)?;
            let file_size = file.size()?;

            if block_start < file_size {
                let to_read = std::cmp::min(block_size as u64, file_size - block_start) as usize;
                file.pread(&mut data[..to_read], block_start)?;
            }
        }

        self.store.admit((fd, block_index), data, &self.table)
    }

    /// Like [`Cache::load_for_read`], but skips the disk read: the caller is
    /// about to overwrite the entire block, so its previous contents (if
    /// any) are irrelevant.
    fn load_for_overwrite(&mut self, fd: libc::c_int, block_index: u64) -> Result<usize> {
        if let Some(slot) = self.store.lookup((fd, block_index)) {
            return Ok(slot);
        }

        let block_size = self.store.block_size();
        let data = AlignedBuf::zeroed(block_size)?;
        self.store.admit((fd, block_index), data, &self.table)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if let Err(e) = self.close_all() {
            log::warn!("cache dropped with unflushed blocks: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "blockcache-lib-test-{}-{}",
            name,
            std::process::id()
        ))
    }

    fn small_cache() -> Cache {
        Cache::with_config(CacheConfig {
            block_size: *align::ALIGNMENT,
            capacity: 4,
            lru_k: 2,
            max_open_files: 8,
        })
        .unwrap()
    }

    #[test]
    fn write_then_read_back_roundtrip() {
        let path = tmp_path("roundtrip");
        let mut cache = small_cache();
        let fd = cache
            .open(&path, libc::O_RDWR | libc::O_CREAT)
            .unwrap();

        cache.write(fd, b"hello, cache").unwrap();
        cache.seek(fd, 0, Whence::Set).unwrap();

        let mut buf = [0u8; 12];
        let n = cache.read(fd, &mut buf).unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf, b"hello, cache");

        cache.close(fd).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let path = tmp_path("eof");
        let mut cache = small_cache();
        let fd = cache.open(&path, libc::O_RDWR | libc::O_CREAT).unwrap();
        cache.write(fd, b"short").unwrap();
        cache.seek(fd, 100, Whence::Set).unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(cache.read(fd, &mut buf).unwrap(), 0);

        cache.close(fd).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn partial_overwrite_preserves_surrounding_bytes() {
        let path = tmp_path("partial");
        let mut cache = small_cache();
        let fd = cache.open(&path, libc::O_RDWR | libc::O_CREAT).unwrap();

        cache.write(fd, b"0123456789").unwrap();
        cache.seek(fd, 2, Whence::Set).unwrap();
        cache.write(fd, b"XY").unwrap();
        cache.seek(fd, 0, Whence::Set).unwrap();

        let mut buf = [0u8; 10];
        cache.read(fd, &mut buf).unwrap();
        assert_eq!(&buf, b"01XY456789");

        cache.close(fd).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn stats_count_hits_and_misses() {
        let path = tmp_path("stats");
        let mut cache = small_cache();
        let fd = cache.open(&path, libc::O_RDWR | libc::O_CREAT).unwrap();
        cache.write(fd, b"x").unwrap();

        cache.seek(fd, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 1];
        cache.read(fd, &mut buf).unwrap();
        cache.seek(fd, 0, Whence::Set).unwrap();
        cache.read(fd, &mut buf).unwrap();

        let stats = cache.stats();
        assert!(stats.hits >= 1);
        assert_eq!(stats.resident, 1);

        cache.close(fd).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn seek_before_start_is_rejected() {
        let path = tmp_path("seek-neg");
        let mut cache = small_cache();
        let fd = cache.open(&path, libc::O_RDWR | libc::O_CREAT).unwrap();
        assert!(matches!(
            cache.seek(fd, -1, Whence::Set),
            Err(CacheError::InvalidArgument(_))
        ));
        cache.close(fd).unwrap();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn misaligned_block_size_is_rejected_at_construction() {
        let result = Cache::with_config(CacheConfig {
            block_size: *align::ALIGNMENT + 1,
            capacity: 4,
            lru_k: 2,
            max_open_files: 8,
        });
        assert!(matches!(result, Err(CacheError::ResourceExhausted(_))));
    }

    #[test]
    fn bad_handle_is_rejected_everywhere() {
        let mut cache = small_cache();
        assert!(matches!(cache.read(42, &mut []), Err(CacheError::BadHandle)));
        assert!(matches!(cache.write(42, &[]), Err(CacheError::BadHandle)));
        assert!(matches!(cache.close(42), Err(CacheError::BadHandle)));
    }
}
