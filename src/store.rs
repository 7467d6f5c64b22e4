//! Fixed-capacity block store with LRU-K replacement.
//!
//! Blocks live in an arena (`Vec<Option<CacheBlock>>`) addressed by small
//! integer slot indices; a hash map from `(file, block_index)` to slot gives
//! average-constant lookup, and victim selection is a linear scan over the
//! slots currently tracked by that map. This avoids the intrusive,
//! cyclically-linked recency list a C implementation would reach for: at the
//! reference capacity (100 blocks) a scan per eviction is cheap, and the
//! arena stays free of pointer-like cross-links.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::block::{BlockKey, CacheBlock};
use crate::error::{CacheError, Result};
use crate::os::{AlignedBuf, RawFile};

/// Resolves a raw file descriptor to the [`RawFile`] that owns it.
///
/// The block store does not own any `RawFile`; a victim chosen for eviction
/// may belong to a file different from the one currently being admitted, so
/// the store asks its caller (the descriptor table) to resolve whichever fd
/// it needs at the moment it needs it.
pub trait FileResolver {
    fn resolve(&self, fd: RawFd) -> Option<&RawFile>;
}

/// The fixed-capacity, LRU-K-replaced pool of cached blocks.
pub struct BlockStore {
    block_size: usize,
    capacity: usize,
    k: usize,
    counter: u64,
    blocks: Vec<Option<CacheBlock>>,
    index: HashMap<BlockKey, usize>,
    free: Vec<usize>,
    hits: u64,
    misses: u64,
}

impl BlockStore {
    pub fn new(block_size: usize, capacity: usize, k: usize) -> Self {
        BlockStore {
            block_size,
            capacity,
            k,
            counter: 0,
            blocks: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Current number of resident blocks.
    pub fn resident(&self) -> usize {
        self.index.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Looks up `key`. On a hit, records the access (advancing the global
    /// counter and updating the block's history) and returns its slot. On a
    /// miss, counts it and returns `None`; the caller is expected to fetch
    /// the block from disk and call [`BlockStore::admit`].
    pub fn lookup(&mut self, key: BlockKey) -> Option<usize> {
        if let Some(&slot) = self.index.get(&key) {
            self.counter += 1;
            self.block_mut(slot).record_access(self.counter, self.k);
            self.hits += 1;
            Some(slot)
        } else {
            self.misses += 1;
            None
        }
    }

    /// Returns a read-only reference into the block at `slot`.
    pub fn data(&self, slot: usize) -> &[u8] {
        &self.block(slot).data
    }

    /// Returns a mutable reference into the block at `slot`. The caller must
    /// call [`BlockStore::mark_dirty`] after writing through it.
    pub fn data_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.block_mut(slot).data
    }

    pub fn mark_dirty(&mut self, slot: usize) {
        self.block_mut(slot).dirty = true;
    }

    /// Installs a new block for `key`, evicting a victim first if the store
    /// is at capacity. `initial` must be exactly `block_size` bytes.
    ///
    /// Precondition: no resident block currently has key `key`.
    pub fn admit(
        &mut self,
        key: BlockKey,
        initial: AlignedBuf,
        resolver: &dyn FileResolver,
    ) -> Result<usize> {
        debug_assert!(!self.index.contains_key(&key));
        debug_assert_eq!(initial.len(), self.block_size);

        let slot = if let Some(slot) = self.free.pop() {
            slot
        } else if self.blocks.len() < self.capacity {
            self.blocks.push(None);
            self.blocks.len() - 1
        } else {
            let victim = self.select_victim().ok_or_else(|| {
                CacheError::ResourceExhausted("block store has no eviction victim".to_string())
            })?;

            if self.block(victim).dirty {
                // On failure the victim must remain resident and dirty; we
                // have not touched `self.index` or `self.blocks[victim]` yet
                // so that invariant holds automatically.
                self.flush_slot(victim, resolver)?;
            }

            let victim_key = self.block(victim).key();
            self.index.remove(&victim_key);
            log::trace!(
                "evicted block {:?} from slot {} to admit {:?}",
                victim_key,
                victim,
                key
            );
            victim
        };

        self.counter += 1;
        let mut block = CacheBlock::new(key.0, key.1, initial);
        block.record_access(self.counter, self.k);
        self.blocks[slot] = Some(block);
        self.index.insert(key, slot);
        log::trace!("admitted block {:?} into slot {}", key, slot);

        Ok(slot)
    }

    /// Flushes the block at `slot` if dirty; a no-op on a clean block.
    pub fn flush_slot(&mut self, slot: usize, resolver: &dyn FileResolver) -> Result<()> {
        if !self.block(slot).dirty {
            return Ok(());
        }

        let (file_fd, index) = {
            let block = self.block(slot);
            (block.file, block.index)
        };

        let file = resolver
            .resolve(file_fd)
            .ok_or(CacheError::BadHandle)?;

        file.pwrite(&self.block(slot).data, index * self.block_size as u64)?;
        self.block_mut(slot).dirty = false;
        Ok(())
    }

    /// Flushes every dirty block belonging to `file`, stopping at the first
    /// failure.
    pub fn flush_file(&mut self, file: RawFd, resolver: &dyn FileResolver) -> Result<()> {
        let slots: Vec<usize> = self
            .index
            .iter()
            .filter(|(key, _)| key.0 == file)
            .map(|(_, &slot)| slot)
            .collect();

        for slot in slots {
            self.flush_slot(slot, resolver)?;
        }

        Ok(())
    }

    /// Removes every resident block belonging to `file`, assuming they are
    /// already clean (the caller must have flushed first).
    pub fn discard_file(&mut self, file: RawFd) {
        let keys: Vec<BlockKey> = self
            .index
            .keys()
            .filter(|key| key.0 == file)
            .copied()
            .collect();

        for key in keys {
            if let Some(slot) = self.index.remove(&key) {
                self.blocks[slot] = None;
                self.free.push(slot);
            }
        }
    }

    fn block(&self, slot: usize) -> &CacheBlock {
        self.blocks[slot]
            .as_ref()
            .expect("slot index must refer to a resident block")
    }

    fn block_mut(&mut self, slot: usize) -> &mut CacheBlock {
        self.blocks[slot]
            .as_mut()
            .expect("slot index must refer to a resident block")
    }

    /// Picks the resident block whose K-th access time is oldest, treating
    /// blocks with fewer than `k` accesses as having the oldest possible
    /// time. Among blocks that are still tied at that point (most commonly:
    /// several blocks under `k` accesses), the one touched most recently is
    /// the one evicted, so that a block which has survived longer without
    /// reaching `k` accesses gets more time to earn its keep than one that
    /// just arrived. Remaining ties fall back to slot-scan order.
    fn select_victim(&self) -> Option<usize> {
        let mut victim: Option<usize> = None;

        for &slot in self.index.values() {
            let block = self.block(slot);
            let candidate = (
                block.kth_access_time(self.k),
                std::cmp::Reverse(block.last_access_time()),
            );

            let better = match victim {
                None => true,
                Some(current) => {
                    let incumbent = self.block(current);
                    let incumbent_key = (
                        incumbent.kth_access_time(self.k),
                        std::cmp::Reverse(incumbent.last_access_time()),
                    );
                    candidate < incumbent_key
                }
            };

            if better {
                victim = Some(slot);
            }
        }

        victim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap as StdHashMap;

    struct FakeFiles(RefCell<StdHashMap<RawFd, RawFile>>);

    impl FileResolver for FakeFiles {
        fn resolve(&self, fd: RawFd) -> Option<&RawFile> {
            // SAFETY: test-only cheat to hand out a reference with the
            // lifetime of &self; sound here because the map is never
            // mutated while the reference is alive.
            let map = self.0.as_ptr();
            unsafe { (*map).get(&fd) }
        }
    }

    fn buf(byte: u8, len: usize) -> AlignedBuf {
        let mut b = AlignedBuf::zeroed(len).unwrap();
        b.iter_mut().for_each(|x| *x = byte);
        b
    }

    fn no_files() -> FakeFiles {
        FakeFiles(RefCell::new(StdHashMap::new()))
    }

    #[test]
    fn admit_then_lookup_hits() {
        let mut store = BlockStore::new(16, 2, 2);
        let resolver = no_files();
        store.admit((1, 0), buf(b'a', 16), &resolver).unwrap();

        assert_eq!(store.resident(), 1);
        assert!(store.lookup((1, 0)).is_some());
        assert_eq!(store.hits(), 1);
        assert_eq!(store.misses(), 0);
        assert!(store.lookup((1, 1)).is_none());
        assert_eq!(store.misses(), 1);
    }

    #[test]
    fn under_k_blocks_are_evicted_first() {
        // Capacity 3, K 2. Access sequence A, B, C, A, D, B must evict C.
        let mut store = BlockStore::new(16, 3, 2);
        let resolver = no_files();

        store.admit((1, 0), buf(0, 16), &resolver).unwrap(); // A
        store.admit((1, 1), buf(0, 16), &resolver).unwrap(); // B
        store.admit((1, 2), buf(0, 16), &resolver).unwrap(); // C
        store.lookup((1, 0)).unwrap(); // A: 2nd access
        store.admit((1, 3), buf(0, 16), &resolver).unwrap(); // D, evicts C
        store.lookup((1, 1)).unwrap(); // B: 2nd access

        assert_eq!(store.resident(), 3);
        assert!(store.lookup((1, 0)).is_some());
        assert!(store.lookup((1, 1)).is_some());
        assert!(store.lookup((1, 3)).is_some());
        assert!(store.lookup((1, 2)).is_none());
    }

    #[test]
    fn discard_file_frees_slots_without_eviction() {
        let mut store = BlockStore::new(16, 1, 2);
        let resolver = no_files();

        store.admit((1, 0), buf(0, 16), &resolver).unwrap();
        store.discard_file(1);
        assert_eq!(store.resident(), 0);

        // Admitting into file 2 must not need to evict anything, because
        // discard freed the only slot.
        store.admit((2, 0), buf(0, 16), &resolver).unwrap();
        assert_eq!(store.resident(), 1);
    }
}
