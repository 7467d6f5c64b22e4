//! The descriptor table: the fixed-size array of caller-visible handles that
//! sits between the public API and the raw files underneath it.

use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::error::{CacheError, Result};
use crate::os::RawFile;
use crate::store::FileResolver;

/// A single open-file slot: the raw file it owns, the caller's current
/// position in it, and enough bookkeeping to support `fsync`/`close`
/// without re-opening or re-`stat`-ing the file.
struct Descriptor {
    file: RawFile,
    pos: u64,
    path: PathBuf,
}

/// Fixed-size table of open-file slots, indexed by small integer handles
/// handed out to callers. A handle is valid from the `open` that returned it
/// until the matching `close`; reusing a closed handle's slot for a new file
/// is intentional and mirrors how POSIX recycles file descriptor numbers.
pub struct DescriptorTable {
    slots: Vec<Option<Descriptor>>,
}

impl DescriptorTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        DescriptorTable { slots }
    }

    /// Installs `file` into the lowest-numbered free slot and returns its
    /// handle, or [`CacheError::TooManyOpen`] if the table is full.
    pub fn insert(&mut self, file: RawFile, path: PathBuf) -> Result<i32> {
        let slot = self
            .slots
            .iter()
            .position(|d| d.is_none())
            .ok_or(CacheError::TooManyOpen)?;

        self.slots[slot] = Some(Descriptor { file, pos: 0, path });
        Ok(slot as i32)
    }

    /// Removes and returns the descriptor at `handle`, freeing its slot.
    pub fn remove(&mut self, handle: i32) -> Result<(RawFile, PathBuf)> {
        let slot = self.slot_index(handle)?;
        let descriptor = self.slots[slot].take().ok_or(CacheError::BadHandle)?;
        Ok((descriptor.file, descriptor.path))
    }

    pub fn raw_fd(&self, handle: i32) -> Result<RawFd> {
        Ok(self.get(handle)?.file.raw_fd())
    }

    pub fn file(&self, handle: i32) -> Result<&RawFile> {
        Ok(&self.get(handle)?.file)
    }

    pub fn pos(&self, handle: i32) -> Result<u64> {
        Ok(self.get(handle)?.pos)
    }

    pub fn set_pos(&mut self, handle: i32, pos: u64) -> Result<()> {
        self.get_mut(handle)?.pos = pos;
        Ok(())
    }

    /// Every currently open handle, for bulk teardown.
    pub fn open_handles(&self) -> Vec<i32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|_| i as i32))
            .collect()
    }

    fn slot_index(&self, handle: i32) -> Result<usize> {
        if handle < 0 || handle as usize >= self.slots.len() {
            Err(CacheError::BadHandle)
        } else {
            Ok(handle as usize)
        }
    }

    fn get(&self, handle: i32) -> Result<&Descriptor> {
        let slot = self.slot_index(handle)?;
        self.slots[slot].as_ref().ok_or(CacheError::BadHandle)
    }

    fn get_mut(&mut self, handle: i32) -> Result<&mut Descriptor> {
        let slot = self.slot_index(handle)?;
        self.slots[slot].as_mut().ok_or(CacheError::BadHandle)
    }
}

impl FileResolver for DescriptorTable {
    fn resolve(&self, fd: RawFd) -> Option<&RawFile> {
        self.slots
            .iter()
            .filter_map(|d| d.as_ref())
            .find(|d| d.file.raw_fd() == fd)
            .map(|d| &d.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp(name: &str) -> (RawFile, PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "blockcache-descriptor-test-{}-{}",
            name,
            std::process::id()
        ));
        let file = RawFile::open(
            &path,
            libc::O_RDWR | libc::O_CREAT,
            libc::S_IRUSR | libc::S_IWUSR,
        )
        .unwrap();
        (file, path)
    }

    #[test]
    fn insert_and_remove_reuses_the_freed_slot() {
        let mut table = DescriptorTable::new(2);
        let (f1, p1) = open_tmp("a");
        let h1 = table.insert(f1, p1.clone()).unwrap();
        assert_eq!(h1, 0);

        let (f2, p2) = open_tmp("b");
        let h2 = table.insert(f2, p2).unwrap();
        assert_eq!(h2, 1);

        table.remove(h1).unwrap();
        let (f3, p3) = open_tmp("c");
        let h3 = table.insert(f3, p3).unwrap();
        assert_eq!(h3, 0);

        let _ = std::fs::remove_file(&p1);
    }

    #[test]
    fn table_rejects_operations_past_capacity() {
        let mut table = DescriptorTable::new(1);
        let (f1, p1) = open_tmp("full-a");
        table.insert(f1, p1.clone()).unwrap();

        let (f2, p2) = open_tmp("full-b");
        assert!(matches!(
            table.insert(f2, p2),
            Err(CacheError::TooManyOpen)
        ));

        let _ = std::fs::remove_file(&p1);
    }

    #[test]
    fn bad_handle_is_rejected() {
        let table = DescriptorTable::new(1);
        assert!(matches!(table.pos(0), Err(CacheError::BadHandle)));
        assert!(matches!(table.pos(-1), Err(CacheError::BadHandle)));
        assert!(matches!(table.pos(99), Err(CacheError::BadHandle)));
    }
}
