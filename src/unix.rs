//! Raw-file adapter: positional block-aligned reads and writes, size query,
//! size extension, and an aligned buffer allocator, all built directly on
//! `libc` rather than `std::fs::File`.

use std::ffi::CString;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;

/// A raw OS file handle. Carries only the file descriptor; all logical
/// state (position, size, path) lives in the descriptor table above it.
pub struct RawFile {
    fd: libc::c_int,
}

impl RawFile {
    /// Opens `path` with the given POSIX `flags`/`mode`, requesting
    /// `O_DIRECT` so that the kernel page cache is bypassed.
    ///
    /// If the platform or filesystem rejects `O_DIRECT` (some tmpfs and
    /// overlay filesystems do), the open is retried without the flag: direct
    /// I/O is this cache's raison d'être, not a correctness requirement, so
    /// its absence must not make the adapter unusable.
    pub fn open(path: &Path, flags: libc::c_int, mode: libc::mode_t) -> io::Result<Self> {
        let cpath = cstr(path)?;

        // SAFETY: cpath is a valid NUL-terminated string for the lifetime of
        // the call. The returned descriptor, if any, is owned by the
        // `RawFile` we construct below and closed on `Drop`.
        let fd = unsafe {
            match ffi::open(&cpath, flags | libc::O_DIRECT, mode) {
                Ok(fd) => fd,
                Err(_) => ffi::open(&cpath, flags, mode)?,
            }
        };

        Ok(Self { fd })
    }

    /// Reads up to `buf.len()` bytes at `offset`, retrying once on `EINTR`.
    pub fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        loop {
            // SAFETY: fd is open and owned by self; buf is a valid mutable
            // slice for its length.
            match unsafe { ffi::pread(self.fd, buf, offset as libc::off_t) } {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes `buf` at `offset`, retrying once on `EINTR`.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        loop {
            // SAFETY: fd is open and owned by self; buf is a valid slice for
            // its length.
            match unsafe { ffi::pwrite(self.fd, buf, offset as libc::off_t) } {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the current size of the file in bytes.
    pub fn size(&self) -> io::Result<u64> {
        // SAFETY: fd is open and owned by self.
        unsafe { ffi::fstat_size(self.fd) }
    }

    /// Extends or shrinks the file to exactly `len` bytes.
    pub fn truncate(&self, len: u64) -> io::Result<()> {
        // SAFETY: fd is open and owned by self.
        unsafe { ffi::truncate(self.fd, len as libc::off_t) }
    }

    /// Flushes this file's data to the storage device.
    pub fn sync(&self) -> io::Result<()> {
        // SAFETY: fd is open and owned by self.
        unsafe { ffi::fsync(self.fd) }
    }

    /// Closes the underlying descriptor, consuming `self`.
    ///
    /// Closing is also attempted (and any error swallowed) in `Drop`, so a
    /// value that is simply let go is still cleaned up; this method exists
    /// for callers who want to observe the close error.
    pub fn close(self) -> io::Result<()> {
        let fd = self.fd;
        std::mem::forget(self);
        // SAFETY: fd was owned by the now-forgotten RawFile and has not been
        // closed yet.
        unsafe { ffi::close(fd) }
    }

    /// The raw descriptor, used only as part of the (file, block) cache key.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RawFile {
    fn drop(&mut self) {
        // SAFETY: fd is open and owned by self; errors here have nowhere to
        // go, matching the usual best-effort close-on-drop convention.
        unsafe {
            let _ = ffi::close(self.fd);
        }
    }
}

/// Returns the alignment required (and recommended) for direct I/O buffers
/// and offsets: the OS page size, or 4096 if the query fails.
pub fn get_alignment() -> usize {
    // SAFETY: a simple call to sysconf with a valid, non-limit option name.
    let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if result == -1 {
        4096
    } else {
        result as usize
    }
}

/// A block of memory allocated with [`get_alignment`] alignment, suitable
/// as a direct-I/O buffer. Owns its memory and frees it on `Drop`.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `len` bytes aligned to the platform's
    /// direct-I/O alignment.
    pub fn zeroed(len: usize) -> io::Result<Self> {
        let alignment = get_alignment();

        // SAFETY: alignment is a power of two obtained from the OS.
        let ptr = unsafe { ffi::aligned_alloc(alignment, len) }?;
        let mut buf = Self { ptr, len };
        buf.deref_mut().fill(0);
        Ok(buf)
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self, and
        // self is borrowed mutably.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was obtained from posix_memalign and has not been
        // freed yet.
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) }
    }
}

// SAFETY: AlignedBuf is an owned, exclusively-accessed heap buffer; nothing
// about its contents is thread-specific.
unsafe impl Send for AlignedBuf {}

fn cstr(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    Ok(CString::new(path.as_os_str().as_bytes())?)
}

mod ffi {
    use std::ffi::CStr;
    use std::io;
    use std::ptr::NonNull;

    pub unsafe fn open(
        path: &CStr,
        flags: libc::c_int,
        mode: libc::mode_t,
    ) -> io::Result<libc::c_int> {
        let fd = libc::open(path.as_ptr(), flags, mode as libc::c_int);

        if fd == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }

    pub unsafe fn pread(
        fd: libc::c_int,
        buf: &mut [u8],
        offset: libc::off_t,
    ) -> io::Result<usize> {
        let n = libc::pread(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            offset,
        );

        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub unsafe fn pwrite(fd: libc::c_int, buf: &[u8], offset: libc::off_t) -> io::Result<usize> {
        let n = libc::pwrite(fd, buf.as_ptr() as *const libc::c_void, buf.len(), offset);

        if n == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    pub unsafe fn fstat_size(fd: libc::c_int) -> io::Result<u64> {
        let mut stat: libc::stat = std::mem::zeroed();

        if libc::fstat(fd, &mut stat) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(stat.st_size as u64)
        }
    }

    pub unsafe fn truncate(fd: libc::c_int, len: libc::off_t) -> io::Result<()> {
        if libc::ftruncate(fd, len) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn fsync(fd: libc::c_int) -> io::Result<()> {
        if libc::fsync(fd) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn close(fd: libc::c_int) -> io::Result<()> {
        if libc::close(fd) == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub unsafe fn aligned_alloc(alignment: usize, len: usize) -> io::Result<NonNull<u8>> {
        let mut ptr: *mut libc::c_void = std::ptr::null_mut();
        let rc = libc::posix_memalign(&mut ptr, alignment, len.max(alignment));

        if rc != 0 {
            Err(io::Error::from_raw_os_error(rc))
        } else {
            NonNull::new(ptr as *mut u8).ok_or_else(|| {
                io::Error::new(io::ErrorKind::Other, "posix_memalign returned null")
            })
        }
    }
}
