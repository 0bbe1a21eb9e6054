//! The backing region (R): a contiguous, page-aligned, zero-filled slice of
//! virtual memory obtained directly from the operating system.
//!
//! A [`Region`] is never resized in place; growth is handled one level up,
//! by the chain in [`crate::pool`].

use std::ptr::NonNull;

use crate::error::ErrorKind;

/// Returns the OS page size, queried once and cached for the process.
pub(crate) fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: `sysconf` with `_SC_PAGESIZE` has no preconditions and
        // always returns a small positive value on the platforms this crate
        // targets.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    })
}

/// Rounds `size` up to the next multiple of the OS page size.
pub(crate) fn round_to_page(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// A contiguous span of anonymous, zero-filled virtual memory owned by
/// exactly one pool link.
///
/// Obtained with `mmap(MAP_ANON | MAP_PRIVATE)` and released with `munmap`
/// on [`Drop`]. The OS guarantees the returned pages are zero-filled and
/// page-aligned, which is all the heap above requires of its backing store.
#[derive(Debug)]
pub(crate) struct Region {
    base: NonNull<u8>,
    size: usize,
}

// SAFETY: a `Region` exclusively owns the mapping it holds; the raw pointer
// is never aliased outside of the pool that owns it, so transferring that
// ownership across a thread boundary is sound. Concurrent *access* is gated
// by the pool's own locking discipline (see `crate::pool`), not by this type.
unsafe impl Send for Region {}

impl Region {
    /// Maps a fresh region of at least `requested` bytes, rounded up to a
    /// whole number of pages.
    pub(crate) fn acquire(requested: usize) -> Result<Self, ErrorKind> {
        let size = round_to_page(requested.max(1));

        // SAFETY: all arguments are valid for an anonymous, private mapping:
        // a null hint address, a non-zero length, read/write protection, and
        // no backing file descriptor (ignored for MAP_ANON).
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ErrorKind::OutOfMemory {
                requested,
                capacity: 0,
            });
        }

        // SAFETY: `mmap` succeeded, so `ptr` is non-null and valid for
        // `size` bytes of read/write access for the lifetime of this region.
        let base = unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) };
        Ok(Region { base, size })
    }

    /// Touches every page of this region once, forcing the OS to commit
    /// backing physical memory rather than faulting it in lazily on first
    /// access.
    pub(crate) fn warmup(&self) {
        let page = page_size();
        let mut offset = 0;
        while offset < self.size {
            // SAFETY: `offset` stays within `[0, self.size)`, `base` is
            // valid for `self.size` bytes, and a volatile byte write cannot
            // be optimized away, which is the point: force a page fault.
            unsafe {
                std::ptr::write_volatile(self.base.as_ptr().add(offset), 0);
            }
            offset += page;
        }
    }

    pub(crate) fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        addr >= start && addr < start + self.size
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: `self.base`/`self.size` describe exactly the mapping
        // returned by the `mmap` call in `acquire`, and this is the only
        // place that unmaps it.
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.size);
        }
    }
}
