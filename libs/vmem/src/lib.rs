// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A page-granularity virtual memory manager: reserve a large address range
//! up front, commit/decommit page ranges on demand.
//!
//! This generalizes the reserve-then-commit pattern `bedrock-fiber`'s
//! default stack allocator uses for a single stack (see
//! `bedrock_fiber::stack`) into a standalone API that `bedrock-alloc`'s
//! virtual allocator builds on.

use bedrock_sys::MapError;
use core::ptr::NonNull;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flags {
    /// Track which pages have been written to since the last
    /// [`VMem::watch_writes`] call. Windows-only; a no-op elsewhere.
    pub write_watch: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Self { write_watch: false }
    }
}

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("failed to reserve address space: {0}")]
    Reserve(#[from] MapError),
    #[error("page index {index} out of bounds (max_pages = {max_pages})")]
    OutOfBounds { index: usize, max_pages: usize },
}

/// A reserved virtual address range with on-demand page commit.
///
/// `num_pages_committed` is a coarse total used for statistics only.
/// `VMem` trusts the caller's bookkeeping about *which*
/// page indices are currently live; committing an already-committed page or
/// decommitting an already-decommitted one is well-defined at the OS level
/// (idempotent) but will over/under-count the statistic if the caller's
/// bookkeeping is wrong.
pub struct VMem {
    base: NonNull<u8>,
    page_size: usize,
    max_pages: usize,
    num_pages_committed: usize,
    write_watch: bool,
}

// Safety: `VMem` owns its reservation exclusively and contains no interior
// mutability other than through `&mut self` methods.
unsafe impl Send for VMem {}

impl VMem {
    /// Reserves `page_size() * max_pages` bytes of address space. No
    /// physical memory is used until pages are committed.
    pub fn init(max_pages: usize, flags: Flags) -> Result<Self, Error> {
        let page_size = bedrock_sys::page_size();
        let len = page_size
            .checked_mul(max_pages)
            .expect("reservation size overflow");
        let base = bedrock_sys::reserve(len, flags.write_watch)?;
        log::debug!("vmem: reserved {len} bytes ({max_pages} pages) at {base:p}");
        Ok(Self {
            base,
            page_size,
            max_pages,
            num_pages_committed: 0,
            write_watch: flags.write_watch,
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    #[must_use]
    pub fn num_pages_committed(&self) -> usize {
        self.num_pages_committed
    }

    fn check_range(&self, index: usize, count: usize) -> Result<(), Error> {
        if count == 0 || index.checked_add(count).is_none_or(|end| end > self.max_pages) {
            return Err(Error::OutOfBounds {
                index,
                max_pages: self.max_pages,
            });
        }
        Ok(())
    }

    fn page_ptr(&self, index: usize) -> NonNull<u8> {
        // Safety: offset stays within the reservation, checked by callers.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index * self.page_size)) }
    }

    /// Commits `[index, index+count)`, returning the base pointer of `index`.
    pub fn commit_pages(&mut self, index: usize, count: usize) -> Result<NonNull<u8>, Error> {
        self.check_range(index, count)?;
        let ptr = self.page_ptr(index);
        // Safety: range checked above, lies within the reservation.
        unsafe { bedrock_sys::commit(ptr, count * self.page_size)? };
        self.num_pages_committed += count;
        log::trace!("vmem: committed pages [{index}, {})", index + count);
        Ok(ptr)
    }

    pub fn commit_page(&mut self, index: usize) -> Result<NonNull<u8>, Error> {
        self.commit_pages(index, 1)
    }

    /// Decommits `[index, index+count)`. The address space stays reserved.
    pub fn free_pages(&mut self, index: usize, count: usize) -> Result<(), Error> {
        self.check_range(index, count)?;
        let ptr = self.page_ptr(index);
        // Safety: range checked above, lies within the reservation.
        unsafe { bedrock_sys::decommit(ptr, count * self.page_size)? };
        self.num_pages_committed = self.num_pages_committed.saturating_sub(count);
        log::trace!("vmem: freed pages [{index}, {})", index + count);
        Ok(())
    }

    pub fn free_page(&mut self, index: usize) -> Result<(), Error> {
        self.free_pages(index, 1)
    }

    /// Returns addresses inside the reservation written since the last call
    /// (or since commit, for the first call). `clear` resets the OS-level
    /// tracking atomically with the query.
    ///
    /// Windows-only feature (backed by `GetWriteWatch`); always returns an
    /// empty list on POSIX, per spec.
    #[cfg(windows)]
    #[must_use]
    pub fn watch_writes(&mut self, clear: bool) -> Vec<NonNull<u8>> {
        if !self.write_watch {
            return Vec::new();
        }
        let len = self.max_pages * self.page_size;
        // Safety: `base` was reserved with write_watch = true whenever
        // `self.write_watch` is set, and `len` matches that reservation.
        unsafe { bedrock_sys::get_write_watch(self.base, len, clear) }
    }

    /// Windows-only feature; always returns an empty list on this backend.
    #[cfg(not(windows))]
    #[must_use]
    pub fn watch_writes(&mut self, _clear: bool) -> Vec<NonNull<u8>> {
        Vec::new()
    }

    /// Returns the whole reservation to the OS. Equivalent to dropping.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for VMem {
    fn drop(&mut self) {
        // Safety: `base` was reserved by `init` and hasn't been released yet.
        unsafe { bedrock_sys::release(self.base, self.max_pages * self.page_size) };
    }
}

#[cfg(test)]
mod tests {
    use super::{Flags, VMem};

    #[test]
    fn commit_decommit_cycle_returns_same_pointer() {
        let mut vmem = VMem::init(256, Flags::default()).unwrap();
        let p1 = vmem.commit_pages(4, 2).unwrap();
        vmem.free_pages(4, 2).unwrap();
        let p2 = vmem.commit_pages(4, 2).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(p2.as_ptr() as usize % vmem.page_size(), 0);
    }

    #[test]
    fn committed_pages_are_writable() {
        let mut vmem = VMem::init(16, Flags::default()).unwrap();
        let ptr = vmem.commit_pages(0, 1).unwrap();
        // Safety: page 0 was just committed above, 1 page is readable/writable.
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, vmem.page_size());
            assert_eq!(*ptr.as_ptr(), 0xAB);
        }
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut vmem = VMem::init(4, Flags::default()).unwrap();
        assert!(vmem.commit_pages(3, 2).is_err());
        assert!(vmem.commit_pages(10, 1).is_err());
    }

    #[test]
    fn write_watch_disabled_returns_empty() {
        let mut vmem = VMem::init(4, Flags::default()).unwrap();
        vmem.commit_pages(0, 1).unwrap();
        assert!(vmem.watch_writes(true).is_empty());
    }

    #[cfg(not(windows))]
    #[test]
    fn write_watch_enabled_is_still_a_noop_off_windows() {
        let mut vmem = VMem::init(4, Flags { write_watch: true }).unwrap();
        let ptr = vmem.commit_pages(0, 2).unwrap();
        // Safety: pages 0 and 1 were just committed, writable for page_size() bytes each.
        unsafe { ptr.as_ptr().write_bytes(0xAB, vmem.page_size()) };
        assert!(vmem.watch_writes(true).is_empty());
    }

    #[cfg(windows)]
    #[test]
    fn write_watch_enabled_tracks_real_page_writes() {
        let mut vmem = VMem::init(4, Flags { write_watch: true }).unwrap();
        let ptr = vmem.commit_pages(0, 2).unwrap();
        // Safety: pages 0 and 1 were just committed, writable for page_size() bytes each.
        unsafe { ptr.as_ptr().write_bytes(0xAB, vmem.page_size()) };
        let addrs = vmem.watch_writes(true);
        assert!(!addrs.is_empty());
        assert!(vmem.watch_writes(false).is_empty());
    }

    #[test]
    fn num_pages_committed_tracks_total() {
        let mut vmem = VMem::init(16, Flags::default()).unwrap();
        vmem.commit_pages(0, 3).unwrap();
        vmem.commit_pages(5, 2).unwrap();
        assert_eq!(vmem.num_pages_committed(), 5);
        vmem.free_pages(0, 3).unwrap();
        assert_eq!(vmem.num_pages_committed(), 2);
    }
}
