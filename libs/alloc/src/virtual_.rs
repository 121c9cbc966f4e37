// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An [`Allocator`] backed by [`bedrock_vmem::VMem`]: every request is
//! rounded up to whole pages and handed a fresh page range, so the arena
//! can grow far past what it's actually using without ever moving
//! already-committed memory until it's explicitly freed.

use crate::{Allocator, notify_oom};
use bedrock_util::SpinLock;
use bedrock_vmem::{Flags, VMem};
use core::ptr::NonNull;

struct Block {
    page_index: usize,
    page_count: usize,
}

struct State {
    vmem: VMem,
    next_page: usize,
    live: Vec<(usize, Block)>,
}

/// Commits whole pages from a reserved address range per request; never
/// moves memory in place, so `realloc` always allocates a fresh range and
/// copies.
pub struct VirtualAllocator {
    state: SpinLock<State>,
}

impl VirtualAllocator {
    pub fn new(max_pages: usize) -> Result<Self, bedrock_vmem::Error> {
        let vmem = VMem::init(max_pages, Flags::default())?;
        Ok(Self {
            state: SpinLock::new(State {
                vmem,
                next_page: 0,
                live: Vec::new(),
            }),
        })
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.state.lock().vmem.page_size()
    }

    #[must_use]
    pub fn num_pages_committed(&self) -> usize {
        self.state.lock().vmem.num_pages_committed()
    }

    fn pages_needed(page_size: usize, size: usize) -> usize {
        bedrock_util::align_up(size, page_size) / page_size
    }
}

// Safety: every live pointer maps to exactly one `Block` tracked in
// `state.live`, recording the page range it owns; `alloc`/`free` keep that
// table in sync with what's actually committed in `vmem`.
unsafe impl Allocator for VirtualAllocator {
    #[track_caller]
    unsafe fn alloc(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        let page_size = state.vmem.page_size();
        if align > page_size {
            // Pages are already page-aligned; we can't honor a coarser
            // alignment request without wasting a page searching for one,
            // which this allocator doesn't support.
            return None;
        }
        let page_count = Self::pages_needed(page_size, size);
        let page_index = state.next_page;
        if page_index + page_count > state.vmem.max_pages() {
            drop(state);
            notify_oom(size, align);
            return None;
        }

        let ptr = state.vmem.commit_pages(page_index, page_count).ok()?;
        state.next_page = page_index + page_count;
        let addr = ptr.as_ptr() as usize;
        state.live.push((
            addr,
            Block {
                page_index,
                page_count,
            },
        ));
        Some(ptr)
    }

    #[track_caller]
    unsafe fn realloc(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        // Safety: size/align valid, OOM handled by `alloc`.
        let new_ptr = unsafe { self.alloc(new_size, align)? };
        let copy_len = old_size.min(new_size);
        // Safety: old block is committed for old_size bytes, new block for
        // at least new_size >= copy_len bytes.
        unsafe { core::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len) };
        // Safety: ptr/old_size/align describe the block just copied from.
        unsafe { self.free(ptr, old_size, align) };
        Some(new_ptr)
    }

    #[track_caller]
    unsafe fn free(&self, ptr: NonNull<u8>, _size: usize, _align: usize) {
        let mut state = self.state.lock();
        let addr = ptr.as_ptr() as usize;
        let Some(pos) = state.live.iter().position(|(a, _)| *a == addr) else {
            return;
        };
        let (_, block) = state.live.swap_remove(pos);
        // Safety: block was committed by a prior `alloc` call and hasn't
        // been freed since (we just removed it from `live`).
        let _ = state.vmem.free_pages(block.page_index, block.page_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_requests_up_to_whole_pages() {
        let va = VirtualAllocator::new(64).unwrap();
        let page_size = va.page_size();
        unsafe {
            let ptr = va.alloc(1, 8).unwrap();
            assert_eq!(va.num_pages_committed(), 1);
            ptr.as_ptr().write_bytes(0x7, page_size);
            assert_eq!(*ptr.as_ptr(), 0x7);
        }
    }

    #[test]
    fn free_decommits_the_right_pages() {
        let va = VirtualAllocator::new(64).unwrap();
        let page_size = va.page_size();
        unsafe {
            let a = va.alloc(page_size, 8).unwrap();
            let _b = va.alloc(page_size * 2, 8).unwrap();
            assert_eq!(va.num_pages_committed(), 3);
            va.free(a, page_size, 8);
            assert_eq!(va.num_pages_committed(), 2);
        }
    }

    #[test]
    fn realloc_copies_into_a_fresh_range() {
        let va = VirtualAllocator::new(64).unwrap();
        let page_size = va.page_size();
        unsafe {
            let a = va.alloc(16, 8).unwrap();
            a.as_ptr().copy_from(b"0123456789abcdef".as_ptr(), 16);
            let b = va.realloc(a, 16, page_size + 16, 8).unwrap();
            assert_eq!(
                core::slice::from_raw_parts(b.as_ptr(), 16),
                b"0123456789abcdef"
            );
        }
    }

    #[test]
    fn exhausting_reservation_reports_oom() {
        let va = VirtualAllocator::new(1).unwrap();
        let page_size = va.page_size();
        unsafe {
            let _a = va.alloc(page_size, 8).unwrap();
            assert!(va.alloc(1, 8).is_none());
        }
    }
}
