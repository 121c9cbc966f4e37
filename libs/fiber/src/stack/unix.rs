// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::stack::{FiberStack, MIN_STACK_SIZE, StackPointer};
use bedrock_sys::MapError;

pub struct DefaultFiberStack {
    top: StackPointer,
    mmap_len: usize,
}

impl DefaultFiberStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self, MapError> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = bedrock_sys::page_size();
        let mmap_len = size
            .checked_add(page_size + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        // Reserve the whole region, then commit everything past the guard
        // page: the guard page is left untouched (PROT_NONE) so a stack
        // overflow faults instead of corrupting adjacent memory.
        let base = bedrock_sys::reserve(mmap_len, false)?;
        let usable = mmap_len - page_size;
        // Safety: `usable` bytes starting right after the guard page are
        // within the reservation we just made.
        unsafe {
            let committed_base = bedrock_util::non_null(base.as_ptr().add(page_size));
            bedrock_sys::commit(committed_base, usable)?;
        }

        Ok(Self {
            top: StackPointer::new(base.as_ptr() as usize + mmap_len).unwrap(),
            mmap_len,
        })
    }
}

impl Default for DefaultFiberStack {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        let base = self.top.get() - self.mmap_len;
        // Safety: `base` is the reservation made by `new`, not yet released.
        unsafe {
            bedrock_sys::release(bedrock_util::non_null(base as *mut u8), self.mmap_len);
        }
    }
}

unsafe impl FiberStack for DefaultFiberStack {
    fn top(&self) -> StackPointer {
        self.top
    }

    fn bottom(&self) -> StackPointer {
        StackPointer::new(self.top.get() - self.mmap_len).unwrap()
    }
}
