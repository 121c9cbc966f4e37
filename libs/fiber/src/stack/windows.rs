// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::FiberStack;
use crate::stack::{MIN_STACK_SIZE, StackPointer, StackTebFields};
use bedrock_sys::MapError;
use windows_sys::Win32::System::Memory::{MEM_COMMIT, PAGE_GUARD, PAGE_READWRITE, VirtualAlloc};
use windows_sys::Win32::System::Threading::SetThreadStackGuarantee;

pub struct DefaultFiberStack {
    top: StackPointer,
    bottom: usize,
    bottom_plus_guard: StackPointer,
    stack_guarantee: usize,
}

impl DefaultFiberStack {
    /// Creates a new stack which has at least the given capacity.
    pub fn new(size: usize) -> Result<Self, MapError> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Calculate how many extra pages we need to add for the various guard
        // pages:
        // - 1 or 2 guard pages to catch the fault (which may be 4095/8191 bytes
        //   into the guard page).
        // - N pages for the thread stack guarantee.
        // - 1 hard guard page at the end of the stack.
        let page_size = bedrock_sys::page_size();
        let guard_size = guard_page_size(page_size);
        let stack_guarantee = get_thread_stack_guarantee(page_size);
        let extra_pages = guard_size + stack_guarantee + page_size;

        // Add the extra pages to the requested size and round the size up to
        // a page boundary.
        let alloc_len = size
            .checked_add(extra_pages + page_size - 1)
            .expect("integer overflow while calculating stack size")
            & !(page_size - 1);

        let alloc_base = bedrock_sys::reserve(alloc_len, false)?;
        let alloc_top = alloc_base.as_ptr() as usize + alloc_len;
        let limit = alloc_top - page_round_up(MIN_STACK_SIZE, page_size);
        let out = Self {
            top: StackPointer::new(alloc_top).unwrap(),
            bottom: limit,
            bottom_plus_guard: StackPointer::new(alloc_base.as_ptr() as usize).unwrap(),
            stack_guarantee,
        };

        // Commit the first MIN_STACK_SIZE pages of the stack.
        // Safety: [limit, alloc_top) lies within the reservation above.
        unsafe {
            bedrock_sys::commit(bedrock_util::non_null(limit as *mut u8), alloc_top - limit)?;
        }

        // Commit the guard pages with PAGE_GUARD, which the generic
        // `bedrock_sys::commit` doesn't expose: a guard-page fault lets
        // Windows extend the stack automatically rather than trapping it
        // as a plain access violation.
        let stack_guard_size = guard_size + stack_guarantee;
        // Safety: [limit - stack_guard_size, limit) lies within the
        // reservation above.
        unsafe {
            if VirtualAlloc(
                (limit - stack_guard_size) as *mut _,
                stack_guard_size,
                MEM_COMMIT,
                PAGE_READWRITE | PAGE_GUARD,
            )
            .is_null()
            {
                return Err(MapError::ProtectFailed(stack_guard_size));
            }
        }

        Ok(out)
    }
}

impl Default for DefaultFiberStack {
    fn default() -> Self {
        Self::new(1024 * 1024).expect("failed to allocate stack")
    }
}

impl Drop for DefaultFiberStack {
    fn drop(&mut self) {
        let alloc_len = self.top.get() - self.bottom_plus_guard.get();
        // Safety: `bottom_plus_guard` is the reservation base from `new`,
        // not yet released.
        unsafe {
            bedrock_sys::release(
                bedrock_util::non_null(self.bottom_plus_guard.get() as *mut u8),
                alloc_len,
            );
        }
    }
}

unsafe impl FiberStack for DefaultFiberStack {
    #[inline]
    fn top(&self) -> StackPointer {
        self.top
    }

    #[inline]
    fn bottom(&self) -> StackPointer {
        self.bottom_plus_guard
    }

    #[inline]
    fn teb_fields(&self) -> StackTebFields {
        StackTebFields {
            StackTop: self.top.get(),
            StackBottom: self.bottom,
            StackBottomPlusGuard: self.bottom_plus_guard.get(),
            GuaranteedStackBytes: self.stack_guarantee,
        }
    }

    #[inline]
    fn update_teb_fields(&mut self, stack_limit: usize, guaranteed_stack_bytes: usize) {
        self.bottom = stack_limit;
        self.stack_guarantee = guaranteed_stack_bytes;
    }
}

fn page_round_up(val: usize, page_size: usize) -> usize {
    (val + page_size - 1) & !(page_size - 1)
}

fn get_thread_stack_guarantee(page_size: usize) -> usize {
    // Passing a value of 0 will just query the existing value.
    let mut stack_guarantee = 0;
    // Safety: a valid out-pointer to a local `u32`.
    unsafe {
        SetThreadStackGuarantee(&mut stack_guarantee);
    }

    // At a bare minimum we need to reserve 1 page for the stack overflow
    // handler. Also round the guarantee up to a page boundary.
    page_round_up((stack_guarantee as usize).max(page_size), page_size)
}

fn guard_page_size(page_size: usize) -> usize {
    if cfg!(target_pointer_width = "64") {
        2 * page_size
    } else {
        page_size
    }
}
