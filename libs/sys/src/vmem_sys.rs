// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//
// Adapted from the reserve/commit dance `bedrock-fiber`'s default stack
// allocator performs for a single stack; here it is generalized into a
// standalone reserve-then-commit-ranges API for `bedrock-vmem`.

use core::ptr::NonNull;

#[derive(Debug, onlyerror::Error)]
pub enum MapError {
    #[error("the OS refused to reserve {0} bytes of address space")]
    ReserveFailed(usize),
    #[error("the OS refused to change protection on a {0}-byte range")]
    ProtectFailed(usize),
}

#[cfg(unix)]
pub fn page_size() -> usize {
    // Safety: sysconf with a valid name is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(size > 0);
    size as usize
}

#[cfg(windows)]
pub fn page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    // Safety: SYSTEM_INFO is a plain-old-data struct, zeroing it is valid.
    unsafe {
        let mut info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

/// Reserves `len` bytes of address space with no physical backing. `len`
/// must already be page-aligned. `write_watch` has no POSIX equivalent and
/// is ignored on this backend.
#[cfg(unix)]
pub fn reserve(len: usize, _write_watch: bool) -> Result<NonNull<u8>, MapError> {
    debug_assert_eq!(len % page_size(), 0);
    // Safety: a PROT_NONE anonymous mapping never aliases live memory.
    unsafe {
        let ptr = libc::mmap(
            core::ptr::null_mut(),
            len,
            libc::PROT_NONE,
            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(MapError::ReserveFailed(len));
        }
        Ok(bedrock_util::non_null(ptr.cast()))
    }
}

/// Reserves `len` bytes of address space with no physical backing. `len`
/// must already be page-aligned. `write_watch` requests `MEM_WRITE_WATCH`
/// tracking for the region, consumed later by [`get_write_watch`].
#[cfg(windows)]
pub fn reserve(len: usize, write_watch: bool) -> Result<NonNull<u8>, MapError> {
    use windows_sys::Win32::System::Memory::{
        MEM_RESERVE, MEM_WRITE_WATCH, PAGE_READWRITE, VirtualAlloc,
    };
    debug_assert_eq!(len % page_size(), 0);
    let alloc_type = MEM_RESERVE | if write_watch { MEM_WRITE_WATCH } else { 0 };
    // Safety: MEM_RESERVE never commits physical pages.
    unsafe {
        let ptr = VirtualAlloc(core::ptr::null(), len, alloc_type, PAGE_READWRITE);
        if ptr.is_null() {
            return Err(MapError::ReserveFailed(len));
        }
        Ok(bedrock_util::non_null(ptr.cast()))
    }
}

/// Retrieves the addresses of pages written to inside `[base, base+len)`
/// since the region was reserved (or since the last call with
/// `reset = true`), and optionally clears the tracking atomically with the
/// query.
///
/// # Safety
///
/// `base..base+len` must lie within a reservation made by [`reserve`] with
/// `write_watch = true`.
#[cfg(windows)]
pub unsafe fn get_write_watch(base: NonNull<u8>, len: usize, reset: bool) -> Vec<NonNull<u8>> {
    use windows_sys::Win32::System::Memory::{GetWriteWatch, WRITE_WATCH_FLAG_RESET};

    // GetWriteWatch wants a caller-sized buffer; this bounds how many
    // dirty pages a single call can report.
    const MAX_ADDRESSES: usize = 4096;
    let mut addresses = vec![core::ptr::null_mut::<core::ffi::c_void>(); MAX_ADDRESSES];
    let mut count = addresses.len();
    let mut granularity = 0u32;
    let flags = if reset { WRITE_WATCH_FLAG_RESET } else { 0 };

    // Safety: base/len describe a write-watch reservation, ensured by caller.
    let status = unsafe {
        GetWriteWatch(
            flags,
            base.as_ptr().cast(),
            len,
            addresses.as_mut_ptr(),
            &mut count,
            &mut granularity,
        )
    };

    if status != 0 {
        log::warn!("vmem: GetWriteWatch failed with status {status}");
        return Vec::new();
    }

    addresses[..count]
        .iter()
        .filter_map(|&p| NonNull::new(p.cast()))
        .collect()
}

/// Commits (makes read+write) the `len`-byte range starting at `base`.
///
/// # Safety
///
/// `base..base+len` must lie entirely within a range previously returned by
/// [`reserve`], page-aligned.
#[cfg(unix)]
pub unsafe fn commit(base: NonNull<u8>, len: usize) -> Result<(), MapError> {
    // Safety: ensured by caller
    unsafe {
        if libc::mprotect(
            base.as_ptr().cast(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
        ) != 0
        {
            return Err(MapError::ProtectFailed(len));
        }
    }
    Ok(())
}

#[cfg(windows)]
pub unsafe fn commit(base: NonNull<u8>, len: usize) -> Result<(), MapError> {
    use windows_sys::Win32::System::Memory::{MEM_COMMIT, PAGE_READWRITE, VirtualAlloc};
    // Safety: ensured by caller
    unsafe {
        if VirtualAlloc(base.as_ptr().cast(), len, MEM_COMMIT, PAGE_READWRITE).is_null() {
            return Err(MapError::ProtectFailed(len));
        }
    }
    Ok(())
}

/// Decommits the `len`-byte range starting at `base`, releasing its physical
/// backing while keeping the address space reserved.
///
/// # Safety
///
/// Same requirements as [`commit`].
#[cfg(unix)]
pub unsafe fn decommit(base: NonNull<u8>, len: usize) -> Result<(), MapError> {
    // Safety: ensured by caller
    unsafe {
        if libc::mprotect(base.as_ptr().cast(), len, libc::PROT_NONE) != 0 {
            return Err(MapError::ProtectFailed(len));
        }
        // MADV_DONTNEED actually drops the physical pages; mprotect alone
        // only revokes access.
        libc::madvise(base.as_ptr().cast(), len, libc::MADV_DONTNEED);
    }
    Ok(())
}

#[cfg(windows)]
pub unsafe fn decommit(base: NonNull<u8>, len: usize) -> Result<(), MapError> {
    use windows_sys::Win32::System::Memory::{MEM_DECOMMIT, VirtualFree};
    // Safety: ensured by caller
    unsafe {
        if VirtualFree(base.as_ptr().cast(), len, MEM_DECOMMIT) == 0 {
            return Err(MapError::ProtectFailed(len));
        }
    }
    Ok(())
}

/// Releases the entire reservation made by [`reserve`] back to the OS.
///
/// # Safety
///
/// `base` must be a pointer returned by [`reserve`] with the same `len`,
/// not yet released.
#[cfg(unix)]
pub unsafe fn release(base: NonNull<u8>, len: usize) {
    // Safety: ensured by caller
    unsafe {
        libc::munmap(base.as_ptr().cast(), len);
    }
}

#[cfg(windows)]
pub unsafe fn release(base: NonNull<u8>, _len: usize) {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};
    // Safety: ensured by caller
    unsafe {
        VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE);
    }
}
