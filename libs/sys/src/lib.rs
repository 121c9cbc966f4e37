// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Uniform wrappers over the handful of OS primitives the rest of this
//! workspace consumes: page-size query, virtual memory reserve/commit,
//! threads, mutex, semaphore, and event/signal. Every other crate in this
//! workspace reaches the OS only through here.
//!
//! Two backends exist, selected by `cfg_if` the same way `bedrock-fiber`
//! selects its stack-allocation backend: one over `libc` for POSIX
//! platforms, one over `windows-sys` for Windows.

mod event;
mod mutex;
mod semaphore;
mod thread;
mod vmem_sys;

pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use thread::{JoinHandle, Thread, ThreadId};
#[cfg(windows)]
pub use vmem_sys::get_write_watch;
pub use vmem_sys::{MapError, commit, decommit, page_size, release, reserve};

/// A duration in milliseconds, used by the blocking waits below. `None` means
/// wait forever, matching the spec's "milliseconds; -1 = infinite" convention.
pub type TimeoutMs = Option<u32>;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("OS refused the operation: {0}")]
    Os(&'static str),
}
