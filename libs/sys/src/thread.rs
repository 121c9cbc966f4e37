// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::Error;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TID: Cell<u64> = const { Cell::new(0) };
}

/// A small dense, non-zero thread identifier assigned lazily on first use.
///
/// The job system tags a job with the thread it must be resumed on
/// (`owner_tid`), using `0` to mean "no owner, any worker may run this".
/// `std::thread::ThreadId` has no stable integer representation, so Bedrock
/// hands out its own starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    #[must_use]
    pub fn current() -> Self {
        let tid = TID.with(|cell| {
            let mut tid = cell.get();
            if tid == 0 {
                tid = NEXT_TID.fetch_add(1, Ordering::Relaxed);
                cell.set(tid);
            }
            tid
        });
        Self(tid)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn any() -> u64 {
        0
    }
}

pub struct JoinHandle<T>(std::thread::JoinHandle<T>);

impl<T> JoinHandle<T> {
    /// # Panics
    ///
    /// Panics if the spawned thread itself panicked.
    pub fn join(self) -> T {
        self.0.join().expect("worker thread panicked")
    }
}

pub struct Thread;

impl Thread {
    /// Spawns a named OS thread running `f`.
    pub fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<()>, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(f)
            .map(JoinHandle)
            .map_err(|_| Error::Os("failed to spawn thread"))
    }

    pub fn yield_now() {
        std::thread::yield_now();
    }

    #[must_use]
    pub fn current_id() -> ThreadId {
        ThreadId::current()
    }
}
