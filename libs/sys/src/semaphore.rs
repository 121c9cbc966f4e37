// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::TimeoutMs;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore with millisecond-granularity timed waits.
///
/// The job system posts this once per dispatched job and per woken waiter;
/// every worker thread's selector loop blocks on it between run-list scans.
pub struct Semaphore {
    count: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increments the count by `n` and wakes up to `n` waiters.
    pub fn post(&self, n: u64) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    /// Blocks until the count is non-zero (decrementing it by one), or the
    /// timeout elapses. `None` waits forever, matching the spec's "-1 =
    /// infinite" convention. Returns `false` on timeout.
    pub fn wait(&self, timeout_ms: TimeoutMs) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *count > 0 {
                *count -= 1;
                return true;
            }
            match timeout_ms {
                None => {
                    count = self.cond.wait(count).unwrap_or_else(|e| e.into_inner());
                }
                Some(ms) => {
                    let (guard, result) = self
                        .cond
                        .wait_timeout(count, Duration::from_millis(u64::from(ms)))
                        .unwrap_or_else(|e| e.into_inner());
                    count = guard;
                    if result.timed_out() && *count == 0 {
                        return false;
                    }
                }
            }
        }
    }

    /// Non-blocking variant of [`Self::wait`].
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post(1);
        assert!(sem.wait(Some(0)));
    }

    #[test]
    fn wait_times_out() {
        let sem = Semaphore::new(0);
        assert!(!sem.wait(Some(10)));
    }

    #[test]
    fn cross_thread_handoff() {
        let sem = Arc::new(Semaphore::new(0));
        let other = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.post(1);
        });
        assert!(sem.wait(None));
        handle.join().unwrap();
    }
}
