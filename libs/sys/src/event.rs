// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::TimeoutMs;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// An auto-reset signal: [`Self::raise`] wakes exactly one waiter, and the
/// signal clears itself the instant that waiter observes it in
/// [`Self::wait`] — there is no separate reset step.
pub struct Event {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self {
            raised: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn raise(&self) {
        *self.raised.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_one();
    }

    /// Blocks until raised or `timeout_ms` elapses, clearing the signal on
    /// a successful wait. Returns `false` on timeout.
    pub fn wait(&self, timeout_ms: TimeoutMs) -> bool {
        let mut raised = self.raised.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *raised {
                *raised = false;
                return true;
            }
            match timeout_ms {
                None => raised = self.cond.wait(raised).unwrap_or_else(|e| e.into_inner()),
                Some(ms) => {
                    let (guard, result) = self
                        .cond
                        .wait_timeout(raised, Duration::from_millis(u64::from(ms)))
                        .unwrap_or_else(|e| e.into_inner());
                    raised = guard;
                    if result.timed_out() && !*raised {
                        return false;
                    }
                }
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Event;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn raise_then_wait() {
        let event = Event::new();
        event.raise();
        assert!(event.wait(Some(0)));
    }

    #[test]
    fn wait_times_out() {
        let event = Event::new();
        assert!(!event.wait(Some(10)));
    }

    #[test]
    fn successful_wait_clears_the_signal() {
        let event = Event::new();
        event.raise();
        assert!(event.wait(Some(0)));
        assert!(!event.wait(Some(10)));
    }

    #[test]
    fn cross_thread_handoff() {
        let event = Arc::new(Event::new());
        let other = Arc::clone(&event);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            other.raise();
        });
        assert!(event.wait(None));
        handle.join().unwrap();
    }

    #[test]
    fn raise_wakes_exactly_one_waiter() {
        let event = Arc::new(Event::new());
        let woken = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let spawn_waiter = |event: Arc<Event>, woken: Arc<std::sync::atomic::AtomicUsize>| {
            thread::spawn(move || {
                if event.wait(Some(200)) {
                    woken.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            })
        };
        let a = spawn_waiter(Arc::clone(&event), Arc::clone(&woken));
        let b = spawn_waiter(Arc::clone(&event), Arc::clone(&woken));
        thread::sleep(Duration::from_millis(20));

        event.raise();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(woken.load(std::sync::atomic::Ordering::SeqCst), 1);

        event.raise();
        a.join().unwrap();
        b.join().unwrap();
        assert_eq!(woken.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
