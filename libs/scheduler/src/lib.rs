// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded, non-preemptive scheduler over [`bedrock_fiber::Fiber`].
//!
//! The scheduler owns a pool of reusable fiber slots threaded onto a run
//! list. [`Scheduler::invoke`] starts a new job and switches into it
//! immediately; [`Scheduler::update`] walks the run list once, resuming every
//! slot whose [`ReturnState`] condition has become satisfied. A job
//! suspends itself by calling a method on the [`Control`] handle passed to
//! its callback; the value it yields is exactly the [`ReturnState`] the
//! scheduler is waiting on.
//!
//! The run list is an index-based slab (`Vec<Slot>` plus `prev`/`next`
//! indices) rather than an intrusive pointer-linked list, since fiber slots
//! are not independently heap-allocated objects here.

use bedrock_fiber::Fiber;
use bedrock_fiber::stack::DefaultFiberStack;
use bedrock_sys::MapError;

/// The reason a job suspended itself, and the condition under which the
/// scheduler should resume it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReturnState {
    /// No condition; resume on the very next [`Scheduler::update`] call.
    None,
    /// The job's callback has run to completion; its slot is freed.
    Finish,
    /// Resume after this many further `update` calls have elapsed.
    Pass(u32),
    /// Resume once at least this many seconds have elapsed across `update`
    /// calls' `dt` arguments.
    Wait(f64),
}

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    #[error("failed to allocate fiber stack: {0}")]
    Stack(#[from] MapError),
    #[error("slot {0} is not a valid handle into this scheduler")]
    InvalidSlot(u32),
}

/// A handle to a slot in the scheduler, returned by [`Scheduler::invoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u32);

/// Passed to a job's callback so it can suspend itself back into the
/// scheduler.
pub struct Control<'a> {
    suspend: &'a bedrock_fiber::Suspend<(), ReturnState>,
}

impl Control<'_> {
    /// Suspends the calling job, to be resumed on the scheduler's very next
    /// `update`.
    pub fn yield_now(&self) {
        self.suspend.suspend(ReturnState::None);
    }

    /// Suspends the calling job for `n` further `update` calls.
    pub fn pass(&self, n: u32) {
        self.suspend.suspend(ReturnState::Pass(n));
    }

    /// Suspends the calling job until at least `secs` seconds have elapsed
    /// across future `update` calls.
    pub fn wait(&self, secs: f64) {
        self.suspend.suspend(ReturnState::Wait(secs));
    }

    /// Suspends the job and tells the scheduler it will not be resumed
    /// again.
    ///
    /// # Safety
    ///
    /// The caller must not hold any value needing `Drop` on its stack past
    /// this call: the scheduler reclaims the slot with
    /// [`bedrock_fiber::Fiber::force_reset`] rather than ever resuming the
    /// job to let it unwind naturally.
    pub unsafe fn finish(&self) {
        self.suspend.suspend(ReturnState::Finish);
    }
}

type JobFiber = Fiber<(), ReturnState, (), (), DefaultFiberStack>;

/// Tracks why a slot is parked in the run list and what would satisfy it.
#[derive(Debug, Clone, Copy)]
enum Pending {
    /// Fires unconditionally on the next `update`.
    Ready,
    Pass { target: u32, count: u32 },
    Wait { target: f64, elapsed: f64 },
}

impl Pending {
    fn from_return_state(state: ReturnState) -> Self {
        match state {
            ReturnState::None => Pending::Ready,
            ReturnState::Pass(n) => Pending::Pass { target: n, count: 0 },
            ReturnState::Wait(secs) => Pending::Wait { target: secs, elapsed: 0.0 },
            ReturnState::Finish => {
                unreachable!("Finish is handled before a slot is ever parked as pending")
            }
        }
    }

    /// Advances the pending condition by one tick of `dt` seconds, returning
    /// whether it is now satisfied.
    fn tick(&mut self, dt: f64) -> bool {
        match self {
            Pending::Ready => true,
            Pending::Pass { target, count } => {
                *count += 1;
                *count >= *target
            }
            Pending::Wait { target, elapsed } => {
                *elapsed += dt;
                *elapsed >= *target
            }
        }
    }
}

struct Slot {
    fiber: JobFiber,
    pending: Pending,
    prev: Option<u32>,
    next: Option<u32>,
}

/// A pool of reusable fiber slots driven by a single run list.
pub struct Scheduler {
    stack_size: usize,
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    run_head: Option<u32>,
    run_tail: Option<u32>,
    current: Option<u32>,
}

impl Scheduler {
    /// Creates an empty scheduler. Every job fiber gets a stack of at least
    /// `stack_size` bytes (rounded up to the fiber primitive's minimum).
    #[must_use]
    pub fn new(stack_size: usize) -> Self {
        Self {
            stack_size,
            slots: Vec::new(),
            free: Vec::new(),
            run_head: None,
            run_tail: None,
            current: None,
        }
    }

    /// Returns the id of the currently running slot, if `update` or
    /// `invoke` is presently switched into one.
    #[must_use]
    pub fn current(&self) -> Option<SlotId> {
        self.current.map(SlotId)
    }

    /// Number of slots presently parked in the run list (running or
    /// waiting on a condition).
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc_slot(&mut self, fiber: JobFiber) -> u32 {
        let slot = Slot { fiber, pending: Pending::Ready, prev: None, next: None };
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            index
        } else {
            let index = u32::try_from(self.slots.len()).expect("slot count overflowed u32");
            self.slots.push(Some(slot));
            index
        }
    }

    fn link_tail(&mut self, index: u32) {
        let slot = self.slots[index as usize].as_mut().unwrap();
        slot.prev = self.run_tail;
        slot.next = None;
        if let Some(tail) = self.run_tail {
            self.slots[tail as usize].as_mut().unwrap().next = Some(index);
        } else {
            self.run_head = Some(index);
        }
        self.run_tail = Some(index);
    }

    fn unlink(&mut self, index: u32) {
        let (prev, next) = {
            let slot = self.slots[index as usize].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        match prev {
            Some(prev) => self.slots[prev as usize].as_mut().unwrap().next = next,
            None => self.run_head = next,
        }
        match next {
            Some(next) => self.slots[next as usize].as_mut().unwrap().prev = prev,
            None => self.run_tail = prev,
        }
    }

    fn free_slot(&mut self, index: u32) {
        self.unlink(index);
        self.slots[index as usize] = None;
        self.free.push(index);
    }

    /// Applies the result of resuming `index`'s fiber: links/unlinks the
    /// slot and records the new pending condition. Returns `true` if the
    /// slot is still alive afterwards.
    fn apply_result(&mut self, index: u32, result: bedrock_fiber::FiberResult<ReturnState, ()>) -> bool {
        match result {
            bedrock_fiber::FiberResult::Yield(ReturnState::Finish) => {
                log::trace!("scheduler: slot {index} finished via Control::finish()");
                // Safety: a job that yields `Finish` has promised not to be
                // resumed again and to hold nothing needing `Drop`.
                unsafe {
                    self.slots[index as usize].as_mut().unwrap().fiber.force_reset();
                }
                self.free_slot(index);
                false
            }
            bedrock_fiber::FiberResult::Yield(state) => {
                self.slots[index as usize].as_mut().unwrap().pending = Pending::from_return_state(state);
                true
            }
            bedrock_fiber::FiberResult::Return(()) => {
                log::trace!("scheduler: slot {index} returned from its callback");
                self.free_slot(index);
                false
            }
        }
    }

    /// Allocates a slot, runs `callback` on a fresh fiber over it, appends
    /// the slot to the run list, and switches into it immediately.
    ///
    /// Returns the slot's id, unless the job finished (or was reclaimed) on
    /// this very first switch, in which case there is no id to return.
    pub fn invoke<F>(&mut self, callback: F) -> Result<Option<SlotId>, Error>
    where
        F: FnOnce(&Control) + 'static,
    {
        let stack = DefaultFiberStack::new(self.stack_size)?;
        let fiber = Fiber::with_stack(stack, move |(), suspend, _local: &()| {
            let ctl = Control { suspend };
            callback(&ctl);
        });

        let index = self.alloc_slot(fiber);
        self.link_tail(index);

        let prev_current = self.current.replace(index);
        let result = self.slots[index as usize].as_mut().unwrap().fiber.resume(());
        self.current = prev_current;

        if self.apply_result(index, result) {
            Ok(Some(SlotId(index)))
        } else {
            Ok(None)
        }
    }

    /// Walks the run list once. Every slot whose pending condition is
    /// satisfied gets resumed with `dt`'s worth of progress applied first.
    ///
    /// Slots that become ready *during* this call (e.g. a `Pass(0)` parked
    /// by a job just resumed) are not resumed again until the next
    /// `update`.
    pub fn update(&mut self, dt: f64) {
        debug_assert!(self.current.is_none(), "update called re-entrantly");

        let mut index = self.run_head;
        while let Some(current) = index {
            // Read `next` before possibly freeing the slot.
            let next = self.slots[current as usize].as_ref().unwrap().next;

            let ready = self.slots[current as usize].as_mut().unwrap().pending.tick(dt);
            if ready {
                let prev_current = self.current.replace(current);
                let result = self.slots[current as usize].as_mut().unwrap().fiber.resume(());
                self.current = prev_current;
                self.apply_result(current, result);
            }

            index = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn invoke_runs_until_first_suspend() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();

        let slot = sched
            .invoke(move |ctl| {
                ran2.set(true);
                ctl.pass(1);
            })
            .unwrap();

        assert!(ran.get());
        assert!(slot.is_some());
        assert_eq!(sched.len(), 1);
    }

    #[test]
    fn invoke_frees_slot_immediately_on_completion() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let slot = sched.invoke(|_ctl| {}).unwrap();
        assert!(slot.is_none());
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn pass_resumes_after_n_updates() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let resumes = Rc::new(Cell::new(0u32));
        let resumes2 = resumes.clone();

        sched
            .invoke(move |ctl| {
                ctl.pass(2);
                resumes2.set(resumes2.get() + 1);
            })
            .unwrap();

        sched.update(1.0);
        assert_eq!(resumes.get(), 0);
        sched.update(1.0);
        assert_eq!(resumes.get(), 1);
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn wait_resumes_once_elapsed_time_reached() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let resumed = Rc::new(Cell::new(false));
        let resumed2 = resumed.clone();

        sched
            .invoke(move |ctl| {
                ctl.wait(1.5);
                resumed2.set(true);
            })
            .unwrap();

        sched.update(0.5);
        assert!(!resumed.get());
        sched.update(0.5);
        assert!(!resumed.get());
        sched.update(0.5);
        assert!(resumed.get());
    }

    #[test]
    fn multiple_jobs_interleave_in_run_list_order() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let order = Rc::new(std::cell::RefCell::new(Vec::new()));

        for id in 0..3 {
            let order = order.clone();
            sched
                .invoke(move |ctl| {
                    order.borrow_mut().push(id);
                    ctl.yield_now();
                    order.borrow_mut().push(id + 100);
                })
                .unwrap();
        }

        sched.update(0.0);

        assert_eq!(*order.borrow(), vec![0, 1, 2, 100, 101, 102]);
        assert_eq!(sched.len(), 0);
    }

    #[test]
    fn finish_reclaims_slot_without_resuming_again() {
        let mut sched = Scheduler::new(bedrock_fiber::stack::MIN_STACK_SIZE);
        let reached_after = Rc::new(Cell::new(false));
        let reached_after2 = reached_after.clone();

        sched
            .invoke(move |ctl| {
                // Safety: nothing needing `Drop` is live past this point.
                unsafe {
                    ctl.finish();
                }
                reached_after2.set(true);
            })
            .unwrap();

        assert_eq!(sched.len(), 0);
        sched.update(0.0);
        // The job body never resumes past `finish()`, so this flag is
        // never set even though `update` ran.
        assert!(!reached_after.get());
    }
}
