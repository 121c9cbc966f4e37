// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A fiber-based multi-threaded job system.
//!
//! [`JobSystem::dispatch`] fans a batch of job descriptors out across
//! `High`/`Normal`/`Low` priority run lists and hands back a [`Counter`]
//! that reaches zero once every job in the batch has completed.
//! [`Handle::wait_del`] blocks the calling job (or, on a thread with no
//! current job, the calling thread) until that happens, without ever
//! parking an OS thread: a waiting job is re-enqueued and the thread moves
//! on to other runnable work instead.
//!
//! Jobs are plain `FnOnce(usize, &Handle)` closures run on their own
//! [`bedrock_fiber::Fiber`]; a job may itself call [`Handle::dispatch`] or
//! [`Handle::wait_del`] to fan out and wait on further sub-jobs.

mod error;

pub use error::Error;

use bedrock_fiber::stack::DefaultFiberStack;
use bedrock_fiber::{Fiber, FiberResult, Suspend};
use bedrock_scheduler::ReturnState;
use bedrock_sys::{JoinHandle, Semaphore, Thread, ThreadId};
use bedrock_util::SpinLock;
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Construction parameters for a [`JobSystem`].
#[derive(Debug, Clone, Copy)]
pub struct Params {
    /// Number of dedicated worker threads. `0` runs every job on whichever
    /// thread calls [`Handle::wait_del`] (typically the main thread).
    pub worker_count: usize,
    /// Maximum number of outstanding [`Counter`]s (in-flight `dispatch`
    /// batches) at any one time.
    pub max_counters: usize,
    /// Maximum number of concurrently live job fibers across every
    /// priority.
    pub max_fibers: usize,
    /// Stack size, in bytes, given to every job's fiber.
    pub stack_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

const PRIORITIES: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

/// A `{callback(index, user), priority}` pair to hand to [`Handle::dispatch`].
pub struct JobDesc {
    pub callback: Box<dyn FnOnce(usize, &Handle) + Send + 'static>,
    pub priority: Priority,
}

impl JobDesc {
    pub fn new<F>(priority: Priority, callback: F) -> Self
    where
        F: FnOnce(usize, &Handle) + Send + 'static,
    {
        Self { callback: Box::new(callback), priority }
    }
}

/// A handle to an outstanding batch of sub-jobs, allocated by
/// [`Handle::dispatch`] and consumed by [`Handle::wait_del`] or
/// [`Handle::try_del`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Counter(u32);

struct CounterPoolState {
    free: Vec<u32>,
    /// Job slot index parked in `wait_del` on each counter, if any. At most
    /// one job ever waits on a given counter, since only whoever `dispatch`
    /// handed the `Counter` to can call `wait_del` on it.
    waiters: Vec<Option<u32>>,
}

struct CounterPool {
    counters: Vec<AtomicU32>,
    state: SpinLock<CounterPoolState>,
}

impl CounterPool {
    fn new(capacity: usize) -> Self {
        Self {
            counters: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            state: SpinLock::new(CounterPoolState {
                free: (0..capacity as u32).rev().collect(),
                waiters: vec![None; capacity],
            }),
        }
    }

    fn alloc(&self, initial: u32) -> Result<Counter, Error> {
        let index = self
            .state
            .lock()
            .free
            .pop()
            .ok_or(Error::CountersExhausted(self.counters.len()))?;
        self.counters[index as usize].store(initial, Ordering::Release);
        Ok(Counter(index))
    }

    fn get(&self, counter: Counter) -> &AtomicU32 {
        &self.counters[counter.0 as usize]
    }

    fn free(&self, counter: Counter) {
        self.state.lock().free.push(counter.0);
    }

    /// Records that `job_index` is parked waiting on `counter`.
    fn register_waiter(&self, counter: Counter, job_index: u32) {
        self.state.lock().waiters[counter.0 as usize] = Some(job_index);
    }

    /// Clears and returns whichever job was waiting on `counter`, if any.
    /// Called once by whichever decrement brings the counter to zero.
    fn take_waiter(&self, counter: Counter) -> Option<u32> {
        self.state.lock().waiters[counter.0 as usize].take()
    }
}

type JobFiber = Fiber<(), ReturnState, (), (), DefaultFiberStack>;

struct Job {
    fiber: JobFiber,
    counter: Counter,
    priority: Priority,
    /// `0` means any thread may resume this job; otherwise the id of the
    /// thread it must be resumed on (stamped by `wait_del` when a job
    /// parks itself pinned to the thread it was running on).
    owner_tid: u64,
    /// `Some` while parked in `wait_del` on a counter that hasn't reached
    /// zero yet. A job is only runnable once this is `None`, regardless of
    /// priority or `owner_tid` — without this gate a high-priority parent
    /// parked on its own lower-priority children would keep winning the
    /// run-list scan and starve them forever.
    blocked_on: Option<Counter>,
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Default)]
struct RunList {
    head: Option<u32>,
    tail: Option<u32>,
}

struct JobsState {
    slots: Vec<Option<Job>>,
    free: Vec<u32>,
    lists: [RunList; 3],
    capacity: usize,
}

impl JobsState {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            lists: [RunList::default(), RunList::default(), RunList::default()],
            capacity,
        }
    }

    fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn alloc_slot(&mut self, job: Job) -> u32 {
        if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(job);
            index
        } else {
            let index = u32::try_from(self.slots.len()).expect("job slot count overflowed u32");
            self.slots.push(Some(job));
            index
        }
    }

    fn link_tail(&mut self, priority: Priority, index: u32) {
        let list = &mut self.lists[priority as usize];
        {
            let slot = self.slots[index as usize].as_mut().unwrap();
            slot.prev = list.tail;
            slot.next = None;
        }
        if let Some(tail) = list.tail {
            self.slots[tail as usize].as_mut().unwrap().next = Some(index);
        } else {
            list.head = Some(index);
        }
        list.tail = Some(index);
    }

    fn unlink(&mut self, priority: Priority, index: u32) {
        let (prev, next) = {
            let slot = self.slots[index as usize].as_ref().unwrap();
            (slot.prev, slot.next)
        };
        let list = &mut self.lists[priority as usize];
        match prev {
            Some(p) => self.slots[p as usize].as_mut().unwrap().next = next,
            None => list.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].as_mut().unwrap().prev = prev,
            None => list.tail = prev,
        }
    }

    /// Finds the first job runnable by `tid` (owned by no one, or owned by
    /// `tid`), unlinks and removes it from its slot, highest priority
    /// first.
    fn take_runnable(&mut self, tid: u64) -> Option<(u32, Job)> {
        for priority in PRIORITIES {
            let mut cursor = self.lists[priority as usize].head;
            while let Some(index) = cursor {
                let slot = self.slots[index as usize].as_ref().unwrap();
                let (owner_tid, blocked, next) = (slot.owner_tid, slot.blocked_on, slot.next);
                if blocked.is_none() && (owner_tid == 0 || owner_tid == tid) {
                    self.unlink(priority, index);
                    return Some((index, self.slots[index as usize].take().unwrap()));
                }
                cursor = next;
            }
        }
        None
    }

    fn any_runnable(&self) -> bool {
        self.lists.iter().any(|list| list.head.is_some())
    }
}

struct ThreadData {
    current_job: Cell<Option<u32>>,
    /// Raw pointer to the `Suspend` handle of the job currently executing
    /// on this thread, if any. Valid only while that job's callback is on
    /// the stack; cleared immediately after.
    current_suspend: Cell<Option<NonNull<Suspend<(), ReturnState>>>>,
    /// Thread id `wait_del` stamps onto a job right before parking it, read
    /// back by the run loop once the job yields.
    pin_to: Cell<u64>,
    /// Counter `wait_del` is parking the current job on, read back by the
    /// run loop once the job yields. The `Job` itself is owned by the run
    /// loop's stack frame while its fiber is resumed, so this is the only
    /// way for `wait_del` (running inside that fiber) to get the value to
    /// it.
    pending_block: Cell<Option<Counter>>,
}

impl ThreadData {
    const fn new() -> Self {
        Self {
            current_job: Cell::new(None),
            current_suspend: Cell::new(None),
            pin_to: Cell::new(0),
            pending_block: Cell::new(None),
        }
    }
}

thread_local! {
    static THREAD_DATA: ThreadData = const { ThreadData::new() };
}

struct Inner {
    jobs: SpinLock<JobsState>,
    counters: CounterPool,
    semaphore: Semaphore,
    stack_size: usize,
    shutdown: AtomicBool,
}

impl Inner {
    fn run_job(&self, index: u32, mut job: Job, tid: ThreadId) {
        THREAD_DATA.with(|td| td.current_job.set(Some(index)));
        let result = job.fiber.resume(());
        THREAD_DATA.with(|td| td.current_job.set(None));

        match result {
            FiberResult::Return(()) => {
                log::trace!("jobs: slot {index} finished");
                let prev = self.counters.get(job.counter).fetch_sub(1, Ordering::AcqRel);
                self.jobs.lock().free.push(index);

                // We're the decrement that brought it to zero; wake whoever
                // parked on it, if anyone did.
                if prev == 1 {
                    if let Some(waiter) = self.counters.take_waiter(job.counter) {
                        let mut jobs = self.jobs.lock();
                        if let Some(slot) = jobs.slots[waiter as usize].as_mut() {
                            slot.blocked_on = None;
                        }
                    }
                }
            }
            FiberResult::Yield(_) => {
                // Parked itself via `wait_del`; re-enqueue pinned to
                // whichever thread it asked to be resumed on, gated behind
                // `blocked_on` until its counter resolves.
                job.owner_tid = THREAD_DATA.with(|td| td.pin_to.replace(0));
                let blocked_on = THREAD_DATA.with(|td| td.pending_block.replace(None));
                job.blocked_on = blocked_on;
                let priority = job.priority;
                {
                    let mut jobs = self.jobs.lock();
                    jobs.slots[index as usize] = Some(job);
                    jobs.link_tail(priority, index);
                }

                if let Some(counter) = blocked_on {
                    self.counters.register_waiter(counter, index);
                    // The counter may have already reached zero between
                    // `wait_del`'s own check and this registration; if so
                    // the decrement that did it already came and went
                    // without finding a waiter to wake, so unblock here
                    // instead. `take_waiter` is a no-op if some other
                    // thread's decrement raced in first and already
                    // cleared `blocked_on` itself.
                    if self.counters.get(counter).load(Ordering::Acquire) == 0 {
                        if self.counters.take_waiter(counter) == Some(index) {
                            self.jobs.lock().slots[index as usize]
                                .as_mut()
                                .unwrap()
                                .blocked_on = None;
                        }
                    }
                }
            }
        }

        let remaining = self.jobs.lock().any_runnable();
        if remaining {
            self.semaphore.post(1);
        }
    }

    /// Tries once to pick up and run a runnable job owned by `tid`.
    /// Returns whether one was found.
    fn drive_once(&self, tid: ThreadId) -> bool {
        let picked = self.jobs.lock().take_runnable(tid.as_u64());
        match picked {
            Some((index, job)) => {
                self.run_job(index, job, tid);
                true
            }
            None => false,
        }
    }
}

/// A cloneable handle to a running [`JobSystem`], passed to every job's
/// callback so it can dispatch and wait on further sub-jobs.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<Inner>,
}

impl Handle {
    /// Allocates a counter initialized to `descs.len()`, spins up a fiber
    /// per descriptor, and enqueues them onto their priority's run list.
    pub fn dispatch(&self, descs: Vec<JobDesc>) -> Result<Counter, Error> {
        let n = descs.len();
        {
            let jobs = self.inner.jobs.lock();
            if jobs.live_count() + n > jobs.capacity {
                return Err(Error::FibersExhausted { requested: n, capacity: jobs.capacity });
            }
        }

        let counter = self.inner.counters.alloc(u32::try_from(n).expect("batch size overflowed u32"))?;

        let mut built: Vec<(Priority, Job)> = Vec::with_capacity(n);
        for (index, desc) in descs.into_iter().enumerate() {
            let stack = match DefaultFiberStack::new(self.inner.stack_size) {
                Ok(stack) => stack,
                Err(err) => {
                    // None of `built`'s fibers have ever been resumed, so
                    // `Fiber::drop`'s `done()` assertion would fire; force
                    // them closed before unwinding out of this function.
                    for (_, mut job) in built {
                        // Safety: a freshly constructed, never-resumed fiber
                        // holds nothing on its stack that needs dropping.
                        unsafe {
                            job.fiber.force_reset();
                        }
                    }
                    self.inner.counters.free(counter);
                    return Err(Error::Stack(err));
                }
            };
            let handle = self.clone();
            let callback = desc.callback;
            let fiber = Fiber::with_stack(stack, move |(), suspend, _local: &()| {
                THREAD_DATA.with(|td| td.current_suspend.set(Some(NonNull::from(suspend))));
                callback(index, &handle);
                THREAD_DATA.with(|td| td.current_suspend.set(None));
            });
            built.push((desc.priority, Job {
                fiber,
                counter,
                priority: desc.priority,
                owner_tid: 0,
                blocked_on: None,
                prev: None,
                next: None,
            }));
        }

        {
            let mut jobs = self.inner.jobs.lock();
            for (priority, job) in built {
                let index = jobs.alloc_slot(job);
                jobs.link_tail(priority, index);
            }
        }

        self.inner.semaphore.post(n as u64);
        Ok(counter)
    }

    /// Blocks until `counter` reaches zero, then frees it.
    ///
    /// If called from inside a job's callback, that job is parked (pinned
    /// to the calling thread) and the thread picks up other runnable work
    /// in the meantime rather than blocking.
    pub fn wait_del(&self, counter: Counter) {
        let tid = ThreadId::current();
        let cell = self.inner.counters.get(counter);

        while cell.load(Ordering::Acquire) > 0 {
            let has_current = THREAD_DATA.with(|td| td.current_job.get().is_some());
            if has_current {
                THREAD_DATA.with(|td| {
                    td.pin_to.set(tid.as_u64());
                    td.pending_block.set(Some(counter));
                });
                let suspend = THREAD_DATA.with(|td| {
                    td.current_suspend
                        .get()
                        .expect("wait_del observed a current job with no recorded Suspend handle")
                });
                // Safety: the pointer targets the `Suspend` local still live
                // on this job's fiber stack, which is what we are executing
                // on right now.
                unsafe {
                    suspend.as_ref().suspend(ReturnState::None);
                }
            } else if !self.inner.drive_once(tid) {
                Thread::yield_now();
            }
        }

        self.inner.counters.free(counter);
    }

    /// Non-blocking check: if `counter` has already reached zero, frees it
    /// and returns `true`.
    #[must_use]
    pub fn try_del(&self, counter: Counter) -> bool {
        if self.inner.counters.get(counter).load(Ordering::Acquire) == 0 {
            self.inner.counters.free(counter);
            true
        } else {
            false
        }
    }
}

/// Owns a pool of worker threads driving a shared [`Handle`]. Dropping a
/// `JobSystem` signals shutdown and joins every worker.
pub struct JobSystem {
    handle: Handle,
    workers: Vec<JoinHandle<()>>,
}

impl std::ops::Deref for JobSystem {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl JobSystem {
    pub fn new(params: Params) -> Result<Self, Error> {
        let inner = Arc::new(Inner {
            jobs: SpinLock::new(JobsState::new(params.max_fibers)),
            counters: CounterPool::new(params.max_counters),
            semaphore: Semaphore::new(0),
            stack_size: params.stack_size,
            shutdown: AtomicBool::new(false),
        });
        let handle = Handle { inner };

        let mut workers = Vec::with_capacity(params.worker_count);
        for i in 0..params.worker_count {
            let inner = handle.inner.clone();
            let name = format!("bedrock-job-worker-{i}");
            workers.push(Thread::spawn(&name, move || worker_loop(&inner))?);
        }

        Ok(Self { handle, workers })
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        self.handle.inner.shutdown.store(true, Ordering::Release);
        self.handle.inner.semaphore.post(self.workers.len() as u64 + 1);
        for worker in self.workers.drain(..) {
            worker.join();
        }
    }
}

fn worker_loop(inner: &Arc<Inner>) {
    let tid = ThreadId::current();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        // Bounded wait so a worker periodically re-checks `shutdown` even
        // if nothing ever posts again.
        if !inner.semaphore.wait(Some(50)) {
            continue;
        }
        inner.drive_once(tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn small_params(worker_count: usize) -> Params {
        Params {
            worker_count,
            max_counters: 64,
            max_fibers: 64,
            stack_size: bedrock_fiber::stack::MIN_STACK_SIZE,
        }
    }

    #[test]
    fn single_threaded_dispatch_and_wait() {
        let jobs = JobSystem::new(small_params(0)).unwrap();
        let total = Arc::new(AtomicU32::new(0));

        let descs = (0..8)
            .map(|_| {
                let total = total.clone();
                JobDesc::new(Priority::Normal, move |_index, _handle| {
                    total.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        let counter = jobs.dispatch(descs).unwrap();
        jobs.wait_del(counter);

        assert_eq!(total.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn nested_dispatch_from_within_a_job() {
        let jobs = JobSystem::new(small_params(0)).unwrap();
        let total = Arc::new(AtomicU32::new(0));

        let total_for_outer = total.clone();
        let outer = JobDesc::new(Priority::High, move |_index, handle| {
            let total = total_for_outer.clone();
            let inner_descs = (0..4)
                .map(|_| {
                    let total = total.clone();
                    JobDesc::new(Priority::Normal, move |_index, _handle| {
                        total.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect();
            let inner_counter = handle.dispatch(inner_descs).unwrap();
            handle.wait_del(inner_counter);
            total.fetch_add(100, Ordering::Relaxed);
        });

        let counter = jobs.dispatch(vec![outer]).unwrap();
        jobs.wait_del(counter);

        assert_eq!(total.load(Ordering::Relaxed), 104);
    }

    #[test]
    fn try_del_reports_incomplete_batches() {
        let jobs = JobSystem::new(small_params(0)).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let release_for_job = release.clone();

        let desc = JobDesc::new(Priority::Low, move |_index, handle| {
            // Busy-poll a flag via recursively dispatched no-op work so the
            // job never completes until the test flips `release`.
            while !release_for_job.load(Ordering::Acquire) {
                let counter = handle
                    .dispatch(vec![JobDesc::new(Priority::Low, |_, _| {})])
                    .unwrap();
                handle.wait_del(counter);
            }
        });

        let counter = jobs.dispatch(vec![desc]).unwrap();
        assert!(!jobs.try_del(counter));

        release.store(true, Ordering::Release);
        jobs.wait_del(counter);
    }

    #[test]
    fn multithreaded_dispatch_distributes_across_workers() {
        let jobs = JobSystem::new(small_params(4)).unwrap();
        let total = Arc::new(AtomicUsize::new(0));

        let descs = (0..64)
            .map(|_| {
                let total = total.clone();
                JobDesc::new(Priority::Normal, move |_index, _handle| {
                    total.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        let counter = jobs.dispatch(descs).unwrap();
        jobs.wait_del(counter);

        assert_eq!(total.load(Ordering::Relaxed), 64);
    }

    #[test]
    fn priority_order_is_high_before_normal_before_low() {
        let jobs = JobSystem::new(small_params(0)).unwrap();
        let order = Arc::new(SpinLock::new(Vec::new()));

        let mut descs = Vec::new();
        for (priority, tag) in [(Priority::Low, 2), (Priority::Normal, 1), (Priority::High, 0)] {
            let order = order.clone();
            descs.push(JobDesc::new(priority, move |_index, _handle| {
                order.lock().push(tag);
            }));
        }

        let counter = jobs.dispatch(descs).unwrap();
        jobs.wait_del(counter);

        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
