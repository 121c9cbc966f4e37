// Copyright (c) 2026 The Bedrock Authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free single-producer/single-consumer queue (Herb Sutter's
//! three-pointer algorithm), backed by a ring of pre-linked nodes drawn
//! from one or more bins.
//!
//! `produce` and `consume` never block and never allocate on their own;
//! when the ring runs out of free nodes, `grow` explicitly links in
//! another bin from an upstream [`bedrock_alloc::Allocator`]. A node
//! reclaimed after consumption is returned to whichever bin it originally
//! came from, identified by a pointer-range test.

use bedrock_alloc::Allocator;
use bedrock_util::CachePadded;
use std::alloc::Layout;
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// A contiguous block of `capacity` pre-linked nodes, allocated from an
/// upstream [`Allocator`]. Owns a producer-private free-node chain through
/// its own nodes' `next` pointers.
struct Bin<T> {
    base: NonNull<Node<T>>,
    capacity: usize,
    free_head: Cell<Option<NonNull<Node<T>>>>,
}

impl<T> Bin<T> {
    fn layout(capacity: usize) -> Layout {
        Layout::array::<Node<T>>(capacity).expect("SPSC bin capacity overflowed a Layout")
    }

    /// # Safety
    /// `upstream` must remain valid for the lifetime of this bin.
    unsafe fn new(capacity: usize, upstream: &dyn Allocator) -> Option<Self> {
        assert!(capacity >= 1, "an SPSC bin needs at least one node");
        let layout = Self::layout(capacity);
        // Safety: layout is non-zero-sized with a valid power-of-two align.
        let base = unsafe { upstream.alloc(layout.size(), layout.align())? }.cast::<Node<T>>();

        for i in 0..capacity {
            // Safety: `i` is within the block just allocated for `capacity` nodes.
            let node = unsafe { base.as_ptr().add(i) };
            let next = if i + 1 < capacity {
                unsafe { base.as_ptr().add(i + 1) }
            } else {
                ptr::null_mut()
            };
            // Safety: `node` is freshly allocated, uninitialized storage.
            unsafe {
                node.write(Node {
                    next: AtomicPtr::new(next),
                    value: UnsafeCell::new(MaybeUninit::uninit()),
                });
            }
        }

        Some(Self { base, capacity, free_head: Cell::new(Some(base)) })
    }

    fn contains(&self, node: NonNull<Node<T>>) -> bool {
        let addr = node.as_ptr() as usize;
        let start = self.base.as_ptr() as usize;
        let end = start + self.capacity * size_of::<Node<T>>();
        addr >= start && addr < end
    }

    fn pop_free(&self) -> Option<NonNull<Node<T>>> {
        let head = self.free_head.get()?;
        // Safety: `head` is a live node owned by this bin's free chain.
        let next = unsafe { (*head.as_ptr()).next.load(Ordering::Relaxed) };
        self.free_head.set(NonNull::new(next));
        Some(head)
    }

    fn push_free(&self, node: NonNull<Node<T>>) {
        let old_head = self.free_head.get();
        let old_ptr = old_head.map_or(ptr::null_mut(), NonNull::as_ptr);
        // Safety: `node` was just reclaimed by the producer and is no
        // longer reachable from the queue's `first..divider` range.
        unsafe { (*node.as_ptr()).next.store(old_ptr, Ordering::Relaxed) };
        self.free_head.set(Some(node));
    }

    /// # Safety
    /// `upstream` must be the same allocator this bin was created with.
    unsafe fn free(&self, upstream: &dyn Allocator) {
        let layout = Self::layout(self.capacity);
        // Safety: `base` was allocated from `upstream` with this exact layout.
        unsafe { upstream.free(self.base.cast(), layout.size(), layout.align()) };
    }
}

/// A single-producer/single-consumer queue. `produce` must only ever be
/// called from one logical producer, `consume` only ever from one logical
/// consumer — the queue enforces neither at the type level, matching the
/// source algorithm's contract.
pub struct Spsc<'a, T> {
    upstream: &'a dyn Allocator,
    bin_capacity: usize,
    // Producer-exclusive: mutated only by `produce`/`reclaim`/`grow`.
    bins: UnsafeCell<Vec<Bin<T>>>,
    first: Cell<NonNull<Node<T>>>,
    tail: Cell<NonNull<Node<T>>>,
    // Consumer-exclusive: mutated only by `consume`.
    head: Cell<NonNull<Node<T>>>,
    // Shared: producer publishes via `last`, consumer reads it to detect
    // emptiness; consumer publishes via `divider`, producer reads it
    // (acquire) during reclaim. Never weaken these orderings to relaxed —
    // the consumer's emptiness check and the producer's reclaim pass are
    // the only synchronization between the two sides.
    divider: CachePadded<AtomicPtr<Node<T>>>,
    last: CachePadded<AtomicPtr<Node<T>>>,
}

// Safety: every `Cell` field is touched exclusively by one of the two
// roles (producer or consumer), each assumed to live on (at most) one
// thread at a time; cross-role communication goes only through `divider`
// and `last`, which are properly synchronized atomics.
unsafe impl<T: Send> Send for Spsc<'_, T> {}
unsafe impl<T: Send> Sync for Spsc<'_, T> {}

impl<'a, T> Spsc<'a, T> {
    /// Builds a queue with one bin of `capacity` nodes (one of which is
    /// permanently held as the algorithm's dummy node, leaving `capacity -
    /// 1` nodes usable for payloads before `grow` is needed).
    #[must_use]
    pub fn new(capacity: usize, upstream: &'a dyn Allocator) -> Option<Self> {
        // Safety: `upstream` outlives `self` by the `'a` bound.
        let bin = unsafe { Bin::new(capacity, upstream)? };
        let dummy = bin.pop_free().expect("a freshly built bin has free nodes");
        // Safety: `dummy` is exclusively owned by us at this point.
        unsafe { (*dummy.as_ptr()).next.store(ptr::null_mut(), Ordering::Relaxed) };

        Some(Self {
            upstream,
            bin_capacity: capacity,
            bins: UnsafeCell::new(vec![bin]),
            first: Cell::new(dummy),
            tail: Cell::new(dummy),
            head: Cell::new(dummy),
            divider: CachePadded::from(AtomicPtr::new(dummy.as_ptr())),
            last: CachePadded::from(AtomicPtr::new(dummy.as_ptr())),
        })
    }

    fn pop_free(&self) -> Option<NonNull<Node<T>>> {
        // Safety: producer-exclusive access.
        let bins = unsafe { &*self.bins.get() };
        bins.iter().find_map(Bin::pop_free)
    }

    fn push_free(&self, node: NonNull<Node<T>>) {
        // Safety: producer-exclusive access.
        let bins = unsafe { &*self.bins.get() };
        for bin in bins {
            if bin.contains(node) {
                bin.push_free(node);
                return;
            }
        }
        debug_assert!(false, "reclaimed node did not belong to any bin");
    }

    /// Pushes `item`. Returns `false` if every bin's free chain is
    /// currently exhausted — the caller should call [`Spsc::grow`] (or
    /// simply drop the item) rather than spin.
    pub fn produce(&self, item: T) -> bool {
        let Some(new_node) = self.pop_free() else {
            return false;
        };
        // Safety: `new_node` was just taken off a free chain, exclusively
        // ours until linked into the queue below.
        unsafe {
            (*new_node.as_ptr()).value.get().write(MaybeUninit::new(item));
            (*new_node.as_ptr()).next.store(ptr::null_mut(), Ordering::Relaxed);
        }

        // Link before publishing: the consumer's emptiness check only
        // ever observes `new_node` via the `last` store below, by which
        // point this link must already be visible.
        let old_tail = self.tail.get();
        // Safety: `old_tail` is the node we linked as `last` ourselves on
        // the previous call (or the initial dummy); still live.
        unsafe { (*old_tail.as_ptr()).next.store(new_node.as_ptr(), Ordering::Relaxed) };
        self.tail.set(new_node);
        self.last.swap(new_node.as_ptr(), Ordering::SeqCst);

        self.reclaim();
        true
    }

    /// Returns nodes between `first` and the consumer's current `divider`
    /// to their owning bin's free chain.
    fn reclaim(&self) {
        let divider = self.divider.load(Ordering::Acquire);
        let mut first = self.first.get();
        while first.as_ptr() != divider {
            // Safety: `first` is strictly behind `divider`, so the
            // consumer has already moved its payload out and will never
            // touch it again.
            let next = unsafe { (*first.as_ptr()).next.load(Ordering::Relaxed) };
            self.push_free(first);
            // Safety: every node up to `divider` has a non-null `next`.
            first = unsafe { NonNull::new_unchecked(next) };
        }
        self.first.set(first);
    }

    /// Pops the oldest item, or `None` if the queue is currently empty.
    pub fn consume(&self) -> Option<T> {
        let current = self.head.get();
        let last = self.last.load(Ordering::Acquire);
        if current.as_ptr() == last {
            return None;
        }
        // Safety: `current != last` means the producer has linked at
        // least one more node; the `last` acquire-load above establishes
        // happens-before with that link.
        let next = unsafe { (*current.as_ptr()).next.load(Ordering::Relaxed) };
        // Safety: established non-null by the check above.
        let next = unsafe { NonNull::new_unchecked(next) };
        // Safety: `next`'s payload was written by `produce` and not yet
        // read; moving it out here is the one and only read.
        let value = unsafe { ptr::read((*next.as_ptr()).value.get().cast::<T>()) };
        self.head.set(next);
        self.divider.store(next.as_ptr(), Ordering::Release);
        Some(value)
    }

    /// Links in another bin of `bin_capacity` nodes from `upstream`,
    /// giving the producer more free nodes once the current ring (and any
    /// prior overflow bins) are exhausted. Producer-only; must not be
    /// called concurrently with `produce`.
    pub fn grow(&self) -> bool {
        // Safety: `self.upstream` outlives `self`.
        let Some(bin) = (unsafe { Bin::new(self.bin_capacity, self.upstream) }) else {
            return false;
        };
        // Safety: producer-exclusive access.
        unsafe { (*self.bins.get()).push(bin) };
        true
    }

    #[must_use]
    pub fn bin_count(&self) -> usize {
        // Safety: read-only snapshot; caller does not race `grow` in its
        // own usage discipline (single producer).
        unsafe { (*self.bins.get()).len() }
    }
}

impl<T> Drop for Spsc<'_, T> {
    fn drop(&mut self) {
        // Drop any items the consumer never got to: `divider.next` through
        // `last` hold valid, not-yet-read payloads.
        let mut node = self.divider.load(Ordering::Relaxed);
        let last = self.last.load(Ordering::Relaxed);
        while node != last {
            // Safety: every node strictly between `divider` and `last` is
            // still linked and has never been read out.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            unsafe { ptr::drop_in_place((*next).value.get().cast::<T>()) };
            node = next;
        }

        let bins = self.bins.get_mut();
        for bin in bins.drain(..) {
            // Safety: `bin` was allocated from `self.upstream` and is
            // dropped exactly once, here.
            unsafe { bin.free(self.upstream) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bedrock_alloc::malloc::SystemAllocator;

    #[test]
    fn produce_consume_preserves_order() {
        let alloc = SystemAllocator;
        let q = Spsc::<u32>::new(8, &alloc).unwrap();

        for i in 0..5 {
            assert!(q.produce(i));
        }
        for i in 0..5 {
            assert_eq!(q.consume(), Some(i));
        }
        assert_eq!(q.consume(), None);
    }

    #[test]
    fn interleaved_produce_consume_reclaims_nodes() {
        let alloc = SystemAllocator;
        // Tiny ring: forces reclaim to run repeatedly to keep up.
        let q = Spsc::<u32>::new(2, &alloc).unwrap();

        for round in 0..100u32 {
            assert!(q.produce(round), "round {round} ran out of free nodes");
            assert_eq!(q.consume(), Some(round));
        }
    }

    #[test]
    fn exhausting_the_ring_without_consuming_fails_produce() {
        let alloc = SystemAllocator;
        let q = Spsc::<u32>::new(2, &alloc).unwrap();

        // Capacity 2 means 1 node usable before the dummy is needed again.
        assert!(q.produce(1));
        assert!(!q.produce(2), "ring should be exhausted with nothing consumed yet");
    }

    #[test]
    fn grow_supplies_more_free_nodes_after_exhaustion() {
        let alloc = SystemAllocator;
        let q = Spsc::<u32>::new(2, &alloc).unwrap();

        assert!(q.produce(1));
        assert!(!q.produce(2));
        assert!(q.grow());
        assert_eq!(q.bin_count(), 2);
        assert!(q.produce(2));

        assert_eq!(q.consume(), Some(1));
        assert_eq!(q.consume(), Some(2));
    }

    #[test]
    fn drop_releases_unconsumed_items() {
        use std::sync::Arc;

        let alloc = SystemAllocator;
        let q = Spsc::<Arc<()>>::new(8, &alloc).unwrap();
        let marker = Arc::new(());

        for _ in 0..4 {
            assert!(q.produce(marker.clone()));
        }
        assert_eq!(Arc::strong_count(&marker), 5);
        drop(q);
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    fn cross_thread_produce_consume() {
        use std::sync::Arc;
        use std::thread;

        let alloc = Box::leak(Box::new(SystemAllocator));
        let q = Arc::new(Spsc::<u32>::new(64, &*alloc).unwrap());

        let producer = {
            let q = q.clone();
            thread::spawn(move || {
                let mut sent = 0u32;
                while sent < 10_000 {
                    if q.produce(sent) {
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = thread::spawn(move || {
            let mut expected = 0u32;
            while expected < 10_000 {
                if let Some(item) = q.consume() {
                    assert_eq!(item, expected);
                    expected += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
