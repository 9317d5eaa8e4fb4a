// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words mpsc Vyukov

//! Lock-free multi-producer / single-consumer queue, stub-node variant.
//!
//! This is the only multi-thread-touched structure a loop owns (together
//! with its wake channel). Producers on any thread [`push`]; the owning loop
//! is the sole consumer and drains with [`pop`] when the wake channel fires.
//!
//! # Algorithm
//!
//! The classic Vyukov intrusive queue, de-intrusified: each pushed value is
//! boxed into a node carrying an atomic `next` link. A permanently allocated
//! *stub* node keeps the list non-empty so producers never race the consumer
//! for the same pointer:
//!
//! ```text
//! tail ──► oldest ──► ... ──► newest ◄── head   (consumer)      (producers)
//! ```
//!
//! - `push`: swap `head` to the new node, then link the previous head to it.
//!   Wait-free per producer; total order across producers is the swap order.
//! - `pop`: consumer-only walk from `tail`. Between a producer's swap and its
//!   link store the queue is momentarily "torn"; `pop` observes `head != tail`
//!   with a null `next` and reports empty instead of spinning. The producer's
//!   wake-channel signal lands after the link store, so no message is lost.
//!
//! # Safety
//!
//! `pop` must only ever be called from one thread at a time (the loop
//! thread). The type is `Send`/`Sync` because producers touch nothing but
//! `head` and their own freshly allocated node.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    value: Option<T>,
}

pub(crate) struct MpscQueue<T> {
    /// Push end. Producers swap themselves in here.
    head: AtomicPtr<Node<T>>,
    /// Pop end. Consumer-only.
    tail: UnsafeCell<*mut Node<T>>,
    /// The permanent stub node; re-pushed by the consumer when it reaches
    /// the end of the chain.
    stub: *mut Node<T>,
}

unsafe impl<T: Send> Send for MpscQueue<T> {}
unsafe impl<T: Send> Sync for MpscQueue<T> {}

impl<T> MpscQueue<T> {
    pub(crate) fn new() -> Self {
        let stub = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: None,
        }));
        Self {
            head: AtomicPtr::new(stub),
            tail: UnsafeCell::new(stub),
            stub,
        }
    }

    /// Enqueues `value`. Callable from any thread.
    pub(crate) fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: AtomicPtr::new(ptr::null_mut()),
            value: Some(value),
        }));
        self.push_node(node);
    }

    fn push_node(&self, node: *mut Node<T>) {
        unsafe {
            (*node).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        let prev = self.head.swap(node, Ordering::AcqRel);
        unsafe {
            (*prev).next.store(node, Ordering::Release);
        }
    }

    /// Dequeues the oldest value, or `None` when the queue is (momentarily)
    /// empty.
    ///
    /// Consumer-only. A `None` with a producer mid-push is fine: that
    /// producer signals the wake channel after it finishes linking.
    pub(crate) fn pop(&self) -> Option<T> {
        unsafe {
            let mut tail = *self.tail.get();
            let mut next = (*tail).next.load(Ordering::Acquire);

            if tail == self.stub {
                // Skip over the stub to the first real node.
                if next.is_null() {
                    return None;
                }
                *self.tail.get() = next;
                tail = next;
                next = (*tail).next.load(Ordering::Acquire);
            }

            if !next.is_null() {
                *self.tail.get() = next;
                return Box::from_raw(tail).value;
            }

            // `tail` is the last linked node. If a producer has swapped head
            // but not linked yet, report empty rather than waiting on it.
            let head = self.head.load(Ordering::Acquire);
            if tail != head {
                return None;
            }

            // Queue holds exactly one node; recycle the stub behind it so the
            // node can be detached.
            self.push_node(self.stub);

            next = (*tail).next.load(Ordering::Acquire);
            if !next.is_null() {
                *self.tail.get() = next;
                return Box::from_raw(tail).value;
            }

            None
        }
    }
}

impl<T> Drop for MpscQueue<T> {
    fn drop(&mut self) {
        // No producers can exist here (&mut self); drain then free the stub.
        while self.pop().is_some() {}
        unsafe {
            debug_assert_eq!(*self.tail.get(), self.stub);
            drop(Box::from_raw(self.stub));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[test]
    fn empty_pops_none() {
        let q: MpscQueue<u32> = MpscQueue::new();
        assert_eq!(q.pop(), None);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn fifo_single_producer() {
        let q = MpscQueue::new();
        for i in 0..100 {
            q.push(i);
        }
        for i in 0..100 {
            assert_eq!(q.pop(), Some(i));
        }
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn interleaved_push_pop() {
        let q = MpscQueue::new();
        q.push(1);
        assert_eq!(q.pop(), Some(1));
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(2));
        q.push(4);
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn drop_releases_unconsumed_nodes() {
        let q = MpscQueue::new();
        for i in 0..16 {
            q.push(vec![i; 32]);
        }
        drop(q);
    }

    /// N producers, one consumer: every message arrives exactly once, and
    /// messages from the same producer arrive in their push order.
    #[test]
    fn many_producers_exactly_once_in_order() {
        const PRODUCERS: u64 = 8;
        const PER_PRODUCER: u64 = 5_000;

        let q = Arc::new(MpscQueue::new());
        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let q = Arc::clone(&q);
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    q.push((p, i));
                }
            }));
        }

        let mut next_expected = [0u64; PRODUCERS as usize];
        let mut received = 0u64;
        while received < PRODUCERS * PER_PRODUCER {
            if let Some((p, i)) = q.pop() {
                assert_eq!(
                    i, next_expected[p as usize],
                    "producer {p} delivered out of order"
                );
                next_expected[p as usize] += 1;
                received += 1;
            } else {
                std::thread::yield_now();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(q.pop(), None);
        assert!(next_expected.iter().all(|&n| n == PER_PRODUCER));
    }
}
