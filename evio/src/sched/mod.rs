// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The per-loop cooperative task scheduler.
//!
//! # Tasks are state machines
//!
//! A task is a pinned, boxed future stored in a generation-checked arena
//! slot. The original stackful design (fixed stack + saved machine context)
//! becomes the compiler's state-machine transform: suspension points are
//! `await`s, and "switching to a task" is polling its future. The verbs keep
//! their meaning:
//!
//! | classic verb | here |
//! |---|---|
//! | create | box the future into an arena slot |
//! | post / exec | schedule it detached / awaited by the parent |
//! | sleep | return `Pending` without scheduling yourself |
//! | wakeup | [`Scheduler::schedule`] the parked [`TaskRef`] |
//! | yield | reschedule self behind the ready queue |
//!
//! # Lifecycle
//!
//! ```text
//!            schedule()                poll → Pending
//! [created] ───────────► [ready] ───► [running] ─────► [suspended]
//!                           ▲                │              │
//!                           │          poll → Ready()       │ schedule()
//!                           │                ▼              │ (timer fire, I/O
//!                           │             [done]            │  edge, channel
//!                           └───────────────────────────────┘  wakeup)
//! ```
//!
//! A `done` task's slot is recycled; an `exec` child's completion
//! schedules its parent.
//!
//! # Invariants
//!
//! - Exactly one task is being polled at a time per loop;
//!   [`Scheduler::current`] names it for the duration of the poll.
//! - A slot is released only from the dispatch step after its future
//!   returns `Ready` - never from inside the task's own poll. This is the
//!   deferred-self-free rule: a task's storage cannot vanish while its own
//!   frame is live.
//! - [`TaskRef`]s are generation-checked; a stale wakeup aimed at a recycled
//!   slot is ignored instead of resuming an unrelated task.

use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Stable name for a task: arena index plus the slot generation at creation
/// time. `Copy` and thread-agnostic, so it can travel through the async
/// channel; only the owning loop can act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskRef {
    index: u32,
    generation: u32,
}

struct TaskSlot {
    generation: u32,
    task: Option<TaskState>,
}

struct TaskState {
    /// Taken out of the slot for the duration of a poll so the task can
    /// re-enter the scheduler (spawn, wake) without aliasing its own slot.
    future: Option<LocalFuture>,
    /// Task to wake when this one completes (`exec` callers).
    parent: Option<TaskRef>,
    /// Detached: completion wakes nobody.
    posted: bool,
    /// Debounces redundant wakeups while already on the ready queue.
    queued: bool,
}

pub(crate) struct Scheduler {
    slots: RefCell<Vec<TaskSlot>>,
    free: RefCell<Vec<u32>>,
    ready: RefCell<VecDeque<TaskRef>>,
    current: Cell<Option<TaskRef>>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            free: RefCell::new(Vec::new()),
            ready: RefCell::new(VecDeque::new()),
            current: Cell::new(None),
        }
    }

    /// Boxes `future` into a fresh slot. The task is not scheduled yet.
    pub(crate) fn create(
        &self,
        future: LocalFuture,
        parent: Option<TaskRef>,
        posted: bool,
    ) -> TaskRef {
        let state = TaskState { future: Some(future), parent, posted, queued: false };
        let mut slots = self.slots.borrow_mut();
        if let Some(index) = self.free.borrow_mut().pop() {
            let slot = &mut slots[index as usize];
            debug_assert!(slot.task.is_none());
            slot.task = Some(state);
            TaskRef { index, generation: slot.generation }
        } else {
            let index = slots.len() as u32;
            slots.push(TaskSlot { generation: 0, task: Some(state) });
            TaskRef { index, generation: 0 }
        }
    }

    /// Wakes `task`: puts it on the ready queue unless it is already there
    /// or the reference is stale.
    pub(crate) fn schedule(&self, task: TaskRef) {
        let mut slots = self.slots.borrow_mut();
        let Some(slot) = slots.get_mut(task.index as usize) else { return };
        if slot.generation != task.generation {
            return;
        }
        let Some(state) = slot.task.as_mut() else { return };
        if state.queued {
            return;
        }
        state.queued = true;
        drop(slots);
        self.ready.borrow_mut().push_back(task);
    }

    /// The task currently being polled. `None` only outside dispatch.
    pub(crate) fn current(&self) -> Option<TaskRef> {
        self.current.get()
    }

    pub(crate) fn is_live(&self, task: TaskRef) -> bool {
        let slots = self.slots.borrow();
        slots
            .get(task.index as usize)
            .is_some_and(|slot| slot.generation == task.generation && slot.task.is_some())
    }

    pub(crate) fn has_ready(&self) -> bool {
        !self.ready.borrow().is_empty()
    }

    pub(crate) fn pop_ready(&self) -> Option<TaskRef> {
        self.ready.borrow_mut().pop_front()
    }

    /// Polls `task` once. Returns `true` if the task completed (its slot is
    /// released and, for `exec` children, the parent has been scheduled).
    pub(crate) fn poll_task(&self, task: TaskRef, waker: &Waker) -> bool {
        // Detach the future from the arena so the poll can re-enter.
        let mut future = {
            let mut slots = self.slots.borrow_mut();
            let Some(slot) = slots.get_mut(task.index as usize) else { return false };
            if slot.generation != task.generation {
                return false;
            }
            let Some(state) = slot.task.as_mut() else { return false };
            state.queued = false;
            match state.future.take() {
                Some(future) => future,
                // Mid-poll wakeup landed on the ready queue; nothing to do.
                None => return false,
            }
        };

        let previous = self.current.replace(Some(task));
        let mut cx = Context::from_waker(waker);
        let poll = future.as_mut().poll(&mut cx);
        self.current.set(previous);

        match poll {
            Poll::Pending => {
                let mut slots = self.slots.borrow_mut();
                let slot = &mut slots[task.index as usize];
                if let Some(state) = slot.task.as_mut() {
                    state.future = Some(future);
                }
                false
            }
            Poll::Ready(()) => {
                let parent = self.release(task);
                // Dropping the future here (not inside its own poll) is what
                // keeps the deferred-self-free invariant.
                drop(future);
                if let Some(parent) = parent {
                    self.schedule(parent);
                }
                true
            }
        }
    }

    /// Frees the slot and hands back the parent to wake, if any.
    fn release(&self, task: TaskRef) -> Option<TaskRef> {
        let mut slots = self.slots.borrow_mut();
        let slot = &mut slots[task.index as usize];
        debug_assert_eq!(slot.generation, task.generation);
        let state = slot.task.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.borrow_mut().push(task.index);
        if state.posted { None } else { state.parent }
    }

    /// Count of live (not yet completed) tasks.
    pub(crate) fn live_tasks(&self) -> usize {
        self.slots.borrow().iter().filter(|slot| slot.task.is_some()).count()
    }

    /// Tears every remaining task down by dropping its future. Used by loop
    /// cleanup after termination wakeups have had their chance to run.
    pub(crate) fn drop_all(&self) {
        let mut futures: SmallVec<[LocalFuture; 8]> = SmallVec::new();
        {
            let mut slots = self.slots.borrow_mut();
            let mut free = self.free.borrow_mut();
            for (index, slot) in slots.iter_mut().enumerate() {
                if let Some(state) = slot.task.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    free.push(index as u32);
                    if let Some(future) = state.future {
                        futures.push(future);
                    }
                }
            }
        }
        self.ready.borrow_mut().clear();
        // Drop outside the borrow: destructors may touch the scheduler.
        drop(futures);
    }
}

/// Suspends the caller until somebody schedules its task: the `task_sleep`
/// primitive. The wake source is whoever holds the [`TaskRef`] - a timer
/// sweep, an I/O dispatch, an async-channel wakeup.
pub(crate) struct ParkOnce {
    parked: bool,
}

impl ParkOnce {
    pub(crate) fn new() -> Self {
        Self { parked: false }
    }
}

impl Future for ParkOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.parked {
            Poll::Ready(())
        } else {
            self.parked = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::rc::Rc;

    fn noop_waker() -> Waker {
        Waker::noop().clone()
    }

    fn run_until_idle(sched: &Scheduler) {
        let waker = noop_waker();
        while let Some(task) = sched.pop_ready() {
            sched.poll_task(task, &waker);
        }
    }

    #[test]
    fn posted_task_runs_and_slot_is_released() {
        let sched = Scheduler::new();
        let hits = Rc::new(Cell::new(0));
        let hits2 = Rc::clone(&hits);
        let task = sched.create(Box::pin(async move { hits2.set(hits2.get() + 1) }), None, true);
        sched.schedule(task);
        run_until_idle(&sched);
        assert_eq!(hits.get(), 1);
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn stale_ref_is_ignored_after_slot_reuse() {
        let sched = Scheduler::new();
        let first = sched.create(Box::pin(async {}), None, true);
        sched.schedule(first);
        run_until_idle(&sched);

        // Same index, new generation.
        let second = sched.create(Box::pin(ParkOnce::new()), None, true);
        assert_eq!(sched.live_tasks(), 1);

        sched.schedule(first);
        assert!(!sched.has_ready(), "stale ref must not enqueue anything");
        assert!(sched.is_live(second));
    }

    #[test]
    fn park_once_suspends_until_scheduled() {
        let sched = Scheduler::new();
        let done = Rc::new(Cell::new(false));
        let done2 = Rc::clone(&done);
        let task = sched.create(
            Box::pin(async move {
                ParkOnce::new().await;
                done2.set(true);
            }),
            None,
            true,
        );
        sched.schedule(task);
        run_until_idle(&sched);
        assert!(!done.get(), "task should be parked");
        assert_eq!(sched.live_tasks(), 1);

        sched.schedule(task);
        run_until_idle(&sched);
        assert!(done.get());
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn completion_wakes_exec_parent() {
        let sched = Scheduler::new();
        let parent = sched.create(Box::pin(ParkOnce::new()), None, true);
        sched.schedule(parent);
        run_until_idle(&sched);
        // Parent is now parked.

        let child = sched.create(Box::pin(async {}), Some(parent), false);
        sched.schedule(child);
        run_until_idle(&sched);

        // Child completion scheduled the parent, which then finished.
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn redundant_wakeups_coalesce() {
        let sched = Scheduler::new();
        let polls = Rc::new(Cell::new(0));
        let polls2 = Rc::clone(&polls);
        let task = sched.create(
            Box::pin(async move {
                polls2.set(polls2.get() + 1);
                ParkOnce::new().await;
                polls2.set(polls2.get() + 1);
            }),
            None,
            true,
        );
        sched.schedule(task);
        sched.schedule(task);
        sched.schedule(task);
        run_until_idle(&sched);
        assert_eq!(polls.get(), 1, "coalesced into a single poll");
    }

    #[test]
    fn drop_all_cancels_parked_tasks() {
        let sched = Scheduler::new();
        for _ in 0..4 {
            let task = sched.create(Box::pin(ParkOnce::new()), None, true);
            sched.schedule(task);
        }
        run_until_idle(&sched);
        assert_eq!(sched.live_tasks(), 4);
        sched.drop_all();
        assert_eq!(sched.live_tasks(), 0);
    }
}
