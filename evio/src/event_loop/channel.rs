// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The async channel: the one cross-thread doorway into a loop.
//!
//! Producers on any thread enqueue a [`Message`] on the loop's MPSC queue
//! and fire the wake channel once per enqueue. The loop drains the queue
//! fully on each wake (the wake is edge-style, so partial drains would lose
//! signals) and dispatches each message by kind. Nothing else on a loop is
//! ever touched from another thread.

use crate::error::{ErrorCode, Result};
use crate::mpsc::MpscQueue;
use crate::sched::{LocalFuture, TaskRef};
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::LoopCtx;

/// Task body as it travels across threads: a closure that, once inside the
/// target loop, builds the task's future against that loop's context.
pub(crate) type PostFn = Box<dyn FnOnce(LoopCtx) -> LocalFuture + Send>;

/// Completion slot for a cross-loop [`Message::Exec`]. Written by the target
/// loop (success) or its cleanup path (termination), read by the suspended
/// caller after its wakeup arrives.
#[derive(Default)]
pub(crate) struct ExecResult {
    value: Mutex<Option<Result<()>>>,
}

impl ExecResult {
    pub(crate) fn set(&self, result: Result<()>) {
        *self.value.lock().expect("exec result lock") = Some(result);
    }

    pub(crate) fn take(&self) -> Option<Result<()>> {
        self.value.lock().expect("exec result lock").take()
    }
}

pub(crate) enum Message {
    /// Spawn a detached task in the target loop.
    Post { f: PostFn },
    /// Resume a specific (usually parked) task in the target loop.
    Wakeup { task: TaskRef },
    /// Spawn a task in the target loop and signal `caller` on `reply` when
    /// it completes.
    Exec {
        f: PostFn,
        reply: Arc<Shared>,
        caller: TaskRef,
        result: Arc<ExecResult>,
    },
    /// Register `caller` to be woken (via `reply`) when the target loop
    /// terminates.
    Wait { reply: Arc<Shared>, caller: TaskRef },
}

/// The thread-shared face of a loop: incoming queue, wake channel, and the
/// stop/terminated lifecycle bits. Everything else a loop owns stays on its
/// own thread.
pub(crate) struct Shared {
    queue: MpscQueue<Message>,
    waker: mio::Waker,
    stop: AtomicBool,
    terminated: AtomicBool,
}

impl Shared {
    pub(crate) fn new(waker: mio::Waker) -> Self {
        Self {
            queue: MpscQueue::new(),
            waker,
            stop: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    /// Enqueue + wake. Fails with [`ErrorCode::Terminate`] once the target
    /// loop's termination path has run.
    pub(crate) fn post(&self, message: Message) -> Result<()> {
        if self.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        self.queue.push(message);
        self.waker.wake().map_err(|err| crate::error::translate(&err))
    }

    /// Consumer side; loop thread only.
    pub(crate) fn try_pop(&self) -> Option<Message> {
        self.queue.pop()
    }

    pub(crate) fn request_stop(&self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake().map_err(|err| crate::error::translate(&err))
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

/// `std::task::Waker` adapter: an arbitrary future inside a task can clone
/// the waker and wake from any thread; the wake lands as a
/// [`Message::Wakeup`] through the channel, exactly like any other
/// cross-thread resume. Stale refs are dropped by the generation check on
/// the scheduler side.
pub(crate) struct ChannelWaker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) task: TaskRef,
}

impl std::task::Wake for ChannelWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let _ = self.shared.post(Message::Wakeup { task: self.task });
    }
}

/// Cross-thread handle to a loop. Cheap to clone; keeps the loop's shared
/// face (not its single-threaded guts) alive.
#[derive(Clone)]
pub struct LoopHandle {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("terminated", &self.shared.is_terminated())
            .finish()
    }
}

impl LoopHandle {
    /// Spawns a detached task in the target loop. Safe from any thread,
    /// including a task inside the same loop (self-post).
    pub fn post<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(LoopCtx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.shared.post(Message::Post {
            f: Box::new(move |ctx| Box::pin(f(ctx)) as LocalFuture),
        })
    }

    /// Resumes a parked task in the target loop. The counterpart of
    /// [`LoopCtx::park`](super::LoopCtx::park); a stale or already-running
    /// reference is a no-op on the receiving side.
    pub fn wakeup(&self, task: TaskRef) -> Result<()> {
        self.shared.post(Message::Wakeup { task })
    }

    /// Requests the loop to stop. Returns without waiting; use
    /// [`LoopCtx::stop_and_wait`](super::LoopCtx::stop_and_wait) to block
    /// until the target has finished its cleanup.
    pub fn stop(&self) -> Result<()> {
        self.shared.request_stop()
    }

    /// True once the loop's termination path has run.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    pub(crate) fn same_loop(&self, shared: &Arc<Shared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }
}
