// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! In-loop counting event.
//!
//! A tiny semaphore for tasks of one loop: [`Event::signal`] adds a count
//! and wakes the parked waiter, [`Event::wait`] consumes a count or
//! suspends until one arrives. Single-waiter by contract. A timed-out wait
//! consumes nothing.

use crate::error::{ErrorCode, Millis, Result};
use crate::event_loop::{LoopCtx, LoopInner};
use crate::sched::TaskRef;
use crate::timer::TimerEntry;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

struct EventInner {
    loop_: Rc<LoopInner>,
    value: Cell<u64>,
    waiter: Cell<Option<TaskRef>>,
}

#[derive(Clone)]
pub struct Event {
    inner: Rc<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("value", &self.inner.value.get()).finish()
    }
}

impl Event {
    #[must_use]
    pub fn new(ctx: &LoopCtx) -> Self {
        Self {
            inner: Rc::new(EventInner {
                loop_: Rc::clone(&ctx.inner),
                value: Cell::new(0),
                waiter: Cell::new(None),
            }),
        }
    }

    /// Increments the count and wakes the parked waiter, if any.
    pub fn signal(&self) {
        self.inner.value.set(self.inner.value.get() + 1);
        if let Some(task) = self.inner.waiter.take() {
            self.inner.loop_.sched.schedule(task);
        }
    }

    /// Consumes one count, suspending while the count is zero.
    ///
    /// With `timeout > 0` the wait gives up after that many milliseconds
    /// and returns [`ErrorCode::TimedOut`] without consuming a signal.
    pub async fn wait(&self, timeout: Millis) -> Result<()> {
        if self.inner.value.get() > 0 {
            self.inner.value.set(self.inner.value.get() - 1);
            return Ok(());
        }
        EventWait { event: Rc::clone(&self.inner), timeout, timer: None, armed: false }.await
    }
}

struct EventWait {
    event: Rc<EventInner>,
    timeout: Millis,
    timer: Option<Rc<TimerEntry>>,
    armed: bool,
}

impl EventWait {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take()
            && timer.is_registered()
        {
            self.event.loop_.timeouts.set(&timer, 0, self.event.loop_.now());
        }
        // Single-waiter contract: whatever is parked here is us.
        self.event.waiter.set(None);
    }
}

impl Future for EventWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        let inner = &this.event;

        if inner.loop_.shared.is_terminated() {
            this.disarm();
            return Poll::Ready(Err(ErrorCode::Terminate));
        }

        if !this.armed {
            let Some(current) = inner.loop_.sched.current() else {
                return Poll::Ready(Err(ErrorCode::InvalidArgument));
            };
            if this.timeout > 0 {
                let timer = TimerEntry::new(Some(current));
                inner.loop_.timeouts.set(&timer, this.timeout, inner.loop_.now());
                this.timer = Some(timer);
            }
            inner.waiter.set(Some(current));
            this.armed = true;
            return Poll::Pending;
        }

        if inner.value.get() > 0 {
            inner.value.set(inner.value.get() - 1);
            this.disarm();
            return Poll::Ready(Ok(()));
        }

        if let Some(timer) = &this.timer
            && timer.elapsed()
        {
            this.timer = None;
            inner.waiter.set(None);
            return Poll::Ready(Err(ErrorCode::TimedOut));
        }

        Poll::Pending
    }
}

impl Drop for EventWait {
    fn drop(&mut self) {
        if self.armed {
            self.disarm();
        }
    }
}
