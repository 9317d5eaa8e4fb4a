// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Readiness waiting for registered descriptors.
//!
//! Every object registered with the demux owns one [`IoWaiter`]: latched
//! readiness flags plus at most one parked reader task and one parked writer
//! task. Event dispatch sets flags and schedules whoever is parked; the
//! [`WaitIo`] future consumes the flags when its task resumes. Flags are
//! latched (not consumed by dispatch) because the demux is edge-style: an
//! edge that arrives between a failed syscall and the task parking must not
//! be lost.

use crate::error::Millis;
use crate::sched::TaskRef;
use crate::timer::TimerEntry;
use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use super::LoopInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IoDirection {
    Read,
    Write,
}

/// Outcome of one readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// An edge arrived; retry the syscall.
    Ready,
    /// The armed per-operation timeout fired first.
    TimedOut,
    /// The loop's termination path ran.
    Terminated,
}

#[derive(Default)]
pub(crate) struct IoWaiter {
    pub(crate) reader: Cell<Option<TaskRef>>,
    pub(crate) writer: Cell<Option<TaskRef>>,
    pub(crate) readable: Cell<bool>,
    pub(crate) writable: Cell<bool>,
    pub(crate) read_closed: Cell<bool>,
    pub(crate) write_closed: Cell<bool>,
    pub(crate) error: Cell<bool>,
    pub(crate) terminated: Cell<bool>,
}

impl IoWaiter {
    /// Latches `event`'s readiness into the flags and returns the parked
    /// tasks to wake (reader, writer).
    pub(crate) fn apply_event(&self, event: &mio::event::Event) -> (Option<TaskRef>, Option<TaskRef>) {
        if event.is_readable() {
            self.readable.set(true);
        }
        if event.is_writable() {
            self.writable.set(true);
        }
        if event.is_read_closed() {
            self.read_closed.set(true);
        }
        if event.is_write_closed() {
            self.write_closed.set(true);
        }
        if event.is_error() {
            self.error.set(true);
        }

        let wake_reader = self.readable.get() || self.read_closed.get() || self.error.get();
        let wake_writer = self.writable.get() || self.write_closed.get() || self.error.get();
        (
            if wake_reader { self.reader.get() } else { None },
            if wake_writer { self.writer.get() } else { None },
        )
    }

    fn flag_set(&self, direction: IoDirection) -> bool {
        match direction {
            IoDirection::Read => {
                self.readable.get() || self.read_closed.get() || self.error.get()
            }
            IoDirection::Write => {
                self.writable.get() || self.write_closed.get() || self.error.get()
            }
        }
    }

    fn consume(&self, direction: IoDirection) {
        match direction {
            IoDirection::Read => self.readable.set(false),
            IoDirection::Write => self.writable.set(false),
        }
        self.error.set(false);
    }

    fn park(&self, direction: IoDirection, task: TaskRef) {
        match direction {
            IoDirection::Read => self.reader.set(Some(task)),
            IoDirection::Write => self.writer.set(Some(task)),
        }
    }

    fn unpark(&self, direction: IoDirection) {
        match direction {
            IoDirection::Read => self.reader.set(None),
            IoDirection::Write => self.writer.set(None),
        }
    }

    /// True while the peer-closed edge is latched for the read side.
    pub(crate) fn saw_read_closed(&self) -> bool {
        self.read_closed.get()
    }

    pub(crate) fn saw_write_closed(&self) -> bool {
        self.write_closed.get()
    }
}

/// Parks the current task until its registration reports progress in one
/// direction, the optional per-operation timeout fires, or the loop
/// terminates. At most one waiter per direction per registration; the loop
/// serializes reads (and writes) on a stream, so this never races.
pub(crate) struct WaitIo {
    inner: Rc<LoopInner>,
    waiter: Rc<IoWaiter>,
    direction: IoDirection,
    timeout: Millis,
    timer: Option<Rc<TimerEntry>>,
    armed: bool,
}

impl WaitIo {
    pub(crate) fn new(
        inner: Rc<LoopInner>,
        waiter: Rc<IoWaiter>,
        direction: IoDirection,
        timeout: Millis,
    ) -> Self {
        Self { inner, waiter, direction, timeout, timer: None, armed: false }
    }

    fn disarm(&mut self) {
        self.waiter.unpark(self.direction);
        if let Some(timer) = self.timer.take() {
            self.inner.timeouts.set(&timer, 0, self.inner.now());
        }
    }
}

impl Future for WaitIo {
    type Output = WaitOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<WaitOutcome> {
        let this = self.get_mut();

        if this.waiter.terminated.get() || this.inner.shared.is_terminated() {
            this.disarm();
            return Poll::Ready(WaitOutcome::Terminated);
        }

        if !this.armed {
            if this.waiter.flag_set(this.direction) {
                this.waiter.consume(this.direction);
                return Poll::Ready(WaitOutcome::Ready);
            }
            let Some(current) = this.inner.sched.current() else {
                return Poll::Ready(WaitOutcome::Terminated);
            };
            this.waiter.park(this.direction, current);
            if this.timeout > 0 {
                let timer = TimerEntry::new(Some(current));
                this.inner.timeouts.set(&timer, this.timeout, this.inner.now());
                this.timer = Some(timer);
            }
            this.armed = true;
            return Poll::Pending;
        }

        if let Some(timer) = &this.timer
            && timer.elapsed()
        {
            this.timer = None;
            this.waiter.unpark(this.direction);
            return Poll::Ready(WaitOutcome::TimedOut);
        }

        if this.waiter.flag_set(this.direction) {
            this.disarm();
            this.waiter.consume(this.direction);
            return Poll::Ready(WaitOutcome::Ready);
        }

        Poll::Pending
    }
}

impl Drop for WaitIo {
    fn drop(&mut self) {
        if self.armed {
            self.disarm();
        }
    }
}
