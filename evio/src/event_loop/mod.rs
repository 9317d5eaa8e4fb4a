// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words demux evio

//! The event loop: one thread, one demux, many tasks.
//!
//! # One iteration
//!
//! 1. Run every ready task (the bootstrap task on the first pass; afterwards
//!    whatever the previous pass woke).
//! 2. Sweep the sleep timers against the wall clock; a fire wakes its task
//!    and refreshes `now` / `last_activity`.
//! 3. Block in the demux with timeout = the nearest future event across the
//!    three timer services.
//! 4. Refresh `now`. Zero events means the loop idled: sweep the idle
//!    timers with `now - last_activity`.
//! 5. Dispatch each event: the wake token drains the async channel; any
//!    other token latches readiness and wakes the parked reader/writer.
//!    Activity refreshes after every event.
//! 6. Sweep the per-operation timeouts with `now - last_activity`.
//!
//! The loop exits when [`LoopHandle::stop`] (or [`LoopCtx::stop`]) has been
//! called, then runs the cleanup path: every pending timer is woken without
//! elapsing, every parked I/O waiter is woken terminated, the channel is
//! drained with terminate semantics, cross-loop waiters are notified, and
//! any task still alive is dropped.
//!
//! # Ownership
//!
//! [`LoopInner`] is single-threaded (`Rc`, `Cell`, `RefCell`); the only
//! cross-thread doorway is the [`channel::Shared`] pair of MPSC queue and
//! wake channel. Streams and listeners keep the loop's storage alive past
//! `stop()` by holding their `Rc` until closed.

pub(crate) mod channel;
pub(crate) mod demux;
pub(crate) mod io_wait;

use crate::clock::time_current;
use crate::config::LoopConfig;
use crate::error::{ErrorCode, Millis, Result};
use crate::pool::BufferPool;
use crate::sched::{LocalFuture, ParkOnce, Scheduler, TaskRef};
use crate::timer::{Fired, TimerEntry, TimerKind, TimerService};
use mio::Events;
use mio::event::Source;
use mio::{Interest, Token};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

pub use channel::LoopHandle;
use channel::{ChannelWaker, ExecResult, Message, Shared};
use demux::{Demux, PollDemux, WAKE_TOKEN};
use io_wait::IoWaiter;

pub(crate) use io_wait::{IoDirection, WaitIo, WaitOutcome};

/// A loop's single-threaded state. Reached through `Rc` from the loop
/// driver, from every [`LoopCtx`], and from every attached stream/listener;
/// the storage lives until the last of those lets go.
pub(crate) struct LoopInner {
    pub(crate) config: LoopConfig,
    pub(crate) shared: Arc<Shared>,
    demux: RefCell<Box<dyn Demux>>,
    pub(crate) sched: Scheduler,
    pub(crate) sleeps: TimerService,
    pub(crate) idles: TimerService,
    pub(crate) timeouts: TimerService,
    now: Cell<Millis>,
    last_activity: Cell<Millis>,
    io_table: RefCell<Vec<Option<Rc<IoWaiter>>>>,
    io_free: RefCell<Vec<usize>>,
    /// Cross-loop waiters (registered through [`Message::Wait`]) to notify
    /// on termination.
    waiters: RefCell<Vec<(Arc<Shared>, TaskRef)>>,
    pub(crate) pool: BufferPool,
}

impl LoopInner {
    fn new(config: LoopConfig, shared: Arc<Shared>, demux: Box<dyn Demux>) -> Rc<Self> {
        let now = time_current();
        let pool_retain = config.pool_retain;
        Rc::new(Self {
            config,
            shared,
            demux: RefCell::new(demux),
            sched: Scheduler::new(),
            sleeps: TimerService::new(TimerKind::Sleep),
            idles: TimerService::new(TimerKind::Idle),
            timeouts: TimerService::new(TimerKind::Timeout),
            now: Cell::new(now),
            last_activity: Cell::new(now),
            io_table: RefCell::new(Vec::new()),
            io_free: RefCell::new(Vec::new()),
            waiters: RefCell::new(Vec::new()),
            pool: BufferPool::new(pool_retain),
        })
    }

    pub(crate) fn now(&self) -> Millis {
        self.now.get()
    }

    fn refresh_now(&self) {
        self.now.set(time_current());
    }

    fn touch_activity(&self) {
        self.last_activity.set(self.now.get());
    }

    fn inactivity(&self) -> Millis {
        self.now.get().saturating_sub(self.last_activity.get())
    }

    /// Registers `source` with the demux under a fresh token, with both
    /// interests armed for the registration's lifetime. Readiness is
    /// latched in the returned [`IoWaiter`], so permanently armed
    /// interests lose nothing and spare the per-operation re-registration
    /// churn.
    pub(crate) fn register_io(&self, source: &mut dyn Source) -> Result<(Token, Rc<IoWaiter>)> {
        self.register_io_with(source, Interest::READABLE | Interest::WRITABLE)
    }

    /// Registers with a caller-chosen interest set.
    pub(crate) fn register_io_with(
        &self,
        source: &mut dyn Source,
        interest: Interest,
    ) -> Result<(Token, Rc<IoWaiter>)> {
        let index = {
            let mut table = self.io_table.borrow_mut();
            match self.io_free.borrow_mut().pop() {
                Some(index) => index,
                None => {
                    table.push(None);
                    table.len() - 1
                }
            }
        };
        let token = Token(index);
        let waiter = Rc::new(IoWaiter::default());
        if let Err(err) = self.demux.borrow().register(source, token, interest) {
            self.io_free.borrow_mut().push(index);
            return Err(crate::error::translate(&err));
        }
        self.io_table.borrow_mut()[index] = Some(Rc::clone(&waiter));
        Ok((token, waiter))
    }

    pub(crate) fn deregister_io(&self, token: Token, source: &mut dyn Source) {
        if let Err(err) = self.demux.borrow().deregister(source) {
            trace!(?token, %err, "deregister failed (descriptor may be gone)");
        }
        let mut table = self.io_table.borrow_mut();
        if let Some(slot) = table.get_mut(token.0) {
            *slot = None;
            self.io_free.borrow_mut().push(token.0);
        }
    }

    fn task_waker(self: &Rc<Self>, task: TaskRef) -> Waker {
        Waker::from(Arc::new(ChannelWaker { shared: Arc::clone(&self.shared), task }))
    }

    /// Polls ready tasks until the queue drains.
    fn run_ready(self: &Rc<Self>) {
        while let Some(task) = self.sched.pop_ready() {
            let waker = self.task_waker(task);
            self.sched.poll_task(task, &waker);
        }
    }

    fn wake_timers(&self, fired: Fired) {
        for entry in fired {
            if let Some(task) = entry.task.get() {
                self.sched.schedule(task);
            }
        }
    }

    fn wait_timeout(&self) -> Option<Duration> {
        let now = self.now.get();
        let delta = self.inactivity();
        [
            self.sleeps.nearest_event(now),
            self.idles.nearest_event(delta),
            self.timeouts.nearest_event(delta),
        ]
        .into_iter()
        .flatten()
        .min()
        .map(Duration::from_millis)
    }

    fn dispatch_io(&self, event: &mio::event::Event) {
        let waiter = {
            let table = self.io_table.borrow();
            table.get(event.token().0).cloned().flatten()
        };
        let Some(waiter) = waiter else {
            trace!(token = event.token().0, "event for retired registration");
            return;
        };
        let (reader, writer) = waiter.apply_event(event);
        if let Some(task) = reader {
            self.sched.schedule(task);
        }
        if let Some(task) = writer {
            self.sched.schedule(task);
        }
    }

    fn drain_channel(self: &Rc<Self>) {
        while let Some(message) = self.shared.try_pop() {
            match message {
                Message::Post { f } => {
                    let future = f(LoopCtx { inner: Rc::clone(self) });
                    let task = self.sched.create(future, None, true);
                    self.sched.schedule(task);
                }
                Message::Wakeup { task } => self.sched.schedule(task),
                Message::Exec { f, reply, caller, result } => {
                    let future = f(LoopCtx { inner: Rc::clone(self) });
                    let body = async move {
                        future.await;
                        result.set(Ok(()));
                        // A dead caller loop leaves nothing to signal.
                        let _ = reply.post(Message::Wakeup { task: caller });
                    };
                    let task = self.sched.create(Box::pin(body), None, true);
                    self.sched.schedule(task);
                }
                Message::Wait { reply, caller } => {
                    self.waiters.borrow_mut().push((reply, caller));
                }
            }
        }
    }

    fn run_internal(self: &Rc<Self>) {
        let mut events = Events::with_capacity(self.config.max_events);
        self.refresh_now();
        self.touch_activity();
        debug!("loop running");

        loop {
            self.run_ready();

            if self.shared.stop_requested() {
                break;
            }

            let fired = self.sleeps.process(self.now.get());
            if !fired.is_empty() {
                self.wake_timers(fired);
                self.run_ready();
                self.refresh_now();
                self.touch_activity();
            }

            let timeout = if self.sched.has_ready() {
                Some(Duration::ZERO)
            } else {
                self.wait_timeout()
            };
            let waited = self.demux.borrow_mut().wait(&mut events, timeout);
            self.refresh_now();

            if let Err(err) = waited {
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                error!(%err, "demux wait failed; terminating loop");
                break;
            }

            if self.shared.stop_requested() {
                break;
            }

            if events.is_empty() {
                let fired = self.idles.process(self.inactivity());
                if !fired.is_empty() {
                    self.wake_timers(fired);
                    self.refresh_now();
                    self.touch_activity();
                }
            } else {
                for event in &events {
                    if event.token() == WAKE_TOKEN {
                        self.drain_channel();
                    } else {
                        self.dispatch_io(event);
                    }
                    self.refresh_now();
                    self.touch_activity();
                }
            }

            let fired = self.timeouts.process(self.inactivity());
            if !fired.is_empty() {
                self.wake_timers(fired);
            }
        }

        self.cleanup();
    }

    /// Termination path; see the module docs for the ordering contract.
    fn cleanup(self: &Rc<Self>) {
        debug!("loop terminating");
        self.shared.mark_terminated();

        for service in [&self.sleeps, &self.idles, &self.timeouts] {
            let woken = service.terminate();
            self.wake_timers(woken);
        }

        {
            let table = self.io_table.borrow();
            for waiter in table.iter().flatten() {
                waiter.terminated.set(true);
                if let Some(task) = waiter.reader.get() {
                    self.sched.schedule(task);
                }
                if let Some(task) = waiter.writer.get() {
                    self.sched.schedule(task);
                }
            }
        }

        // Give the woken tasks one chance to observe Terminate and unwind.
        self.run_ready();

        // Late arrivals on the channel get terminate semantics.
        while let Some(message) = self.shared.try_pop() {
            match message {
                Message::Post { .. } => {}
                Message::Wakeup { task } => self.sched.schedule(task),
                Message::Exec { reply, caller, result, .. } => {
                    result.set(Err(ErrorCode::Terminate));
                    let _ = reply.post(Message::Wakeup { task: caller });
                }
                Message::Wait { reply, caller } => {
                    self.waiters.borrow_mut().push((reply, caller));
                }
            }
        }
        self.run_ready();

        for (reply, caller) in self.waiters.borrow_mut().drain(..) {
            let _ = reply.post(Message::Wakeup { task: caller });
        }

        let leaked = self.sched.live_tasks();
        if leaked > 0 {
            warn!(count = leaked, "dropping tasks still alive at termination");
        }
        self.sched.drop_all();
        debug!("loop terminated");
    }
}

/// Entry points for creating and driving loops.
#[derive(Debug)]
pub struct EventLoop;

impl EventLoop {
    /// Converts the current thread into a loop, runs `f` as the bootstrap
    /// task, and drives the loop until [`stop`](LoopCtx::stop) is called.
    pub fn run<F, Fut>(f: F) -> Result<()>
    where
        F: FnOnce(LoopCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self::run_with(LoopConfig::default(), f)
    }

    pub fn run_with<F, Fut>(config: LoopConfig, f: F) -> Result<()>
    where
        F: FnOnce(LoopCtx) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let (demux, waker) = PollDemux::new().map_err(|err| crate::error::translate(&err))?;
        let shared = Arc::new(Shared::new(waker));
        let inner = LoopInner::new(config, shared, Box::new(demux));

        let ctx = LoopCtx { inner: Rc::clone(&inner) };
        let future = f(ctx);
        let task = inner.sched.create(Box::pin(future), None, true);
        inner.sched.schedule(task);

        inner.run_internal();
        Ok(())
    }

    /// Starts a loop on a new thread and returns its handle. The loop idles
    /// until work arrives via [`LoopHandle::post`] or a stream attaches.
    pub fn start() -> Result<LoopHandle> {
        Self::start_with(LoopConfig::default())
    }

    pub fn start_with(config: LoopConfig) -> Result<LoopHandle> {
        let (demux, waker) = PollDemux::new().map_err(|err| crate::error::translate(&err))?;
        let shared = Arc::new(Shared::new(waker));
        let handle = LoopHandle { shared: Arc::clone(&shared) };

        std::thread::Builder::new()
            .name("evio-loop".into())
            .spawn(move || {
                let inner = LoopInner::new(config, shared, Box::new(demux));
                inner.run_internal();
            })
            .map_err(|err| crate::error::translate(&err))?;

        Ok(handle)
    }
}

/// A task's view of its own loop. `!Send` by construction; cheap to clone.
///
/// Handed to every task body. All suspension points of the runtime hang off
/// this type (or off [`crate::stream::Stream`], which holds one internally).
#[derive(Clone)]
pub struct LoopCtx {
    pub(crate) inner: Rc<LoopInner>,
}

impl std::fmt::Debug for LoopCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopCtx")
            .field("now", &self.inner.now())
            .field("terminated", &self.inner.shared.is_terminated())
            .finish()
    }
}

impl LoopCtx {
    /// Cross-thread handle to this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.inner.shared) }
    }

    /// The loop's cached wall clock (refreshed at every iteration step).
    #[must_use]
    pub fn now(&self) -> Millis {
        self.inner.now()
    }

    /// The task currently running, usable as a [`LoopHandle::wakeup`]
    /// target. `None` outside task dispatch.
    #[must_use]
    pub fn current_task(&self) -> Option<TaskRef> {
        self.inner.sched.current()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.shared.is_terminated()
    }

    /// Requests this loop to stop; the current task keeps running until its
    /// next suspension point, after which the loop enters cleanup.
    pub fn stop(&self) -> Result<()> {
        self.inner.shared.request_stop()
    }

    /// Spawns a detached task in this loop (the in-loop `post`): it runs as
    /// an independent child of the loop and is freed by the scheduler when
    /// it completes.
    pub fn spawn<F, Fut>(&self, f: F) -> Result<TaskRef>
    where
        F: FnOnce(LoopCtx) -> Fut,
        Fut: Future<Output = ()> + 'static,
    {
        if self.inner.shared.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        let future: LocalFuture = Box::pin(f(self.clone()));
        let task = self.inner.sched.create(future, None, true);
        self.inner.sched.schedule(task);
        Ok(task)
    }

    /// Runs `f` as a child task and suspends until it completes, returning
    /// its output (the classic `exec`, which also subsumes `call`: a state
    /// machine needs no fresh stack to run a callback on).
    pub async fn exec<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(LoopCtx) -> Fut,
        Fut: Future<Output = T> + 'static,
        T: 'static,
    {
        if self.inner.shared.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        let parent = self.inner.sched.current().ok_or(ErrorCode::InvalidArgument)?;
        let slot: Rc<Cell<Option<T>>> = Rc::new(Cell::new(None));
        let child_slot = Rc::clone(&slot);
        let future = f(self.clone());
        let child = self.inner.sched.create(
            Box::pin(async move {
                child_slot.set(Some(future.await));
            }),
            Some(parent),
            false,
        );
        self.inner.sched.schedule(child);
        ExecWait { inner: Rc::clone(&self.inner), child, slot }.await
    }

    /// Suspends the current task for `period` milliseconds.
    ///
    /// Returns [`ErrorCode::Terminate`] when woken by loop termination
    /// instead of the timer elapsing. `period == 0` returns immediately.
    pub async fn sleep(&self, period: Millis) -> Result<()> {
        TimerWait::new(Rc::clone(&self.inner), TimerKind::Sleep, period).await
    }

    /// Suspends the current task until the loop has been idle (no demux
    /// events) for `period` milliseconds.
    pub async fn idle(&self, period: Millis) -> Result<()> {
        TimerWait::new(Rc::clone(&self.inner), TimerKind::Idle, period).await
    }

    /// Reschedules the current task behind everything already ready.
    pub async fn yield_now(&self) {
        YieldNow { inner: Rc::clone(&self.inner), yielded: false }.await;
    }

    /// Parks the current task until somebody wakes it by [`TaskRef`]
    /// (`task_sleep`, with [`LoopHandle::wakeup`] as the counterpart).
    /// The caller is responsible for re-checking whatever condition it was
    /// waiting for.
    pub async fn park(&self) {
        ParkOnce::new().await;
    }

    /// Spawns a task in `target` (possibly another loop) and suspends until
    /// it completes there.
    pub async fn exec_on<F, Fut>(&self, target: &LoopHandle, f: F) -> Result<()>
    where
        F: FnOnce(LoopCtx) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let caller = self.inner.sched.current().ok_or(ErrorCode::InvalidArgument)?;
        let result = Arc::new(ExecResult::default());
        target.shared.post(Message::Exec {
            f: Box::new(move |ctx| Box::pin(f(ctx)) as LocalFuture),
            reply: Arc::clone(&self.inner.shared),
            caller,
            result: Arc::clone(&result),
        })?;
        loop {
            self.park().await;
            if let Some(outcome) = result.take() {
                return outcome;
            }
            if self.inner.shared.is_terminated() {
                return Err(ErrorCode::Terminate);
            }
            // Stray wakeup aimed at this task; the completion signal is
            // still on its way, so park again.
        }
    }

    /// Suspends until `target` terminates. Waiting on an already-terminated
    /// loop returns immediately. `target` must not be this loop.
    pub async fn wait(&self, target: &LoopHandle) -> Result<()> {
        if target.same_loop(&self.inner.shared) {
            return Err(ErrorCode::InvalidArgument);
        }
        let caller = self.inner.sched.current().ok_or(ErrorCode::InvalidArgument)?;
        let registered = target
            .shared
            .post(Message::Wait { reply: Arc::clone(&self.inner.shared), caller })
            .is_ok();
        if !registered {
            return Ok(());
        }
        loop {
            self.park().await;
            if target.is_terminated() {
                return Ok(());
            }
            if self.inner.shared.is_terminated() {
                return Err(ErrorCode::Terminate);
            }
        }
    }

    /// Stops `target` and suspends until its cleanup has finished.
    /// `target` must not be this loop.
    pub async fn stop_and_wait(&self, target: &LoopHandle) -> Result<()> {
        if target.same_loop(&self.inner.shared) {
            return Err(ErrorCode::InvalidArgument);
        }
        let caller = self.inner.sched.current().ok_or(ErrorCode::InvalidArgument)?;
        let registered = target
            .shared
            .post(Message::Wait { reply: Arc::clone(&self.inner.shared), caller })
            .is_ok();
        target.stop()?;
        if !registered {
            return Ok(());
        }
        loop {
            self.park().await;
            if target.is_terminated() {
                return Ok(());
            }
            if self.inner.shared.is_terminated() {
                return Err(ErrorCode::Terminate);
            }
        }
    }
}

/// Waits on one of the loop's timer services.
struct TimerWait {
    inner: Rc<LoopInner>,
    kind: TimerKind,
    value: Millis,
    entry: Option<Rc<TimerEntry>>,
}

impl TimerWait {
    fn new(inner: Rc<LoopInner>, kind: TimerKind, value: Millis) -> Self {
        Self { inner, kind, value, entry: None }
    }

    fn service(&self) -> &TimerService {
        match self.kind {
            TimerKind::Sleep => &self.inner.sleeps,
            TimerKind::Idle => &self.inner.idles,
            TimerKind::Timeout => &self.inner.timeouts,
        }
    }
}

impl Future for TimerWait {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        let this = self.get_mut();
        if this.value == 0 {
            return Poll::Ready(Ok(()));
        }
        match &this.entry {
            None => {
                if this.inner.shared.is_terminated() {
                    return Poll::Ready(Err(ErrorCode::Terminate));
                }
                let Some(current) = this.inner.sched.current() else {
                    return Poll::Ready(Err(ErrorCode::InvalidArgument));
                };
                let entry = TimerEntry::new(Some(current));
                this.service().set(&entry, this.value, this.inner.now());
                this.entry = Some(entry);
                Poll::Pending
            }
            Some(entry) => {
                if entry.elapsed() {
                    Poll::Ready(Ok(()))
                } else if !entry.is_registered() {
                    // Woken without elapsing: the service was terminated.
                    Poll::Ready(Err(ErrorCode::Terminate))
                } else {
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for TimerWait {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take()
            && entry.is_registered()
        {
            self.service().set(&entry, 0, self.inner.now());
        }
    }
}

/// Completion side of [`LoopCtx::exec`].
struct ExecWait<T> {
    inner: Rc<LoopInner>,
    child: TaskRef,
    slot: Rc<Cell<Option<T>>>,
}

impl<T> Future for ExecWait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<T>> {
        if let Some(value) = self.slot.take() {
            return Poll::Ready(Ok(value));
        }
        if !self.inner.sched.is_live(self.child) {
            // Completed without a value only when the child was torn down.
            return Poll::Ready(Err(ErrorCode::Terminate));
        }
        Poll::Pending
    }
}

struct YieldNow {
    inner: Rc<LoopInner>,
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.yielded {
            return Poll::Ready(());
        }
        this.yielded = true;
        if let Some(current) = this.inner.sched.current() {
            this.inner.sched.schedule(current);
        }
        Poll::Pending
    }
}
