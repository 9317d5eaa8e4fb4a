// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Bucketed timer services: sleeps, idles, per-operation timeouts.
//!
//! Every loop owns three independent instances of [`TimerService`]. Timers
//! that share a period live in one *bucket* (a FIFO), and buckets sit in an
//! ordered map keyed by period. Insertion costs `O(log B)` in the number of
//! distinct periods; expiry pops from FIFO fronts, so a server with ten
//! thousand connections sharing one 10 s read timeout sweeps a single
//! bucket.
//!
//! Kinds differ only in their elapse test during a sweep:
//!
//! - `Sleep`: `now - issued >= period` (the sweep receives the wall clock).
//! - `Idle` / `Timeout`: `delta >= period` (the sweep receives
//!   `now - last_activity`).
//!
//! A service-wide version counter stamps every insertion; a sweep snapshots
//! the counter on entry and skips newer stamps, so a timer set while a sweep
//! runs can never fire within that same sweep.

use crate::error::Millis;
use crate::sched::TaskRef;
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Sleep,
    Idle,
    Timeout,
}

/// One pending timer. Shared (`Rc`) between the waiting future and the
/// service; all coordination goes through `Cell`s since everything runs on
/// the loop thread.
pub(crate) struct TimerEntry {
    pub(crate) task: Cell<Option<TaskRef>>,
    issued: Cell<Millis>,
    version: Cell<u64>,
    /// `true` iff a sweep fired this timer. A timer woken with `elapsed`
    /// still `false` was terminated, and the waiter must report
    /// [`crate::ErrorCode::Terminate`].
    elapsed: Cell<bool>,
    /// Bucket period while registered; `None` once detached.
    registered: Cell<Option<Millis>>,
}

impl TimerEntry {
    pub(crate) fn new(task: Option<TaskRef>) -> Rc<Self> {
        Rc::new(Self {
            task: Cell::new(task),
            issued: Cell::new(0),
            version: Cell::new(0),
            elapsed: Cell::new(false),
            registered: Cell::new(None),
        })
    }

    pub(crate) fn elapsed(&self) -> bool {
        self.elapsed.get()
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.get().is_some()
    }
}

type Bucket = VecDeque<Rc<TimerEntry>>;
pub(crate) type Fired = SmallVec<[Rc<TimerEntry>; 8]>;

pub(crate) struct TimerService {
    kind: TimerKind,
    buckets: RefCell<BTreeMap<Millis, Bucket>>,
    version: Cell<u64>,
    sweeping: Cell<bool>,
}

impl TimerService {
    pub(crate) fn new(kind: TimerKind) -> Self {
        Self {
            kind,
            buckets: RefCell::new(BTreeMap::new()),
            version: Cell::new(0),
            sweeping: Cell::new(false),
        }
    }

    /// Registers, refreshes, or (with `value == 0`) cancels a timer.
    ///
    /// A refresh to the same period moves the timer to its bucket's tail,
    /// restarting its FIFO rank; a different period migrates it to the
    /// matching bucket, creating or freeing buckets as needed.
    pub(crate) fn set(&self, entry: &Rc<TimerEntry>, value: Millis, now: Millis) {
        let mut buckets = self.buckets.borrow_mut();

        if let Some(current) = entry.registered.get() {
            if let Some(bucket) = buckets.get_mut(&current) {
                if let Some(at) = bucket.iter().position(|e| Rc::ptr_eq(e, entry)) {
                    bucket.remove(at);
                }
                if current == value {
                    // FIFO refresh: back to the tail of the same bucket.
                    self.stamp(entry, value, now);
                    bucket.push_back(Rc::clone(entry));
                    return;
                }
                if bucket.is_empty() && !self.sweeping.get() {
                    buckets.remove(&current);
                }
            }
            entry.registered.set(None);
        }

        if value == 0 {
            return;
        }

        self.stamp(entry, value, now);
        buckets.entry(value).or_default().push_back(Rc::clone(entry));
    }

    fn stamp(&self, entry: &Rc<TimerEntry>, value: Millis, now: Millis) {
        if matches!(self.kind, TimerKind::Sleep | TimerKind::Timeout) {
            entry.issued.set(now);
        }
        self.version.set(self.version.get() + 1);
        entry.version.set(self.version.get());
        entry.elapsed.set(false);
        entry.registered.set(Some(value));
    }

    /// One sweep. `value` is the wall clock for `Sleep` services and the
    /// inactivity delta for `Idle`/`Timeout` services.
    ///
    /// Returns the fired timers (already marked elapsed and detached) for
    /// the loop to wake. Within a bucket the first still-pending timer ends
    /// that bucket's walk: FIFO order plus a shared period mean nothing
    /// behind it can have elapsed.
    pub(crate) fn process(&self, value: Millis) -> Fired {
        let snapshot = self.version.get();
        self.sweeping.set(true);

        let mut fired = Fired::new();
        let mut buckets = self.buckets.borrow_mut();
        let periods: SmallVec<[Millis; 8]> = buckets.keys().copied().collect();

        for period in periods {
            let Some(bucket) = buckets.get_mut(&period) else { continue };
            let mut at = 0;
            while at < bucket.len() {
                let entry = &bucket[at];
                if entry.version.get() > snapshot {
                    // Inserted during this sweep; eligible next sweep.
                    at += 1;
                    continue;
                }
                let elapsed = match self.kind {
                    TimerKind::Sleep => value.wrapping_sub(entry.issued.get()) >= period,
                    TimerKind::Idle | TimerKind::Timeout => value >= period,
                };
                if !elapsed {
                    break;
                }
                let entry = bucket.remove(at).unwrap_or_else(|| unreachable!());
                entry.elapsed.set(true);
                entry.registered.set(None);
                fired.push(entry);
            }
            if bucket.is_empty() {
                buckets.remove(&period);
            }
        }

        self.sweeping.set(false);
        if !fired.is_empty() {
            trace!(kind = ?self.kind, count = fired.len(), "timers fired");
        }
        fired
    }

    /// Milliseconds until the earliest registered timer would fire, measured
    /// from the same reference `process` will receive; `None` when no timer
    /// is pending.
    pub(crate) fn nearest_event(&self, reference: Millis) -> Option<Millis> {
        let buckets = self.buckets.borrow();
        buckets
            .iter()
            .filter_map(|(period, bucket)| {
                let front = bucket.front()?;
                Some(match self.kind {
                    TimerKind::Sleep => {
                        (front.issued.get() + period).saturating_sub(reference)
                    }
                    TimerKind::Idle | TimerKind::Timeout => period.saturating_sub(reference),
                })
            })
            .min()
    }

    /// Detaches and returns every pending timer *without* marking it
    /// elapsed: the waiters observe `!elapsed` and report termination.
    pub(crate) fn terminate(&self) -> Fired {
        let mut fired = Fired::new();
        let mut buckets = self.buckets.borrow_mut();
        for (_, bucket) in std::mem::take(&mut *buckets) {
            for entry in bucket {
                entry.registered.set(None);
                fired.push(entry);
            }
        }
        fired
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.borrow().is_empty()
    }
}
