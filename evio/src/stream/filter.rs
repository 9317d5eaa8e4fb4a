// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The filter chain: composable transforms on a stream's pipeline.
//!
//! A filter sees eight callbacks: the two data paths (`on_read`,
//! `on_write`) and six notifications. Application filters sit at the head
//! of the chain; the stream's own transport operations are the implicit
//! tail. Every callback defaults to delegating to the next element, so a
//! concrete filter overrides only what it transforms - a TLS filter, for
//! example, overrides the data paths to run its record layer and calls
//! through to the transport for handshake and flush traffic.
//!
//! Data calls enter at the head and flow toward the tail, which performs
//! the real I/O; notifications fan the same way. [`Next`] is the cursor a
//! filter uses to continue the walk:
//!
//! ```text
//! stream.read(buf)
//!    │
//!    ▼
//! [ tls ] ──► [ metrics ] ──► ( transport tail: the real syscall )
//!  head           │
//!                 └── each element calls next.read(..) / next.write(..)
//! ```
//!
//! # Writing a filter
//!
//! Override only the callbacks you transform; everything else forwards:
//!
//! ```no_run
//! use async_trait::async_trait;
//! use evio::{Next, StreamFilter};
//! use std::cell::Cell;
//!
//! /// Counts bytes that actually crossed this point of the chain.
//! struct Meter {
//!     seen: Cell<u64>,
//! }
//!
//! #[async_trait(?Send)]
//! impl StreamFilter for Meter {
//!     async fn on_read(&self, next: Next<'_>, buffer: &mut [u8]) -> usize {
//!         let count = next.read(buffer).await;
//!         self.seen.set(self.seen.get() + count as u64);
//!         count
//!     }
//! }
//! ```
//!
//! A record-layer filter (TLS and friends) follows the same shape: it
//! keeps its own staging buffers, calls `next.read`/`next.write` for
//! handshake and ciphertext traffic, and hands plaintext up through its
//! own `on_read` return.

use crate::error::ErrorCode;
use async_trait::async_trait;
use std::rc::Rc;

use super::StreamInner;

/// One element of a stream's filter chain. All methods default to
/// pass-through.
#[async_trait(?Send)]
pub trait StreamFilter {
    /// Data path: fill `buffer`, returning the byte count (0 = failure or
    /// end of stream; the stream status carries the reason).
    async fn on_read(&self, next: Next<'_>, buffer: &mut [u8]) -> usize {
        next.read(buffer).await
    }

    /// Data path: send `buffer`, returning the bytes consumed. Anything
    /// short of `buffer.len()` is a failure.
    async fn on_write(&self, next: Next<'_>, buffer: &[u8]) -> usize {
        next.write(buffer).await
    }

    fn on_read_timeout(&self, next: Next<'_>) {
        next.notify_read_timeout();
    }

    fn on_write_timeout(&self, next: Next<'_>) {
        next.notify_write_timeout();
    }

    fn on_error(&self, next: Next<'_>, code: ErrorCode) {
        next.notify_error(code);
    }

    fn on_peer_closed(&self, next: Next<'_>) {
        next.notify_peer_closed();
    }

    fn on_closed(&self, next: Next<'_>) {
        next.notify_closed();
    }

    fn on_terminate(&self, next: Next<'_>) {
        next.notify_terminate();
    }
}

/// Cursor over the remainder of a chain. Position `index` addresses the
/// next filter to run; past the last filter, calls land on the stream's
/// own transport operations.
pub struct Next<'a> {
    pub(crate) stream: &'a StreamInner,
    pub(crate) index: usize,
}

impl Next<'_> {
    fn filter_at(&self, index: usize) -> Option<Rc<dyn StreamFilter>> {
        self.stream.filters.borrow().get(index).cloned()
    }

    fn advance(&self) -> Next<'_> {
        Next { stream: self.stream, index: self.index + 1 }
    }

    pub async fn read(&self, buffer: &mut [u8]) -> usize {
        match self.filter_at(self.index) {
            Some(filter) => filter.on_read(self.advance(), buffer).await,
            None => self.stream.tail_read(buffer).await,
        }
    }

    pub async fn write(&self, buffer: &[u8]) -> usize {
        match self.filter_at(self.index) {
            Some(filter) => filter.on_write(self.advance(), buffer).await,
            None => self.stream.tail_write(buffer).await,
        }
    }

    pub fn notify_read_timeout(&self) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_read_timeout(self.advance());
        }
    }

    pub fn notify_write_timeout(&self) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_write_timeout(self.advance());
        }
    }

    pub fn notify_error(&self, code: ErrorCode) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_error(self.advance(), code);
        }
    }

    pub fn notify_peer_closed(&self) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_peer_closed(self.advance());
        }
    }

    pub fn notify_closed(&self) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_closed(self.advance());
        }
    }

    pub fn notify_terminate(&self) {
        if let Some(filter) = self.filter_at(self.index) {
            filter.on_terminate(self.advance());
        }
    }
}
