// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words FIONBIO unread pushback

//! Unified stream I/O over sockets, files, pipes, ttys, and memory.
//!
//! A [`Stream`] is attached to exactly one loop and used only from tasks of
//! that loop. Reads and writes are straight-line calls that suspend the
//! calling task until the kernel reports progress; failure is reported as a
//! short count plus status bits rather than a separate error channel, so
//! parser-style callers can keep consuming until a zero return and then ask
//! [`Stream::status`] why.
//!
//! Data calls run through the stream's [filter chain](filter): application
//! filters first, the kind-specific transport operations as the tail.
//! Each completed operation feeds the pair of bandwidth counters for its
//! direction. [`Stream::unread`] holds at most one pushback buffer that the
//! next read drains before touching the chain.
//!
//! # Status bits
//!
//! | bit | set when | blocks |
//! |---|---|---|
//! | `eof` | transport reported end of stream | reads |
//! | `peer_closed` | remote shut down / reset | reads + writes |
//! | `closed` | [`Stream::close`] ran | reads + writes |
//! | `terminated` | the owning loop stopped | reads + writes |
//! | `read_timeout` | the per-read timeout fired | reads |
//! | `write_timeout` | the per-write timeout fired | writes |
//! | `error` | any other transport failure | reads + writes |

pub mod event;
pub mod file;
pub(crate) mod filter;
pub(crate) mod memory;
pub mod transfer;

use crate::error::{ErrorCode, Millis};
use crate::event_loop::{IoDirection, LoopCtx, LoopInner, WaitIo, WaitOutcome};
use crate::event_loop::io_wait::IoWaiter;
use mio::Token;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::rc::Rc;
use strum_macros::Display;
use tracing::trace;

pub use filter::{Next, StreamFilter};

#[cfg(unix)]
use std::os::fd::{AsRawFd, OwnedFd};

/// What a stream's descriptor is.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Memory,
    File,
    Tcp,
    Udp,
    Tty,
    Pipe,
}

/// Snapshot of a stream's failure bits. Once any bit is set the stream is
/// done for that direction; subsequent operations short-circuit to 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStatus {
    pub eof: bool,
    pub closed: bool,
    pub peer_closed: bool,
    /// The owning loop was stopped while (or before) the operation ran.
    pub terminated: bool,
    pub read_timeout: bool,
    pub write_timeout: bool,
    pub error: Option<ErrorCode>,
}

#[derive(Default)]
struct StatusCells {
    eof: Cell<bool>,
    closed: Cell<bool>,
    peer_closed: Cell<bool>,
    terminated: Cell<bool>,
    read_timeout: Cell<bool>,
    write_timeout: Cell<bool>,
    error: Cell<Option<ErrorCode>>,
}

impl StatusCells {
    fn snapshot(&self) -> StreamStatus {
        StreamStatus {
            eof: self.eof.get(),
            closed: self.closed.get(),
            peer_closed: self.peer_closed.get(),
            terminated: self.terminated.get(),
            read_timeout: self.read_timeout.get(),
            write_timeout: self.write_timeout.get(),
            error: self.error.get(),
        }
    }

    fn read_blocked(&self) -> bool {
        self.read_timeout.get()
            || self.eof.get()
            || self.error.get().is_some()
            || self.closed.get()
            || self.peer_closed.get()
            || self.terminated.get()
    }

    fn write_blocked(&self) -> bool {
        self.write_timeout.get()
            || self.error.get().is_some()
            || self.closed.get()
            || self.peer_closed.get()
            || self.terminated.get()
    }
}

/// Transferred bytes and elapsed milliseconds, accumulated per direction
/// across the stream's lifetime. Both counters are non-decreasing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bandwidth {
    pub bytes: u64,
    pub period: Millis,
}

#[derive(Default)]
struct BandwidthCells {
    bytes: Cell<u64>,
    period: Cell<Millis>,
}

impl BandwidthCells {
    fn account(&self, bytes: u64, period: Millis) {
        self.bytes.set(self.bytes.get() + bytes);
        self.period.set(self.period.get() + period);
    }

    fn snapshot(&self) -> Bandwidth {
        Bandwidth { bytes: self.bytes.get(), period: self.period.get() }
    }
}

struct Pushback {
    buffer: Vec<u8>,
    offset: usize,
}

/// Kind-specific transport state.
pub(crate) enum StreamIo {
    Memory(memory::MemoryIo),
    File(file::FileIo),
    Tcp(mio::net::TcpStream),
    Udp(mio::net::UdpSocket),
    #[cfg(unix)]
    Fd(OwnedFd),
}

pub(crate) struct StreamInner {
    kind: StreamKind,
    pub(crate) io: RefCell<Option<StreamIo>>,
    pub(crate) loop_: Rc<LoopInner>,
    token: Cell<Option<Token>>,
    pub(crate) waiter: Rc<IoWaiter>,
    status: StatusCells,
    read_timeout: Cell<Millis>,
    write_timeout: Cell<Millis>,
    read_bw: BandwidthCells,
    write_bw: BandwidthCells,
    unread: RefCell<Option<Pushback>>,
    pub(crate) filters: RefCell<Vec<Rc<dyn StreamFilter>>>,
}

/// A loop-attached byte stream. Cloning shares the same underlying stream.
#[derive(Clone)]
pub struct Stream {
    pub(crate) inner: Rc<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("kind", &self.inner.kind)
            .field("status", &self.inner.status.snapshot())
            .finish()
    }
}

impl Stream {
    pub(crate) fn from_parts(
        ctx: &LoopCtx,
        kind: StreamKind,
        io: StreamIo,
        token: Option<Token>,
        waiter: Rc<IoWaiter>,
    ) -> Self {
        Self {
            inner: Rc::new(StreamInner {
                kind,
                io: RefCell::new(Some(io)),
                loop_: Rc::clone(&ctx.inner),
                token: Cell::new(token),
                waiter,
                status: StatusCells::default(),
                read_timeout: Cell::new(0),
                write_timeout: Cell::new(0),
                read_bw: BandwidthCells::default(),
                write_bw: BandwidthCells::default(),
                unread: RefCell::new(None),
                filters: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A loop-local stream over an in-memory buffer: reads consume from the
    /// front, writes append. Useful as a source/sink for
    /// [`transfer`](transfer::transfer) and for exercising filters.
    #[must_use]
    pub fn memory(ctx: &LoopCtx, initial: Vec<u8>) -> Self {
        Self::from_parts(
            ctx,
            StreamKind::Memory,
            StreamIo::Memory(memory::MemoryIo::new(initial)),
            None,
            Rc::new(IoWaiter::default()),
        )
    }

    /// Attaches an arbitrary descriptor (tty or pipe end) to `ctx`'s loop.
    /// The descriptor is switched to non-blocking mode and registered with
    /// the demux.
    #[cfg(unix)]
    pub fn attach_fd(ctx: &LoopCtx, fd: OwnedFd, kind: StreamKind) -> crate::Result<Self> {
        if !matches!(kind, StreamKind::Tty | StreamKind::Pipe) {
            return Err(ErrorCode::InvalidArgument);
        }
        if ctx.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        rustix::io::ioctl_fionbio(&fd, true)?;
        let raw = fd.as_raw_fd();
        let (token, waiter) =
            ctx.inner.register_io(&mut mio::unix::SourceFd(&raw))?;
        Ok(Self::from_parts(ctx, kind, StreamIo::Fd(fd), Some(token), waiter))
    }

    /// Attaches a connected UDP socket to `ctx`'s loop; reads and writes
    /// map to single-datagram receives and sends.
    pub fn attach_udp(ctx: &LoopCtx, socket: std::net::UdpSocket) -> crate::Result<Self> {
        if ctx.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        socket.set_nonblocking(true)?;
        let mut socket = mio::net::UdpSocket::from_std(socket);
        let (token, waiter) = ctx.inner.register_io(&mut socket)?;
        Ok(Self::from_parts(ctx, StreamKind::Udp, StreamIo::Udp(socket), Some(token), waiter))
    }

    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    #[must_use]
    pub fn status(&self) -> StreamStatus {
        self.inner.status.snapshot()
    }

    #[must_use]
    pub fn read_bandwidth(&self) -> Bandwidth {
        self.inner.read_bw.snapshot()
    }

    #[must_use]
    pub fn write_bandwidth(&self) -> Bandwidth {
        self.inner.write_bw.snapshot()
    }

    /// Per-operation read timeout in milliseconds; 0 disables.
    pub fn set_read_timeout(&self, timeout: Millis) {
        self.inner.read_timeout.set(timeout);
    }

    /// Per-operation write timeout in milliseconds; 0 disables.
    pub fn set_write_timeout(&self, timeout: Millis) {
        self.inner.write_timeout.set(timeout);
    }

    /// Remote address, for connected TCP streams.
    #[must_use]
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        match self.inner.io.borrow().as_ref() {
            Some(StreamIo::Tcp(stream)) => stream.peer_addr().ok(),
            _ => None,
        }
    }

    /// Contents written to a memory stream so far (its whole backing
    /// buffer). `None` for other kinds.
    #[must_use]
    pub fn memory_data(&self) -> Option<Vec<u8>> {
        match self.inner.io.borrow().as_ref() {
            Some(StreamIo::Memory(io)) => Some(io.data().to_vec()),
            _ => None,
        }
    }

    /// Prepends `filter` at the head of the chain.
    pub fn attach_filter(&self, filter: Rc<dyn StreamFilter>) {
        self.inner.filters.borrow_mut().insert(0, filter);
    }

    /// Removes `filter` (by identity) from the chain.
    pub fn detach_filter(&self, filter: &Rc<dyn StreamFilter>) -> bool {
        let mut filters = self.inner.filters.borrow_mut();
        match filters.iter().position(|f| Rc::ptr_eq(f, filter)) {
            Some(at) => {
                filters.remove(at);
                true
            }
            None => false,
        }
    }

    /// Reads up to `buffer.len()` bytes.
    ///
    /// Returns the byte count; 0 means either a zero-length request or a
    /// terminal condition recorded in [`Stream::status`]. A short read is
    /// not an error. Pending pushback is drained before the filter chain
    /// runs.
    pub async fn read(&self, buffer: &mut [u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }
        if self.inner.status.read_blocked() {
            return 0;
        }
        if self.inner.loop_.shared.is_terminated() {
            self.inner.status.terminated.set(true);
            return 0;
        }
        if let Some(count) = self.inner.take_unread(buffer) {
            return count;
        }
        Next { stream: self.inner.as_ref(), index: 0 }.read(buffer).await
    }

    /// Writes all of `buffer`, suspending as needed.
    ///
    /// Returns the bytes actually sent; anything less than `buffer.len()`
    /// is a failure and [`Stream::status`] carries the reason.
    pub async fn write(&self, buffer: &[u8]) -> usize {
        if buffer.is_empty() {
            return 0;
        }
        if self.inner.status.write_blocked() {
            return 0;
        }
        if self.inner.loop_.shared.is_terminated() {
            self.inner.status.terminated.set(true);
            return 0;
        }
        Next { stream: self.inner.as_ref(), index: 0 }.write(buffer).await
    }

    /// Puts bytes back for the next read. At most one pushback is held:
    /// a second call replaces the first.
    pub fn unread(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut slot = self.inner.unread.borrow_mut();
        if let Some(previous) = slot.take() {
            self.inner.loop_.pool.release(previous.buffer);
        }
        let mut buffer = self.inner.loop_.pool.acquire(data.len());
        buffer.copy_from_slice(data);
        *slot = Some(Pushback { buffer, offset: 0 });
        data.len()
    }

    /// Deregisters from the demux, closes the descriptor, and notifies the
    /// chain. The loop reference is released when the last [`Stream`]
    /// clone drops.
    pub fn close(&self) -> crate::Result<()> {
        self.inner.close_internal();
        Ok(())
    }
}

impl StreamInner {
    pub(crate) fn read_timeout_value(&self) -> Millis {
        self.read_timeout.get()
    }

    pub(crate) fn write_timeout_value(&self) -> Millis {
        self.write_timeout.get()
    }

    pub(crate) fn status_set_eof(&self) {
        self.status.eof.set(true);
    }

    pub(crate) fn status_set_error(&self, code: ErrorCode) {
        self.status.error.set(Some(code));
        self.notify_error(code);
    }

    pub(crate) fn status_set_read_timeout(&self) {
        self.status.read_timeout.set(true);
        self.notify_read_timeout();
    }

    pub(crate) fn status_set_write_timeout(&self) {
        self.status.write_timeout.set(true);
        self.notify_write_timeout();
    }

    pub(crate) fn status_set_terminated(&self) {
        self.status.terminated.set(true);
        self.notify_terminate();
    }

    /// Serves a read from the pushback buffer, if one is pending.
    fn take_unread(&self, buffer: &mut [u8]) -> Option<usize> {
        let mut slot = self.unread.borrow_mut();
        let pushback = slot.as_mut()?;
        let pending = pushback.buffer.len() - pushback.offset;
        let count = pending.min(buffer.len());
        buffer[..count].copy_from_slice(&pushback.buffer[pushback.offset..pushback.offset + count]);
        pushback.offset += count;
        let exhausted = pushback.offset == pushback.buffer.len();
        if exhausted
            && let Some(spent) = slot.take()
        {
            self.loop_.pool.release(spent.buffer);
        }
        Some(count)
    }

    fn notify_read_timeout(&self) {
        Next { stream: self, index: 0 }.notify_read_timeout();
    }

    fn notify_write_timeout(&self) {
        Next { stream: self, index: 0 }.notify_write_timeout();
    }

    fn notify_error(&self, code: ErrorCode) {
        Next { stream: self, index: 0 }.notify_error(code);
    }

    fn notify_peer_closed(&self) {
        Next { stream: self, index: 0 }.notify_peer_closed();
    }

    fn notify_closed(&self) {
        Next { stream: self, index: 0 }.notify_closed();
    }

    fn notify_terminate(&self) {
        Next { stream: self, index: 0 }.notify_terminate();
    }

    /// Tail of the filter chain, read side: the real transport.
    pub(crate) async fn tail_read(&self, buffer: &mut [u8]) -> usize {
        if buffer.is_empty() || self.status.read_blocked() {
            return 0;
        }
        let started = self.loop_.now();
        let count = match self.kind {
            StreamKind::Memory => self.memory_read(buffer),
            StreamKind::File => file::read(self, buffer).await,
            _ => self.readiness_read(buffer).await,
        };
        self.read_bw.account(count as u64, self.loop_.now().saturating_sub(started));
        count
    }

    /// Tail of the filter chain, write side.
    pub(crate) async fn tail_write(&self, buffer: &[u8]) -> usize {
        if buffer.is_empty() || self.status.write_blocked() {
            return 0;
        }
        let started = self.loop_.now();
        let count = match self.kind {
            StreamKind::Memory => self.memory_write(buffer),
            StreamKind::File => file::write(self, buffer).await,
            _ => self.readiness_write(buffer).await,
        };
        self.write_bw.account(count as u64, self.loop_.now().saturating_sub(started));
        count
    }

    fn memory_read(&self, buffer: &mut [u8]) -> usize {
        let mut io = self.io.borrow_mut();
        let Some(StreamIo::Memory(memory)) = io.as_mut() else { return 0 };
        let count = memory.read(buffer);
        if count == 0 {
            self.status.eof.set(true);
        }
        count
    }

    fn memory_write(&self, buffer: &[u8]) -> usize {
        let mut io = self.io.borrow_mut();
        let Some(StreamIo::Memory(memory)) = io.as_mut() else { return 0 };
        memory.write(buffer)
    }

    fn try_read_io(&self, buffer: &mut [u8]) -> std::io::Result<usize> {
        let mut io = self.io.borrow_mut();
        match io.as_mut() {
            Some(StreamIo::Tcp(stream)) => stream.read(buffer),
            Some(StreamIo::Udp(socket)) => socket.recv(buffer),
            #[cfg(unix)]
            Some(StreamIo::Fd(fd)) => {
                rustix::io::read(fd, buffer).map_err(std::io::Error::from)
            }
            _ => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    fn try_write_io(&self, buffer: &[u8]) -> std::io::Result<usize> {
        let mut io = self.io.borrow_mut();
        match io.as_mut() {
            Some(StreamIo::Tcp(stream)) => stream.write(buffer),
            Some(StreamIo::Udp(socket)) => socket.send(buffer),
            #[cfg(unix)]
            Some(StreamIo::Fd(fd)) => {
                rustix::io::write(fd, buffer).map_err(std::io::Error::from)
            }
            _ => Err(std::io::Error::from(std::io::ErrorKind::NotConnected)),
        }
    }

    /// Readiness-profile read: try the non-blocking syscall, wait for an
    /// edge when it would block, repeat.
    async fn readiness_read(&self, buffer: &mut [u8]) -> usize {
        loop {
            match self.try_read_io(buffer) {
                Ok(0) => {
                    self.status.eof.set(true);
                    if self.waiter.saw_read_closed() {
                        self.status.peer_closed.set(true);
                        self.notify_peer_closed();
                    }
                    return 0;
                }
                Ok(count) => return count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    let outcome = WaitIo::new(
                        Rc::clone(&self.loop_),
                        Rc::clone(&self.waiter),
                        IoDirection::Read,
                        self.read_timeout.get(),
                    )
                    .await;
                    match outcome {
                        WaitOutcome::Ready => {}
                        WaitOutcome::TimedOut => {
                            self.status.read_timeout.set(true);
                            self.notify_read_timeout();
                            return 0;
                        }
                        WaitOutcome::Terminated => {
                            self.status.terminated.set(true);
                            self.notify_terminate();
                            return 0;
                        }
                    }
                }
                Err(err) => {
                    let code = crate::error::translate(&err);
                    trace!(kind = %self.kind, %err, "read failed");
                    self.status.error.set(Some(code));
                    self.notify_error(code);
                    return 0;
                }
            }
        }
    }

    /// Readiness-profile write: repeat until every byte is sent or a
    /// terminal condition interrupts; short result = failure.
    async fn readiness_write(&self, buffer: &[u8]) -> usize {
        let mut offset = 0;
        while offset < buffer.len() {
            match self.try_write_io(&buffer[offset..]) {
                Ok(count) => offset += count,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    let outcome = WaitIo::new(
                        Rc::clone(&self.loop_),
                        Rc::clone(&self.waiter),
                        IoDirection::Write,
                        self.write_timeout.get(),
                    )
                    .await;
                    match outcome {
                        WaitOutcome::Ready => {}
                        WaitOutcome::TimedOut => {
                            self.status.write_timeout.set(true);
                            self.notify_write_timeout();
                            break;
                        }
                        WaitOutcome::Terminated => {
                            self.status.terminated.set(true);
                            self.notify_terminate();
                            break;
                        }
                    }
                }
                Err(err) => {
                    let code = crate::error::translate(&err);
                    trace!(kind = %self.kind, %err, "write failed");
                    if self.waiter.saw_write_closed()
                        || err.kind() == std::io::ErrorKind::BrokenPipe
                    {
                        self.status.peer_closed.set(true);
                        self.notify_peer_closed();
                    } else {
                        self.status.error.set(Some(code));
                        self.notify_error(code);
                    }
                    break;
                }
            }
        }
        offset
    }

    fn close_internal(&self) {
        if let Some(io) = self.io.borrow_mut().take() {
            match io {
                StreamIo::Tcp(mut stream) => {
                    if let Some(token) = self.token.take() {
                        self.loop_.deregister_io(token, &mut stream);
                    }
                }
                StreamIo::Udp(mut socket) => {
                    if let Some(token) = self.token.take() {
                        self.loop_.deregister_io(token, &mut socket);
                    }
                }
                #[cfg(unix)]
                StreamIo::Fd(fd) => {
                    if let Some(token) = self.token.take() {
                        let raw = fd.as_raw_fd();
                        self.loop_.deregister_io(token, &mut mio::unix::SourceFd(&raw));
                    }
                }
                StreamIo::Memory(_) | StreamIo::File(_) => {}
            }
            // Descriptor closes as `io` drops here.
            self.status.closed.set(true);
        }
        self.notify_closed();
        if let Some(pushback) = self.unread.borrow_mut().take() {
            self.loop_.pool.release(pushback.buffer);
        }
    }
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        // Safety net for streams dropped without close(): deregister so the
        // token slot is recycled. Notifications are skipped (no Rc left).
        if let Some(io) = self.io.borrow_mut().take() {
            match io {
                StreamIo::Tcp(mut stream) => {
                    if let Some(token) = self.token.take() {
                        self.loop_.deregister_io(token, &mut stream);
                    }
                }
                StreamIo::Udp(mut socket) => {
                    if let Some(token) = self.token.take() {
                        self.loop_.deregister_io(token, &mut socket);
                    }
                }
                #[cfg(unix)]
                StreamIo::Fd(fd) => {
                    if let Some(token) = self.token.take() {
                        let raw = fd.as_raw_fd();
                        self.loop_.deregister_io(token, &mut mio::unix::SourceFd(&raw));
                    }
                }
                StreamIo::Memory(_) | StreamIo::File(_) => {}
            }
        }
    }
}
