// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words backlog nodelay

//! TCP listening, accepting, and connecting.
//!
//! The listener binds and listens on a non-blocking socket with an explicit
//! backlog, registers with the loop's demux, and suspends the accepting
//! task until connections are ready. Conditional accepts run through an
//! `on_accept` callback: rejecting closes the socket and the accept loop
//! keeps going without waking anyone.
//!
//! Accepted connections come back as [`TcpConnection`] - a `Send` value
//! that can hop to another loop (the multi-loop server pattern: accept in
//! one loop, round-robin the connections to workers) before being attached
//! as a [`Stream`].

pub(crate) mod socket_opts;

use crate::error::{ErrorCode, Millis, Result};
use crate::event_loop::{IoDirection, LoopCtx, LoopInner, WaitIo, WaitOutcome};
use crate::event_loop::io_wait::IoWaiter;
use crate::stream::{Stream, StreamIo, StreamKind};
use mio::{Interest, Token};
use std::cell::{Cell, RefCell};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::str::FromStr;
use tracing::{debug, trace};

pub use socket_opts::set_keepalive;

/// Address family selection follows the presence of `:` in the literal.
fn parse_endpoint(ip: &str, port: u16) -> Result<SocketAddr> {
    let addr = if ip.contains(':') {
        IpAddr::V6(Ipv6Addr::from_str(ip).map_err(|_| ErrorCode::InvalidArgument)?)
    } else {
        IpAddr::V4(Ipv4Addr::from_str(ip).map_err(|_| ErrorCode::InvalidArgument)?)
    };
    Ok(SocketAddr::new(addr, port))
}

/// An accepted-but-unattached TCP connection. `Send`, so a listener loop
/// can hand it to a worker loop; it becomes a [`Stream`] on attach.
#[derive(Debug)]
pub struct TcpConnection {
    stream: mio::net::TcpStream,
    peer: SocketAddr,
}

impl TcpConnection {
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Registers the connection with `ctx`'s loop and wraps it as a TCP
    /// stream. Fails with [`ErrorCode::Terminate`] on a stopped loop.
    pub fn attach(self, ctx: &LoopCtx) -> Result<Stream> {
        if ctx.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        let mut stream = self.stream;
        let (token, waiter) = ctx.inner.register_io(&mut stream)?;
        Ok(Stream::from_parts(ctx, StreamKind::Tcp, StreamIo::Tcp(stream), Some(token), waiter))
    }
}

type AcceptCallback = Box<dyn FnMut(&TcpConnection) -> bool>;
type ErrorCallback = Box<dyn FnMut(ErrorCode)>;
type PlainCallback = Box<dyn FnMut()>;

#[derive(Default)]
struct ListenerCallbacks {
    on_accept: Option<AcceptCallback>,
    on_error: Option<ErrorCallback>,
    on_closed: Option<PlainCallback>,
    on_terminate: Option<PlainCallback>,
}

struct ListenerStatus {
    closed: Cell<bool>,
    terminated: Cell<bool>,
    error: Cell<Option<ErrorCode>>,
}

struct ListenerInner {
    loop_: Rc<LoopInner>,
    listener: RefCell<Option<mio::net::TcpListener>>,
    token: Cell<Option<Token>>,
    waiter: Rc<IoWaiter>,
    local_addr: SocketAddr,
    status: ListenerStatus,
    callbacks: RefCell<ListenerCallbacks>,
}

/// A bound-and-listening TCP endpoint attached to one loop.
#[derive(Clone)]
pub struct TcpListener {
    inner: Rc<ListenerInner>,
}

impl std::fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListener").field("local_addr", &self.inner.local_addr).finish()
    }
}

impl TcpListener {
    /// Creates the socket (IPv4 or IPv6 by the shape of `ip`), applies the
    /// loop's socket policy, binds, listens with `backlog`, and registers
    /// with the demux.
    pub fn listen(ctx: &LoopCtx, ip: &str, port: u16, backlog: u32) -> Result<TcpListener> {
        if ctx.is_terminated() {
            return Err(ErrorCode::Terminate);
        }
        let addr = parse_endpoint(ip, port)?;

        let family = if addr.is_ipv6() {
            rustix::net::AddressFamily::INET6
        } else {
            rustix::net::AddressFamily::INET
        };
        let fd = rustix::net::socket_with(
            family,
            rustix::net::SocketType::STREAM,
            rustix::net::SocketFlags::NONBLOCK | rustix::net::SocketFlags::CLOEXEC,
            None,
        )?;
        socket_opts::configure_tcp(&fd, &ctx.inner.config)?;
        rustix::net::bind(&fd, &addr)?;
        rustix::net::listen(&fd, backlog.min(i32::MAX as u32) as i32)?;

        let std_listener = std::net::TcpListener::from(fd);
        let mut listener = mio::net::TcpListener::from_std(std_listener);
        let local_addr = listener.local_addr()?;
        let (token, waiter) = ctx.inner.register_io(&mut listener)?;

        debug!(%local_addr, backlog, "listening");
        Ok(TcpListener {
            inner: Rc::new(ListenerInner {
                loop_: Rc::clone(&ctx.inner),
                listener: RefCell::new(Some(listener)),
                token: Cell::new(Some(token)),
                waiter,
                local_addr,
                status: ListenerStatus {
                    closed: Cell::new(false),
                    terminated: Cell::new(false),
                    error: Cell::new(None),
                },
                callbacks: RefCell::new(ListenerCallbacks::default()),
            }),
        })
    }

    /// The bound address (resolves port 0 to the kernel-chosen port).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Conditional-accept hook: return `false` to reject a connection; the
    /// listener closes it and keeps accepting without waking the caller.
    pub fn set_on_accept(&self, callback: impl FnMut(&TcpConnection) -> bool + 'static) {
        self.inner.callbacks.borrow_mut().on_accept = Some(Box::new(callback));
    }

    pub fn set_on_error(&self, callback: impl FnMut(ErrorCode) + 'static) {
        self.inner.callbacks.borrow_mut().on_error = Some(Box::new(callback));
    }

    pub fn set_on_closed(&self, callback: impl FnMut() + 'static) {
        self.inner.callbacks.borrow_mut().on_closed = Some(Box::new(callback));
    }

    pub fn set_on_terminate(&self, callback: impl FnMut() + 'static) {
        self.inner.callbacks.borrow_mut().on_terminate = Some(Box::new(callback));
    }

    /// Suspends until a connection is accepted. Rejected connections (see
    /// [`TcpListener::set_on_accept`]) are closed and the loop reissues the
    /// accept without returning.
    pub async fn accept(&self) -> Result<TcpConnection> {
        let inner = &self.inner;
        if inner.loop_.shared.is_terminated() {
            inner.status.terminated.set(true);
            return Err(ErrorCode::Terminate);
        }
        if inner.status.closed.get() || inner.status.terminated.get() {
            return Err(inner.status.error.get().unwrap_or(ErrorCode::Terminate));
        }
        if let Some(code) = inner.status.error.get() {
            return Err(code);
        }

        loop {
            let accepted = {
                let guard = inner.listener.borrow();
                let Some(listener) = guard.as_ref() else {
                    return Err(ErrorCode::BadFile);
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer)) => {
                    let connection = TcpConnection { stream, peer };
                    if !self.run_accept_callback(&connection) {
                        trace!(%peer, "connection rejected by on_accept");
                        drop(connection);
                        continue;
                    }
                    socket_opts::configure_tcp(&connection.stream, &inner.loop_.config)?;
                    trace!(%peer, "connection accepted");
                    return Ok(connection);
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    let outcome = WaitIo::new(
                        Rc::clone(&inner.loop_),
                        Rc::clone(&inner.waiter),
                        IoDirection::Read,
                        0,
                    )
                    .await;
                    match outcome {
                        WaitOutcome::Ready => {}
                        WaitOutcome::Terminated => {
                            inner.status.terminated.set(true);
                            if let Some(mut cb) = inner.callbacks.borrow_mut().on_terminate.take()
                            {
                                cb();
                                inner.callbacks.borrow_mut().on_terminate = Some(cb);
                            }
                            return Err(ErrorCode::Terminate);
                        }
                        WaitOutcome::TimedOut => unreachable!("accept waits without timeout"),
                    }
                }
                Err(err) => {
                    let code = crate::error::translate(&err);
                    inner.status.error.set(Some(code));
                    if let Some(mut cb) = inner.callbacks.borrow_mut().on_error.take() {
                        cb(code);
                        inner.callbacks.borrow_mut().on_error = Some(cb);
                    }
                    return Err(code);
                }
            }
        }
    }

    fn run_accept_callback(&self, connection: &TcpConnection) -> bool {
        // Take-call-restore so the callback can touch the listener.
        let callback = self.inner.callbacks.borrow_mut().on_accept.take();
        match callback {
            Some(mut cb) => {
                let verdict = cb(connection);
                self.inner.callbacks.borrow_mut().on_accept = Some(cb);
                verdict
            }
            None => true,
        }
    }

    /// Stops listening, closes the socket, and releases the loop
    /// reference.
    pub fn close(&self) -> Result<()> {
        if let Some(mut listener) = self.inner.listener.borrow_mut().take() {
            if let Some(token) = self.inner.token.take() {
                self.inner.loop_.deregister_io(token, &mut listener);
            }
        }
        self.inner.status.closed.set(true);
        if let Some(mut cb) = self.inner.callbacks.borrow_mut().on_closed.take() {
            cb();
            self.inner.callbacks.borrow_mut().on_closed = Some(cb);
        }
        Ok(())
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(mut listener) = self.listener.borrow_mut().take()
            && let Some(token) = self.token.take()
        {
            self.loop_.deregister_io(token, &mut listener);
        }
    }
}

/// Connects to `ip:port`, suspending until the handshake completes, fails,
/// or `timeout` milliseconds pass (0 = no timeout). Returns the connected,
/// attached stream.
pub async fn connect(ctx: &LoopCtx, ip: &str, port: u16, timeout: Millis) -> Result<Stream> {
    if ctx.is_terminated() {
        return Err(ErrorCode::Terminate);
    }
    let addr = parse_endpoint(ip, port)?;

    let mut stream = mio::net::TcpStream::connect(addr)
        .map_err(|err| crate::error::translate(&err))?;
    socket_opts::configure_tcp(&stream, &ctx.inner.config)?;

    let (token, waiter) = ctx
        .inner
        .register_io_with(&mut stream, Interest::READABLE | Interest::WRITABLE)?;

    let outcome =
        WaitIo::new(Rc::clone(&ctx.inner), Rc::clone(&waiter), IoDirection::Write, timeout).await;

    let fail = |mut stream: mio::net::TcpStream, code: ErrorCode| {
        ctx.inner.deregister_io(token, &mut stream);
        Err(code)
    };

    match outcome {
        WaitOutcome::TimedOut => fail(stream, ErrorCode::TimedOut),
        WaitOutcome::Terminated => fail(stream, ErrorCode::Terminate),
        WaitOutcome::Ready => {
            match stream.take_error() {
                Ok(Some(err)) => return fail(stream, crate::error::translate(&err)),
                Ok(None) => {}
                Err(err) => {
                    let code = crate::error::translate(&err);
                    return fail(stream, code);
                }
            }
            // A writable edge with no pending error means established.
            if let Err(err) = stream.peer_addr() {
                let code = crate::error::translate(&err);
                return fail(stream, code);
            }
            debug!(%addr, "connected");
            Ok(Stream::from_parts(
                ctx,
                StreamKind::Tcp,
                StreamIo::Tcp(stream),
                Some(token),
                waiter,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn endpoint_parsing_picks_family_by_colon() {
        assert!(parse_endpoint("127.0.0.1", 80).unwrap().is_ipv4());
        assert!(parse_endpoint("::1", 80).unwrap().is_ipv6());
        assert_eq!(parse_endpoint("not-an-ip", 80), Err(ErrorCode::InvalidArgument));
        assert_eq!(parse_endpoint("fe80::1", 443).unwrap().port(), 443);
    }
}
