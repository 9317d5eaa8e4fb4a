// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words kqueue IOCP AFD

//! The OS demultiplexer seam.
//!
//! The loop drives a kernel demux through [`Demux`], written once for two
//! profiles:
//!
//! | profile | kernel reports | who does the I/O |
//! |---|---|---|
//! | readiness | registrations that became ready | the stream code, non-blocking |
//! | completion | finished transfers (count, error) | the kernel; no retry needed |
//!
//! The shipped implementation is the readiness profile over [`mio::Poll`]
//! (epoll on Linux, kqueue on macOS, IOCP-backed AFD readiness on
//! Windows). A completion-profile driver slots in behind the same trait;
//! the runtime's file I/O already follows that shape by completing through
//! the async channel with a completion record.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::time::Duration;

/// Token reserved for the loop's wake channel.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

pub(crate) trait Demux {
    fn register(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn reregister(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()>;

    fn deregister(&self, source: &mut dyn Source) -> io::Result<()>;

    /// Blocks for up to `timeout` (`None` = until woken) and fills `events`.
    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;
}

/// Readiness-profile driver over [`mio::Poll`].
pub(crate) struct PollDemux {
    poll: Poll,
}

impl PollDemux {
    /// Creates the poller and its wake channel together: a [`mio::Waker`] is
    /// bound to the registry it was created from, so the pair is
    /// inseparable.
    pub(crate) fn new() -> io::Result<(Self, mio::Waker)> {
        let poll = Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok((Self { poll }, waker))
    }
}

impl Demux for PollDemux {
    fn register(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    fn reregister(
        &self,
        source: &mut dyn Source,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    fn deregister(&self, source: &mut dyn Source) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        self.poll.poll(events, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn readiness_is_reported_for_a_registered_pipe() {
        let (demux, _waker) = PollDemux::new().unwrap();
        let mut demux = demux;
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();

        let raw = read_end.as_raw_fd();
        demux
            .register(&mut mio::unix::SourceFd(&raw), Token(7), Interest::READABLE)
            .unwrap();

        // Nothing pending: the wait honors its timeout.
        let mut events = Events::with_capacity(8);
        let before = Instant::now();
        demux.wait(&mut events, Some(Duration::from_millis(30))).unwrap();
        assert!(events.is_empty());
        assert!(before.elapsed() >= Duration::from_millis(25));

        // A write makes the read end ready under our token.
        let mut file = std::fs::File::from(write_end);
        file.write_all(b"x").unwrap();
        demux.wait(&mut events, Some(Duration::from_millis(1_000))).unwrap();
        let event = events.iter().next().expect("one readiness event");
        assert_eq!(event.token(), Token(7));
        assert!(event.is_readable());

        demux.deregister(&mut mio::unix::SourceFd(&raw)).unwrap();
    }

    #[test]
    fn waker_unblocks_the_wait_with_the_wake_token() {
        let (demux, waker) = PollDemux::new().unwrap();
        let mut demux = demux;

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        let mut events = Events::with_capacity(8);
        demux.wait(&mut events, Some(Duration::from_millis(5_000))).unwrap();
        let event = events.iter().next().expect("wake event");
        assert_eq!(event.token(), WAKE_TOKEN);

        handle.join().unwrap();
    }
}
