// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words unread pushback

//! Stream semantics: pushback, filters, transfer, events, files, pipes.

use async_trait::async_trait;
use evio::{ErrorCode, Event, EventLoop, Next, Stream, StreamFilter, StreamKind, fs, transfer};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Spec scenario: read "HTTP", push it back, re-read it in two halves,
/// then continue with the transport.
#[test]
fn pushback_is_drained_before_the_transport() {
    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, b"HTTP/1.1 200 OK".to_vec());

        let mut buffer = [0u8; 4];
        assert_eq!(stream.read(&mut buffer).await, 4);
        assert_eq!(&buffer, b"HTTP");

        assert_eq!(stream.unread(&buffer), 4);

        let mut half = [0u8; 2];
        assert_eq!(stream.read(&mut half).await, 2);
        assert_eq!(&half, b"HT");
        assert_eq!(stream.read(&mut half).await, 2);
        assert_eq!(&half, b"TP");

        // Pushback exhausted; next read hits the transport.
        let mut rest = [0u8; 16];
        assert_eq!(stream.read(&mut rest).await, 11);
        assert_eq!(&rest[..11], b"/1.1 200 OK");

        ctx.stop().unwrap();
    })
    .unwrap();
}

/// A second unread replaces the first: at-most-one pushback.
#[test]
fn unread_replaces_any_pending_pushback() {
    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, Vec::new());
        stream.unread(b"aaaa");
        stream.unread(b"bb");

        let mut buffer = [0u8; 8];
        assert_eq!(stream.read(&mut buffer).await, 2);
        assert_eq!(&buffer[..2], b"bb");

        ctx.stop().unwrap();
    })
    .unwrap();
}

/// Caps every read at a fixed size, like a transport that dribbles.
struct ChunkCap(usize);

#[async_trait(?Send)]
impl StreamFilter for ChunkCap {
    async fn on_read(&self, next: Next<'_>, buffer: &mut [u8]) -> usize {
        let cap = self.0.min(buffer.len());
        next.read(&mut buffer[..cap]).await
    }
}

/// Spec scenario: 1 MiB source read in 17-byte dribbles, pumped with a
/// 4 KiB chunk size; the sink must receive every byte in order.
#[test]
fn transfer_conserves_every_byte() {
    let delivered = Arc::new(Mutex::new(0u64));
    let sink_total = Arc::clone(&delivered);

    EventLoop::run(move |ctx| async move {
        let payload: Vec<u8> = (0..1usize << 20).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let src = Stream::memory(&ctx, payload);
        src.attach_filter(Rc::new(ChunkCap(17)));
        let dst = Stream::memory(&ctx, Vec::new());

        let total = transfer(&dst, &src, 4096).await.unwrap();
        *sink_total.lock().unwrap() = total;

        assert!(src.status().eof);
        assert_eq!(dst.memory_data().unwrap(), expected);
        assert_eq!(src.read_bandwidth().bytes, 1 << 20);
        assert_eq!(dst.write_bandwidth().bytes, 1 << 20);

        ctx.stop().unwrap();
    })
    .unwrap();

    assert_eq!(*delivered.lock().unwrap(), 1 << 20);
}

/// Filters run head-first on reads; a later attach prepends.
#[test]
fn filters_prepend_and_run_in_chain_order() {
    struct Tag(&'static str, Rc<RefCell<Vec<&'static str>>>);

    #[async_trait(?Send)]
    impl StreamFilter for Tag {
        async fn on_read(&self, next: Next<'_>, buffer: &mut [u8]) -> usize {
            self.1.borrow_mut().push(self.0);
            next.read(buffer).await
        }
    }

    EventLoop::run(|ctx| async move {
        let order = Rc::new(RefCell::new(Vec::new()));
        let stream = Stream::memory(&ctx, b"x".to_vec());

        stream.attach_filter(Rc::new(Tag("inner", Rc::clone(&order))));
        stream.attach_filter(Rc::new(Tag("outer", Rc::clone(&order))));

        let mut buffer = [0u8; 1];
        assert_eq!(stream.read(&mut buffer).await, 1);
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn detached_filter_no_longer_runs() {
    struct Blocker;

    #[async_trait(?Send)]
    impl StreamFilter for Blocker {
        async fn on_read(&self, _next: Next<'_>, _buffer: &mut [u8]) -> usize {
            0
        }
    }

    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, b"data".to_vec());
        let blocker: Rc<dyn StreamFilter> = Rc::new(Blocker);

        stream.attach_filter(Rc::clone(&blocker));
        let mut buffer = [0u8; 4];
        assert_eq!(stream.read(&mut buffer).await, 0, "blocker swallows the read");

        assert!(stream.detach_filter(&blocker));
        assert_eq!(stream.read(&mut buffer).await, 4);
        assert_eq!(&buffer, b"data");

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn event_signal_then_wait_does_not_park() {
    EventLoop::run(|ctx| async move {
        let event = Event::new(&ctx);
        event.signal();

        let before = Instant::now();
        event.wait(0).await.unwrap();
        assert!(before.elapsed() < Duration::from_millis(20));

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn event_wait_parks_until_signalled() {
    EventLoop::run(|ctx| async move {
        let event = Event::new(&ctx);

        let signaller = event.clone();
        let _ = ctx.spawn(move |ctx| async move {
            ctx.sleep(40).await.unwrap();
            signaller.signal();
        });

        let before = Instant::now();
        event.wait(0).await.unwrap();
        assert!(before.elapsed() >= Duration::from_millis(40));

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn event_wait_timeout_consumes_nothing() {
    EventLoop::run(|ctx| async move {
        let event = Event::new(&ctx);

        assert_eq!(event.wait(50).await, Err(ErrorCode::TimedOut));

        // A later signal is still worth one wait.
        event.signal();
        event.wait(0).await.unwrap();

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[cfg(unix)]
#[test]
fn pipe_streams_carry_bytes_between_tasks() {
    EventLoop::run(|ctx| async move {
        let (read_end, write_end) = rustix::pipe::pipe().unwrap();
        let reader = Stream::attach_fd(&ctx, read_end, StreamKind::Pipe).unwrap();
        let writer = Stream::attach_fd(&ctx, write_end, StreamKind::Pipe).unwrap();

        let _ = ctx.spawn(move |ctx| async move {
            ctx.sleep(20).await.unwrap();
            assert_eq!(writer.write(b"through the pipe").await, 16);
            writer.close().unwrap();
        });

        let mut buffer = [0u8; 32];
        let mut collected = Vec::new();
        loop {
            let count = reader.read(&mut buffer).await;
            if count == 0 {
                break;
            }
            collected.extend_from_slice(&buffer[..count]);
        }
        assert_eq!(collected, b"through the pipe");
        assert!(reader.status().eof);
        reader.close().unwrap();

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn file_streams_roundtrip_through_disk() {
    let path = std::env::temp_dir().join(format!("evio-file-{}.tmp", std::process::id()));
    let path2 = path.clone();

    EventLoop::run(move |ctx| async move {
        let file = fs::create(&ctx, &path2).unwrap();
        assert_eq!(file.kind(), StreamKind::File);
        assert_eq!(file.write(b"persisted bytes").await, 15);
        file.close().unwrap();

        let file = fs::open(&ctx, &path2).unwrap();
        let mut buffer = [0u8; 64];
        assert_eq!(file.read(&mut buffer).await, 15);
        assert_eq!(&buffer[..15], b"persisted bytes");
        // Offset advanced; next read is end-of-file.
        assert_eq!(file.read(&mut buffer).await, 0);
        assert!(file.status().eof);
        file.close().unwrap();

        assert_eq!(fs::stat(&path2).unwrap().size, 15);

        ctx.stop().unwrap();
    })
    .unwrap();

    std::fs::remove_file(&path).unwrap();
}

/// Terminal status bits short-circuit subsequent operations.
#[test]
fn closed_stream_reads_and_writes_return_zero() {
    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, b"leftovers".to_vec());
        stream.close().unwrap();
        assert!(stream.status().closed);

        let mut buffer = [0u8; 8];
        assert_eq!(stream.read(&mut buffer).await, 0);
        assert_eq!(stream.write(b"nope").await, 0);

        ctx.stop().unwrap();
    })
    .unwrap();
}

/// Writes flow head-to-tail through the chain as well.
#[test]
fn write_filters_transform_before_the_transport() {
    struct Frame;

    #[async_trait(?Send)]
    impl StreamFilter for Frame {
        async fn on_write(&self, next: Next<'_>, buffer: &[u8]) -> usize {
            let mut framed = Vec::with_capacity(buffer.len() + 2);
            framed.push(b'[');
            framed.extend_from_slice(buffer);
            framed.push(b']');
            let sent = next.write(&framed).await;
            // Report in caller units: all or nothing for a frame.
            if sent == framed.len() { buffer.len() } else { 0 }
        }
    }

    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, Vec::new());
        stream.attach_filter(Rc::new(Frame));

        assert_eq!(stream.write(b"payload").await, 7);
        assert_eq!(stream.memory_data().unwrap(), b"[payload]");

        ctx.stop().unwrap();
    })
    .unwrap();
}

#[test]
fn udp_streams_exchange_datagrams() {
    EventLoop::run(|ctx| async move {
        let a = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        a.connect(b.local_addr().unwrap()).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();

        let a = Stream::attach_udp(&ctx, a).unwrap();
        let b = Stream::attach_udp(&ctx, b).unwrap();
        assert_eq!(a.kind(), StreamKind::Udp);

        assert_eq!(a.write(b"ping").await, 4);
        let mut buffer = [0u8; 16];
        assert_eq!(b.read(&mut buffer).await, 4);
        assert_eq!(&buffer[..4], b"ping");

        assert_eq!(b.write(b"pong").await, 4);
        assert_eq!(a.read(&mut buffer).await, 4);
        assert_eq!(&buffer[..4], b"pong");

        a.close().unwrap();
        b.close().unwrap();
        ctx.stop().unwrap();
    })
    .unwrap();
}

/// Bandwidth counters only ever grow, and grow by what was transferred.
#[test]
fn bandwidth_counters_are_monotonic() {
    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, vec![7u8; 96]);

        let mut buffer = [0u8; 32];
        let mut previous = stream.read_bandwidth();
        for _ in 0..3 {
            assert_eq!(stream.read(&mut buffer).await, 32);
            let current = stream.read_bandwidth();
            assert!(current.bytes > previous.bytes);
            assert!(current.period >= previous.period);
            previous = current;
        }
        assert_eq!(previous.bytes, 96);

        assert_eq!(stream.write(b"abc").await, 3);
        assert_eq!(stream.write_bandwidth().bytes, 3);

        ctx.stop().unwrap();
    })
    .unwrap();
}

/// Reading less than the pushback leaves the remainder for later reads,
/// interleaved correctly with a replacement.
#[test]
fn partial_pushback_reads_keep_their_place() {
    EventLoop::run(|ctx| async move {
        let stream = Stream::memory(&ctx, b"tail".to_vec());
        stream.unread(b"abcdef");

        let mut two = [0u8; 2];
        assert_eq!(stream.read(&mut two).await, 2);
        assert_eq!(&two, b"ab");
        assert_eq!(stream.read(&mut two).await, 2);
        assert_eq!(&two, b"cd");

        let mut rest = [0u8; 8];
        assert_eq!(stream.read(&mut rest).await, 2);
        assert_eq!(&rest[..2], b"ef");

        // Pushback done; transport takes over.
        assert_eq!(stream.read(&mut rest).await, 4);
        assert_eq!(&rest[..4], b"tail");

        ctx.stop().unwrap();
    })
    .unwrap();
}
