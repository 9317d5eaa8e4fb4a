// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words demux evio unread pushback

//! # evio
//!
//! A cross-platform I/O runtime for writing straight-line code with
//! event-demultiplexed scalability. Each runtime instance is a
//! single-threaded *loop* that multiplexes many lightweight *tasks*; a task
//! suspends on I/O or a timer and the loop resumes it when the kernel
//! reports progress. Multiple loops run on their own threads and interact
//! only through a well-defined cross-loop dispatch surface.
//!
//! ## The pieces
//!
//! | piece | entry points |
//! |---|---|
//! | loops | [`EventLoop::run`], [`EventLoop::start`], [`LoopHandle`] |
//! | tasks | [`LoopCtx::spawn`], [`LoopCtx::exec`], [`LoopCtx::park`], [`LoopHandle::wakeup`] |
//! | timers | [`LoopCtx::sleep`], [`LoopCtx::idle`], per-stream timeouts |
//! | cross-loop | [`LoopHandle::post`], [`LoopCtx::exec_on`], [`LoopCtx::wait`], [`LoopCtx::stop_and_wait`] |
//! | streams | [`Stream`], [`StreamFilter`], [`transfer`], [`fs`], [`net`] |
//! | events | [`Event`] |
//!
//! ## A taste
//!
//! ```no_run
//! use evio::{EventLoop, net};
//!
//! fn main() -> evio::Result<()> {
//!     EventLoop::run(|ctx| async move {
//!         let listener = net::TcpListener::listen(&ctx, "127.0.0.1", 8080, 128)
//!             .expect("bind");
//!         while let Ok(conn) = listener.accept().await {
//!             let _ = ctx.spawn(move |ctx| async move {
//!                 let stream = conn.attach(&ctx).expect("attach");
//!                 let mut buffer = [0u8; 65536];
//!                 let n = stream.read(&mut buffer).await;
//!                 if n > 0 {
//!                     stream.write(&buffer[..n]).await;
//!                 }
//!                 let _ = stream.close();
//!             });
//!         }
//!         let _ = ctx.stop();
//!     })
//! }
//! ```
//!
//! ## Model
//!
//! - **Cooperative, single-threaded per loop.** A task holds the CPU until
//!   it suspends (`.await` on a runtime operation). Loop-owned state needs
//!   no locks; the async channel is the only thing other threads touch.
//! - **Failure as status.** Stream data paths return short counts and
//!   record the reason in [`Stream::status`]; everything else returns
//!   [`Result`] over the closed [`ErrorCode`] taxonomy.
//! - **Termination is observable.** Stopping a loop wakes every pending
//!   timer, waiter, and I/O operation, which report
//!   [`ErrorCode::Terminate`] (or the `terminated` status bit).

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod net;

pub(crate) mod event_loop;
pub(crate) mod mpsc;
pub(crate) mod pool;
pub(crate) mod sched;
pub(crate) mod stream;
pub(crate) mod timer;

pub use clock::time_current;
pub use config::LoopConfig;
pub use error::{ErrorCode, Millis, Result, translate, translate_os};
pub use event_loop::{EventLoop, LoopCtx, LoopHandle};
pub use sched::TaskRef;
pub use stream::event::Event;
pub use stream::file as fs;
pub use stream::file::FileStat;
pub use stream::transfer::transfer;
pub use stream::{Bandwidth, Next, Stream, StreamFilter, StreamKind, StreamStatus};
