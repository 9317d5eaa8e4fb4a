// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Concurrent stream-to-stream pumping.
//!
//! [`transfer`] pumps `src` into `dst` with a reader task and a writer task
//! running in the same loop: the calling task becomes the writer, and a
//! fresh task is posted as the reader. The shared FIFO of filled chunks is
//! touched only by those two tasks on one thread, so it needs no lock; the
//! wakeup request/done counter pair debounces redundant writer wakeups,
//! which travel through the async channel like any other cross-task resume.

use crate::error::{ErrorCode, Result};
use crate::event_loop::LoopCtx;
use crate::sched::TaskRef;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::trace;

use super::Stream;

struct TransferState {
    buffers: RefCell<VecDeque<Vec<u8>>>,
    read_done: Cell<bool>,
    write_done: Cell<bool>,
    wakeup_requested: Cell<u64>,
    wakeup_consumed: Cell<u64>,
    writer: TaskRef,
}

/// Pumps `src` into `dst` in `chunk_size`-byte reads until `src` reports
/// end of stream or `dst` rejects a write.
///
/// Returns the number of bytes actually delivered to `dst`. On a clean
/// source EOF that equals everything read; on a short write it is the byte
/// count of all fully written chunks plus the partial one. The caller
/// consults `dst.status()` / `src.status()` for the failure reason, as with
/// any other stream operation.
///
/// Both streams must be attached to the calling task's loop.
pub async fn transfer(dst: &Stream, src: &Stream, chunk_size: usize) -> Result<u64> {
    if chunk_size == 0 {
        return Err(ErrorCode::InvalidArgument);
    }
    if !Rc::ptr_eq(&src.inner.loop_, &dst.inner.loop_) {
        return Err(ErrorCode::InvalidArgument);
    }
    let ctx = LoopCtx { inner: Rc::clone(&src.inner.loop_) };
    let writer = ctx.current_task().ok_or(ErrorCode::InvalidArgument)?;

    let state = Rc::new(TransferState {
        buffers: RefCell::new(VecDeque::new()),
        read_done: Cell::new(false),
        write_done: Cell::new(false),
        wakeup_requested: Cell::new(0),
        wakeup_consumed: Cell::new(0),
        writer,
    });

    let reader_state = Rc::clone(&state);
    let reader_src = src.clone();
    ctx.spawn(move |ctx| async move {
        reader_loop(&ctx, &reader_src, &reader_state, chunk_size).await;
    })?;

    let handle_pool = &ctx.inner.pool;
    let mut total: u64 = 0;
    let mut failed = false;

    loop {
        ctx.park().await;
        state.wakeup_consumed.set(state.wakeup_consumed.get() + 1);

        loop {
            // Pop in its own statement: holding the FIFO borrow across the
            // write's suspension would collide with the reader's push.
            let popped = state.buffers.borrow_mut().pop_front();
            let Some(buffer) = popped else { break };
            let used = buffer.len();
            let wrote = dst.write(&buffer).await;
            handle_pool.release(buffer);
            total += wrote as u64;
            if wrote < used {
                failed = true;
                state.write_done.set(true);
                break;
            }
        }
        if failed {
            break;
        }
        if state.read_done.get() && state.buffers.borrow().is_empty() {
            break;
        }
        if ctx.is_terminated() {
            break;
        }
    }

    // Anything still queued was never written; recycle it.
    for buffer in state.buffers.borrow_mut().drain(..) {
        handle_pool.release(buffer);
    }

    trace!(total, failed, "transfer finished");
    Ok(total)
}

async fn reader_loop(ctx: &LoopCtx, src: &Stream, state: &Rc<TransferState>, chunk_size: usize) {
    let handle = ctx.handle();
    loop {
        let mut buffer = ctx.inner.pool.acquire(chunk_size);
        let count = src.read(&mut buffer).await;
        if count == 0 {
            ctx.inner.pool.release(buffer);
            state.read_done.set(true);
            break;
        }
        buffer.truncate(count);
        // Short reads keep their slack otherwise; a fast source that never
        // suspends could pile up full-capacity chunks ahead of the writer.
        buffer.shrink_to_fit();
        state.buffers.borrow_mut().push_back(buffer);

        if state.write_done.get() {
            break;
        }
        if state.wakeup_consumed.get() == state.wakeup_requested.get() {
            let _ = handle.wakeup(state.writer);
            state.wakeup_requested.set(state.wakeup_requested.get() + 1);
        }
    }

    if state.wakeup_consumed.get() == state.wakeup_requested.get() {
        let _ = handle.wakeup(state.writer);
        state.wakeup_requested.set(state.wakeup_requested.get() + 1);
    }
}
