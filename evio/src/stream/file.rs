// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! File streams: positional I/O that completes through the async channel.
//!
//! Regular files are always "ready" as far as a readiness demux is
//! concerned, so file transfers follow the completion shape instead: the
//! operation runs on a helper thread against a dup of the descriptor, and
//! completion is signalled by a cross-thread wakeup carrying a completion
//! record, which the suspended task consumes when it resumes. Read and
//! write offsets advance per stream, not per descriptor.

use crate::error::{ErrorCode, Millis, Result};
use crate::event_loop::{LoopCtx, LoopHandle, LoopInner};
use crate::timer::TimerEntry;
use std::future::Future;
use std::os::unix::fs::FileExt;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::UNIX_EPOCH;
use tracing::trace;

use super::{Stream, StreamInner, StreamIo, StreamKind};

pub(crate) struct FileIo {
    file: std::fs::File,
    read_offset: u64,
    write_offset: u64,
}

/// File metadata as [`stat`] reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Milliseconds since the Unix epoch; 0 when the filesystem does not
    /// record the timestamp.
    pub created: Millis,
    pub accessed: Millis,
    pub modified: Millis,
}

/// Opens an existing file for reading and writing as a stream on `ctx`'s
/// loop. Both offsets start at the beginning of the file.
pub fn open(ctx: &LoopCtx, path: impl AsRef<std::path::Path>) -> Result<Stream> {
    if ctx.is_terminated() {
        return Err(ErrorCode::Terminate);
    }
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    Ok(stream_from(ctx, file))
}

/// Creates (or truncates) a file as a write-oriented stream on `ctx`'s
/// loop.
pub fn create(ctx: &LoopCtx, path: impl AsRef<std::path::Path>) -> Result<Stream> {
    if ctx.is_terminated() {
        return Err(ErrorCode::Terminate);
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(stream_from(ctx, file))
}

/// Fetches size and timestamps for `path`.
pub fn stat(path: impl AsRef<std::path::Path>) -> Result<FileStat> {
    let metadata = std::fs::metadata(path)?;
    let to_millis = |time: std::io::Result<std::time::SystemTime>| -> Millis {
        time.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_millis() as Millis)
    };
    Ok(FileStat {
        size: metadata.len(),
        created: to_millis(metadata.created()),
        accessed: to_millis(metadata.accessed()),
        modified: to_millis(metadata.modified()),
    })
}

fn stream_from(ctx: &LoopCtx, file: std::fs::File) -> Stream {
    Stream::from_parts(
        ctx,
        StreamKind::File,
        StreamIo::File(FileIo { file, read_offset: 0, write_offset: 0 }),
        None,
        Rc::new(crate::event_loop::io_wait::IoWaiter::default()),
    )
}

/// What a finished helper-thread operation hands back: transferred byte
/// count, plus the data for reads.
struct FileDone {
    data: Vec<u8>,
    count: usize,
}

/// Completion record shared between the helper thread and the suspended
/// task: the analogue of an asynchronous I/O control block.
struct FileOp {
    result: Mutex<Option<std::io::Result<FileDone>>>,
}

impl FileOp {
    fn new() -> Arc<Self> {
        Arc::new(Self { result: Mutex::new(None) })
    }

    fn complete(&self, result: std::io::Result<FileDone>) {
        *self.result.lock().expect("file op lock") = Some(result);
    }

    fn take(&self) -> Option<std::io::Result<FileDone>> {
        self.result.lock().expect("file op lock").take()
    }
}

enum FileOutcome {
    Done(std::io::Result<FileDone>),
    TimedOut,
    Terminated,
}

/// Parks the task until the helper thread's wakeup, the per-operation
/// timeout, or loop termination - whichever lands first.
struct WaitFile {
    inner: Rc<LoopInner>,
    op: Arc<FileOp>,
    timer: Option<Rc<TimerEntry>>,
}

impl WaitFile {
    fn new(inner: Rc<LoopInner>, op: Arc<FileOp>, timeout: Millis) -> Self {
        let timer = (timeout > 0).then(|| {
            let entry = TimerEntry::new(inner.sched.current());
            inner.timeouts.set(&entry, timeout, inner.now());
            entry
        });
        Self { inner, op, timer }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take()
            && timer.is_registered()
        {
            self.inner.timeouts.set(&timer, 0, self.inner.now());
        }
    }
}

impl Future for WaitFile {
    type Output = FileOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<FileOutcome> {
        let this = self.get_mut();
        if let Some(result) = this.op.take() {
            this.cancel_timer();
            return Poll::Ready(FileOutcome::Done(result));
        }
        if let Some(timer) = &this.timer
            && timer.elapsed()
        {
            this.timer = None;
            return Poll::Ready(FileOutcome::TimedOut);
        }
        if this.inner.shared.is_terminated() {
            this.cancel_timer();
            return Poll::Ready(FileOutcome::Terminated);
        }
        Poll::Pending
    }
}

impl Drop for WaitFile {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Read tail for file streams.
pub(crate) async fn read(inner: &StreamInner, buffer: &mut [u8]) -> usize {
    let (file, offset) = {
        let io = inner.io.borrow();
        let Some(StreamIo::File(file_io)) = io.as_ref() else { return 0 };
        match file_io.file.try_clone() {
            Ok(clone) => (clone, file_io.read_offset),
            Err(err) => {
                let code = crate::error::translate(&err);
                inner.status_set_error(code);
                return 0;
            }
        }
    };
    let Some(task) = inner.loop_.sched.current() else { return 0 };
    let handle = LoopHandle { shared: Arc::clone(&inner.loop_.shared) };
    let length = buffer.len();

    let op = FileOp::new();
    let worker_op = Arc::clone(&op);
    std::thread::spawn(move || {
        let mut data = vec![0u8; length];
        let result = file.read_at(&mut data, offset).map(|count| {
            data.truncate(count);
            FileDone { count, data }
        });
        worker_op.complete(result);
        let _ = handle.wakeup(task);
    });

    let outcome =
        WaitFile::new(Rc::clone(&inner.loop_), op, inner.read_timeout_value()).await;
    match outcome {
        FileOutcome::Done(Ok(result)) => {
            let count = result.count;
            buffer[..count].copy_from_slice(&result.data);
            if let Some(StreamIo::File(file_io)) = inner.io.borrow_mut().as_mut() {
                file_io.read_offset += count as u64;
            }
            if count == 0 {
                inner.status_set_eof();
            }
            count
        }
        FileOutcome::Done(Err(err)) => {
            let code = crate::error::translate(&err);
            trace!(%err, "file read failed");
            inner.status_set_error(code);
            0
        }
        FileOutcome::TimedOut => {
            inner.status_set_read_timeout();
            0
        }
        FileOutcome::Terminated => {
            inner.status_set_terminated();
            0
        }
    }
}

/// Write tail for file streams: positional writes, repeated until the
/// buffer is fully on disk or a terminal condition interrupts.
pub(crate) async fn write(inner: &StreamInner, buffer: &[u8]) -> usize {
    let timeout = inner.write_timeout_value();
    let mut done = 0;

    while done < buffer.len() {
        let (file, offset) = {
            let io = inner.io.borrow();
            let Some(StreamIo::File(file_io)) = io.as_ref() else { break };
            match file_io.file.try_clone() {
                Ok(clone) => (clone, file_io.write_offset),
                Err(err) => {
                    let code = crate::error::translate(&err);
                    inner.status_set_error(code);
                    break;
                }
            }
        };
        let Some(task) = inner.loop_.sched.current() else { break };
        let handle = LoopHandle { shared: Arc::clone(&inner.loop_.shared) };
        let chunk = buffer[done..].to_vec();

        let op = FileOp::new();
        let worker_op = Arc::clone(&op);
        std::thread::spawn(move || {
            let result = file
                .write_at(&chunk, offset)
                .map(|count| FileDone { data: Vec::new(), count });
            worker_op.complete(result);
            let _ = handle.wakeup(task);
        });

        let outcome = WaitFile::new(Rc::clone(&inner.loop_), op, timeout).await;
        match outcome {
            FileOutcome::Done(Ok(result)) => {
                if result.count == 0 {
                    inner.status_set_error(ErrorCode::IoError);
                    break;
                }
                if let Some(StreamIo::File(file_io)) = inner.io.borrow_mut().as_mut() {
                    file_io.write_offset += result.count as u64;
                }
                done += result.count;
            }
            FileOutcome::Done(Err(err)) => {
                let code = crate::error::translate(&err);
                trace!(%err, "file write failed");
                inner.status_set_error(code);
                break;
            }
            FileOutcome::TimedOut => {
                inner.status_set_write_timeout();
                break;
            }
            FileOutcome::Terminated => {
                inner.status_set_terminated();
                break;
            }
        }
    }

    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::time_current;
    use pretty_assertions::assert_eq;

    #[test]
    fn stat_reports_size_and_timestamps() {
        let path = std::env::temp_dir().join(format!("evio-stat-{}.tmp", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();

        let info = stat(&path).unwrap();
        assert_eq!(info.size, 10);
        assert!(info.modified > 0);
        // Rough sanity: modified within a day of now.
        assert!(time_current().abs_diff(info.modified) < 86_400_000);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn stat_missing_file_is_not_found() {
        let missing = std::env::temp_dir().join("evio-definitely-missing.tmp");
        assert_eq!(stat(&missing).unwrap_err(), ErrorCode::NotFound);
    }
}
