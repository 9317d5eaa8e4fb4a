// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words errno EAGAIN EBADF ENOTTY ENFILE EMFILE EADDRINUSE ETIMEDOUT

//! The closed error taxonomy shared by every operation in the runtime.
//!
//! Errors are values, never unwinds. Every syscall result crosses the OS
//! boundary through [`translate()`] exactly once; from there on only
//! [`ErrorCode`] moves through the system. Stream data paths additionally
//! report failure as a short count plus status bits (see
//! [`crate::stream::Stream::status`]), so `ErrorCode` shows up there as the
//! recorded reason rather than as a return value.

use std::io;

/// Milliseconds, the only time unit the runtime speaks.
pub type Millis = u64;

/// Crate-wide result alias over the closed taxonomy.
pub type Result<T> = std::result::Result<T, ErrorCode>;

/// One value per failure class the runtime distinguishes.
///
/// `Terminate` is not an OS condition: it is produced whenever an operation
/// observes that its loop's termination path has run (a timer woken without
/// elapsing, a stream op entered on a stopped loop, a cross-loop call whose
/// target has shut down).
///
/// OS codes with no dedicated variant pass through as [`ErrorCode::Os`]
/// rather than being collapsed into a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorCode {
    #[error("operation not permitted")]
    NotPermitted,
    #[error("not found")]
    NotFound,
    #[error("i/o error")]
    IoError,
    #[error("bad file descriptor")]
    BadFile,
    #[error("resource temporarily unavailable")]
    TemporaryUnavailable,
    #[error("not enough memory")]
    NoMemory,
    #[error("permission denied")]
    AccessDenied,
    #[error("bad address in system call argument")]
    Fault,
    #[error("already exist")]
    AlreadyExist,
    #[error("no such device")]
    NoDevice,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("limit has been reached")]
    Limit,
    #[error("too many open files")]
    TooManyFiles,
    #[error("not a typewriter")]
    NotTypewriter,
    #[error("no space left on device")]
    NoSpace,
    #[error("address already in use")]
    AddressInUse,
    #[error("operation timed out")]
    TimedOut,
    #[error("terminate")]
    Terminate,
    /// Raw OS code the taxonomy has no dedicated variant for.
    #[error("os error {0}")]
    Os(i32),
}

/// Maps a raw errno / last-error value into the taxonomy.
///
/// Unknown codes pass through as [`ErrorCode::Os`].
pub fn translate_os(raw: i32) -> ErrorCode {
    match raw {
        libc_errno::EPERM => ErrorCode::NotPermitted,
        libc_errno::ENOENT => ErrorCode::NotFound,
        libc_errno::EIO => ErrorCode::IoError,
        libc_errno::EBADF => ErrorCode::BadFile,
        libc_errno::EAGAIN => ErrorCode::TemporaryUnavailable,
        libc_errno::ENOMEM => ErrorCode::NoMemory,
        libc_errno::EACCES => ErrorCode::AccessDenied,
        libc_errno::EFAULT => ErrorCode::Fault,
        libc_errno::EEXIST => ErrorCode::AlreadyExist,
        libc_errno::ENODEV => ErrorCode::NoDevice,
        libc_errno::EINVAL => ErrorCode::InvalidArgument,
        libc_errno::ENFILE => ErrorCode::Limit,
        libc_errno::EMFILE => ErrorCode::TooManyFiles,
        libc_errno::ENOTTY => ErrorCode::NotTypewriter,
        libc_errno::ENOSPC => ErrorCode::NoSpace,
        libc_errno::EADDRINUSE => ErrorCode::AddressInUse,
        libc_errno::ETIMEDOUT => ErrorCode::TimedOut,
        other => ErrorCode::Os(other),
    }
}

/// Maps an [`io::Error`] into the taxonomy.
///
/// Prefers the raw OS code when one is present; synthesized errors (e.g.
/// from `io::Error::new`) fall back on the [`io::ErrorKind`].
pub fn translate(err: &io::Error) -> ErrorCode {
    if let Some(raw) = err.raw_os_error() {
        return translate_os(raw);
    }
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::NotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
        io::ErrorKind::WouldBlock => ErrorCode::TemporaryUnavailable,
        io::ErrorKind::InvalidInput => ErrorCode::InvalidArgument,
        io::ErrorKind::TimedOut => ErrorCode::TimedOut,
        io::ErrorKind::AddrInUse => ErrorCode::AddressInUse,
        io::ErrorKind::OutOfMemory => ErrorCode::NoMemory,
        _ => ErrorCode::IoError,
    }
}

impl From<io::Error> for ErrorCode {
    fn from(err: io::Error) -> Self { translate(&err) }
}

impl From<rustix::io::Errno> for ErrorCode {
    fn from(errno: rustix::io::Errno) -> Self { translate_os(errno.raw_os_error()) }
}

/// The errno values the translator maps, spelled out so the table above does
/// not depend on a `libc` import. Values are the Linux ones; on other Unixes
/// the few that differ pass through as [`ErrorCode::Os`], which is the
/// documented behavior for unmapped codes.
mod libc_errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EIO: i32 = 5;
    pub const EBADF: i32 = 9;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const ENOTTY: i32 = 25;
    pub const ENOSPC: i32 = 28;
    pub const EADDRINUSE: i32 = 98;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case(libc_errno::EPERM, ErrorCode::NotPermitted; "eperm")]
    #[test_case(libc_errno::ENOENT, ErrorCode::NotFound; "enoent")]
    #[test_case(libc_errno::EIO, ErrorCode::IoError; "eio")]
    #[test_case(libc_errno::EBADF, ErrorCode::BadFile; "ebadf")]
    #[test_case(libc_errno::EAGAIN, ErrorCode::TemporaryUnavailable; "eagain")]
    #[test_case(libc_errno::ENOMEM, ErrorCode::NoMemory; "enomem")]
    #[test_case(libc_errno::EACCES, ErrorCode::AccessDenied; "eacces")]
    #[test_case(libc_errno::EFAULT, ErrorCode::Fault; "efault")]
    #[test_case(libc_errno::EEXIST, ErrorCode::AlreadyExist; "eexist")]
    #[test_case(libc_errno::ENODEV, ErrorCode::NoDevice; "enodev")]
    #[test_case(libc_errno::EINVAL, ErrorCode::InvalidArgument; "einval")]
    #[test_case(libc_errno::ENFILE, ErrorCode::Limit; "enfile")]
    #[test_case(libc_errno::EMFILE, ErrorCode::TooManyFiles; "emfile")]
    #[test_case(libc_errno::ENOTTY, ErrorCode::NotTypewriter; "enotty")]
    #[test_case(libc_errno::ENOSPC, ErrorCode::NoSpace; "enospc")]
    #[test_case(libc_errno::EADDRINUSE, ErrorCode::AddressInUse; "eaddrinuse")]
    #[test_case(libc_errno::ETIMEDOUT, ErrorCode::TimedOut; "etimedout")]
    fn translates_mapped_errno(raw: i32, expected: ErrorCode) {
        assert_eq!(translate_os(raw), expected);
    }

    #[test]
    fn unknown_errno_passes_through() {
        assert_eq!(translate_os(71), ErrorCode::Os(71));
        assert_eq!(translate_os(-3), ErrorCode::Os(-3));
    }

    #[test]
    fn io_error_prefers_raw_os_code() {
        let err = io::Error::from_raw_os_error(libc_errno::EAGAIN);
        assert_eq!(translate(&err), ErrorCode::TemporaryUnavailable);
    }

    #[test]
    fn synthesized_io_error_falls_back_on_kind() {
        let err = io::Error::new(io::ErrorKind::TimedOut, "synthetic");
        assert_eq!(translate(&err), ErrorCode::TimedOut);
    }
}
