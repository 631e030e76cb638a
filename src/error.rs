//! Portable error taxonomy.
//!
//! Every fallible path in the crate returns [`Error`] rather than a raw OS
//! error or a sentinel integer (see `SPEC_FULL.md` §9.1 on the spawn path's
//! mixed sentinel/errno returns in the source this crate is grounded on).

use std::{error, fmt, io};

/// A closed set of portable error codes. Unmapped OS errors collapse to
/// [`Code::Unknown`] with the raw OS code retained on [`Error::raw_os_error`]
/// for debugging.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Code {
    Eacces,
    Eagain,
    Eaddrinuse,
    Ebadf,
    Econnrefused,
    Econnreset,
    Eexist,
    Einval,
    Eio,
    Eisdir,
    Eloop,
    Emfile,
    Enametoolong,
    Enoent,
    Enomem,
    Enospc,
    Enosys,
    Enotconn,
    Enotdir,
    Enotsock,
    Epipe,
    Esrch,
    Etimedout,
    /// Operation was cancelled as part of handle close processing.
    Ecancelled,
    /// End of file / half-close from the remote side.
    Eof,
    Unknown,
}

impl Code {
    fn as_str(&self) -> &'static str {
        match self {
            Code::Eacces => "permission denied",
            Code::Eagain => "resource temporarily unavailable",
            Code::Eaddrinuse => "address already in use",
            Code::Ebadf => "bad file descriptor",
            Code::Econnrefused => "connection refused",
            Code::Econnreset => "connection reset by peer",
            Code::Eexist => "file already exists",
            Code::Einval => "invalid argument",
            Code::Eio => "i/o error",
            Code::Eisdir => "is a directory",
            Code::Eloop => "too many symbolic links",
            Code::Emfile => "too many open files",
            Code::Enametoolong => "name too long",
            Code::Enoent => "no such file or directory",
            Code::Enomem => "out of memory",
            Code::Enospc => "no space left on device",
            Code::Enosys => "function not implemented",
            Code::Enotconn => "socket is not connected",
            Code::Enotdir => "not a directory",
            Code::Enotsock => "not a socket",
            Code::Epipe => "broken pipe",
            Code::Esrch => "no such process",
            Code::Etimedout => "operation timed out",
            Code::Ecancelled => "operation cancelled",
            Code::Eof => "end of file",
            Code::Unknown => "unknown error",
        }
    }
}

/// A portable error: a [`Code`] plus the raw OS error that produced it, when
/// there was one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Error {
    code: Code,
    raw: Option<i32>,
}

impl Error {
    pub fn new(code: Code) -> Self {
        Error { code, raw: None }
    }

    pub fn with_raw(code: Code, raw: i32) -> Self {
        Error {
            code,
            raw: Some(raw),
        }
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        self.raw
    }

    pub fn cancelled() -> Self {
        Error::new(Code::Ecancelled)
    }

    pub fn eof() -> Self {
        Error::new(Code::Eof)
    }

    pub fn is_would_block(&self) -> bool {
        self.code == Code::Eagain
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.raw {
            Some(raw) => write!(f, "{} (os error {raw})", self.code.as_str()),
            None => write!(f, "{}", self.code.as_str()),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        let code = map_io_error_kind(&value);
        match value.raw_os_error() {
            Some(raw) => Error::with_raw(code, raw),
            None => Error::new(code),
        }
    }
}

fn map_io_error_kind(value: &io::Error) -> Code {
    use io::ErrorKind as K;
    match value.kind() {
        K::NotFound => Code::Enoent,
        K::PermissionDenied => Code::Eacces,
        K::ConnectionRefused => Code::Econnrefused,
        K::ConnectionReset => Code::Econnreset,
        K::NotConnected => Code::Enotconn,
        K::AddrInUse => Code::Eaddrinuse,
        K::AlreadyExists => Code::Eexist,
        K::WouldBlock => Code::Eagain,
        K::InvalidInput | K::InvalidData => Code::Einval,
        K::TimedOut => Code::Etimedout,
        K::WriteZero => Code::Epipe,
        K::Interrupted => Code::Eagain,
        K::UnexpectedEof => Code::Eof,
        K::OutOfMemory => Code::Enomem,
        _ => map_raw_os_error(value.raw_os_error()),
    }
}

#[cfg(unix)]
fn map_raw_os_error(raw: Option<i32>) -> Code {
    match raw {
        Some(libc::EACCES) => Code::Eacces,
        Some(libc::EAGAIN) => Code::Eagain,
        Some(libc::EADDRINUSE) => Code::Eaddrinuse,
        Some(libc::EBADF) => Code::Ebadf,
        Some(libc::ECONNREFUSED) => Code::Econnrefused,
        Some(libc::ECONNRESET) => Code::Econnreset,
        Some(libc::EEXIST) => Code::Eexist,
        Some(libc::EINVAL) => Code::Einval,
        Some(libc::EIO) => Code::Eio,
        Some(libc::EISDIR) => Code::Eisdir,
        Some(libc::ELOOP) => Code::Eloop,
        Some(libc::EMFILE) => Code::Emfile,
        Some(libc::ENAMETOOLONG) => Code::Enametoolong,
        Some(libc::ENOENT) => Code::Enoent,
        Some(libc::ENOMEM) => Code::Enomem,
        Some(libc::ENOSPC) => Code::Enospc,
        Some(libc::ENOSYS) => Code::Enosys,
        Some(libc::ENOTCONN) => Code::Enotconn,
        Some(libc::ENOTDIR) => Code::Enotdir,
        Some(libc::ENOTSOCK) => Code::Enotsock,
        Some(libc::EPIPE) => Code::Epipe,
        Some(libc::ESRCH) => Code::Esrch,
        Some(libc::ETIMEDOUT) => Code::Etimedout,
        _ => Code::Unknown,
    }
}

#[cfg(windows)]
fn map_raw_os_error(raw: Option<i32>) -> Code {
    use windows_sys::Win32::Foundation::*;
    match raw.map(|r| r as u32) {
        Some(ERROR_ACCESS_DENIED) => Code::Eacces,
        Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PATH_NOT_FOUND) => Code::Enoent,
        Some(ERROR_ALREADY_EXISTS) | Some(ERROR_FILE_EXISTS) => Code::Eexist,
        Some(ERROR_INVALID_PARAMETER) | Some(ERROR_INVALID_HANDLE) => Code::Einval,
        Some(ERROR_NOT_ENOUGH_MEMORY) | Some(ERROR_OUTOFMEMORY) => Code::Enomem,
        Some(ERROR_DISK_FULL) => Code::Enospc,
        Some(ERROR_BROKEN_PIPE) | Some(ERROR_NO_DATA) => Code::Epipe,
        Some(ERROR_SEM_TIMEOUT) | Some(WAIT_TIMEOUT) => Code::Etimedout,
        Some(ERROR_CALL_NOT_IMPLEMENTED) => Code::Enosys,
        Some(ERROR_DIRECTORY) => Code::Enotdir,
        Some(ERROR_BUFFER_OVERFLOW) | Some(ERROR_FILENAME_EXCED_RANGE) => Code::Enametoolong,
        _ => Code::Unknown,
    }
}

#[cfg(not(any(unix, windows)))]
fn map_raw_os_error(_raw: Option<i32>) -> Code {
    Code::Unknown
}

pub type Result<T> = std::result::Result<T, Error>;
