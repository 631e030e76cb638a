//! Unified polling backend.
//!
//! Unix targets get a readiness backend (`epoll` on Linux, `kqueue` on
//! BSD/macOS, `poll(2)` everywhere else as the portable fallback) behind one
//! [`Backend`] trait; Windows gets I/O completion ports, which report
//! completed operations rather than readiness. The trait is shaped around
//! the readiness model, since that's what the loop's stream engine expects
//! (`SPEC_FULL.md` §4.3); the Windows backend turns each IOCP completion
//! packet into a synthetic readable/writable `Event` before handing it back,
//! the same translation the teacher's `io/overlapped.rs` driver performs
//! between `OVERLAPPED` completions and its `WriteState` machine.
//!
//! Module layout (`unix.rs` / `windows.rs` behind `#[cfg(unix)]` /
//! `#[cfg(windows)]` re-exports) follows mio's `src/sys` convention.

use std::time::Duration;

use crate::error::Result;
use crate::handle::HandleId;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixBackend as SysBackend;
#[cfg(windows)]
pub use windows::IocpBackend as SysBackend;

bitflags::bitflags! {
    #[derive(Copy, Clone, PartialEq, Eq, Debug)]
    pub struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// One readiness notification handed back from [`Backend::wait`].
#[derive(Copy, Clone, Debug)]
pub struct Event {
    pub id: HandleId,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// A raw OS I/O descriptor registered with the backend. `RawFd` on Unix,
/// `RawSocket`/`RawHandle` on Windows; callers key registrations by
/// [`HandleId`] instead so the rest of the crate never matches on platform.
#[cfg(unix)]
pub type RawToken = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawToken = std::os::windows::io::RawSocket;

/// Readiness source shared by every polling backend.
///
/// Implementations are not required to be thread-safe; the loop that owns
/// one never touches it from more than one thread.
pub trait Backend {
    fn new() -> Result<Self>
    where
        Self: Sized;

    /// Start watching `token` for `interest`, tagging events with `id`.
    fn add(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()>;

    /// Change the interest set for an already-registered token.
    fn modify(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()>;

    /// Stop watching `token`.
    fn remove(&mut self, token: RawToken) -> Result<()>;

    /// Block for readiness events, up to `timeout` (`None` = forever, `Some`
    /// `Duration::ZERO` = return immediately). Appends to `events` rather
    /// than returning a fresh `Vec` so the caller can reuse one allocation
    /// across iterations.
    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()>;
}
