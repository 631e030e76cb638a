//! Unix readiness backend: picks `epoll` on Linux, `kqueue` on the BSDs and
//! macOS, and a `poll(2)` fallback everywhere else, the same three-way split
//! the spec names as the portable backend set. Selection happens at compile
//! time via `cfg(target_os = ..)`, mirroring mio's `src/sys/unix` dispatch.

use std::time::Duration;

use crate::backend::{Backend, Event, Interest, RawToken};
use crate::error::Result;
use crate::handle::HandleId;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
mod poll;

#[cfg(target_os = "linux")]
type Selector = epoll::Epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
type Selector = kqueue::Kqueue;
#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
type Selector = poll::Poll;

pub struct UnixBackend {
    selector: Selector,
}

impl Backend for UnixBackend {
    fn new() -> Result<Self> {
        Ok(UnixBackend {
            selector: Selector::new()?,
        })
    }

    fn add(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        self.selector.add(token, id, interest)
    }

    fn modify(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        self.selector.modify(token, id, interest)
    }

    fn remove(&mut self, token: RawToken) -> Result<()> {
        self.selector.remove(token)
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        self.selector.wait(events, timeout)
    }
}
