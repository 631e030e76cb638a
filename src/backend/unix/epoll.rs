use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{Event, Interest, RawToken};
use crate::error::{Error, Result};
use crate::handle::HandleId;

pub(super) struct Epoll {
    epfd: RawFd,
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut flags = libc::EPOLLRDHUP as u32;
    if interest.contains(Interest::READABLE) {
        flags |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        flags |= libc::EPOLLOUT as u32;
    }
    flags
}

fn ctl(epfd: RawFd, op: i32, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
    let mut ev = libc::epoll_event {
        events: interest_to_epoll(interest),
        u64: id.0 as u64,
    };
    // SAFETY: `epfd` is a valid epoll instance owned by `self`, `token` is a
    // caller-owned fd, and `ev` is a live local we pass by pointer for the
    // duration of the call only.
    let rc = unsafe { libc::epoll_ctl(epfd, op, token, &mut ev) };
    if rc < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

impl Epoll {
    pub(super) fn new() -> Result<Self> {
        // SAFETY: no preconditions beyond the syscall itself.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(Epoll { epfd })
    }

    pub(super) fn add(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        ctl(self.epfd, libc::EPOLL_CTL_ADD, token, id, interest)
    }

    pub(super) fn modify(
        &mut self,
        token: RawToken,
        id: HandleId,
        interest: Interest,
    ) -> Result<()> {
        ctl(self.epfd, libc::EPOLL_CTL_MOD, token, id, interest)
    }

    pub(super) fn remove(&mut self, token: RawToken) -> Result<()> {
        // SAFETY: the event pointer is ignored for `EPOLL_CTL_DEL` on Linux
        // but older kernels want a non-null one; a stack default suffices.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, token, &mut ev) };
        if rc < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub(super) fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; 256];
        // SAFETY: `raw` outlives the call and has capacity matching `len`.
        let n = unsafe {
            libc::epoll_wait(self.epfd, raw.as_mut_ptr(), raw.len() as i32, timeout_ms)
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::from(err));
        }
        for ev in &raw[..n as usize] {
            let flags = ev.events as i32;
            events.push(Event {
                id: HandleId(ev.u64 as usize),
                readable: flags & (libc::EPOLLIN | libc::EPOLLHUP) != 0,
                writable: flags & libc::EPOLLOUT != 0,
                error: flags & libc::EPOLLERR != 0,
            });
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: `epfd` is only ever closed here, once.
        unsafe {
            libc::close(self.epfd);
        }
    }
}
