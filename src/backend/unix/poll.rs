use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{Event, Interest, RawToken};
use crate::error::{Error, Result};
use crate::handle::HandleId;

/// `poll(2)` fallback for Unix targets without `epoll`/`kqueue`. Unlike
/// those two, `poll` has no kernel-side registration: every call re-submits
/// the full watch list, so this backend keeps it itself.
pub(super) struct Poll {
    watched: Vec<(RawFd, HandleId, Interest)>,
}

fn interest_to_poll(interest: Interest) -> i16 {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    events as i16
}

impl Poll {
    pub(super) fn new() -> Result<Self> {
        Ok(Poll {
            watched: Vec::new(),
        })
    }

    pub(super) fn add(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        if self.watched.iter().any(|(fd, _, _)| *fd == token) {
            return Err(Error::new(crate::error::Code::Eexist));
        }
        self.watched.push((token, id, interest));
        Ok(())
    }

    pub(super) fn modify(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        match self.watched.iter_mut().find(|(fd, _, _)| *fd == token) {
            Some(entry) => {
                *entry = (token, id, interest);
                Ok(())
            }
            None => Err(Error::new(crate::error::Code::Enoent)),
        }
    }

    pub(super) fn remove(&mut self, token: RawToken) -> Result<()> {
        let before = self.watched.len();
        self.watched.retain(|(fd, _, _)| *fd != token);
        if self.watched.len() == before {
            return Err(Error::new(crate::error::Code::Enoent));
        }
        Ok(())
    }

    pub(super) fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .watched
            .iter()
            .map(|(fd, _, interest)| libc::pollfd {
                fd: *fd,
                events: interest_to_poll(*interest),
                revents: 0,
            })
            .collect();
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => i32::try_from(d.as_millis()).unwrap_or(i32::MAX),
        };
        // SAFETY: `fds` is a live, correctly-sized buffer for the duration
        // of the call.
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::from(err));
        }
        for (pfd, (_, id, _)) in fds.iter().zip(self.watched.iter()) {
            if pfd.revents == 0 {
                continue;
            }
            events.push(Event {
                id: *id,
                readable: pfd.revents & (libc::POLLIN | libc::POLLHUP) != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
            });
        }
        Ok(())
    }
}
