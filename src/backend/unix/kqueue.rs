use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::backend::{Event, Interest, RawToken};
use crate::error::{Error, Result};
use crate::handle::HandleId;

pub(super) struct Kqueue {
    kq: RawFd,
}

fn changelist(token: RawToken, id: HandleId, interest: Interest, enable: bool) -> Vec<libc::kevent> {
    let flags = if enable {
        libc::EV_ADD | libc::EV_RECEIPT
    } else {
        libc::EV_DELETE | libc::EV_RECEIPT
    };
    let mut changes = Vec::with_capacity(2);
    let udata = id.0 as *mut libc::c_void;
    if interest.contains(Interest::READABLE) || !enable {
        changes.push(libc::kevent {
            ident: token as usize,
            filter: libc::EVFILT_READ,
            flags,
            fflags: 0,
            data: 0,
            udata,
        });
    }
    if interest.contains(Interest::WRITABLE) || !enable {
        changes.push(libc::kevent {
            ident: token as usize,
            filter: libc::EVFILT_WRITE,
            flags,
            fflags: 0,
            data: 0,
            udata,
        });
    }
    changes
}

impl Kqueue {
    pub(super) fn new() -> Result<Self> {
        // SAFETY: no preconditions.
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(Kqueue { kq })
    }

    fn apply(&mut self, mut changes: Vec<libc::kevent>) -> Result<()> {
        // SAFETY: `changes` is a live buffer sized to hold its own receipts;
        // kqueue writes acknowledgements back into the same slice in place.
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                changes.as_mut_ptr(),
                changes.len() as i32,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        for change in &changes {
            // EV_RECEIPT reports per-change errors via `data` when `flags`
            // carries EV_ERROR; a non-zero `data` that isn't ENOENT/EEXIST
            // (benign on add-over-add / delete-of-unregistered) is real.
            if change.flags & libc::EV_ERROR != 0
                && change.data != 0
                && change.data != libc::ENOENT as isize
                && change.data != libc::EEXIST as isize
            {
                return Err(Error::with_raw(crate::error::Code::Eio, change.data as i32));
            }
        }
        Ok(())
    }

    pub(super) fn add(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        self.apply(changelist(token, id, interest, true))
    }

    pub(super) fn modify(&mut self, token: RawToken, id: HandleId, interest: Interest) -> Result<()> {
        // kqueue has no atomic "replace interest"; drop both filters and
        // re-add the ones that are wanted now.
        let _ = self.apply(changelist(token, id, Interest::all(), false));
        self.apply(changelist(token, id, interest, true))
    }

    pub(super) fn remove(&mut self, token: RawToken) -> Result<()> {
        self.apply(changelist(token, HandleId(0), Interest::all(), false))
    }

    pub(super) fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |t| t as *const _);
        let mut raw: [libc::kevent; 256] = unsafe { std::mem::zeroed() };
        // SAFETY: `raw` outlives the call and matches the `nevents` bound.
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                raw.as_mut_ptr(),
                raw.len() as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::from(err));
        }
        for ev in &raw[..n as usize] {
            events.push(Event {
                id: HandleId(ev.udata as usize),
                readable: ev.filter == libc::EVFILT_READ,
                writable: ev.filter == libc::EVFILT_WRITE,
                error: ev.flags & libc::EV_ERROR != 0,
            });
        }
        Ok(())
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        // SAFETY: `kq` is only ever closed here, once.
        unsafe {
            libc::close(self.kq);
        }
    }
}
