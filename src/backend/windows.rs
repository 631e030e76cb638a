//! I/O completion port backend.
//!
//! IOCP reports completed operations, not readiness, so this backend can't
//! tell a caller "the socket is readable" the way epoll/kqueue/poll can —
//! only "the read you queued finished". It marks both `readable` and
//! `writable` on every completion and leaves it to the stream engine (which
//! already knows which operation it queued against this handle) to
//! interpret that; the same shortcut the pack's other IOCP `Poller`
//! (`other_examples/.../selenia_core-src-os-iocp.rs`) takes, and the
//! approach the teacher's `io/overlapped.rs` `Overlapped` wrapper is built
//! around.

use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, OVERLAPPED, OVERLAPPED_ENTRY,
};

use crate::backend::{Backend, Event, Interest, RawToken};
use crate::error::{Error, Result};
use crate::handle::HandleId;

extern "system" {
    fn GetQueuedCompletionStatusEx(
        completionport: HANDLE,
        lpcompletionportentries: *mut OVERLAPPED_ENTRY,
        ulcount: u32,
        ulnumentriesremoved: *mut u32,
        dwmilliseconds: u32,
        falertable: i32,
    ) -> i32;
}

pub struct IocpBackend {
    port: HANDLE,
}

// SAFETY: the completion port handle has no thread affinity; Win32 allows
// any thread to wait on or post to it.
unsafe impl Send for IocpBackend {}

impl IocpBackend {
    /// The raw completion port, needed by [`crate::wakeup::Wakeup`] to post
    /// its own wakeup packets directly to the same port this backend waits
    /// on.
    pub(crate) fn raw_port(&self) -> HANDLE {
        self.port
    }
}

impl Backend for IocpBackend {
    fn new() -> Result<Self> {
        // SAFETY: `INVALID_HANDLE_VALUE` with a null existing port asks the
        // kernel to create a fresh completion port.
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 0) };
        if port == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(IocpBackend { port })
    }

    fn add(&mut self, token: RawToken, id: HandleId, _interest: Interest) -> Result<()> {
        // SAFETY: `token` is a caller-owned, open socket handle; associating
        // it with the port does not take ownership.
        let result =
            unsafe { CreateIoCompletionPort(token as isize as HANDLE, self.port, id.0, 0) };
        if result == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn modify(&mut self, _token: RawToken, _id: HandleId, _interest: Interest) -> Result<()> {
        // IOCP readiness is driven by outstanding overlapped operations, not
        // a subscribed interest mask; there is nothing to change here.
        Ok(())
    }

    fn remove(&mut self, _token: RawToken) -> Result<()> {
        // A handle is disassociated from its port automatically when closed.
        Ok(())
    }

    fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<()> {
        let timeout_ms = match timeout {
            None => u32::MAX,
            Some(d) => u32::try_from(d.as_millis()).unwrap_or(u32::MAX),
        };
        let mut entries: [OVERLAPPED_ENTRY; 256] = unsafe { std::mem::zeroed() };
        let mut removed: u32 = 0;
        // SAFETY: `entries` is a live buffer sized to `entries.len()`.
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };
        if ok == 0 {
            let err = std::io::Error::last_os_error();
            // WAIT_TIMEOUT just means nothing completed in time.
            if err.raw_os_error() == Some(258) {
                return Ok(());
            }
            return Err(Error::from(err));
        }
        for entry in &entries[..removed as usize] {
            events.push(Event {
                id: HandleId(entry.lpCompletionKey),
                readable: true,
                writable: true,
                error: false,
            });
        }
        Ok(())
    }
}

impl Drop for IocpBackend {
    fn drop(&mut self) {
        // SAFETY: `port` is only ever closed here, once.
        unsafe {
            CloseHandle(self.port);
        }
    }
}

/// Wraps a Win32 `OVERLAPPED` for one in-flight async operation, the same
/// role the teacher's `io::overlapped::Overlapped` plays: the kernel writes
/// completion status into the struct asynchronously, so it must be heap
/// allocated and outlive the call until the matching completion packet
/// arrives.
#[repr(C)]
pub struct Overlapped {
    raw: OVERLAPPED,
}

impl Overlapped {
    pub fn new() -> Box<Self> {
        Box::new(Overlapped {
            raw: unsafe { std::mem::zeroed() },
        })
    }

    pub fn as_mut_ptr(self: &mut Box<Self>) -> *mut OVERLAPPED {
        &mut self.raw as *mut OVERLAPPED
    }
}
