//! Cross-thread wakeup signal.
//!
//! Any thread — a worker finishing a job, code calling in from outside the
//! loop thread — needs a way to nudge the loop out of a blocking wait. On
//! Unix that's a self-pipe: a byte written to one end becomes readability on
//! the other, which every backend already knows how to wait on. On Windows
//! it's a completion packet posted straight to the IOCP port. Both sides
//! coalesce: multiple `send()` calls between wakeups collapse into one,
//! which is what keeps a busy worker pool from flooding the loop with
//! redundant pipe writes (`SPEC_FULL.md` §4.6, "coalescing semantics").
//!
//! The self-pipe shape is grounded on the pack's signal-delivery `Waker`
//! (`other_examples/.../signal-hook-src-iterator.rs`): a pending flag plus a
//! byte funneled through a pipe pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Result;

#[cfg(unix)]
mod imp {
    use std::os::unix::io::RawFd;

    use crate::error::{Error, Result};

    pub(super) struct Platform {
        pub(super) read_fd: RawFd,
        pub(super) write_fd: RawFd,
    }

    impl Platform {
        pub(super) fn new() -> Result<Self> {
            let mut fds = [0i32; 2];
            // SAFETY: `fds` is a valid 2-element out-buffer.
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc != 0 {
                return Err(Error::from(std::io::Error::last_os_error()));
            }
            for fd in fds {
                // SAFETY: `fd` was just created by `pipe` above.
                unsafe {
                    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                    let fdflags = libc::fcntl(fd, libc::F_GETFD, 0);
                    libc::fcntl(fd, libc::F_SETFD, fdflags | libc::FD_CLOEXEC);
                }
            }
            Ok(Platform {
                read_fd: fds[0],
                write_fd: fds[1],
            })
        }

        pub(super) fn signal(&self) {
            let byte = [1u8];
            // SAFETY: `write_fd` is open for the lifetime of `self`; a short
            // write to a pipe of one byte cannot partially complete.
            unsafe {
                libc::write(self.write_fd, byte.as_ptr() as *const _, 1);
            }
        }

        pub(super) fn drain(&self) {
            let mut buf = [0u8; 64];
            loop {
                // SAFETY: `buf` is a valid 64-byte out-buffer, `read_fd` is
                // non-blocking so this returns rather than stalling once
                // drained.
                let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
                if n <= 0 {
                    break;
                }
            }
        }
    }

    impl Drop for Platform {
        fn drop(&mut self) {
            // SAFETY: both fds are owned exclusively by this struct.
            unsafe {
                libc::close(self.read_fd);
                libc::close(self.write_fd);
            }
        }
    }
}

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

    use crate::error::{Error, Result};

    pub(super) const WAKEUP_KEY: usize = usize::MAX;

    pub(super) struct Platform {
        port: HANDLE,
    }

    impl Platform {
        pub(super) fn new(port: HANDLE) -> Result<Self> {
            Ok(Platform { port })
        }

        pub(super) fn signal(&self) {
            // SAFETY: `port` outlives this call; a null OVERLAPPED pointer is
            // the documented way to post a packet with no associated I/O.
            unsafe {
                PostQueuedCompletionStatus(self.port, 0, WAKEUP_KEY, std::ptr::null_mut());
            }
        }

        pub(super) fn drain(&self) {
            // Nothing to drain: the completion packet itself was the signal
            // and GetQueuedCompletionStatusEx already consumed it.
        }
    }
}

struct Inner {
    pending: AtomicBool,
    platform: Option<imp::Platform>,
    test_sink: Option<std::sync::mpsc::Sender<()>>,
}

/// The loop-owned side: registered with the backend, drained whenever the
/// loop wakes from a wait.
pub struct Wakeup {
    inner: Arc<Inner>,
}

/// A cloneable handle any thread can use to wake the loop up.
#[derive(Clone)]
pub struct WakeupSender {
    inner: Arc<Inner>,
}

impl Wakeup {
    #[cfg(unix)]
    pub fn new() -> Result<Self> {
        let platform = imp::Platform::new()?;
        Ok(Wakeup {
            inner: Arc::new(Inner {
                pending: AtomicBool::new(false),
                platform: Some(platform),
                test_sink: None,
            }),
        })
    }

    #[cfg(windows)]
    pub fn new(port: windows_sys::Win32::Foundation::HANDLE) -> Result<Self> {
        let platform = imp::Platform::new(port)?;
        Ok(Wakeup {
            inner: Arc::new(Inner {
                pending: AtomicBool::new(false),
                platform: Some(platform),
                test_sink: None,
            }),
        })
    }

    #[cfg(unix)]
    pub(crate) fn read_fd(&self) -> std::os::unix::io::RawFd {
        self.inner.platform.as_ref().unwrap().read_fd
    }

    /// The write end of the self-pipe, for wiring a signal handler (SIGCHLD)
    /// to nudge the loop directly — `write(2)` is async-signal-safe, unlike
    /// anything that would need to go through [`WakeupSender::send`]'s
    /// atomic flag.
    #[cfg(unix)]
    pub(crate) fn write_fd(&self) -> std::os::unix::io::RawFd {
        self.inner.platform.as_ref().unwrap().write_fd
    }

    pub fn sender(&self) -> WakeupSender {
        WakeupSender {
            inner: self.inner.clone(),
        }
    }

    /// Clears the pending flag and drains the OS-level signal. Call once per
    /// loop iteration after waking from the backend wait.
    pub fn consume(&self) -> bool {
        let was_pending = self.inner.pending.swap(false, Ordering::SeqCst);
        if was_pending {
            if let Some(platform) = &self.inner.platform {
                platform.drain();
            }
        }
        was_pending
    }
}

impl WakeupSender {
    /// A sender with no real OS backing, useful for unit-testing subsystems
    /// (like the worker pool) that only need to observe "a wakeup happened".
    pub fn channel(tx: std::sync::mpsc::Sender<()>) -> Self {
        WakeupSender {
            inner: Arc::new(Inner {
                pending: AtomicBool::new(false),
                platform: None,
                test_sink: Some(tx),
            }),
        }
    }

    /// Signal the loop. Coalesces: a send that lands while a previous one is
    /// still unconsumed is a no-op.
    pub fn send(&self) {
        if self.inner.pending.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(platform) = &self.inner.platform {
            platform.signal();
        }
        if let Some(sink) = &self.inner.test_sink {
            let _ = sink.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_sends_coalesce() {
        let (tx, rx) = std::sync::mpsc::channel();
        let sender = WakeupSender::channel(tx);
        sender.send();
        sender.send();
        sender.send();
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn consume_clears_pending_and_drains_pipe() {
        let wakeup = Wakeup::new().unwrap();
        let sender = wakeup.sender();
        sender.send();
        assert!(wakeup.consume());
        assert!(!wakeup.consume());
    }
}
