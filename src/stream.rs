//! Duplex stream engine shared by TCP, pipes, and anything else byte-stream
//! shaped.
//!
//! The engine itself is transport agnostic: it does the bookkeeping around
//! `read_start`/`read_stop`, a FIFO write queue with partial-write offset
//! tracking, half-close, and listen/accept back-pressure. The transport
//! (`std::net::TcpStream`, a named pipe, ...) only has to provide
//! non-blocking `Read`/`Write`; the concrete handle types in `r#loop.rs`
//! plug a real socket in and drive this engine off backend readiness
//! events. This split mirrors the teacher's `io::drive::Drive<H, D>`, which
//! separates the OS-facing read/write driver from the handle it drives.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};

use crate::error::{Code, Error, Result};
use crate::handle::Flags;

/// One queued write. `offset` tracks how much of `data` a partial write has
/// already consumed, so a stream that can only accept part of a buffer on a
/// given `write(2)` doesn't lose or resend bytes.
struct WriteJob {
    data: Bytes,
    offset: usize,
    cb: Box<dyn FnOnce(Result<()>)>,
}

/// Per-connection read/write state, independent of the underlying
/// transport.
pub struct StreamState {
    flags: Flags,
    write_queue: VecDeque<WriteJob>,
    alloc_cb: Option<Box<dyn FnMut(usize) -> BytesMut>>,
    read_cb: Option<Box<dyn FnMut(Result<Bytes>)>>,
    accept_backlog: usize,
    pending_accepts: VecDeque<()>,
}

/// Outcome of driving writes far enough to either drain the queue or hit
/// `EWOULDBLOCK`.
pub enum WriteProgress {
    Drained,
    WouldBlock,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState {
            flags: Flags::default(),
            write_queue: VecDeque::new(),
            alloc_cb: None,
            read_cb: None,
            accept_backlog: 128,
            pending_accepts: VecDeque::new(),
        }
    }
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn is_reading(&self) -> bool {
        self.read_cb.is_some()
    }

    pub fn is_writable_pending(&self) -> bool {
        !self.write_queue.is_empty()
    }

    pub fn set_accept_backlog(&mut self, backlog: usize) {
        self.accept_backlog = backlog.max(1);
    }

    pub fn accept_backlog(&self) -> usize {
        self.accept_backlog
    }

    /// Arms read callbacks. Mirrors `uv_read_start`: idempotent re-arming is
    /// allowed, stopping is separate (`read_stop`).
    pub fn read_start(
        &mut self,
        alloc_cb: Box<dyn FnMut(usize) -> BytesMut>,
        read_cb: Box<dyn FnMut(Result<Bytes>)>,
    ) {
        self.alloc_cb = Some(alloc_cb);
        self.read_cb = Some(read_cb);
        self.flags.insert(Flags::ACTIVE);
    }

    pub fn read_stop(&mut self) {
        self.alloc_cb = None;
        self.read_cb = None;
        self.flags.remove(Flags::ACTIVE);
    }

    /// Queue a write. Ordering is FIFO: this job will not start until every
    /// job ahead of it has fully drained, even if this call races with an
    /// in-progress partial write.
    pub fn queue_write(&mut self, data: Bytes, cb: Box<dyn FnOnce(Result<()>)>) {
        self.write_queue.push_back(WriteJob {
            data,
            offset: 0,
            cb,
        });
        self.flags.insert(Flags::WRITE_PENDING);
    }

    /// Drive queued writes against `sink` until the queue drains or a write
    /// would block. Each job's callback fires the moment its bytes are
    /// fully accepted by the transport, not when the whole queue drains.
    pub fn drive_writes<W: Write>(&mut self, sink: &mut W) -> Result<WriteProgress> {
        while let Some(job) = self.write_queue.front_mut() {
            match sink.write(&job.data[job.offset..]) {
                Ok(0) => {
                    let job = self.write_queue.pop_front().unwrap();
                    (job.cb)(Err(Error::new(Code::Epipe)));
                }
                Ok(n) => {
                    job.offset += n;
                    if job.offset >= job.data.len() {
                        let job = self.write_queue.pop_front().unwrap();
                        (job.cb)(Ok(()));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteProgress::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // A hard error (reset, broken pipe, ...) poisons the
                    // whole connection: every queued write fails with it,
                    // not just the one in flight when it happened.
                    let err = Error::from(e);
                    for job in self.write_queue.drain(..) {
                        (job.cb)(Err(err));
                    }
                    self.flags.remove(Flags::WRITE_PENDING);
                    return Err(err);
                }
            }
        }
        self.flags.remove(Flags::WRITE_PENDING);
        Ok(WriteProgress::Drained)
    }

    /// Fail every queued write, e.g. when the handle is being closed with
    /// writes still outstanding.
    pub fn cancel_writes(&mut self, err: Error) {
        for job in self.write_queue.drain(..) {
            (job.cb)(Err(err));
        }
        self.flags.remove(Flags::WRITE_PENDING);
    }

    /// Drive reads off `source` until it would block, EOFs, or errors.
    /// Returns after one `alloc`+`read` round: the caller re-invokes this
    /// once per readiness notification rather than looping to drain,
    /// matching level-triggered backends which will simply notify again.
    pub fn drive_read<R: Read>(&mut self, source: &mut R) {
        let Some(alloc_cb) = self.alloc_cb.as_mut() else {
            return;
        };
        let Some(read_cb) = self.read_cb.as_mut() else {
            return;
        };
        loop {
            let mut buf = alloc_cb(64 * 1024);
            if buf.capacity() == 0 {
                // alloc_cb declined to provide a buffer; treat as backpressure.
                return;
            }
            let spare = buf.spare_capacity_mut();
            // SAFETY: `read` only ever initializes a prefix of `spare` and we
            // truncate to exactly the bytes it reports reading.
            let spare = unsafe {
                std::slice::from_raw_parts_mut(spare.as_mut_ptr() as *mut u8, spare.len())
            };
            match source.read(spare) {
                Ok(0) => {
                    self.flags.insert(Flags::EOF);
                    read_cb(Err(Error::eof()));
                    return;
                }
                Ok(n) => {
                    // SAFETY: `n` bytes were just initialized by `read`.
                    unsafe { buf.set_len(buf.len() + n) };
                    read_cb(Ok(buf.freeze()));
                    if n < spare.len() {
                        // Short read: likely drained the socket for now.
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    read_cb(Err(Error::from(e)));
                    return;
                }
            }
        }
    }

    /// Begin a half-close: no more writes may be queued, but reads continue
    /// until the peer EOFs or the whole handle is closed.
    pub fn shutdown(&mut self) {
        self.flags.insert(Flags::SHUTTING);
    }

    pub fn is_shutting(&self) -> bool {
        self.flags.contains(Flags::SHUTTING)
    }

    pub fn mark_listening(&mut self, backlog: usize) {
        self.set_accept_backlog(backlog);
        self.flags.insert(Flags::LISTENING | Flags::ACTIVE);
    }

    pub fn is_listening(&self) -> bool {
        self.flags.contains(Flags::LISTENING)
    }

    /// Record an accept that arrived while the backlog was full; it is
    /// served once a slot frees up (`take_pending_accept`).
    pub fn queue_pending_accept(&mut self) -> bool {
        if self.pending_accepts.len() >= self.accept_backlog {
            return false;
        }
        self.pending_accepts.push_back(());
        true
    }

    pub fn take_pending_accept(&mut self) -> bool {
        self.pending_accepts.pop_front().is_some()
    }

    pub fn mark_connected(&mut self) {
        self.flags.insert(Flags::CONNECTED | Flags::READABLE | Flags::WRITABLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct ChunkedWriter {
        accepted: Vec<u8>,
        max_per_call: usize,
    }

    impl Write for ChunkedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.max_per_call);
            self.accepted.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writes_complete_in_fifo_order_across_partial_writes() {
        let mut state = StreamState::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..3u8 {
            let order = order.clone();
            state.queue_write(Bytes::from(vec![tag; 10]), Box::new(move |res| {
                assert!(res.is_ok());
                order.borrow_mut().push(tag);
            }));
        }

        let mut sink = ChunkedWriter {
            accepted: Vec::new(),
            max_per_call: 4,
        };
        loop {
            match state.drive_writes(&mut sink).unwrap() {
                WriteProgress::Drained => break,
                WriteProgress::WouldBlock => unreachable!("writer never blocks in this test"),
            }
        }

        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(sink.accepted.len(), 30);
    }

    struct BrokenPipeWriter;

    impl Write for BrokenPipeWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn hard_write_error_fails_every_queued_job_not_just_the_head() {
        let mut state = StreamState::new();
        let failures = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let failures = failures.clone();
            state.queue_write(Bytes::from_static(b"x"), Box::new(move |res| {
                assert!(res.is_err());
                *failures.borrow_mut() += 1;
            }));
        }
        let mut sink = BrokenPipeWriter;
        assert!(state.drive_writes(&mut sink).is_err());
        assert_eq!(*failures.borrow(), 3);
        assert!(!state.is_writable_pending());
    }

    #[test]
    fn cancel_writes_fails_every_pending_job() {
        let mut state = StreamState::new();
        let failures = Rc::new(RefCell::new(0));
        for _ in 0..3 {
            let failures = failures.clone();
            state.queue_write(Bytes::from_static(b"x"), Box::new(move |res| {
                assert!(res.is_err());
                *failures.borrow_mut() += 1;
            }));
        }
        state.cancel_writes(Error::cancelled());
        assert_eq!(*failures.borrow(), 3);
        assert!(!state.is_writable_pending());
    }

    #[test]
    fn accept_backlog_rejects_beyond_capacity() {
        let mut state = StreamState::new();
        state.mark_listening(2);
        assert!(state.queue_pending_accept());
        assert!(state.queue_pending_accept());
        assert!(!state.queue_pending_accept());
        assert!(state.take_pending_accept());
        assert!(state.queue_pending_accept());
    }
}
