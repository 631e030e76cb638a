//! The event loop: owns every handle, drives the ten-phase iteration, and
//! is the only thing in this crate allowed to block.
//!
//! Handles live in a `slab::Slab<HandleSlot>` rather than being referenced
//! by pointer the way the library this is modeled on does it — a `Loop`
//! owns its handles by value, callers hold a `Copy` [`HandleId`], and there
//! is no lifetime tangle between "the handle points back at its loop" and
//! "the loop owns the handle" (`SPEC_FULL.md` §9, resolved open question on
//! the handle/loop relationship).

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use slab::Slab;

use crate::backend::{Backend, Interest, RawToken, SysBackend};
use crate::error::{Code, Error, Result};
use crate::handle::{Flags, HandleId, HandleKind};
use crate::process::{ExitStatus, ProcessOptions};
use crate::request::{RequestId, RequestIdGen};
use crate::stream::{StreamState, WriteProgress};
use crate::timer::{TimerHeap, TimerOptions};
use crate::wakeup::Wakeup;
use crate::work::WorkerPool;

#[cfg(unix)]
use crate::process::Reaper;

pub struct LoopOptions {
    /// Number of worker threads backing [`crate::work`] submissions.
    pub worker_threads: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        LoopOptions { worker_threads: 4 }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RunMode {
    /// Run until there are no more active handles/requests.
    Default,
    /// Run one iteration, blocking if nothing is immediately ready.
    Once,
    /// Run one iteration without blocking at all.
    NoWait,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RunResult {
    /// The loop had nothing to do (no active handles/requests).
    NothingToDo,
    /// The loop is still alive; call `run` again to keep servicing it.
    ReadyAgain,
}

type TimerCb = Box<dyn FnMut(HandleId)>;
type LoopCb = Box<dyn FnMut()>;
type ReadCb = Box<dyn FnMut(Result<Bytes>)>;
type AllocCb = Box<dyn FnMut(usize) -> BytesMut>;
type ConnectionCb = Box<dyn FnMut(Result<()>)>;
type AsyncCb = Box<dyn FnMut()>;
type ExitCb = Box<dyn FnMut(ExitStatus)>;

struct TcpSlot {
    stream: std::net::TcpStream,
    state: StreamState,
    token: RawToken,
}

struct ListenerSlot {
    listener: std::net::TcpListener,
    token: RawToken,
    state: StreamState,
    connection_cb: Option<ConnectionCb>,
    /// Accepted sockets not yet claimed by `tcp_accept`.
    pending: VecDeque<std::net::TcpStream>,
    /// Set when the backlog filled and the listener was deregistered from
    /// the backend; cleared and re-registered by `tcp_accept` once a slot
    /// frees up.
    accept_paused: bool,
}

struct ProcessSlot {
    pid: crate::process::Pid,
    exit_cb: Option<ExitCb>,
    #[cfg(windows)]
    process_handle: windows_sys::Win32::Foundation::HANDLE,
}

enum HandleSlot {
    Timer {
        flags: Flags,
        cb: TimerCb,
    },
    Idle {
        flags: Flags,
        cb: LoopCb,
    },
    Prepare {
        flags: Flags,
        cb: LoopCb,
    },
    Check {
        flags: Flags,
        cb: LoopCb,
    },
    Async {
        flags: Flags,
        cb: AsyncCb,
    },
    Tcp(TcpSlot),
    TcpListener(ListenerSlot),
    Process(ProcessSlot),
    /// Left behind by `close`; reclaimed once close processing runs. Carries
    /// whatever the backend needs to unregister (`token`) and the close
    /// callback to fire once that's done.
    Closing(Flags, HandleKind, Option<RawToken>, Option<Box<dyn FnOnce()>>),
}

impl HandleSlot {
    fn flags(&self) -> Flags {
        match self {
            HandleSlot::Timer { flags, .. }
            | HandleSlot::Idle { flags, .. }
            | HandleSlot::Prepare { flags, .. }
            | HandleSlot::Check { flags, .. }
            | HandleSlot::Async { flags, .. } => *flags,
            HandleSlot::Tcp(slot) => slot.state.flags(),
            HandleSlot::TcpListener(slot) => slot.state.flags(),
            HandleSlot::Process(_) => Flags::ACTIVE | Flags::REF,
            HandleSlot::Closing(flags, ..) => *flags,
        }
    }

    fn kind(&self) -> HandleKind {
        match self {
            HandleSlot::Timer { .. } => HandleKind::Timer,
            HandleSlot::Idle { .. } => HandleKind::Idle,
            HandleSlot::Prepare { .. } => HandleKind::Prepare,
            HandleSlot::Check { .. } => HandleKind::Check,
            HandleSlot::Async { .. } => HandleKind::Async,
            HandleSlot::Tcp(_) => HandleKind::Tcp,
            HandleSlot::TcpListener(_) => HandleKind::Tcp,
            HandleSlot::Process(_) => HandleKind::Process,
            HandleSlot::Closing(_, kind, ..) => *kind,
        }
    }
}

/// A single-threaded event loop. Not `Send`/`Sync`: everything but
/// [`crate::wakeup::WakeupSender`] and [`crate::work::WorkerPool`]
/// submission is meant to be touched from one thread only.
pub struct Loop {
    handles: Slab<HandleSlot>,
    timers: TimerHeap,
    backend: SysBackend,
    wakeup: Wakeup,
    worker_pool: WorkerPool,
    request_ids: RequestIdGen,
    #[cfg(unix)]
    reaper: Reaper,
    /// Exit statuses pushed by per-child `watch_exit` threads; drained once
    /// per iteration the same way `reap_children` drains the SIGCHLD sweep.
    #[cfg(windows)]
    process_exits: std::sync::Arc<crossbeam::queue::SegQueue<(crate::process::Pid, ExitStatus)>>,
    /// Closed this iteration or earlier; fired and reclaimed in phase 10.
    close_queue: VecDeque<HandleId>,
    /// Closed during the iteration currently running; promoted into
    /// `close_queue` at the top of the *next* iteration, so a close
    /// requested from inside a callback always fires its callback in a
    /// later iteration rather than the same one.
    pending_close: VecDeque<HandleId>,
    stop_requested: bool,
    now: u64,
    start: Instant,
}

impl Loop {
    pub fn new() -> Result<Self> {
        Self::with_options(LoopOptions::default())
    }

    pub fn with_options(opts: LoopOptions) -> Result<Self> {
        let backend = SysBackend::new()?;
        #[cfg(unix)]
        let wakeup = Wakeup::new()?;
        #[cfg(windows)]
        let wakeup = Wakeup::new(backend.raw_port())?;
        let worker_pool = WorkerPool::new(opts.worker_threads, wakeup.sender());
        let mut loop_ = Loop {
            handles: Slab::new(),
            timers: TimerHeap::new(),
            backend,
            wakeup,
            worker_pool,
            request_ids: RequestIdGen::default(),
            #[cfg(unix)]
            reaper: Reaper::new(),
            #[cfg(windows)]
            process_exits: std::sync::Arc::new(crossbeam::queue::SegQueue::new()),
            close_queue: VecDeque::new(),
            pending_close: VecDeque::new(),
            stop_requested: false,
            now: 0,
            start: Instant::now(),
        };
        loop_.register_wakeup()?;
        #[cfg(unix)]
        crate::process::install_sigchld_handler(loop_.wakeup.write_fd());
        Ok(loop_)
    }

    #[cfg(unix)]
    fn register_wakeup(&mut self) -> Result<()> {
        self.backend
            .add(self.wakeup.read_fd(), HandleId(usize::MAX), Interest::READABLE)
    }

    #[cfg(windows)]
    fn register_wakeup(&mut self) -> Result<()> {
        // The Windows wakeup posts directly to the IOCP port with a
        // reserved completion key; there is no separate registration step.
        Ok(())
    }

    fn update_time(&mut self) {
        self.now = self.start.elapsed().as_millis() as u64;
    }

    fn next_request_id(&mut self) -> RequestId {
        self.request_ids.next()
    }

    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    // ---- Timers ----------------------------------------------------

    pub fn timer_start(
        &mut self,
        opts: TimerOptions,
        cb: impl FnMut(HandleId) + 'static,
    ) -> HandleId {
        let id = HandleId(self.handles.insert(HandleSlot::Timer {
            flags: Flags::default() | Flags::ACTIVE,
            cb: Box::new(cb),
        }));
        self.timers.start(id, self.now, opts);
        id
    }

    pub fn timer_stop(&mut self, id: HandleId) {
        self.timers.remove(id);
        if let Some(HandleSlot::Timer { flags, .. }) = self.handles.get_mut(id.0) {
            flags.remove(Flags::ACTIVE);
        }
    }

    pub fn timer_again(&mut self, id: HandleId) -> bool {
        self.timers.again(id, self.now)
    }

    // ---- Idle / prepare / check -------------------------------------

    pub fn idle_start(&mut self, cb: impl FnMut() + 'static) -> HandleId {
        HandleId(self.handles.insert(HandleSlot::Idle {
            flags: Flags::default() | Flags::ACTIVE,
            cb: Box::new(cb),
        }))
    }

    pub fn prepare_start(&mut self, cb: impl FnMut() + 'static) -> HandleId {
        HandleId(self.handles.insert(HandleSlot::Prepare {
            flags: Flags::default() | Flags::ACTIVE,
            cb: Box::new(cb),
        }))
    }

    pub fn check_start(&mut self, cb: impl FnMut() + 'static) -> HandleId {
        HandleId(self.handles.insert(HandleSlot::Check {
            flags: Flags::default() | Flags::ACTIVE,
            cb: Box::new(cb),
        }))
    }

    // ---- Async wakeup ------------------------------------------------

    pub fn async_start(&mut self, cb: impl FnMut() + 'static) -> (HandleId, crate::wakeup::WakeupSender) {
        let id = HandleId(self.handles.insert(HandleSlot::Async {
            flags: Flags::default() | Flags::ACTIVE,
            cb: Box::new(cb),
        }));
        (id, self.wakeup.sender())
    }

    // ---- Work pool -----------------------------------------------------

    pub fn queue_work(
        &mut self,
        work: impl FnOnce() -> Result<Box<dyn std::any::Any + Send>> + Send + 'static,
        after: impl FnOnce(Result<Box<dyn std::any::Any + Send>>) + Send + 'static,
    ) {
        let id = self.next_request_id();
        self.worker_pool.submit(id, work, after);
    }

    // ---- Process -------------------------------------------------------

    #[cfg(unix)]
    pub fn spawn(&mut self, opts: &ProcessOptions, exit_cb: impl FnMut(ExitStatus) + 'static) -> Result<HandleId> {
        let child = crate::process::spawn(opts)?;
        tracing::debug!(pid = child.pid, file = %opts.file, "spawned child process");
        self.reaper.track(child.pid);
        let id = HandleId(self.handles.insert(HandleSlot::Process(ProcessSlot {
            pid: child.pid,
            exit_cb: Some(Box::new(exit_cb)),
        })));
        Ok(id)
    }

    #[cfg(windows)]
    pub fn spawn(&mut self, opts: &ProcessOptions, exit_cb: impl FnMut(ExitStatus) + 'static) -> Result<HandleId> {
        let child = crate::process::spawn(opts)?;
        crate::process::watch_exit(
            child.process_handle,
            child.pid,
            self.process_exits.clone(),
            self.wakeup.sender(),
        );
        let id = HandleId(self.handles.insert(HandleSlot::Process(ProcessSlot {
            pid: child.pid,
            exit_cb: Some(Box::new(exit_cb)),
            process_handle: child.process_handle,
        })));
        Ok(id)
    }

    pub fn process_kill(&mut self, id: HandleId, signum: i32) -> Result<()> {
        #[cfg(unix)]
        {
            let pid = match self.handles.get(id.0) {
                Some(HandleSlot::Process(slot)) => slot.pid,
                _ => return Err(Error::new(Code::Ebadf)),
            };
            crate::process::kill(pid, signum)
        }
        #[cfg(windows)]
        {
            let process_handle = match self.handles.get(id.0) {
                Some(HandleSlot::Process(slot)) => slot.process_handle,
                _ => return Err(Error::new(Code::Ebadf)),
            };
            crate::process::signal(process_handle, signum)
        }
    }

    // ---- TCP -------------------------------------------------------------

    #[cfg(unix)]
    pub fn tcp_connect(&mut self, addr: std::net::SocketAddr) -> Result<HandleId> {
        use std::os::unix::io::AsRawFd;
        let stream = std::net::TcpStream::connect(addr).map_err(Error::from)?;
        stream.set_nonblocking(true).map_err(Error::from)?;
        let token = stream.as_raw_fd();
        let mut state = StreamState::new();
        state.mark_connected();
        let id = HandleId(self.handles.insert(HandleSlot::Tcp(TcpSlot {
            stream,
            state,
            token,
        })));
        self.backend.add(token, id, Interest::READABLE | Interest::WRITABLE)?;
        Ok(id)
    }

    #[cfg(unix)]
    pub fn tcp_listen(
        &mut self,
        addr: std::net::SocketAddr,
        backlog: usize,
        connection_cb: impl FnMut(Result<()>) + 'static,
    ) -> Result<HandleId> {
        use std::os::unix::io::AsRawFd;
        let listener = std::net::TcpListener::bind(addr).map_err(Error::from)?;
        listener.set_nonblocking(true).map_err(Error::from)?;
        let token = listener.as_raw_fd();
        let mut state = StreamState::new();
        state.mark_listening(backlog);
        let id = HandleId(self.handles.insert(HandleSlot::TcpListener(ListenerSlot {
            listener,
            token,
            state,
            connection_cb: Some(Box::new(connection_cb)),
            pending: VecDeque::new(),
            accept_paused: false,
        })));
        self.backend.add(token, id, Interest::READABLE)?;
        Ok(id)
    }

    /// Claims one connection the engine already accepted off the kernel
    /// backlog and queued for delivery. Returns `None` if nothing is
    /// queued, which can happen if another `tcp_accept` call already
    /// drained it.
    #[cfg(unix)]
    pub fn tcp_accept(&mut self, listener_id: HandleId) -> Result<Option<HandleId>> {
        let stream = match self.handles.get_mut(listener_id.0) {
            Some(HandleSlot::TcpListener(slot)) => {
                let stream = slot.pending.pop_front();
                if stream.is_some() {
                    slot.state.take_pending_accept();
                }
                stream
            }
            _ => return Err(Error::new(Code::Ebadf)),
        };
        let Some(stream) = stream else {
            return Ok(None);
        };

        // A slot just freed up; re-arm the backend if back-pressure had
        // paused the listener.
        if let Some(HandleSlot::TcpListener(slot)) = self.handles.get_mut(listener_id.0) {
            if slot.accept_paused && slot.pending.len() < slot.state.accept_backlog() {
                slot.accept_paused = false;
                let token = slot.token;
                let _ = self.backend.modify(token, listener_id, Interest::READABLE);
            }
        }

        use std::os::unix::io::AsRawFd;
        stream.set_nonblocking(true).map_err(Error::from)?;
        let token = stream.as_raw_fd();
        let mut state = StreamState::new();
        state.mark_connected();
        let id = HandleId(self.handles.insert(HandleSlot::Tcp(TcpSlot {
            stream,
            state,
            token,
        })));
        self.backend.add(token, id, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Some(id))
    }

    pub fn tcp_read_start(&mut self, id: HandleId, alloc_cb: AllocCb, read_cb: ReadCb) -> Result<()> {
        match self.handles.get_mut(id.0) {
            Some(HandleSlot::Tcp(slot)) => {
                slot.state.read_start(alloc_cb, read_cb);
                Ok(())
            }
            _ => Err(Error::new(Code::Ebadf)),
        }
    }

    pub fn tcp_read_stop(&mut self, id: HandleId) -> Result<()> {
        match self.handles.get_mut(id.0) {
            Some(HandleSlot::Tcp(slot)) => {
                slot.state.read_stop();
                Ok(())
            }
            _ => Err(Error::new(Code::Ebadf)),
        }
    }

    pub fn tcp_write(
        &mut self,
        id: HandleId,
        data: Bytes,
        cb: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        match self.handles.get_mut(id.0) {
            Some(HandleSlot::Tcp(slot)) => {
                slot.state.queue_write(data, Box::new(cb));
                let progress = slot.state.drive_writes(&mut slot.stream)?;
                if let WriteProgress::WouldBlock = progress {
                    self.backend
                        .modify(slot.token, id, Interest::READABLE | Interest::WRITABLE)?;
                }
                Ok(())
            }
            _ => Err(Error::new(Code::Ebadf)),
        }
    }

    /// The local address a listener or connected socket is bound to. Useful
    /// for looking up the real port after binding to `:0`.
    pub fn tcp_local_addr(&self, id: HandleId) -> Result<std::net::SocketAddr> {
        match self.handles.get(id.0) {
            Some(HandleSlot::Tcp(slot)) => slot.stream.local_addr().map_err(Error::from),
            Some(HandleSlot::TcpListener(slot)) => slot.listener.local_addr().map_err(Error::from),
            _ => Err(Error::new(Code::Ebadf)),
        }
    }

    pub fn tcp_shutdown(&mut self, id: HandleId) -> Result<()> {
        match self.handles.get_mut(id.0) {
            Some(HandleSlot::Tcp(slot)) => {
                slot.state.shutdown();
                slot.stream.shutdown(std::net::Shutdown::Write).ok();
                Ok(())
            }
            _ => Err(Error::new(Code::Ebadf)),
        }
    }

    /// Schedules `id` for close. `close_cb` fires exactly once, from phase 10
    /// of a later loop iteration than the one `close` was called from.
    ///
    /// Any write queued but not yet drained fails with [`Code::Ecancelled`];
    /// a listener with peers queued in its accept backlog gets its
    /// `connection_cb` fired once per queued peer, also with
    /// [`Code::Ecancelled`].
    pub fn close(&mut self, id: HandleId, close_cb: impl FnOnce() + 'static) {
        if let Some(slot) = self.handles.get_mut(id.0) {
            let mut flags = slot.flags();
            flags.insert(Flags::CLOSING);
            let kind = slot.kind();
            let token = match slot {
                HandleSlot::Tcp(tcp) => {
                    tcp.state.cancel_writes(Error::cancelled());
                    Some(tcp.token)
                }
                HandleSlot::TcpListener(listener) => {
                    while listener.pending.pop_front().is_some() {
                        listener.state.take_pending_accept();
                        if let Some(cb) = listener.connection_cb.as_mut() {
                            cb(Err(Error::cancelled()));
                        }
                    }
                    Some(listener.token)
                }
                _ => None,
            };
            let replaced = std::mem::replace(
                slot,
                HandleSlot::Closing(flags, kind, token, Some(Box::new(close_cb))),
            );
            drop(replaced);
            self.pending_close.push_back(id);
        }
    }

    /// Opts `id` out of contributing to loop liveness (`uv_unref`).
    /// Supported for the plain callback handles (timer/idle/prepare/check/
    /// async); streams and processes always ref their loop while active.
    pub fn handle_unref(&mut self, id: HandleId) {
        self.set_ref(id, false);
    }

    pub fn handle_ref(&mut self, id: HandleId) {
        self.set_ref(id, true);
    }

    fn set_ref(&mut self, id: HandleId, want_ref: bool) {
        let flags = match self.handles.get_mut(id.0) {
            Some(HandleSlot::Timer { flags, .. })
            | Some(HandleSlot::Idle { flags, .. })
            | Some(HandleSlot::Prepare { flags, .. })
            | Some(HandleSlot::Check { flags, .. })
            | Some(HandleSlot::Async { flags, .. }) => flags,
            _ => return,
        };
        flags.set(Flags::REF, want_ref);
    }

    // ---- Liveness ----------------------------------------------------

    fn is_alive(&self) -> bool {
        if self.handles.iter().any(|(_, slot)| slot.flags().keeps_loop_alive()) {
            return true;
        }
        if self.worker_pool.inflight() > 0 {
            return true;
        }
        !self.close_queue.is_empty() || !self.pending_close.is_empty()
    }

    // ---- The ten-phase iteration --------------------------------------

    /// Drive the loop according to `mode`. `Default` blocks until no active
    /// handle or request remains; `Once`/`NoWait` run exactly one iteration.
    pub fn run(&mut self, mode: RunMode) -> RunResult {
        loop {
            if !self.is_alive() {
                return RunResult::NothingToDo;
            }

            // Closes requested during the previous iteration's callbacks
            // become eligible for phase 10 of this one.
            self.close_queue.extend(self.pending_close.drain(..));

            // 1. Update time.
            self.update_time();

            // 2. Run expired timers.
            for id in self.timers.expire(self.now) {
                if let Some(HandleSlot::Timer { cb, .. }) = self.handles.get_mut(id.0) {
                    cb(id);
                }
            }

            // 3. Run pending I/O callbacks left over from a previous
            //    iteration's partial writes / queued accepts.
            self.run_pending_writes();

            // 4. Idle handles run every iteration they're active,
            //    regardless of backend readiness.
            self.run_idle();

            // 5. Prepare handles run right before the backend is polled.
            self.run_phase_callbacks(HandleKind::Prepare);

            // 6. Compute the block timeout: zero if idle handles are
            //    active or `mode` forbids blocking, otherwise the time to
            //    the next timer (capped at i32::MAX ms), otherwise forever.
            let timeout = self.compute_timeout(mode);

            // 7. Block in the backend.
            let mut events = Vec::new();
            if let Err(err) = self.backend.wait(&mut events, timeout) {
                tracing::warn!(?err, "backend wait failed");
            }

            // 8. Run I/O callbacks for whatever became ready.
            self.dispatch_events(events);

            // SIGCHLD-driven reaps piggyback on the same wakeup path.
            #[cfg(unix)]
            self.reap_children();
            #[cfg(windows)]
            self.reap_children_windows();

            self.worker_pool.run_completions();

            // 9. Check handles run right after I/O dispatch.
            self.run_phase_callbacks(HandleKind::Check);

            // 10. Close callbacks for anything queued via `close`.
            self.run_close_callbacks();

            if self.stop_requested || mode != RunMode::Default {
                break;
            }
        }

        if self.is_alive() {
            RunResult::ReadyAgain
        } else {
            RunResult::NothingToDo
        }
    }

    fn run_pending_writes(&mut self) {
        let ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter_map(|(k, slot)| match slot {
                HandleSlot::Tcp(s) if s.state.is_writable_pending() => Some(HandleId(k)),
                _ => None,
            })
            .collect();
        for id in ids {
            if let Some(HandleSlot::Tcp(slot)) = self.handles.get_mut(id.0) {
                let _ = slot.state.drive_writes(&mut slot.stream);
            }
        }
    }

    fn run_idle(&mut self) {
        self.run_phase_callbacks(HandleKind::Idle);
    }

    fn run_phase_callbacks(&mut self, kind: HandleKind) {
        let ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|(_, slot)| slot.kind() == kind && slot.flags().contains(Flags::ACTIVE))
            .map(|(k, _)| HandleId(k))
            .collect();
        for id in ids {
            match self.handles.get_mut(id.0) {
                Some(HandleSlot::Idle { cb, .. })
                | Some(HandleSlot::Prepare { cb, .. })
                | Some(HandleSlot::Check { cb, .. }) => cb(),
                _ => {}
            }
        }
    }

    fn compute_timeout(&self, mode: RunMode) -> Option<Duration> {
        if mode == RunMode::NoWait {
            return Some(Duration::ZERO);
        }
        let has_idle = self
            .handles
            .iter()
            .any(|(_, slot)| matches!(slot, HandleSlot::Idle { flags, .. } if flags.contains(Flags::ACTIVE)));
        if has_idle {
            return Some(Duration::ZERO);
        }
        self.timers.timeout(self.now).map(Duration::from_millis)
    }

    fn dispatch_events(&mut self, events: Vec<crate::backend::Event>) {
        for ev in events {
            if ev.id == HandleId(usize::MAX) {
                self.wakeup.consume();
                self.run_phase_callbacks(HandleKind::Async);
                continue;
            }
            self.dispatch_one(ev);
        }
    }

    fn dispatch_one(&mut self, ev: crate::backend::Event) {
        match self.handles.get_mut(ev.id.0) {
            Some(HandleSlot::Tcp(slot)) => {
                if ev.writable {
                    let _ = slot.state.drive_writes(&mut slot.stream);
                }
                if ev.readable {
                    slot.state.drive_read(&mut slot.stream);
                }
            }
            Some(HandleSlot::TcpListener(_)) => {
                if ev.readable {
                    self.drain_listener_accepts(ev.id);
                }
            }
            _ => {}
        }
    }

    /// Accepts off the kernel backlog in a loop until it would block,
    /// queuing each connection and firing `connection_cb` once per accept.
    /// If the queue fills up before the kernel backlog empties, the
    /// listener is deregistered from the backend (no more readability
    /// notifications) until `tcp_accept` frees a slot and re-arms it.
    fn drain_listener_accepts(&mut self, id: HandleId) {
        loop {
            let full = match self.handles.get(id.0) {
                Some(HandleSlot::TcpListener(slot)) => {
                    slot.pending.len() >= slot.state.accept_backlog()
                }
                _ => return,
            };
            if full {
                if let Some(HandleSlot::TcpListener(slot)) = self.handles.get(id.0) {
                    let token = slot.token;
                    let _ = self.backend.modify(token, id, Interest::empty());
                }
                if let Some(HandleSlot::TcpListener(slot)) = self.handles.get_mut(id.0) {
                    slot.accept_paused = true;
                }
                return;
            }

            let accept_result = match self.handles.get_mut(id.0) {
                Some(HandleSlot::TcpListener(slot)) => slot.listener.accept(),
                _ => return,
            };
            match accept_result {
                Ok((stream, _addr)) => {
                    if let Some(HandleSlot::TcpListener(slot)) = self.handles.get_mut(id.0) {
                        slot.state.queue_pending_accept();
                        slot.pending.push_back(stream);
                        if let Some(cb) = slot.connection_cb.as_mut() {
                            cb(Ok(()));
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if let Some(HandleSlot::TcpListener(slot)) = self.handles.get_mut(id.0) {
                        if let Some(cb) = slot.connection_cb.as_mut() {
                            cb(Err(Error::from(e)));
                        }
                    }
                    return;
                }
            }
        }
    }

    #[cfg(unix)]
    fn reap_children(&mut self) {
        for (pid, status) in self.reaper.sweep() {
            let id = self.handles.iter().find_map(|(k, slot)| match slot {
                HandleSlot::Process(p) if p.pid == pid => Some(HandleId(k)),
                _ => None,
            });
            if let Some(id) = id {
                if let Some(HandleSlot::Process(slot)) = self.handles.get_mut(id.0) {
                    if let Some(cb) = slot.exit_cb.as_mut() {
                        cb(status);
                    }
                }
                self.handles.remove(id.0);
            }
        }
    }

    #[cfg(windows)]
    fn reap_children_windows(&mut self) {
        while let Some((pid, status)) = self.process_exits.pop() {
            let id = self.handles.iter().find_map(|(k, slot)| match slot {
                HandleSlot::Process(p) if p.pid == pid => Some(HandleId(k)),
                _ => None,
            });
            if let Some(id) = id {
                if let Some(HandleSlot::Process(slot)) = self.handles.get_mut(id.0) {
                    if let Some(cb) = slot.exit_cb.as_mut() {
                        cb(status);
                    }
                    // SAFETY: the handle was opened by `CreateProcessW` in
                    // `spawn` and not yet closed; `watch_exit`'s thread has
                    // already returned, so no other use is in flight.
                    unsafe {
                        windows_sys::Win32::Foundation::CloseHandle(slot.process_handle);
                    }
                }
                self.handles.remove(id.0);
            }
        }
    }

    fn run_close_callbacks(&mut self) {
        while let Some(id) = self.close_queue.pop_front() {
            let mut token = None;
            let mut close_cb = None;
            if let Some(HandleSlot::Closing(_, _, tok, cb)) = self.handles.get_mut(id.0) {
                token = tok.take();
                close_cb = cb.take();
            }
            if self.handles.contains(id.0) {
                self.handles.remove(id.0);
            }
            if let Some(token) = token {
                let _ = self.backend.remove(token);
            }
            if let Some(cb) = close_cb {
                cb();
            }
        }
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        for (_, slot) in self.handles.iter() {
            match slot {
                HandleSlot::Tcp(tcp) => {
                    let _ = self.backend.remove(tcp.token);
                }
                HandleSlot::TcpListener(listener) => {
                    let _ = self.backend.remove(listener.token);
                }
                _ => {}
            }
        }
    }
}
