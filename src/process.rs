//! Child process spawn and reap.
//!
//! Unix: `fork`+`exec` with the CLOEXEC-pipe trick for surfacing exec
//! failures to the parent as a real error instead of a silently exited
//! child, and a SIGCHLD-driven reap sweep so no platform code ever calls
//! `waitpid` from inside a signal handler.
//!
//! Windows: `CreateProcessW` over a UTF-16 command line built with the
//! documented argv quoting rules, plus a wait registered against the exit
//! event through the same wait-pool style the teacher's `wait/mod.rs`
//! wraps (`RegisterWaitForSingleObject`), so child exit delivery reaches the
//! loop the same way every other completion does.

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stdio {
    Inherit,
    Ignore,
    Pipe,
}

#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    pub file: String,
    pub args: Vec<String>,
    pub env: Option<Vec<(String, String)>>,
    pub cwd: Option<String>,
    pub stdio: [Stdio; 3],
}

impl ProcessOptions {
    pub fn new(file: impl Into<String>) -> Self {
        ProcessOptions {
            file: file.into(),
            args: Vec::new(),
            env: None,
            cwd: None,
            stdio: [Stdio::Inherit, Stdio::Inherit, Stdio::Inherit],
        }
    }
}

/// Exit status delivered once, from the reap sweep (`Unix`) or the wait
/// callback (Windows).
#[derive(Copy, Clone, Debug)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(i32),
}

#[cfg(unix)]
pub use unix_impl::{install_sigchld_handler, spawn, Pid, Reaper};
#[cfg(windows)]
pub use windows_impl::{signal, spawn, watch_exit, Pid};

#[cfg(unix)]
mod unix_impl {
    use std::collections::HashMap;
    use std::ffi::CString;
    use std::os::unix::io::RawFd;

    use super::{ExitStatus, ProcessOptions, Stdio};
    use crate::error::{Code, Error, Result};

    pub type Pid = libc::pid_t;

    const DEV_NULL: &[u8] = b"/dev/null\0";

    /// A spawned child's inheritable fds, for the `Pipe` stdio slots.
    pub struct Child {
        pub pid: Pid,
        pub stdio_fds: [Option<RawFd>; 3],
    }

    fn to_cstrings(args: &[String]) -> Result<Vec<CString>> {
        args.iter()
            .map(|s| CString::new(s.as_bytes()).map_err(|_| Error::new(Code::Einval)))
            .collect()
    }

    /// `fork`+`exec` with an `O_CLOEXEC` error pipe: the child closes its end
    /// on successful `execvp`, so a read that returns data (rather than EOF)
    /// on the parent's end means `execvp` failed and the errno is right
    /// there instead of having to be inferred from the exit status.
    pub fn spawn(opts: &ProcessOptions) -> Result<Child> {
        let path = CString::new(opts.file.as_bytes()).map_err(|_| Error::new(Code::Einval))?;
        let mut argv_owned = vec![CString::new(opts.file.as_bytes()).unwrap()];
        argv_owned.extend(to_cstrings(&opts.args)?);
        let mut argv: Vec<*const libc::c_char> =
            argv_owned.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());

        let envp_owned: Option<Vec<CString>> = opts.env.as_ref().map(|pairs| {
            pairs
                .iter()
                .map(|(k, v)| CString::new(format!("{k}={v}")).unwrap())
                .collect()
        });
        let mut envp: Vec<*const libc::c_char> = match &envp_owned {
            Some(pairs) => pairs.iter().map(|s| s.as_ptr()).collect(),
            None => Vec::new(),
        };
        if envp_owned.is_some() {
            envp.push(std::ptr::null());
        }

        let cwd_owned = opts
            .cwd
            .as_ref()
            .map(|c| CString::new(c.as_bytes()))
            .transpose()
            .map_err(|_| Error::new(Code::Einval))?;

        let mut error_pipe = [0i32; 2];
        // SAFETY: valid 2-element out buffer.
        if unsafe { libc::pipe(error_pipe.as_mut_ptr()) } != 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        // SAFETY: fds just created by `pipe`.
        unsafe {
            let flags = libc::fcntl(error_pipe[1], libc::F_GETFD, 0);
            libc::fcntl(error_pipe[1], libc::F_SETFD, flags | libc::FD_CLOEXEC);
        }

        let mut stdio_parent: [Option<RawFd>; 3] = [None, None, None];
        let mut stdio_child: [Option<RawFd>; 3] = [None, None, None];
        for (i, kind) in opts.stdio.iter().enumerate() {
            if *kind == Stdio::Pipe {
                let mut fds = [0i32; 2];
                // SAFETY: valid 2-element out buffer.
                if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                    return Err(Error::from(std::io::Error::last_os_error()));
                }
                // stdin: parent writes fds[1], child reads fds[0].
                // stdout/stderr: parent reads fds[0], child writes fds[1].
                if i == 0 {
                    stdio_child[i] = Some(fds[0]);
                    stdio_parent[i] = Some(fds[1]);
                } else {
                    stdio_child[i] = Some(fds[1]);
                    stdio_parent[i] = Some(fds[0]);
                }
            }
        }

        // SAFETY: between `fork` and `execvp`/`_exit` the child only calls
        // async-signal-safe functions (`dup2`, `close`, `chdir`, `execvp`,
        // `write`, `_exit`), as POSIX requires.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        if pid == 0 {
            unsafe {
                libc::close(error_pipe[0]);
                for (i, fd) in stdio_child.iter().enumerate() {
                    if let Some(fd) = fd {
                        libc::dup2(*fd, i as i32);
                    } else if opts.stdio[i] == Stdio::Ignore {
                        let devnull = libc::open(
                            DEV_NULL.as_ptr().cast(),
                            if i == 0 { libc::O_RDONLY } else { libc::O_WRONLY },
                        );
                        if devnull >= 0 {
                            libc::dup2(devnull, i as i32);
                            libc::close(devnull);
                        }
                    }
                }
                for fd in stdio_parent.iter().flatten() {
                    libc::close(*fd);
                }
                if let Some(cwd) = &cwd_owned {
                    if libc::chdir(cwd.as_ptr()) != 0 {
                        report_and_exit(error_pipe[1]);
                    }
                }
                if envp_owned.is_some() {
                    libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
                } else {
                    libc::execvp(path.as_ptr(), argv.as_ptr());
                }
                report_and_exit(error_pipe[1]);
            }
        }

        // SAFETY: parent side only.
        unsafe {
            libc::close(error_pipe[1]);
        }
        for fd in stdio_child.iter().flatten() {
            // SAFETY: these belong to the child post-fork copy; the parent's
            // own copy is unneeded once dup2'd into place there.
            unsafe {
                libc::close(*fd);
            }
        }

        let mut errno_buf = [0u8; 4];
        // SAFETY: valid 4-byte out buffer; pipe is CLOEXEC so a successful
        // exec leaves nothing to read and `read` returns 0.
        let n = unsafe {
            libc::read(
                error_pipe[0],
                errno_buf.as_mut_ptr() as *mut _,
                errno_buf.len(),
            )
        };
        unsafe {
            libc::close(error_pipe[0]);
        }
        if n == 4 {
            let errno = i32::from_ne_bytes(errno_buf);
            // Reap the child that failed to exec so it doesn't zombie.
            let mut status = 0;
            unsafe {
                libc::waitpid(pid, &mut status, 0);
            }
            return Err(Error::with_raw(Code::Enoent, errno));
        }

        Ok(Child {
            pid,
            stdio_fds: stdio_parent,
        })
    }

    unsafe fn report_and_exit(error_fd: RawFd) -> ! {
        let errno = *libc::__errno_location();
        let buf = errno.to_ne_bytes();
        libc::write(error_fd, buf.as_ptr() as *const _, buf.len());
        libc::_exit(127);
    }

    pub fn decode_exit_status(status: i32) -> ExitStatus {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else {
            ExitStatus::Signaled(libc::WTERMSIG(status))
        }
    }

    /// Sweeps `waitpid(_, WNOHANG)` for every tracked pid. Meant to be
    /// called from the loop thread after SIGCHLD wakes it via the async
    /// signal path (`wakeup.rs`) — never from the signal handler itself.
    pub struct Reaper {
        tracked: HashMap<Pid, ()>,
    }

    impl Reaper {
        pub fn new() -> Self {
            Reaper {
                tracked: HashMap::new(),
            }
        }

        pub fn track(&mut self, pid: Pid) {
            self.tracked.insert(pid, ());
        }

        pub fn sweep(&mut self) -> Vec<(Pid, ExitStatus)> {
            let mut reaped = Vec::new();
            loop {
                let mut status = 0;
                // SAFETY: `status` is a valid out-param; WNOHANG never blocks.
                let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
                if pid <= 0 {
                    break;
                }
                if self.tracked.remove(&pid).is_some() {
                    reaped.push((pid, decode_exit_status(status)));
                }
            }
            reaped
        }
    }

    pub fn kill(pid: Pid, signum: i32) -> Result<()> {
        // SAFETY: `pid` is a plain integer argument to `kill(2)`.
        if unsafe { libc::kill(pid, signum) } != 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Fd a SIGCHLD handler writes one byte to. `-1` means unset.
    static WAKEUP_WRITE_FD: std::sync::atomic::AtomicI32 = std::sync::atomic::AtomicI32::new(-1);

    extern "C" fn sigchld_handler(_signum: i32) {
        let fd = WAKEUP_WRITE_FD.load(std::sync::atomic::Ordering::Relaxed);
        if fd >= 0 {
            let byte = [1u8];
            // SAFETY: `write` is on the short list of functions safe to call
            // from a signal handler; the fd is a self-pipe write end that
            // outlives the process once installed.
            unsafe {
                libc::write(fd, byte.as_ptr() as *const _, 1);
            }
        }
    }

    /// Registers a process-wide SIGCHLD handler that nudges the loop's
    /// wakeup self-pipe. Without this, a loop blocked in the backend wait
    /// with only process handles active would never notice a child exit
    /// until something else happened to wake it.
    ///
    /// Only one loop's wakeup fd can be wired up at a time; a later call
    /// replaces the earlier one. That matches the common case of a single
    /// reactor per process.
    pub fn install_sigchld_handler(write_fd: RawFd) {
        WAKEUP_WRITE_FD.store(write_fd, std::sync::atomic::Ordering::Relaxed);
        // SAFETY: `action` is fully initialized before being passed to
        // `sigaction`; `sigchld_handler` only touches the atomic and calls
        // `write`, both async-signal-safe.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = sigchld_handler as usize;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(libc::SIGCHLD, &action, std::ptr::null_mut());
        }
    }
}

#[cfg(windows)]
mod windows_impl {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::sync::Arc;

    use crossbeam::queue::SegQueue;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::Threading::{
        CreateProcessW, GetExitCodeProcess, TerminateProcess, WaitForSingleObject,
        INFINITE, PROCESS_INFORMATION, STARTUPINFOW, STILL_ACTIVE,
    };

    use super::{ExitStatus, ProcessOptions};
    use crate::error::{Code, Error, Result};
    use crate::wakeup::WakeupSender;

    pub type Pid = u32;

    pub struct Child {
        pub pid: Pid,
        pub process_handle: HANDLE,
    }

    /// Quote one argv element per the rules `CommandLineToArgvW` expects:
    /// wrap in quotes if it contains a space/tab/quote, doubling a quote
    /// that precedes a literal `"` and doubling trailing backslashes that
    /// would otherwise escape the closing quote.
    fn quote_arg(arg: &str, out: &mut String) {
        let needs_quotes = arg.is_empty() || arg.contains(|c: char| c == ' ' || c == '\t' || c == '"');
        if !needs_quotes {
            out.push_str(arg);
            return;
        }
        out.push('"');
        let mut chars = arg.chars().peekable();
        while let Some(c) = chars.next() {
            let mut backslashes = 0;
            let mut c = c;
            loop {
                if c == '\\' {
                    backslashes += 1;
                    match chars.next() {
                        Some(next) => c = next,
                        None => {
                            out.push_str(&"\\".repeat(backslashes * 2));
                            break;
                        }
                    }
                    continue;
                }
                if c == '"' {
                    out.push_str(&"\\".repeat(backslashes * 2 + 1));
                    out.push('"');
                } else {
                    out.push_str(&"\\".repeat(backslashes));
                    out.push(c);
                }
                break;
            }
        }
        out.push('"');
    }

    fn build_command_line(opts: &ProcessOptions) -> String {
        let mut line = String::new();
        quote_arg(&opts.file, &mut line);
        for arg in &opts.args {
            line.push(' ');
            quote_arg(arg, &mut line);
        }
        line
    }

    fn to_wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    pub fn spawn(opts: &ProcessOptions) -> Result<Child> {
        let mut cmdline = to_wide(&build_command_line(opts));
        let cwd_wide = opts.cwd.as_ref().map(|c| to_wide(c));

        let mut startup_info: STARTUPINFOW = unsafe { std::mem::zeroed() };
        startup_info.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
        let mut process_info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        // SAFETY: `cmdline` is a mutable, nul-terminated wide buffer as
        // `CreateProcessW` requires; out-params are valid, zeroed structs.
        let ok = unsafe {
            CreateProcessW(
                std::ptr::null(),
                cmdline.as_mut_ptr(),
                std::ptr::null(),
                std::ptr::null(),
                0,
                0,
                std::ptr::null(),
                cwd_wide.as_ref().map_or(std::ptr::null(), |w| w.as_ptr()),
                &startup_info,
                &mut process_info,
            )
        };
        if ok == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        // SAFETY: returned by the successful `CreateProcessW` above, unused
        // beyond this point.
        unsafe {
            CloseHandle(process_info.hThread);
        }

        Ok(Child {
            pid: process_info.dwProcessId,
            process_handle: process_info.hProcess,
        })
    }

    /// Block on the child's exit handle from a dedicated thread and push the
    /// exit status onto `exits`, then nudge the loop the same way a worker
    /// thread wakes it on job completion (`work.rs`'s `WorkerPool`). Avoids
    /// inventing a second, Windows-only notification channel: the loop only
    /// ever has to know about one wakeup mechanism.
    pub fn watch_exit(
        process_handle: HANDLE,
        pid: Pid,
        exits: Arc<SegQueue<(Pid, ExitStatus)>>,
        wakeup: WakeupSender,
    ) {
        std::thread::spawn(move || {
            // SAFETY: `process_handle` is owned by the caller and kept alive
            // until this thread observes the wait complete.
            unsafe {
                WaitForSingleObject(process_handle, INFINITE);
            }
            let mut code: u32 = 0;
            // SAFETY: `process_handle` is still valid; `code` is a valid
            // out-param.
            unsafe {
                GetExitCodeProcess(process_handle, &mut code);
            }
            exits.push((pid, ExitStatus::Exited(code as i32)));
            wakeup.send();
        });
    }

    /// `signum == 0` is the POSIX liveness-probe convention carried through
    /// from `kill(2)`: report whether the process is still running without
    /// affecting it. Any other signal number maps to `TerminateProcess`,
    /// since Windows has no equivalent to POSIX signal delivery.
    pub fn signal(process_handle: HANDLE, signum: i32) -> Result<()> {
        if signum == 0 {
            let mut code: u32 = 0;
            // SAFETY: `process_handle` is a valid handle owned by the caller.
            let ok = unsafe { GetExitCodeProcess(process_handle, &mut code) };
            if ok == 0 {
                return Err(Error::from(std::io::Error::last_os_error()));
            }
            return if code == STILL_ACTIVE as u32 {
                Ok(())
            } else {
                Err(Error::new(Code::Esrch))
            };
        }
        // SAFETY: `process_handle` is a valid handle owned by the caller.
        let ok = unsafe { TerminateProcess(process_handle, 1) };
        if ok == 0 {
            return Err(Error::from(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
