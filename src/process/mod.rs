//! Subprocess supervision.
//!
//! A [`Process`] forks a child with its standard streams piped back to the
//! parent. In async mode the pipes are registered with the current thread's
//! event loop and output arrives incrementally through ready-read signals;
//! in sync mode [`Process::exec`] blocks the caller in a private `select`
//! until the child exits or a timeout fires. Exits are observed by the
//! process-global SIGCHLD reaper worker, which reports them back to the
//! owning supervisor.

mod reaper;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::mux::Mode;
use crate::sys;

use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

const MAX_OUTPUT_BUFFER: usize = 16 * 1024 * 1024;
const READ_CHUNK: usize = 1024;

bitflags::bitflags! {
    /// Flags for [`Process::exec`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecFlags: u32 {
        /// Keep the child's stdin open instead of closing it once queued
        /// writes have flushed.
        const NO_CLOSE_STDIN = 0x1;
    }
}

/// Outcome of a synchronous [`Process::exec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// The child ran and exited; see [`Process::return_code`].
    Done,
    /// The child could not be started; see [`Process::error_string`].
    Error,
    /// The exec timeout expired; the child was sent SIGTERM.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExecMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    StdOut,
    StdErr,
}

type ProcessSignal = Option<Box<dyn FnMut() + Send>>;

pub(crate) struct ProcessInner {
    pid: libc::pid_t,
    return_code: Option<i32>,
    stdin_fds: [RawFd; 2],
    stdout_fds: [RawFd; 2],
    stderr_fds: [RawFd; 2],
    sync_fds: [RawFd; 2],
    stdin_buffer: VecDeque<Vec<u8>>,
    stdin_index: usize,
    stdout_buffer: Vec<u8>,
    stdout_index: usize,
    stderr_buffer: Vec<u8>,
    stderr_index: usize,
    stdin_registered: bool,
    mode: ExecMode,
    cwd: Option<PathBuf>,
    error_string: String,
    loop_handle: Option<LoopHandle>,
    on_ready_read_stdout: ProcessSignal,
    on_ready_read_stderr: ProcessSignal,
    on_finished: ProcessSignal,
}

impl ProcessInner {
    fn stream_mut(&mut self, kind: StreamKind) -> (&mut Vec<u8>, &mut usize) {
        match kind {
            StreamKind::StdOut => (&mut self.stdout_buffer, &mut self.stdout_index),
            StreamKind::StdErr => (&mut self.stderr_buffer, &mut self.stderr_index),
        }
    }

    fn ready_slot(&mut self, kind: StreamKind) -> &mut ProcessSignal {
        match kind {
            StreamKind::StdOut => &mut self.on_ready_read_stdout,
            StreamKind::StdErr => &mut self.on_ready_read_stderr,
        }
    }
}

impl Drop for ProcessInner {
    fn drop(&mut self) {
        if self.mode == ExecMode::Async {
            if let Some(event_loop) = EventLoop::current() {
                for fd in [self.stdin_fds[1], self.stdout_fds[0], self.stderr_fds[0]] {
                    if fd != -1 {
                        event_loop.unregister_socket(fd);
                    }
                }
            }
        }
        let fds = [
            self.stdin_fds[0],
            self.stdin_fds[1],
            self.stdout_fds[0],
            self.stdout_fds[1],
            self.stderr_fds[0],
            self.stderr_fds[1],
            self.sync_fds[0],
            self.sync_fds[1],
        ];
        for fd in fds {
            if fd != -1 {
                sys::close(fd);
            }
        }
    }
}

/// Resolves a command: absolute paths are used verbatim, everything else is
/// looked up in `PATH`, taking the first regular file with read and execute
/// permission.
fn find_command(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }
    if command.starts_with('/') {
        return Some(PathBuf::from(command));
    }

    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        let Ok(metadata) = std::fs::metadata(&candidate) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let Ok(c_path) = CString::new(candidate.as_os_str().as_bytes()) else {
            continue;
        };
        if unsafe { libc::access(c_path.as_ptr(), libc::R_OK | libc::X_OK) } == 0 {
            return Some(candidate);
        }
    }
    None
}

/// Launches child programs and supervises their standard streams.
///
/// Cloning is shallow; all clones observe the same child. Signals fire with
/// the internal lock released, so handlers may freely call back into the
/// process.
#[derive(Clone)]
pub struct Process {
    inner: Arc<Mutex<ProcessInner>>,
}

impl Process {
    pub fn new() -> Process {
        Process {
            inner: Arc::new(Mutex::new(ProcessInner {
                pid: -1,
                return_code: None,
                stdin_fds: [-1, -1],
                stdout_fds: [-1, -1],
                stderr_fds: [-1, -1],
                sync_fds: [-1, -1],
                stdin_buffer: VecDeque::new(),
                stdin_index: 0,
                stdout_buffer: Vec::new(),
                stdout_index: 0,
                stderr_buffer: Vec::new(),
                stderr_index: 0,
                stdin_registered: false,
                mode: ExecMode::Sync,
                cwd: None,
                error_string: String::new(),
                loop_handle: None,
                on_ready_read_stdout: None,
                on_ready_read_stderr: None,
                on_finished: None,
            })),
        }
    }

    pub fn set_cwd<P: Into<PathBuf>>(&self, cwd: P) {
        self.inner.lock().unwrap().cwd = Some(cwd.into());
    }

    /// The child's pid, or -1 before start and again after the exit has been
    /// reaped.
    pub fn pid(&self) -> libc::pid_t {
        self.inner.lock().unwrap().pid
    }

    pub fn return_code(&self) -> Option<i32> {
        self.inner.lock().unwrap().return_code
    }

    pub fn error_string(&self) -> String {
        self.inner.lock().unwrap().error_string.clone()
    }

    pub fn on_ready_read_stdout<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().on_ready_read_stdout = Some(Box::new(f));
    }

    pub fn on_ready_read_stderr<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().on_ready_read_stderr = Some(Box::new(f));
    }

    /// Fires exactly once per successfully started child, after the exit has
    /// been reaped and `pid()` reads -1 again.
    pub fn on_finished<F: FnMut() + Send + 'static>(&self, f: F) {
        self.inner.lock().unwrap().on_finished = Some(Box::new(f));
    }

    /// Takes everything the child wrote to stdout since the last call.
    pub fn read_all_stdout(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner.stdout_index = 0;
        std::mem::take(&mut inner.stdout_buffer)
    }

    /// Takes everything the child wrote to stderr since the last call.
    pub fn read_all_stderr(&self) -> Vec<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner.stderr_index = 0;
        std::mem::take(&mut inner.stderr_buffer)
    }

    /// Queues bytes for the child's stdin and flushes as much as the pipe
    /// accepts right now. May be called before start; queued chunks flush
    /// once the pipe exists.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let fd = {
            let mut inner = self.inner.lock().unwrap();
            inner.stdin_buffer.push_back(data.to_vec());
            inner.stdin_fds[1]
        };
        if fd != -1 {
            handle_input(&self.inner, fd);
        }
    }

    /// Flushes what it can without blocking, then closes the child's stdin.
    pub fn close_stdin(&self) {
        let fd = self.inner.lock().unwrap().stdin_fds[1];
        if fd == -1 {
            return;
        }
        handle_input(&self.inner, fd);

        let mut inner = self.inner.lock().unwrap();
        if !inner.stdin_buffer.is_empty() {
            log::debug!(
                "closing stdin with {} chunk(s) still queued",
                inner.stdin_buffer.len()
            );
        }
        if inner.stdin_registered {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.unregister_socket(fd);
            }
            inner.stdin_registered = false;
        } else if inner.mode == ExecMode::Async {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.unregister_socket(fd);
            }
        }
        sys::close(fd);
        inner.stdin_fds[1] = -1;
    }

    /// Sends SIGTERM to a running child. Does not wait; the reaper reports
    /// the exit. A no-op once the child has been reaped.
    pub fn stop(&self) {
        let pid = self.inner.lock().unwrap().pid;
        if pid != -1 {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }
    }

    /// Starts the child in async mode: stdout and stderr are registered with
    /// the current thread's event loop and `finished` is posted back to it.
    pub fn start(&self, command: &str, args: &[&str]) -> Result<(), Error> {
        self.start_internal(command, args, None, None, ExecFlags::empty(), ExecMode::Async)
            .map(|_| ())
    }

    /// Like [`Process::start`] with an explicit environment.
    pub fn start_env(&self, command: &str, args: &[&str], env: &[&str]) -> Result<(), Error> {
        self.start_internal(
            command,
            args,
            Some(env),
            None,
            ExecFlags::empty(),
            ExecMode::Async,
        )
        .map(|_| ())
    }

    /// Runs the child synchronously, blocking the calling thread in a
    /// private `select` until it exits or `timeout` elapses. Independent of
    /// any event loop.
    pub fn exec(
        &self,
        command: &str,
        args: &[&str],
        timeout: Option<Duration>,
        flags: ExecFlags,
    ) -> ExecState {
        self.exec_result(command, args, None, timeout, flags)
    }

    /// Like [`Process::exec`] with an explicit environment.
    pub fn exec_env(
        &self,
        command: &str,
        args: &[&str],
        env: &[&str],
        timeout: Option<Duration>,
        flags: ExecFlags,
    ) -> ExecState {
        self.exec_result(command, args, Some(env), timeout, flags)
    }

    fn exec_result(
        &self,
        command: &str,
        args: &[&str],
        env: Option<&[&str]>,
        timeout: Option<Duration>,
        flags: ExecFlags,
    ) -> ExecState {
        match self.start_internal(command, args, env, timeout, flags, ExecMode::Sync) {
            Ok(state) => state,
            Err(error) => {
                self.inner.lock().unwrap().error_string = error.to_string();
                ExecState::Error
            }
        }
    }

    fn start_internal(
        &self,
        command: &str,
        args: &[&str],
        env: Option<&[&str]>,
        timeout: Option<Duration>,
        flags: ExecFlags,
        mode: ExecMode,
    ) -> Result<ExecState, Error> {
        let resolved = find_command(command).ok_or(Error::CommandNotFound)?;

        let c_command = CString::new(resolved.as_os_str().as_bytes())
            .map_err(|_| Error::CommandNotFound)?;
        let mut c_args = vec![c_command.clone()];
        for arg in args {
            c_args.push(CString::new(*arg).map_err(|_| Error::CommandNotFound)?);
        }
        let mut argv: Vec<*const libc::c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());

        let c_env = match env {
            None => None,
            Some(env) => {
                let mut c_env = Vec::with_capacity(env.len());
                for entry in env {
                    c_env.push(CString::new(*entry).map_err(|_| Error::CommandNotFound)?);
                }
                Some(c_env)
            }
        };
        let envp: Option<Vec<*const libc::c_char>> = c_env.as_ref().map(|c_env| {
            let mut envp: Vec<*const libc::c_char> = c_env.iter().map(|e| e.as_ptr()).collect();
            envp.push(std::ptr::null());
            envp
        });

        let c_cwd = {
            let inner = self.inner.lock().unwrap();
            match &inner.cwd {
                None => None,
                Some(cwd) => Some(
                    CString::new(cwd.as_os_str().as_bytes())
                        .map_err(|_| Error::CommandNotFound)?,
                ),
            }
        };

        let stdin_fds = sys::pipe()?;
        let stdout_fds = match sys::pipe() {
            Ok(fds) => fds,
            Err(error) => {
                sys::close(stdin_fds.0);
                sys::close(stdin_fds.1);
                return Err(Error::Io(error));
            }
        };
        let stderr_fds = match sys::pipe() {
            Ok(fds) => fds,
            Err(error) => {
                for fd in [stdin_fds.0, stdin_fds.1, stdout_fds.0, stdout_fds.1] {
                    sys::close(fd);
                }
                return Err(Error::Io(error));
            }
        };
        let sync_fds = if mode == ExecMode::Sync {
            match sys::pipe() {
                Ok(fds) => fds,
                Err(error) => {
                    let open = [
                        stdin_fds.0,
                        stdin_fds.1,
                        stdout_fds.0,
                        stdout_fds.1,
                        stderr_fds.0,
                        stderr_fds.1,
                    ];
                    for fd in open {
                        sys::close(fd);
                    }
                    return Err(Error::Io(error));
                }
            }
        } else {
            (-1, -1)
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.mode = mode;
            inner.error_string.clear();
            inner.return_code = None;
            inner.stdin_fds = [stdin_fds.0, stdin_fds.1];
            inner.stdout_fds = [stdout_fds.0, stdout_fds.1];
            inner.stderr_fds = [stderr_fds.0, stderr_fds.1];
            inner.sync_fds = [sync_fds.0, sync_fds.1];
            inner.stdin_index = 0;
            inner.stdout_buffer.clear();
            inner.stdout_index = 0;
            inner.stderr_buffer.clear();
            inner.stderr_index = 0;
            inner.stdin_registered = false;
            inner.loop_handle = None;
        }

        let pid = unsafe { libc::fork() };
        if pid == -1 {
            let error = std::io::Error::last_os_error();
            let open = [
                stdin_fds.0,
                stdin_fds.1,
                stdout_fds.0,
                stdout_fds.1,
                stderr_fds.0,
                stderr_fds.1,
                sync_fds.0,
                sync_fds.1,
            ];
            let mut inner = self.inner.lock().unwrap();
            inner.stdin_fds = [-1, -1];
            inner.stdout_fds = [-1, -1];
            inner.stderr_fds = [-1, -1];
            inner.sync_fds = [-1, -1];
            drop(inner);
            for fd in open {
                if fd != -1 {
                    sys::close(fd);
                }
            }
            return Err(Error::ForkFailed(error));
        }

        if pid == 0 {
            // Child. Only async-signal-safe calls from here to exec.
            unsafe {
                libc::close(stdin_fds.1);
                libc::close(stdout_fds.0);
                libc::close(stderr_fds.0);
                if sync_fds.0 != -1 {
                    libc::close(sync_fds.0);
                    libc::close(sync_fds.1);
                }

                libc::dup2(stdin_fds.0, libc::STDIN_FILENO);
                libc::close(stdin_fds.0);
                libc::dup2(stdout_fds.1, libc::STDOUT_FILENO);
                libc::close(stdout_fds.1);
                libc::dup2(stderr_fds.1, libc::STDERR_FILENO);
                libc::close(stderr_fds.1);

                if let Some(cwd) = &c_cwd {
                    libc::chdir(cwd.as_ptr());
                }

                match &envp {
                    Some(envp) => {
                        libc::execve(c_command.as_ptr(), argv.as_ptr(), envp.as_ptr());
                    }
                    None => {
                        libc::execv(c_command.as_ptr(), argv.as_ptr());
                    }
                }
                libc::_exit(1);
            }
        }

        // Parent. The loop handle has to be in place before the reaper can
        // possibly report this child, so its finish is posted, not run on
        // the reaper thread.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.pid = pid;
            inner.stdin_fds[0] = -1;
            inner.stdout_fds[1] = -1;
            inner.stderr_fds[1] = -1;
            if mode == ExecMode::Async {
                if let Some(event_loop) = EventLoop::current() {
                    inner.loop_handle = Some(event_loop.handle());
                }
            }
        }
        reaper::add_pid(pid, Arc::downgrade(&self.inner));

        sys::close(stdin_fds.0);
        sys::close(stdout_fds.1);
        sys::close(stderr_fds.1);

        sys::set_nonblocking(stdin_fds.1)?;
        sys::set_nonblocking(stdout_fds.0)?;
        sys::set_nonblocking(stderr_fds.0)?;

        match mode {
            ExecMode::Async => {
                match EventLoop::current() {
                    Some(event_loop) => {
                        let weak = Arc::downgrade(&self.inner);
                        event_loop.register_socket(stdout_fds.0, Mode::READ, {
                            let weak = weak.clone();
                            move |fd, fired| process_callback(&weak, fd, fired)
                        })?;
                        event_loop.register_socket(stderr_fds.0, Mode::READ, {
                            let weak = weak.clone();
                            move |fd, fired| process_callback(&weak, fd, fired)
                        })?;
                    }
                    None => {
                        log::warn!("async process started without an event loop on this thread");
                    }
                }
                let pending = !self.inner.lock().unwrap().stdin_buffer.is_empty();
                if pending {
                    handle_input(&self.inner, stdin_fds.1);
                }
                Ok(ExecState::Done)
            }
            ExecMode::Sync => self.sync_wait(timeout, flags),
        }
    }

    /// The private select loop of sync mode: drains stdout/stderr, flushes
    /// queued stdin while data is pending, and returns once the completion
    /// pipe reports the reaped exit or the timeout expires.
    fn sync_wait(&self, timeout: Option<Duration>, flags: ExecFlags) -> Result<ExecState, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let close_stdin_when_drained = !flags.contains(ExecFlags::NO_CLOSE_STDIN);

        if close_stdin_when_drained && self.inner.lock().unwrap().stdin_buffer.is_empty() {
            self.close_stdin();
        }

        loop {
            let (stdout_fd, stderr_fd, sync_fd, stdin_fd, stdin_pending) = {
                let inner = self.inner.lock().unwrap();
                (
                    inner.stdout_fds[0],
                    inner.stderr_fds[0],
                    inner.sync_fds[0],
                    inner.stdin_fds[1],
                    !inner.stdin_buffer.is_empty(),
                )
            };

            let mut rfds: libc::fd_set = unsafe { std::mem::zeroed() };
            let mut wfds: libc::fd_set = unsafe { std::mem::zeroed() };
            let mut max_fd = 0;
            unsafe {
                libc::FD_ZERO(&mut rfds);
                libc::FD_ZERO(&mut wfds);
                for fd in [stdout_fd, stderr_fd, sync_fd] {
                    if fd != -1 {
                        libc::FD_SET(fd, &mut rfds);
                        max_fd = max_fd.max(fd);
                    }
                }
                if stdin_fd != -1 && stdin_pending {
                    libc::FD_SET(stdin_fd, &mut wfds);
                    max_fd = max_fd.max(stdin_fd);
                }
            }

            let mut tv = libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            };
            let tv_ptr = match deadline {
                None => std::ptr::null_mut(),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tv.tv_sec = remaining.as_secs() as libc::time_t;
                    tv.tv_usec = remaining.subsec_micros() as libc::suseconds_t;
                    &mut tv as *mut libc::timeval
                }
            };

            let r = sys::retry_eintr(|| {
                (unsafe {
                    libc::select(
                        max_fd + 1,
                        &mut rfds,
                        &mut wfds,
                        std::ptr::null_mut(),
                        tv_ptr,
                    )
                }) as isize
            });
            if r == -1 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            unsafe {
                if stdout_fd != -1 && libc::FD_ISSET(stdout_fd, &rfds) {
                    handle_output(&self.inner, stdout_fd, StreamKind::StdOut);
                }
                if stderr_fd != -1 && libc::FD_ISSET(stderr_fd, &rfds) {
                    handle_output(&self.inner, stderr_fd, StreamKind::StdErr);
                }
                if stdin_fd != -1 && stdin_pending && libc::FD_ISSET(stdin_fd, &wfds) {
                    handle_input(&self.inner, stdin_fd);
                    if close_stdin_when_drained
                        && self.inner.lock().unwrap().stdin_buffer.is_empty()
                    {
                        self.close_stdin();
                    }
                }
                if sync_fd != -1 && libc::FD_ISSET(sync_fd, &rfds) {
                    // The reaper has collected the exit; drain what is left
                    // and shut the streams down.
                    handle_output(&self.inner, stdout_fd, StreamKind::StdOut);
                    handle_output(&self.inner, stderr_fd, StreamKind::StdErr);
                    {
                        let mut inner = self.inner.lock().unwrap();
                        for fd in [inner.stdout_fds[0], inner.stderr_fds[0], inner.sync_fds[0]] {
                            if fd != -1 {
                                sys::close(fd);
                            }
                        }
                        inner.stdout_fds[0] = -1;
                        inner.stderr_fds[0] = -1;
                        inner.sync_fds[0] = -1;
                    }
                    emit_finished(&self.inner);
                    return Ok(ExecState::Done);
                }
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    self.stop();
                    return Ok(ExecState::TimedOut);
                }
            }
        }
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

fn process_callback(weak: &Weak<Mutex<ProcessInner>>, fd: RawFd, fired: Mode) {
    let Some(inner) = weak.upgrade() else { return };
    if fired == Mode::ERROR {
        return;
    }
    let (stdin_fd, stdout_fd, stderr_fd) = {
        let guard = inner.lock().unwrap();
        (guard.stdin_fds[1], guard.stdout_fds[0], guard.stderr_fds[0])
    };
    if fd == stdin_fd {
        handle_input(&inner, fd);
    } else if fd == stdout_fd {
        handle_output(&inner, fd, StreamKind::StdOut);
    } else if fd == stderr_fd {
        handle_output(&inner, fd, StreamKind::StdErr);
    }
}

/// Writes queued stdin chunks until the pipe would block. While blocked, the
/// descriptor carries write interest with the loop; interest is dropped
/// again whenever the queue drains or before a fresh flush attempt.
fn handle_input(inner_arc: &Arc<Mutex<ProcessInner>>, fd: RawFd) {
    let mut inner = inner_arc.lock().unwrap();

    if inner.stdin_registered {
        if let Some(event_loop) = EventLoop::current() {
            event_loop.unregister_socket(fd);
        }
        inner.stdin_registered = false;
    }

    loop {
        let Some(front) = inner.stdin_buffer.front() else {
            break;
        };
        let index = inner.stdin_index;
        let remaining = &front[index..];
        let want = remaining.len();

        let w = sys::retry_eintr(|| unsafe {
            libc::write(fd, remaining.as_ptr() as *const libc::c_void, want)
        });

        if w == -1 {
            let errno = sys::last_errno();
            if sys::would_block(errno) && inner.mode == ExecMode::Async {
                if let Some(event_loop) = EventLoop::current() {
                    let weak = Arc::downgrade(inner_arc);
                    let registered = event_loop
                        .register_socket(fd, Mode::WRITE, move |fd, fired| {
                            process_callback(&weak, fd, fired)
                        })
                        .is_ok();
                    inner.stdin_registered = registered;
                }
            } else if !sys::would_block(errno) {
                log::debug!("stdin write failed: {}", errno);
            }
            break;
        }

        let w = w as usize;
        if w == want {
            inner.stdin_buffer.pop_front();
            inner.stdin_index = 0;
        } else {
            inner.stdin_index = index + w;
        }
    }
}

/// Drains a child output pipe into its accumulating buffer. Growth beyond
/// 16 MiB first compacts away the consumed prefix; if that is not enough the
/// buffer is reset and the loss reported once.
fn handle_output(inner_arc: &Arc<Mutex<ProcessInner>>, fd: RawFd, kind: StreamKind) {
    if fd == -1 {
        return;
    }

    let mut total = 0usize;
    let callback = {
        let mut inner = inner_arc.lock().unwrap();
        let mut chunk = [0u8; READ_CHUNK];
        let mut eof = false;

        loop {
            let r = sys::retry_eintr(|| unsafe {
                libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, chunk.len())
            });
            if r == -1 {
                break;
            }
            if r == 0 {
                eof = true;
                break;
            }

            let r = r as usize;
            let (buffer, index) = inner.stream_mut(kind);
            if buffer.len() + r > MAX_OUTPUT_BUFFER {
                if buffer.len() + r - *index > MAX_OUTPUT_BUFFER {
                    log::warn!("process output buffer overflow, dropping data");
                    buffer.clear();
                    *index = 0;
                } else {
                    let consumed = *index;
                    buffer.drain(..consumed);
                    *index = 0;
                }
            }
            buffer.extend_from_slice(&chunk[..r]);
            total += r;
        }

        if eof && inner.mode == ExecMode::Async {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.unregister_socket(fd);
            }
        }

        if total > 0 {
            inner.ready_slot(kind).take()
        } else {
            None
        }
    };

    if let Some(mut f) = callback {
        f();
        let mut inner = inner_arc.lock().unwrap();
        let slot = inner.ready_slot(kind);
        if slot.is_none() {
            *slot = Some(f);
        }
    }
}

fn emit_finished(inner_arc: &Arc<Mutex<ProcessInner>>) {
    let callback = inner_arc.lock().unwrap().on_finished.take();
    if let Some(mut f) = callback {
        f();
        let mut inner = inner_arc.lock().unwrap();
        if inner.on_finished.is_none() {
            inner.on_finished = Some(f);
        }
    }
}

/// Called by the reaper once the child's exit status has been collected.
/// State is updated under the lock; signal emission happens after release.
pub(crate) fn finish(inner_arc: &Arc<Mutex<ProcessInner>>, code: i32) {
    let (mode, handle) = {
        let mut inner = inner_arc.lock().unwrap();
        inner.pid = -1;
        inner.return_code = Some(code);
        inner.stdin_buffer.clear();
        inner.stdin_index = 0;

        if inner.mode == ExecMode::Sync && inner.sync_fds[1] != -1 {
            sys::write_byte(inner.sync_fds[1], b'q');
            sys::close(inner.sync_fds[1]);
            inner.sync_fds[1] = -1;
        }

        (inner.mode, inner.loop_handle.clone())
    };

    if mode == ExecMode::Async {
        let arc = inner_arc.clone();
        match handle {
            // Re-enter the owning loop; stream teardown and the finished
            // signal belong on its thread.
            Some(handle) => handle.post(move || finish_async(&arc)),
            None => finish_async(&arc),
        }
    }
}

fn finish_async(inner_arc: &Arc<Mutex<ProcessInner>>) {
    let (stdin_fd, stdout_fd, stderr_fd) = {
        let inner = inner_arc.lock().unwrap();
        (inner.stdin_fds[1], inner.stdout_fds[0], inner.stderr_fds[0])
    };

    handle_output(inner_arc, stdout_fd, StreamKind::StdOut);
    handle_output(inner_arc, stderr_fd, StreamKind::StdErr);

    {
        let mut inner = inner_arc.lock().unwrap();
        let event_loop = EventLoop::current();
        for fd in [stdin_fd, stdout_fd, stderr_fd] {
            if fd != -1 {
                if let Some(event_loop) = &event_loop {
                    event_loop.unregister_socket(fd);
                }
                sys::close(fd);
            }
        }
        inner.stdin_fds[1] = -1;
        inner.stdout_fds[0] = -1;
        inner.stderr_fds[0] = -1;
        inner.stdin_registered = false;
    }

    emit_finished(inner_arc);
}
