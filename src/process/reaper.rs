//! Process-global SIGCHLD reaper.
//!
//! A single background worker owns a self-pipe: the SIGCHLD handler writes
//! one byte `'c'`, shutdown writes `'s'`. One signal may cover several
//! exited children, so on every `'c'` the worker scans all tracked pids
//! with `waitpid(WNOHANG)` and reports each finished child to its
//! supervisor with the reaper lock released.

use crate::process::{self, ProcessInner};
use crate::sys;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, OnceLock, Weak};
use std::thread::JoinHandle;

static REAPER: OnceLock<Reaper> = OnceLock::new();
static REAPER_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

// Async-signal-safe: one write to the self-pipe, nothing else.
extern "C" fn sigchld_handler(_sig: libc::c_int) {
    let fd = REAPER_PIPE_WRITE.load(Ordering::Relaxed);
    if fd != -1 {
        let byte = b'c';
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

extern "C" fn shutdown_at_exit() {
    if let Some(reaper) = REAPER.get() {
        sys::write_byte(reaper.pipe_write, b's');
        if let Some(worker) = reaper.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

struct Reaper {
    pipe_write: RawFd,
    processes: Mutex<HashMap<libc::pid_t, Weak<Mutex<ProcessInner>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn install() -> &'static Reaper {
    REAPER.get_or_init(|| {
        let (pipe_read, pipe_write) = sys::pipe().expect("failed to create reaper pipe");
        sys::set_nonblocking(pipe_write).expect("failed to configure reaper pipe");
        REAPER_PIPE_WRITE.store(pipe_write, Ordering::Relaxed);

        unsafe {
            libc::signal(libc::SIGCHLD, sigchld_handler as libc::sighandler_t);
        }

        let worker = std::thread::Builder::new()
            .name("eventkit-reaper".into())
            .spawn(move || run(pipe_read))
            .expect("failed to spawn reaper thread");

        unsafe {
            libc::atexit(shutdown_at_exit);
        }

        Reaper {
            pipe_write,
            processes: Mutex::new(HashMap::new()),
            worker: Mutex::new(Some(worker)),
        }
    })
}

/// Tracks a freshly forked child. The extra `'c'` wake closes the window
/// where the child exits before its pid lands in the map.
pub(crate) fn add_pid(pid: libc::pid_t, process: Weak<Mutex<ProcessInner>>) {
    let reaper = install();
    reaper.processes.lock().unwrap().insert(pid, process);
    sys::write_byte(reaper.pipe_write, b'c');
}

fn run(pipe_read: RawFd) {
    loop {
        let mut byte = 0u8;
        let r = sys::retry_eintr(|| unsafe {
            libc::read(pipe_read, &mut byte as *mut u8 as *mut libc::c_void, 1)
        });
        if r <= 0 || byte == b's' {
            break;
        }
        scan();
    }
    sys::close(pipe_read);
}

fn scan() {
    let reaper = match REAPER.get() {
        Some(reaper) => reaper,
        None => return,
    };

    loop {
        // Find one reapable child per pass, then report it with the map
        // unlocked so finish callbacks cannot deadlock against add_pid.
        let mut finished: Option<(libc::pid_t, i32)> = None;
        {
            let map = reaper.processes.lock().unwrap();
            for &pid in map.keys() {
                let mut status = 0;
                let r = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                if r == 0 {
                    continue;
                }
                let code = if r > 0 && libc::WIFEXITED(status) {
                    libc::WEXITSTATUS(status)
                } else {
                    -1
                };
                finished = Some((pid, code));
                break;
            }
        }

        let Some((pid, code)) = finished else { break };
        let process = reaper.processes.lock().unwrap().remove(&pid);
        if let Some(process) = process.and_then(|weak| weak.upgrade()) {
            process::finish(&process, code);
        }
    }
}
