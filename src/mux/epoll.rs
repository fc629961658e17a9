use super::{timeout_ms, Mode, MuxEvent};
use crate::error::Error;
use crate::sys;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

const EVENT_CAPACITY: usize = 64;

pub(crate) struct Mux {
    epoll_fd: RawFd,
    native: Vec<libc::epoll_event>,
}

impl Mux {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Mux {
            epoll_fd,
            native: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    fn interest(mode: Mode) -> u32 {
        let mut events = 0u32;

        if mode.contains(Mode::READ) {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if mode.contains(Mode::WRITE) {
            events |= libc::EPOLLOUT as u32;
        }
        if !mode.contains(Mode::LEVEL_TRIGGERED) {
            events |= libc::EPOLLET as u32;
        }
        if mode.contains(Mode::ONE_SHOT) {
            events |= libc::EPOLLONESHOT as u32;
        }

        events
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mode: Mode) -> i32 {
        let mut event = libc::epoll_event {
            events: Self::interest(mode),
            u64: fd as u64,
        };

        let r = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event) };
        if r == -1 { sys::last_errno() } else { 0 }
    }

    pub(crate) fn add(&self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        match self.ctl(libc::EPOLL_CTL_ADD, fd, mode) {
            0 => Ok(()),
            libc::EEXIST => Err(Error::AlreadyRegistered(fd)),
            errno => Err(Error::Io(io::Error::from_raw_os_error(errno))),
        }
    }

    pub(crate) fn modify(&self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        match self.ctl(libc::EPOLL_CTL_MOD, fd, mode) {
            0 => Ok(()),
            errno => Err(Error::Io(io::Error::from_raw_os_error(errno))),
        }
    }

    /// Removing a descriptor that is not registered is a no-op.
    pub(crate) fn remove(&self, fd: RawFd) {
        let r = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if r == -1 {
            let errno = sys::last_errno();
            if errno != libc::ENOENT && errno != libc::EBADF {
                log::debug!("epoll_ctl(DEL, {}) failed: {}", fd, errno);
            }
        }
    }

    /// Blocks until readiness, timeout or interruption. An interrupted wait
    /// reports zero events rather than an error so the caller can re-check
    /// its shutdown flag.
    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<MuxEvent>,
    ) -> io::Result<usize> {
        events.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.native.as_mut_ptr(),
                self.native.capacity() as i32,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(error);
        }

        let n = n as usize;
        unsafe {
            self.native.set_len(n);
        }

        for native in &self.native[..n] {
            let mut mode = Mode::empty();

            if native.events & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                mode |= Mode::READ;
            }
            if native.events & libc::EPOLLOUT as u32 != 0 {
                mode |= Mode::WRITE;
            }
            if native.events & libc::EPOLLERR as u32 != 0 {
                mode |= Mode::ERROR;
            }

            if !mode.is_empty() {
                events.push(MuxEvent {
                    fd: native.u64 as RawFd,
                    mode,
                });
            }
        }

        Ok(events.len())
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        sys::close(self.epoll_fd);
    }
}
