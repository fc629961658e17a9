use super::{Mode, MuxEvent};
use crate::error::Error;
use crate::sys;

use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

const EVENT_CAPACITY: usize = 64;

pub(crate) struct Mux {
    kqueue_fd: RawFd,
    native: Vec<libc::kevent>,
    // kqueue silently re-adds an existing ident, so duplicates are tracked
    // here to keep add() semantics identical to the epoll backend.
    registered: HashSet<RawFd>,
}

fn filter_flags(mode: Mode) -> u16 {
    let mut flags = libc::EV_ADD | libc::EV_ENABLE;
    if !mode.contains(Mode::LEVEL_TRIGGERED) {
        flags |= libc::EV_CLEAR;
    }
    if mode.contains(Mode::ONE_SHOT) {
        flags |= libc::EV_ONESHOT;
    }
    flags
}

impl Mux {
    pub(crate) fn new() -> io::Result<Self> {
        let kqueue_fd = unsafe { libc::kqueue() };
        if kqueue_fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(Mux {
            kqueue_fd,
            native: Vec::with_capacity(EVENT_CAPACITY),
            registered: HashSet::new(),
        })
    }

    fn change(&self, fd: RawFd, filter: i16, flags: u16) -> i32 {
        let event = libc::kevent {
            ident: fd as usize,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };

        let r = unsafe { libc::kevent(self.kqueue_fd, &event, 1, ptr::null_mut(), 0, ptr::null()) };
        if r == -1 { sys::last_errno() } else { 0 }
    }

    pub(crate) fn add(&mut self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        if !self.registered.insert(fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        self.apply(fd, mode)
    }

    pub(crate) fn modify(&mut self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        self.apply(fd, mode)
    }

    fn apply(&self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        let flags = filter_flags(mode);
        if mode.contains(Mode::READ) {
            let errno = self.change(fd, libc::EVFILT_READ, flags);
            if errno != 0 {
                return Err(Error::Io(io::Error::from_raw_os_error(errno)));
            }
        }
        if mode.contains(Mode::WRITE) {
            let errno = self.change(fd, libc::EVFILT_WRITE, flags);
            if errno != 0 {
                return Err(Error::Io(io::Error::from_raw_os_error(errno)));
            }
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, fd: RawFd) {
        self.registered.remove(&fd);
        self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
        self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
    }

    pub(crate) fn wait(
        &mut self,
        timeout: Option<Duration>,
        events: &mut Vec<MuxEvent>,
    ) -> io::Result<usize> {
        events.clear();

        let ts;
        let timespec_ptr = match timeout {
            Some(t) => {
                ts = libc::timespec {
                    tv_sec: t.as_secs() as libc::time_t,
                    tv_nsec: t.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
            None => ptr::null(),
        };

        let n = unsafe {
            libc::kevent(
                self.kqueue_fd,
                ptr::null(),
                0,
                self.native.as_mut_ptr(),
                self.native.capacity() as i32,
                timespec_ptr,
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
            let fd = native.ident as RawFd;
            let mut mode = Mode::empty();

            if native.filter == libc::EVFILT_READ {
                mode |= Mode::READ;
            }
            if native.filter == libc::EVFILT_WRITE {
                mode |= Mode::WRITE;
            }
            if native.flags & libc::EV_ERROR != 0 {
                mode |= Mode::ERROR;
            }

            // The two filters report separately; merge them into one event
            // per descriptor so the loop dispatches a single batch.
            match events.iter_mut().find(|e| e.fd == fd) {
                Some(event) => event.mode |= mode,
                None => events.push(MuxEvent { fd, mode }),
            }
        }

        Ok(events.len())
    }
}

impl Drop for Mux {
    fn drop(&mut self) {
        sys::close(self.kqueue_fd);
    }
}
