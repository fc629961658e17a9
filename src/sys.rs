//! Small syscall helpers shared by the loop, socket and process layers.

use std::io;
use std::os::unix::io::RawFd;

pub(crate) fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Retries a syscall while it fails with EINTR.
pub(crate) fn retry_eintr<F: FnMut() -> isize>(mut f: F) -> isize {
    loop {
        let r = f();
        if r != -1 || last_errno() != libc::EINTR {
            return r;
        }
    }
}

pub(crate) fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = retry_eintr(|| unsafe { libc::fcntl(fd, libc::F_GETFL, 0) } as isize);
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    let r = retry_eintr(|| {
        (unsafe { libc::fcntl(fd, libc::F_SETFL, flags as i32 | libc::O_NONBLOCK) }) as isize
    });
    if r == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if r == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

pub(crate) fn close(fd: RawFd) {
    retry_eintr(|| unsafe { libc::close(fd) } as isize);
}

/// Writes a single byte to a wakeup pipe, retrying through EINTR. A full
/// pipe is not retried: the reader already has wake bytes pending, so the
/// wakeup cannot be lost.
pub(crate) fn write_byte(fd: RawFd, byte: u8) {
    let buf = [byte];
    retry_eintr(|| unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) });
}

/// Reads and discards everything currently readable on `fd`.
pub(crate) fn drain(fd: RawFd) {
    let mut buf = [0u8; 128];
    loop {
        let r = retry_eintr(|| unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) });
        if r <= 0 {
            return;
        }
    }
}
