use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::mux::Mode;
use crate::sys;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::Once;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 1024;
const MAX_READ_BUFFER: usize = 16 * 1024 * 1024;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

static IGNORE_SIGPIPE: Once = Once::new();

fn ignore_sigpipe() {
    IGNORE_SIGPIPE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

type ClientSignal = Option<Box<dyn FnMut(&SocketClient)>>;

struct ClientInner {
    fd: RawFd,
    write_buffers: std::collections::VecDeque<Vec<u8>>,
    write_index: usize,
    read_buffer: Vec<u8>,
    read_pos: usize,
    on_connected: ClientSignal,
    on_disconnected: ClientSignal,
    on_ready_read: ClientSignal,
    on_bytes_written: Option<Box<dyn FnMut(&SocketClient, usize)>>,
    on_error: Option<Box<dyn FnMut(&SocketClient, Error)>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.fd != -1 {
            if let Some(event_loop) = EventLoop::current() {
                event_loop.unregister_socket(self.fd);
            }
            sys::close(self.fd);
        }
    }
}

/// Nonblocking stream socket bound to the current thread's event loop.
///
/// Reads drain into an internal buffer capped at 16 MiB and are reported
/// through `ready_read`; writes queue and flush as the descriptor allows,
/// reported through `bytes_written`. Write interest is registered only while
/// the queue is non-empty.
#[derive(Clone)]
pub struct SocketClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl SocketClient {
    /// An unconnected client; call [`SocketClient::connect_unix`] next.
    pub fn new() -> SocketClient {
        ignore_sigpipe();
        SocketClient {
            inner: Rc::new(RefCell::new(ClientInner {
                fd: -1,
                write_buffers: std::collections::VecDeque::new(),
                write_index: 0,
                read_buffer: Vec::new(),
                read_pos: 0,
                on_connected: None,
                on_disconnected: None,
                on_ready_read: None,
                on_bytes_written: None,
                on_error: None,
            })),
        }
    }

    /// Adopts an already-connected descriptor: sets it nonblocking and
    /// registers it for reads with the current thread's loop.
    pub fn from_fd(fd: RawFd) -> Result<SocketClient, Error> {
        let client = SocketClient::new();
        client.inner.borrow_mut().fd = fd;
        sys::set_nonblocking(fd)?;
        client.register(Mode::READ)?;
        Ok(client)
    }

    fn event_loop() -> EventLoop {
        match EventLoop::current() {
            Some(event_loop) => event_loop,
            None => panic!("no event loop on this thread"),
        }
    }

    fn register(&self, mode: Mode) -> Result<(), Error> {
        let fd = self.inner.borrow().fd;
        let weak = Rc::downgrade(&self.inner);
        Self::event_loop().register_socket(fd, mode, move |fd, fired| {
            Self::data_callback(&weak, fd, fired);
        })
    }

    fn data_callback(weak: &Weak<RefCell<ClientInner>>, _fd: RawFd, fired: Mode) {
        let Some(inner) = weak.upgrade() else { return };
        let client = SocketClient { inner };
        if fired.intersects(Mode::READ | Mode::ERROR) {
            client.read_more();
        }
        if fired.contains(Mode::WRITE) {
            client.write_more();
        }
    }

    /// Blocking connect to a unix stream socket, retrying every 100 ms until
    /// the server accepts or `timeout` elapses. On success the descriptor is
    /// registered with the current loop and `connected` fires.
    pub fn connect_unix<P: AsRef<Path>>(&self, path: P, timeout: Option<Duration>) -> bool {
        use std::os::unix::ffi::OsStrExt;

        let bytes = path.as_ref().as_os_str().as_bytes();
        let mut address: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        address.sun_family = libc::AF_UNIX as libc::sa_family_t;
        if bytes.len() >= address.sun_path.len() {
            return false;
        }
        for (dst, &src) in address.sun_path.iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }

        let started = Instant::now();
        let fd = loop {
            let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
            if fd == -1 {
                return false;
            }

            let r = sys::retry_eintr(|| {
                (unsafe {
                    libc::connect(
                        fd,
                        &address as *const libc::sockaddr_un as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
                    )
                }) as isize
            });
            if r == 0 {
                break fd;
            }

            sys::close(fd);
            if let Some(timeout) = timeout {
                if started.elapsed() >= timeout {
                    return false;
                }
            }
            std::thread::sleep(CONNECT_RETRY_DELAY);
        };

        if sys::set_nonblocking(fd).is_err() {
            sys::close(fd);
            return false;
        }

        let mode = if self.inner.borrow().write_buffers.is_empty() {
            Mode::READ
        } else {
            Mode::READ | Mode::WRITE
        };
        self.inner.borrow_mut().fd = fd;
        if self.register(mode).is_err() {
            self.inner.borrow_mut().fd = -1;
            sys::close(fd);
            return false;
        }

        self.emit_plain(|inner| &mut inner.on_connected);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().fd != -1
    }

    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// Queues `data` and flushes as much as the socket accepts right now.
    /// Returns false on a hard write error; EAGAIN is not an error, the
    /// remainder flushes as the loop reports writability.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        {
            let mut inner = self.inner.borrow_mut();
            if inner.fd == -1 {
                log::debug!("write on unconnected socket");
                return false;
            }
            let fd = inner.fd;
            let was_empty = inner.write_buffers.is_empty();
            inner.write_buffers.push_back(data.to_vec());
            drop(inner);
            if was_empty {
                let _ = Self::event_loop().update_socket(fd, Mode::READ | Mode::WRITE);
            }
        }
        self.write_more()
    }

    fn write_more(&self) -> bool {
        let mut written = 0usize;
        let mut hard_error: Option<std::io::Error> = None;

        loop {
            let mut inner = self.inner.borrow_mut();
            let fd = inner.fd;
            if fd == -1 {
                break;
            }
            if inner.write_buffers.is_empty() {
                drop(inner);
                let _ = Self::event_loop().update_socket(fd, Mode::READ);
                break;
            }

            let index = inner.write_index;
            let front = &inner.write_buffers[0];
            let remaining = &front[index..];
            let want = remaining.len();
            let w = sys::retry_eintr(|| unsafe {
                libc::send(
                    fd,
                    remaining.as_ptr() as *const libc::c_void,
                    want,
                    libc::MSG_NOSIGNAL,
                )
            });

            if w == -1 {
                if !sys::would_block(sys::last_errno()) {
                    hard_error = Some(std::io::Error::last_os_error());
                }
                break;
            }

            let w = w as usize;
            written += w;
            if index + w == front.len() {
                inner.write_buffers.pop_front();
                inner.write_index = 0;
            } else {
                inner.write_index = index + w;
            }
        }

        if written > 0 {
            self.emit_bytes_written(written);
        }
        match hard_error {
            Some(error) => {
                self.emit_error(Error::WriteFailed(error));
                false
            }
            None => true,
        }
    }

    fn read_more(&self) {
        let mut total = 0usize;
        let mut was_disconnected = false;
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let mut inner = self.inner.borrow_mut();
            let fd = inner.fd;
            if fd == -1 {
                break;
            }

            let r = sys::retry_eintr(|| unsafe {
                libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            });

            if r == -1 {
                if !sys::would_block(sys::last_errno()) {
                    log::debug!("socket read failed: {}", std::io::Error::last_os_error());
                    was_disconnected = true;
                }
                break;
            }
            if r == 0 {
                was_disconnected = true;
                break;
            }

            let r = r as usize;
            if inner.read_buffer.len() + r > MAX_READ_BUFFER {
                if inner.read_buffer.len() + r - inner.read_pos <= MAX_READ_BUFFER {
                    let pos = inner.read_pos;
                    inner.read_buffer.drain(..pos);
                    inner.read_pos = 0;
                } else {
                    log::error!(
                        "socket read buffer exhausted ({} bytes), dropping",
                        inner.read_buffer.len()
                    );
                    inner.read_buffer.clear();
                    inner.read_pos = 0;
                }
            }
            inner.read_buffer.extend_from_slice(&buf[..r]);
            total += r;
        }

        if total > 0 {
            self.emit_plain(|inner| &mut inner.on_ready_read);
        }
        if was_disconnected {
            self.disconnect();
        }
    }

    /// Unregisters, closes and reports `disconnected`. Idempotent.
    pub fn disconnect(&self) {
        let fd = {
            let mut inner = self.inner.borrow_mut();
            let fd = inner.fd;
            inner.fd = -1;
            fd
        };
        if fd == -1 {
            return;
        }
        if let Some(event_loop) = EventLoop::current() {
            event_loop.unregister_socket(fd);
        }
        sys::close(fd);
        self.emit_plain(|inner| &mut inner.on_disconnected);
    }

    pub fn bytes_available(&self) -> usize {
        let inner = self.inner.borrow();
        inner.read_buffer.len() - inner.read_pos
    }

    /// Takes everything received since the last take, dropping the already
    /// consumed prefix.
    pub fn take_buffer(&self) -> Vec<u8> {
        let mut inner = self.inner.borrow_mut();
        let pos = inner.read_pos;
        if pos > 0 {
            inner.read_buffer.drain(..pos);
            inner.read_pos = 0;
        }
        std::mem::take(&mut inner.read_buffer)
    }

    /// Copies up to `buf.len()` buffered bytes out, consuming them.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut inner = self.inner.borrow_mut();
        let available = inner.read_buffer.len() - inner.read_pos;
        let n = available.min(buf.len());
        if n > 0 {
            let pos = inner.read_pos;
            buf[..n].copy_from_slice(&inner.read_buffer[pos..pos + n]);
            inner.read_pos += n;
            if inner.read_pos == inner.read_buffer.len() {
                inner.read_buffer.clear();
                inner.read_pos = 0;
            }
        }
        n
    }

    pub fn on_connected<F: FnMut(&SocketClient) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_connected = Some(Box::new(f));
    }

    pub fn on_disconnected<F: FnMut(&SocketClient) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_disconnected = Some(Box::new(f));
    }

    pub fn on_ready_read<F: FnMut(&SocketClient) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_ready_read = Some(Box::new(f));
    }

    pub fn on_bytes_written<F: FnMut(&SocketClient, usize) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_bytes_written = Some(Box::new(f));
    }

    pub fn on_error<F: FnMut(&SocketClient, Error) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_error = Some(Box::new(f));
    }

    // Signals are taken out of the slot while firing so a handler can use the
    // client freely; a handler that installs a replacement wins over the
    // put-back.
    fn emit_plain(&self, slot: fn(&mut ClientInner) -> &mut ClientSignal) {
        let taken = slot(&mut *self.inner.borrow_mut()).take();
        if let Some(mut f) = taken {
            f(self);
            let mut inner = self.inner.borrow_mut();
            let slot = slot(&mut inner);
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    fn emit_bytes_written(&self, n: usize) {
        let taken = self.inner.borrow_mut().on_bytes_written.take();
        if let Some(mut f) = taken {
            f(self, n);
            let mut inner = self.inner.borrow_mut();
            if inner.on_bytes_written.is_none() {
                inner.on_bytes_written = Some(f);
            }
        }
    }

    fn emit_error(&self, error: Error) {
        let taken = self.inner.borrow_mut().on_error.take();
        if let Some(mut f) = taken {
            f(self, error);
            let mut inner = self.inner.borrow_mut();
            if inner.on_error.is_none() {
                inner.on_error = Some(f);
            }
        }
    }
}

impl Default for SocketClient {
    fn default() -> Self {
        Self::new()
    }
}
