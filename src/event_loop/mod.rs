//! Per-thread cooperative event loop.
//!
//! An [`EventLoop`] multiplexes file-descriptor readiness, timers and posted
//! callables on a single thread. All socket and timer callbacks run on the
//! loop's thread, serialized. The only sanctioned cross-thread channels into
//! a loop are the posted-event queue and the wake pipe, both reachable
//! through a [`LoopHandle`].
//!
//! One iteration of the scheduler drains posted events, blocks in the
//! multiplexer until the next timer deadline (or wakeup), dispatches socket
//! callbacks, then fires due timers.

mod timer;

pub use timer::TimerFlags;

use crate::error::Error;
use crate::mux::{Mode, Mux, MuxEvent};
use crate::sys;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak as ArcWeak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

bitflags::bitflags! {
    /// Flags passed to [`EventLoop::init`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoopFlags: u32 {
        /// Install this loop in the process-global main slot.
        const MAIN_EVENT_LOOP = 0x1;
        /// Quit the main loop on SIGINT. Main loop only.
        const ENABLE_SIGINT_HANDLER = 0x2;
        /// Quit the main loop on SIGTERM. Main loop only.
        const ENABLE_SIGTERM_HANDLER = 0x4;
    }
}

/// Outcome of [`EventLoop::exec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecResult {
    /// The loop observed [`EventLoop::quit`].
    Success,
    /// The outer exec timeout or the inactivity timeout expired.
    Timeout,
    /// The multiplexer failed; the loop cannot continue.
    GeneralError,
}

/// A posted callable, executed once on the loop thread.
///
/// Implemented for every `FnOnce()` closure, so most callers never name this
/// trait directly.
pub trait Event {
    fn exec(self: Box<Self>);
}

impl<F: FnOnce()> Event for F {
    fn exec(self: Box<Self>) {
        (*self)()
    }
}

/// Cross-thread state: the posted queue and the wake pipe.
struct Shared {
    posted: Mutex<VecDeque<Box<dyn Event + Send>>>,
    wake_write: RawFd,
    stop: AtomicBool,
    polling: AtomicBool,
    thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn wake(&self) {
        sys::write_byte(self.wake_write, b'w');
    }

    /// A poster on the loop thread outside of the multiplexer wait does not
    /// need a wakeup; everything else does.
    fn wake_if_needed(&self) {
        let on_loop_thread = *self.thread.lock().unwrap() == Some(thread::current().id());
        if !on_loop_thread || self.polling.load(Ordering::Acquire) {
            self.wake();
        }
    }

    fn quit(&self) {
        self.stop.store(true, Ordering::Release);
        self.wake();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        sys::close(self.wake_write);
    }
}

/// Cloneable, `Send` handle to a loop: post work and request shutdown from
/// any thread. The handle stays valid after the loop is destroyed; posts
/// simply go nowhere.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.post_event(Box::new(f));
    }

    pub fn post_event(&self, event: Box<dyn Event + Send>) {
        self.shared.posted.lock().unwrap().push_back(event);
        self.shared.wake_if_needed();
    }

    /// Sets the stop flag and wakes the loop. Level-triggered: the flag
    /// persists until the loop observes it.
    pub fn quit(&self) {
        self.shared.quit();
    }

    /// Forces the loop out of its multiplexer wait without posting work.
    pub fn wakeup(&self) {
        self.shared.wake();
    }
}

type SocketCallback = Rc<RefCell<dyn FnMut(RawFd, Mode)>>;

struct SocketData {
    mode: Mode,
    callback: SocketCallback,
}

/// Loop-private state. Only ever touched on the loop thread.
struct Inner {
    mux: Mux,
    wake_read: RawFd,
    sockets: HashMap<RawFd, SocketData>,
    timers: timer::TimerQueue,
    local_posted: VecDeque<Box<dyn Event>>,
    flags: LoopFlags,
    thread: ThreadId,
    inactivity_timeout: Option<Duration>,
    timed_out: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for (&fd, _) in self.sockets.iter() {
            self.mux.remove(fd);
        }
        sys::close(self.wake_read);
    }
}

struct CurrentSlot {
    inner: Weak<RefCell<Inner>>,
    shared: ArcWeak<Shared>,
}

thread_local! {
    static CURRENT: RefCell<Option<CurrentSlot>> = const { RefCell::new(None) };
}

static MAIN_LOOP: Mutex<Option<ArcWeak<Shared>>> = Mutex::new(None);

static SIGNAL_PIPE: OnceLock<(RawFd, RawFd)> = OnceLock::new();
static SIGNAL_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

// Async-signal-safe: a single write to the signal pipe, nothing else.
extern "C" fn quit_signal_handler(sig: libc::c_int) {
    let fd = SIGNAL_PIPE_WRITE.load(Ordering::Relaxed);
    if fd != -1 {
        let byte = sig as u8;
        unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    }
}

/// Cooperative single-threaded scheduler of FD readiness, timers and posted
/// callables.
///
/// Cloning is shallow; all clones drive the same loop. The loop registers
/// itself in a thread-local slot at [`EventLoop::init`], reachable through
/// [`EventLoop::current`] until the last clone is dropped.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<Inner>>,
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new() -> Result<EventLoop, Error> {
        let mux = Mux::new().map_err(Error::MuxFailure)?;
        let (wake_read, wake_write) = sys::pipe()?;
        sys::set_nonblocking(wake_read)?;
        sys::set_nonblocking(wake_write)?;

        Ok(EventLoop {
            inner: Rc::new(RefCell::new(Inner {
                mux,
                wake_read,
                sockets: HashMap::new(),
                timers: timer::TimerQueue::new(),
                local_posted: VecDeque::new(),
                flags: LoopFlags::empty(),
                thread: thread::current().id(),
                inactivity_timeout: None,
                timed_out: false,
            })),
            shared: Arc::new(Shared {
                posted: Mutex::new(VecDeque::new()),
                wake_write,
                stop: AtomicBool::new(false),
                polling: AtomicBool::new(false),
                thread: Mutex::new(None),
            }),
        })
    }

    /// Wires the loop to its thread: records the thread id, installs the
    /// thread-local (and, for the main loop, process-global) slot, registers
    /// the wake pipe and any requested signal handlers. Call once, on the
    /// thread that will run [`EventLoop::exec`].
    pub fn init(&self, flags: LoopFlags) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.flags = flags;
            inner.thread = thread::current().id();
        }
        *self.shared.thread.lock().unwrap() = Some(thread::current().id());

        CURRENT.with(|slot| {
            *slot.borrow_mut() = Some(CurrentSlot {
                inner: Rc::downgrade(&self.inner),
                shared: Arc::downgrade(&self.shared),
            });
        });

        if flags.contains(LoopFlags::MAIN_EVENT_LOOP) {
            *MAIN_LOOP.lock().unwrap() = Some(Arc::downgrade(&self.shared));
        }

        let wake_read = self.inner.borrow().wake_read;
        self.register_socket(wake_read, Mode::READ, move |fd, _mode| {
            sys::drain(fd);
        })?;

        let wants_signals = flags
            .intersects(LoopFlags::ENABLE_SIGINT_HANDLER | LoopFlags::ENABLE_SIGTERM_HANDLER);
        if wants_signals {
            if flags.contains(LoopFlags::MAIN_EVENT_LOOP) {
                self.install_signal_handlers(flags)?;
            } else {
                log::warn!("signal handlers requested on a non-main event loop, ignoring");
            }
        }

        Ok(())
    }

    fn install_signal_handlers(&self, flags: LoopFlags) -> Result<(), Error> {
        let &(read_fd, write_fd) = match SIGNAL_PIPE.get() {
            Some(fds) => fds,
            None => {
                let fds = sys::pipe()?;
                sys::set_nonblocking(fds.0)?;
                sys::set_nonblocking(fds.1)?;
                SIGNAL_PIPE.get_or_init(|| fds)
            }
        };
        SIGNAL_PIPE_WRITE.store(write_fd, Ordering::Relaxed);

        let shared = self.shared.clone();
        self.register_socket(read_fd, Mode::READ, move |fd, _mode| {
            sys::drain(fd);
            shared.quit();
        })?;

        unsafe {
            if flags.contains(LoopFlags::ENABLE_SIGINT_HANDLER) {
                libc::signal(libc::SIGINT, quit_signal_handler as libc::sighandler_t);
            }
            if flags.contains(LoopFlags::ENABLE_SIGTERM_HANDLER) {
                libc::signal(libc::SIGTERM, quit_signal_handler as libc::sighandler_t);
            }
        }

        Ok(())
    }

    /// The loop installed on the current thread, if any.
    pub fn current() -> Option<EventLoop> {
        CURRENT.with(|slot| {
            let slot = slot.borrow();
            let current = slot.as_ref()?;
            Some(EventLoop {
                inner: current.inner.upgrade()?,
                shared: current.shared.upgrade()?,
            })
        })
    }

    /// Cross-thread handle to the main loop, if one was initialised.
    pub fn main_handle() -> Option<LoopHandle> {
        let slot = MAIN_LOOP.lock().unwrap();
        let shared = slot.as_ref()?.upgrade()?;
        Some(LoopHandle { shared })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn flags(&self) -> LoopFlags {
        self.inner.borrow().flags
    }

    /// When no events arrive for this long, [`EventLoop::exec`] returns
    /// [`ExecResult::Timeout`]. Changing it while the loop is running may
    /// not be honoured until the next exec.
    pub fn set_inactivity_timeout(&self, timeout: Option<Duration>) {
        self.inner.borrow_mut().inactivity_timeout = timeout;
    }

    fn check_thread(&self, what: &str) {
        let owner = self.inner.borrow().thread;
        if owner != thread::current().id() {
            panic!("EventLoop::{} called from a foreign thread", what);
        }
    }

    /// Thread-safe; the event runs on the loop thread at the start of the
    /// next iteration, FIFO per posting thread.
    pub fn post<F: FnOnce() + Send + 'static>(&self, f: F) {
        self.handle().post(f);
    }

    pub fn post_event(&self, event: Box<dyn Event + Send>) {
        self.handle().post_event(event);
    }

    /// Defers a non-`Send` callable to the next iteration. Loop thread only;
    /// this is the recursion-breaking primitive for code already running on
    /// the loop.
    pub fn call_later<F: FnOnce() + 'static>(&self, f: F) {
        self.check_thread("call_later");
        self.inner.borrow_mut().local_posted.push_back(Box::new(f));
    }

    pub fn quit(&self) {
        self.shared.quit();
    }

    pub fn wakeup(&self) {
        self.shared.wake();
    }

    /// Registers `fd` with the multiplexer. The callback fires on the loop
    /// thread with the subset of mode bits that became ready. Loop thread
    /// only.
    pub fn register_socket<F>(&self, fd: RawFd, mode: Mode, callback: F) -> Result<(), Error>
    where
        F: FnMut(RawFd, Mode) + 'static,
    {
        self.check_thread("register_socket");
        let mut inner = self.inner.borrow_mut();
        if inner.sockets.contains_key(&fd) {
            return Err(Error::AlreadyRegistered(fd));
        }
        inner.mux.add(fd, mode)?;
        inner.sockets.insert(
            fd,
            SocketData {
                mode,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        Ok(())
    }

    /// Replaces the interest bits of an already-registered descriptor.
    pub fn update_socket(&self, fd: RawFd, mode: Mode) -> Result<(), Error> {
        self.check_thread("update_socket");
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        match inner.sockets.get_mut(&fd) {
            None => Err(Error::Io(std::io::Error::from_raw_os_error(libc::ENOENT))),
            Some(data) => {
                data.mode = mode;
                inner.mux.modify(fd, mode)
            }
        }
    }

    /// Idempotent. Always unregister before closing the descriptor so a
    /// reused fd cannot receive a stale callback.
    pub fn unregister_socket(&self, fd: RawFd) {
        self.check_thread("unregister_socket");
        let mut inner = self.inner.borrow_mut();
        inner.sockets.remove(&fd);
        inner.mux.remove(fd);
    }

    /// Registers a timer due `timeout` from now and returns its id. Without
    /// [`TimerFlags::SINGLE_SHOT`] the timer repeats at `timeout` intervals
    /// until unregistered; the next firing is not scheduled until the
    /// previous callback returns.
    pub fn register_timer<F>(&self, timeout: Duration, flags: TimerFlags, callback: F) -> u32
    where
        F: FnMut(u32) + 'static,
    {
        self.check_thread("register_timer");
        self.inner.borrow_mut().timers.register(
            timeout,
            flags,
            Rc::new(RefCell::new(callback)),
            Instant::now(),
        )
    }

    /// Loop thread only; cross-thread cancellation must be posted. Safe to
    /// call from within the timer's own callback.
    pub fn unregister_timer(&self, id: u32) {
        self.check_thread("unregister_timer");
        self.inner.borrow_mut().timers.unregister(id);
    }

    /// One-shot synchronous wait for readiness on a single registered
    /// descriptor, dispatching only that descriptor's callback. Runs no
    /// posted events and no timers. Returns the fired mode bits.
    pub fn process_socket(&self, fd: RawFd, timeout: Option<Duration>) -> Mode {
        self.check_thread("process_socket");

        let (mode, callback) = {
            let inner = self.inner.borrow();
            match inner.sockets.get(&fd) {
                None => return Mode::empty(),
                Some(data) => (data.mode, data.callback.clone()),
            }
        };

        let mut pollfd = libc::pollfd {
            fd,
            events: 0,
            revents: 0,
        };
        if mode.contains(Mode::READ) {
            pollfd.events |= libc::POLLIN;
        }
        if mode.contains(Mode::WRITE) {
            pollfd.events |= libc::POLLOUT;
        }

        let timeout_ms = crate::mux::timeout_ms(timeout);
        let r = sys::retry_eintr(|| unsafe { libc::poll(&mut pollfd, 1, timeout_ms) } as isize);
        if r <= 0 {
            return Mode::empty();
        }

        let mut fired = Mode::empty();
        if pollfd.revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            fired |= Mode::READ;
        }
        if pollfd.revents & libc::POLLOUT != 0 {
            fired |= Mode::WRITE;
        }
        if pollfd.revents & libc::POLLERR != 0 {
            fired |= Mode::ERROR;
        }

        if !fired.is_empty() {
            (callback.borrow_mut())(fd, fired);
        }
        fired
    }

    /// Drains both posted queues up to their lengths at entry, so events that
    /// re-post cannot livelock the iteration. Panicking events are logged
    /// and swallowed; the loop continues.
    fn send_posted_events(&self) -> bool {
        let mut ran = false;

        let mut remaining = self.shared.posted.lock().unwrap().len();
        while remaining > 0 {
            remaining -= 1;
            let event = self.shared.posted.lock().unwrap().pop_front();
            let Some(event) = event else { break };
            ran = true;
            if catch_unwind(AssertUnwindSafe(|| event.exec())).is_err() {
                log::error!("posted event panicked; continuing");
            }
        }

        let mut remaining = self.inner.borrow().local_posted.len();
        while remaining > 0 {
            remaining -= 1;
            let event = self.inner.borrow_mut().local_posted.pop_front();
            let Some(event) = event else { break };
            ran = true;
            if catch_unwind(AssertUnwindSafe(|| event.exec())).is_err() {
                log::error!("posted event panicked; continuing");
            }
        }

        ran
    }

    /// Fires every timer due at entry. Timers (re-)inserted while draining
    /// wait for the next iteration, so an interval-0 repeating timer fires
    /// once per iteration instead of spinning.
    fn send_timers(&self) -> bool {
        let now = Instant::now();
        let watermark = self.inner.borrow().timers.watermark();
        let mut fired = false;

        loop {
            let due = self.inner.borrow_mut().timers.take_due(now, watermark);
            let Some(due) = due else { break };
            fired = true;

            (due.callback.borrow_mut())(due.id);

            let mut inner = self.inner.borrow_mut();
            let cancelled = inner.timers.end_fire();
            if !cancelled && !due.flags.contains(TimerFlags::SINGLE_SHOT) {
                inner.timers.reschedule(due, now);
            }
        }

        fired
    }

    fn fire_socket(&self, event: MuxEvent) {
        let (mode, callback) = {
            let inner = self.inner.borrow();
            match inner.sockets.get(&event.fd) {
                None => return,
                Some(data) => (data.mode, data.callback.clone()),
            }
        };

        // One-shot registrations are removed before dispatch; re-arming is a
        // fresh register_socket.
        if mode.contains(Mode::ONE_SHOT) {
            self.unregister_socket(event.fd);
        }

        (callback.borrow_mut())(event.fd, event.mode);
    }

    fn has_pending_posts(&self) -> bool {
        !self.shared.posted.lock().unwrap().is_empty()
            || !self.inner.borrow().local_posted.is_empty()
    }

    /// Runs the scheduler until [`EventLoop::quit`] (`Success`), the outer or
    /// inactivity timeout (`Timeout`), or a multiplexer failure
    /// (`GeneralError`). Loop thread only; nested exec is not supported.
    pub fn exec(&self, timeout: Option<Duration>) -> ExecResult {
        self.check_thread("exec");

        let deadline = timeout.map(|t| Instant::now() + t);
        let inactivity = self.inner.borrow().inactivity_timeout;
        let mut last_activity = Instant::now();
        let mut events: Vec<MuxEvent> = Vec::with_capacity(64);

        loop {
            if self.send_posted_events() {
                last_activity = Instant::now();
            }

            if self.shared.stop.swap(false, Ordering::AcqRel) {
                // Everything enqueued before quit() still runs; the posting
                // thread's queue insert happens-before the flag.
                self.send_posted_events();
                return ExecResult::Success;
            }

            let now = Instant::now();
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return ExecResult::Timeout;
                }
            }

            let mut wait: Option<Duration> = None;
            let mut clamp = |limit: Duration| {
                wait = Some(wait.map_or(limit, |w| w.min(limit)));
            };
            if self.has_pending_posts() {
                clamp(Duration::ZERO);
            }
            if let Some(next) = self.inner.borrow().timers.next_when() {
                clamp(next.saturating_duration_since(now));
            }
            if let Some(inactivity) = inactivity {
                clamp(inactivity.saturating_sub(now - last_activity));
            }
            if let Some(deadline) = deadline {
                clamp(deadline.saturating_duration_since(now));
            }

            self.shared.polling.store(true, Ordering::Release);
            let waited = {
                let mut inner = self.inner.borrow_mut();
                inner.mux.wait(wait, &mut events)
            };
            self.shared.polling.store(false, Ordering::Release);

            match waited {
                Ok(count) => {
                    if count > 0 {
                        last_activity = Instant::now();
                    }
                }
                Err(error) => {
                    log::error!("multiplexer wait failed: {}", error);
                    return ExecResult::GeneralError;
                }
            }

            for i in 0..events.len() {
                self.fire_socket(events[i]);
            }

            if self.send_timers() {
                last_activity = Instant::now();
            }

            if let Some(inactivity) = inactivity {
                if Instant::now().saturating_duration_since(last_activity) >= inactivity {
                    self.inner.borrow_mut().timed_out = true;
                    return ExecResult::Timeout;
                }
            }
        }
    }

    /// Whether the last exec ended on the inactivity timeout.
    pub fn timed_out(&self) -> bool {
        self.inner.borrow().timed_out
    }
}
