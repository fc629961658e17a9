use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::net::message::{Message, MessageFactory, RawMessageFactory, FINISH_MESSAGE_ID};
use crate::net::socket::SocketClient;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

// Payloads at or below this size decode through a stack buffer; only larger
// ones allocate.
const INLINE_PAYLOAD: usize = 1024;

type ConnSignal = Option<Box<dyn FnMut(&Connection)>>;

struct ConnInner {
    client: SocketClient,
    inbound: VecDeque<Vec<u8>>,
    pending_read: u32,
    pending_write: usize,
    silent: bool,
    factory: Rc<dyn MessageFactory>,
    on_new_message: Option<Box<dyn FnMut(Message, &Connection)>>,
    on_send_finished: ConnSignal,
    on_finished: ConnSignal,
    on_disconnected: ConnSignal,
    on_error: Option<Box<dyn FnMut(&Connection, Error)>>,
}

fn inbound_size(buffers: &VecDeque<Vec<u8>>) -> usize {
    buffers.iter().map(Vec::len).sum()
}

/// Destructively reads `out.len()` bytes from the front of the buffer
/// sequence. Fully consumed buffers are removed; a partially consumed head
/// is compacted to its remainder. Returns the number of bytes copied.
fn inbound_read(buffers: &mut VecDeque<Vec<u8>>, out: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < out.len() {
        let Some(front) = buffers.front_mut() else { break };
        let take = front.len().min(out.len() - copied);
        out[copied..copied + take].copy_from_slice(&front[..take]);
        copied += take;
        if take == front.len() {
            buffers.pop_front();
        } else {
            front.drain(..take);
        }
    }
    copied
}

/// Framed message transport over a connected stream socket.
///
/// Every frame on the wire is a little-endian `u32` length followed by that
/// many payload bytes, the first of which is the message id. Whole decoded
/// messages are handed to `new_message`; a frame carrying
/// [`FINISH_MESSAGE_ID`] fires `finished` instead.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnInner>>,
}

impl Connection {
    /// An unconnected connection; call [`Connection::connect_to_server`]
    /// next. Frames decode through the given factory.
    pub fn with_factory(factory: Rc<dyn MessageFactory>) -> Connection {
        let conn = Connection {
            inner: Rc::new(RefCell::new(ConnInner {
                client: SocketClient::new(),
                inbound: VecDeque::new(),
                pending_read: 0,
                pending_write: 0,
                silent: false,
                factory,
                on_new_message: None,
                on_send_finished: None,
                on_finished: None,
                on_disconnected: None,
                on_error: None,
            })),
        };
        conn.wire_client();
        conn
    }

    pub fn new() -> Connection {
        Self::with_factory(Rc::new(RawMessageFactory))
    }

    /// Wraps an already-connected client. Data the socket buffered before
    /// the handlers were attached is decoded on the next loop iteration.
    pub fn from_client(client: SocketClient, factory: Rc<dyn MessageFactory>) -> Connection {
        let conn = Self::with_factory(factory);
        conn.inner.borrow_mut().client = client;
        conn.wire_client();

        let weak = Rc::downgrade(&conn.inner);
        if let Some(event_loop) = EventLoop::current() {
            event_loop.call_later(move || {
                let Some(inner) = weak.upgrade() else { return };
                let pending = inner.borrow().client.bytes_available() > 0;
                if pending {
                    Self::on_data_available(&inner);
                }
            });
        }
        conn
    }

    /// Adopts a raw connected descriptor with the pass-through factory.
    pub fn from_fd(fd: std::os::unix::io::RawFd) -> Result<Connection, Error> {
        let client = SocketClient::from_fd(fd)?;
        Ok(Self::from_client(client, Rc::new(RawMessageFactory)))
    }

    fn wire_client(&self) {
        let client = self.inner.borrow().client.clone();

        let weak = Rc::downgrade(&self.inner);
        client.on_ready_read(move |_| {
            if let Some(inner) = weak.upgrade() {
                Connection::on_data_available(&inner);
            }
        });

        let weak = Rc::downgrade(&self.inner);
        client.on_bytes_written(move |_, n| {
            if let Some(inner) = weak.upgrade() {
                Connection::on_data_written(&inner, n);
            }
        });

        let weak = Rc::downgrade(&self.inner);
        client.on_disconnected(move |_| {
            if let Some(inner) = weak.upgrade() {
                Connection::emit(&inner, |i| &mut i.on_disconnected);
            }
        });

        let weak = Rc::downgrade(&self.inner);
        client.on_error(move |_, error| {
            if let Some(inner) = weak.upgrade() {
                Connection::on_socket_error(&inner, error);
            }
        });
    }

    pub fn connect_to_server<P: AsRef<Path>>(&self, path: P, timeout: Option<Duration>) -> bool {
        let client = self.inner.borrow().client.clone();
        client.connect_unix(path, timeout)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().client.is_connected()
    }

    pub fn pending_write(&self) -> usize {
        self.inner.borrow().pending_write
    }

    /// Suppresses error emission on this connection.
    pub fn set_silent(&self, silent: bool) {
        self.inner.borrow_mut().silent = silent;
    }

    /// Encodes and queues one message: a 4-byte length prefix covering id and
    /// payload, then the body. Both underlying writes must succeed; on
    /// failure the connection should be discarded.
    pub fn send(&self, id: u8, payload: &[u8]) -> bool {
        let client = {
            let inner = self.inner.borrow();
            if !inner.client.is_connected() {
                if !inner.silent {
                    log::error!("send of message {} on unconnected connection", id);
                }
                return false;
            }
            inner.client.clone()
        };

        let mut body = Vec::with_capacity(1 + payload.len());
        body.push(id);
        body.extend_from_slice(payload);
        let header = (body.len() as u32).to_le_bytes();

        self.inner.borrow_mut().pending_write += header.len() + body.len();

        if !client.write(&header) {
            return false;
        }
        client.write(&body)
    }

    /// Defers the send to the next loop iteration; use when replying from
    /// inside a `new_message` handler.
    pub fn write_async(&self, id: u8, payload: Vec<u8>) {
        if let Some(event_loop) = EventLoop::current() {
            let weak = Rc::downgrade(&self.inner);
            event_loop.call_later(move || {
                let Some(inner) = weak.upgrade() else { return };
                let conn = Connection { inner };
                conn.send(id, &payload);
            });
        }
    }

    pub fn on_new_message<F: FnMut(Message, &Connection) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_new_message = Some(Box::new(f));
    }

    pub fn on_send_finished<F: FnMut(&Connection) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_send_finished = Some(Box::new(f));
    }

    pub fn on_finished<F: FnMut(&Connection) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_finished = Some(Box::new(f));
    }

    pub fn on_disconnected<F: FnMut(&Connection) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_disconnected = Some(Box::new(f));
    }

    pub fn on_error<F: FnMut(&Connection, Error) + 'static>(&self, f: F) {
        self.inner.borrow_mut().on_error = Some(Box::new(f));
    }

    /// Decode state machine. Header state: wait for the 4-byte length
    /// prefix. Body state: wait for `pending_read` payload bytes, then hand
    /// the frame to the factory and start over. Yields whenever the inbound
    /// sequence runs short; re-entered on the next ready-read.
    fn on_data_available(inner: &Rc<RefCell<ConnInner>>) {
        loop {
            let mut stack = [0u8; INLINE_PAYLOAD];
            let frame;
            {
                let mut guard = inner.borrow_mut();

                let fresh = guard.client.take_buffer();
                if !fresh.is_empty() {
                    guard.inbound.push_back(fresh);
                }

                let mut available = inbound_size(&guard.inbound);
                if available == 0 {
                    break;
                }

                if guard.pending_read == 0 {
                    if available < 4 {
                        break;
                    }
                    let mut prefix = [0u8; 4];
                    inbound_read(&mut guard.inbound, &mut prefix);
                    guard.pending_read = u32::from_le_bytes(prefix);
                    available -= 4;
                }

                let need = guard.pending_read as usize;
                if available < need {
                    break;
                }

                if need <= INLINE_PAYLOAD {
                    inbound_read(&mut guard.inbound, &mut stack[..need]);
                    guard.pending_read = 0;
                    frame = None;
                } else {
                    let mut heap = vec![0u8; need];
                    inbound_read(&mut guard.inbound, &mut heap);
                    guard.pending_read = 0;
                    frame = Some(heap);
                }

                let bytes: &[u8] = match &frame {
                    Some(heap) => heap,
                    None => &stack[..need],
                };

                if bytes.is_empty() {
                    log::warn!("dropping zero-length frame");
                    continue;
                }

                let id = bytes[0];
                let payload = &bytes[1..];

                if id == FINISH_MESSAGE_ID {
                    drop(guard);
                    Self::emit(inner, |i| &mut i.on_finished);
                    continue;
                }

                let factory = guard.factory.clone();
                match factory.create(id, payload) {
                    Some(message) => {
                        drop(guard);
                        Self::emit_new_message(inner, message);
                    }
                    None => {
                        log::warn!("message factory rejected frame with id {}", id);
                    }
                }
            }
        }
    }

    fn on_data_written(inner: &Rc<RefCell<ConnInner>>, n: usize) {
        let drained = {
            let mut guard = inner.borrow_mut();
            debug_assert!(guard.pending_write >= n);
            guard.pending_write = guard.pending_write.saturating_sub(n);
            guard.pending_write == 0
        };
        if drained {
            Self::emit(inner, |i| &mut i.on_send_finished);
        }
    }

    fn on_socket_error(inner: &Rc<RefCell<ConnInner>>, error: Error) {
        let silent = inner.borrow().silent;
        if silent {
            return;
        }
        log::error!("connection socket error: {}", error);
        let taken = inner.borrow_mut().on_error.take();
        if let Some(mut f) = taken {
            let conn = Connection {
                inner: inner.clone(),
            };
            f(&conn, error);
            let mut guard = inner.borrow_mut();
            if guard.on_error.is_none() {
                guard.on_error = Some(f);
            }
        }
    }

    fn emit(inner: &Rc<RefCell<ConnInner>>, slot: fn(&mut ConnInner) -> &mut ConnSignal) {
        let taken = slot(&mut *inner.borrow_mut()).take();
        if let Some(mut f) = taken {
            let conn = Connection {
                inner: inner.clone(),
            };
            f(&conn);
            let mut guard = inner.borrow_mut();
            let slot = slot(&mut guard);
            if slot.is_none() {
                *slot = Some(f);
            }
        }
    }

    fn emit_new_message(inner: &Rc<RefCell<ConnInner>>, message: Message) {
        let taken = inner.borrow_mut().on_new_message.take();
        if let Some(mut f) = taken {
            let conn = Connection {
                inner: inner.clone(),
            };
            f(message, &conn);
            let mut guard = inner.borrow_mut();
            if guard.on_new_message.is_none() {
                guard.on_new_message = Some(f);
            }
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}
