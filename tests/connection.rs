use eventkit::{Connection, EventLoop, ExecResult, LoopFlags, Message, MessageFactory, TimerFlags, FINISH_MESSAGE_ID};

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

fn socketpair() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let r = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(r, 0, "socketpair() failed");
    (fds[0], fds[1])
}

fn write_raw(fd: RawFd, bytes: &[u8]) {
    let wrote = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
    assert_eq!(wrote, bytes.len() as isize);
}

#[test]
fn test_echo_over_socketpair() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (client_fd, server_fd) = socketpair();
    let client = Connection::from_fd(client_fd).unwrap();
    let server = Connection::from_fd(server_fd).unwrap();

    let server_got = Rc::new(RefCell::new(Vec::new()));
    let client_got = Rc::new(RefCell::new(Vec::new()));
    let client_send_finished = Rc::new(RefCell::new(0));
    let server_send_finished = Rc::new(RefCell::new(0));

    let server_got2 = server_got.clone();
    server.on_new_message(move |message, conn| {
        server_got2.borrow_mut().push((message.id(), message.payload().to_vec()));
        // Echo straight back.
        assert!(conn.send(message.id(), message.payload()));
    });

    let client_got2 = client_got.clone();
    client.on_new_message(move |message, _conn| {
        client_got2.borrow_mut().push((message.id(), message.payload().to_vec()));
        EventLoop::current().unwrap().quit();
    });

    let counter = client_send_finished.clone();
    client.on_send_finished(move |_| {
        *counter.borrow_mut() += 1;
    });
    let counter = server_send_finished.clone();
    server.on_send_finished(move |_| {
        *counter.borrow_mut() += 1;
    });

    assert!(client.send(7, b"hello"));

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);

    assert_eq!(*server_got.borrow(), vec![(7u8, b"hello".to_vec())]);
    assert_eq!(*client_got.borrow(), vec![(7u8, b"hello".to_vec())]);
    assert!(*client_send_finished.borrow() >= 1);
    assert!(*server_send_finished.borrow() >= 1);
    assert_eq!(client.pending_write(), 0);
    assert_eq!(server.pending_write(), 0);
}

#[test]
fn test_fragmented_frame_decodes_once_complete() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (conn_fd, raw_fd) = socketpair();
    let conn = Connection::from_fd(conn_fd).unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    conn.on_new_message(move |message, _| {
        got2.borrow_mut().push((message.id(), message.payload().to_vec()));
        EventLoop::current().unwrap().quit();
    });

    // Length prefix first, payload a little later.
    write_raw(raw_fd, &[0x05, 0x00, 0x00, 0x00]);

    let got_early = got.clone();
    event_loop.register_timer(Duration::from_millis(10), TimerFlags::SINGLE_SHOT, move |_| {
        assert!(got_early.borrow().is_empty(), "frame decoded before its payload arrived");
        write_raw(raw_fd, &[0x09, b'A', b'B', b'C', b'D']);
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*got.borrow(), vec![(9u8, b"ABCD".to_vec())]);
    unsafe { libc::close(raw_fd) };
}

#[test]
fn test_length_prefix_split_into_single_bytes() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (conn_fd, raw_fd) = socketpair();
    let conn = Connection::from_fd(conn_fd).unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    conn.on_new_message(move |message, _| {
        got2.borrow_mut().push((message.id(), message.payload().to_vec()));
        EventLoop::current().unwrap().quit();
    });

    // Frame: length 3, id 5, payload "xy" - header delivered byte by byte.
    let frame = [0x03u8, 0x00, 0x00, 0x00, 5, b'x', b'y'];
    let sent = Rc::new(RefCell::new(0usize));
    let sent2 = sent.clone();
    event_loop.register_timer(Duration::from_millis(5), TimerFlags::empty(), move |id| {
        let mut sent = sent2.borrow_mut();
        if *sent < 4 {
            write_raw(raw_fd, &frame[*sent..*sent + 1]);
            *sent += 1;
        } else {
            write_raw(raw_fd, &frame[4..]);
            EventLoop::current().unwrap().unregister_timer(id);
        }
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*got.borrow(), vec![(5u8, b"xy".to_vec())]);
    unsafe { libc::close(raw_fd) };
}

#[test]
fn test_zero_payload_frame() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (conn_fd, raw_fd) = socketpair();
    let conn = Connection::from_fd(conn_fd).unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    conn.on_new_message(move |message, _| {
        got2.borrow_mut().push((message.id(), message.payload().to_vec()));
        EventLoop::current().unwrap().quit();
    });

    write_raw(raw_fd, &[0x01, 0x00, 0x00, 0x00, 42]);

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*got.borrow(), vec![(42u8, Vec::new())]);
    unsafe { libc::close(raw_fd) };
}

#[test]
fn test_finish_frame_fires_finished_not_new_message() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (client_fd, server_fd) = socketpair();
    let client = Connection::from_fd(client_fd).unwrap();
    let server = Connection::from_fd(server_fd).unwrap();

    let messages = Rc::new(RefCell::new(0));
    let finishes = Rc::new(RefCell::new(0));

    let messages2 = messages.clone();
    server.on_new_message(move |_, _| {
        *messages2.borrow_mut() += 1;
    });
    let finishes2 = finishes.clone();
    server.on_finished(move |_| {
        *finishes2.borrow_mut() += 1;
        EventLoop::current().unwrap().quit();
    });

    assert!(client.send(FINISH_MESSAGE_ID, b""));

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*messages.borrow(), 0);
    assert_eq!(*finishes.borrow(), 1);
}

struct EvenIdsOnly;

impl MessageFactory for EvenIdsOnly {
    fn create(&self, id: u8, payload: &[u8]) -> Option<Message> {
        if id % 2 == 0 {
            Some(Message::new(id, payload.to_vec()))
        } else {
            None
        }
    }
}

#[test]
fn test_rejected_frame_is_dropped_and_stream_continues() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (conn_fd, raw_fd) = socketpair();
    let client = eventkit::SocketClient::from_fd(conn_fd).unwrap();
    let conn = Connection::from_client(client, Rc::new(EvenIdsOnly));

    let got = Rc::new(RefCell::new(Vec::new()));
    let finishes = Rc::new(RefCell::new(0));

    let got2 = got.clone();
    conn.on_new_message(move |message, _| {
        got2.borrow_mut().push(message.id());
        EventLoop::current().unwrap().quit();
    });
    let finishes2 = finishes.clone();
    conn.on_finished(move |_| {
        *finishes2.borrow_mut() += 1;
    });

    // id 3 is rejected by the factory, id 4 decodes.
    write_raw(raw_fd, &[0x01, 0x00, 0x00, 0x00, 3]);
    write_raw(raw_fd, &[0x01, 0x00, 0x00, 0x00, 4]);

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*got.borrow(), vec![4u8]);
    assert_eq!(*finishes.borrow(), 0);
    unsafe { libc::close(raw_fd) };
}

#[test]
fn test_large_payload_round_trip() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let (client_fd, server_fd) = socketpair();
    let client = Connection::from_fd(client_fd).unwrap();
    let server = Connection::from_fd(server_fd).unwrap();

    // Bigger than both the inline decode buffer and one socket read chunk.
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = got.clone();
    server.on_new_message(move |message, _| {
        got2.borrow_mut().push(message);
        EventLoop::current().unwrap().quit();
    });

    assert!(client.send(11, &payload));

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    let got = got.borrow();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].id(), 11);
    assert_eq!(got[0].payload(), &payload[..]);
}
