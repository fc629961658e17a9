use eventkit::{EventLoop, ExecResult, LoopFlags, Mode};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[test]
fn test_posted_events_run_in_fifo_order() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let order = order.clone();
        event_loop.post(move || {
            order.lock().unwrap().push(i);
        });
    }
    event_loop.quit();

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn test_cross_thread_posts_keep_fifo_order() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();
    let handle = event_loop.handle();

    let order = Arc::new(Mutex::new(Vec::new()));
    let order2 = order.clone();
    let poster = std::thread::spawn(move || {
        for i in 0..1000 {
            let order = order2.clone();
            handle.post(move || {
                order.lock().unwrap().push(i);
            });
        }
        handle.quit();
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(10))), ExecResult::Success);
    poster.join().unwrap();

    let order = order.lock().unwrap();
    assert_eq!(order.len(), 1000);
    assert!(order.windows(2).all(|w| w[0] < w[1]), "per-poster FIFO order violated");
}

#[test]
fn test_exec_honours_outer_timeout() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let start = Instant::now();
    let result = event_loop.exec(Some(Duration::from_millis(50)));
    assert_eq!(result, ExecResult::Timeout);
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_inactivity_timeout_stops_an_idle_loop() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();
    event_loop.set_inactivity_timeout(Some(Duration::from_millis(50)));

    let result = event_loop.exec(Some(Duration::from_secs(5)));
    assert_eq!(result, ExecResult::Timeout);
    assert!(event_loop.timed_out());
}

#[test]
fn test_quit_from_a_posted_event() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    event_loop.post(|| {
        EventLoop::current().unwrap().quit();
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
}

#[test]
fn test_posted_event_panic_does_not_kill_the_loop() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = ran.clone();
    event_loop.post(|| panic!("boom"));
    event_loop.post(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
        EventLoop::current().unwrap().quit();
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_process_socket_waits_for_a_single_descriptor() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let mut fds = [0i32; 2];
    let r = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(r, 0, "pipe() failed");
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    event_loop
        .register_socket(read_fd, Mode::READ, move |_, mode| {
            assert!(mode.contains(Mode::READ));
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let byte = [1u8];
    let wrote = unsafe { libc::write(write_fd, byte.as_ptr() as *const _, 1) };
    assert_eq!(wrote, 1);

    let mode = event_loop.process_socket(read_fd, Some(Duration::from_secs(1)));
    assert!(mode.contains(Mode::READ));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    event_loop.unregister_socket(read_fd);
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

#[test]
fn test_wakeup_interrupts_a_blocked_loop() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();
    let handle = event_loop.handle();

    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let start = Instant::now();
    assert_eq!(event_loop.exec(Some(Duration::from_secs(10))), ExecResult::Success);
    assert!(start.elapsed() < Duration::from_secs(5), "quit did not interrupt the wait");
    waker.join().unwrap();
}
