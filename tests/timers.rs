use eventkit::{EventLoop, ExecResult, LoopFlags, TimerFlags};

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

#[test]
fn test_single_shot_timer_fires_once() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let count = Rc::new(RefCell::new(0));
    let count2 = count.clone();
    let start = Instant::now();
    event_loop.register_timer(Duration::from_millis(30), TimerFlags::SINGLE_SHOT, move |_| {
        *count2.borrow_mut() += 1;
        EventLoop::current().unwrap().quit();
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_timers_fire_in_deadline_order() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let order = Rc::new(RefCell::new(Vec::new()));

    // Registered out of order on purpose; the later deadline goes in first.
    let order2 = order.clone();
    event_loop.register_timer(Duration::from_millis(50), TimerFlags::SINGLE_SHOT, move |_| {
        order2.borrow_mut().push("late");
        EventLoop::current().unwrap().quit();
    });
    let order2 = order.clone();
    event_loop.register_timer(Duration::from_millis(10), TimerFlags::SINGLE_SHOT, move |_| {
        order2.borrow_mut().push("early");
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*order.borrow(), vec!["early", "late"]);
}

#[test]
fn test_repeating_timer_reschedules_until_unregistered() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let count = Rc::new(RefCell::new(0));
    let count2 = count.clone();
    event_loop.register_timer(Duration::from_millis(10), TimerFlags::empty(), move |id| {
        let mut count = count2.borrow_mut();
        *count += 1;
        if *count == 3 {
            let event_loop = EventLoop::current().unwrap();
            event_loop.unregister_timer(id);
            event_loop.quit();
        }
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*count.borrow(), 3);
}

#[test]
fn test_unregister_inside_callback_prevents_refire() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let count = Rc::new(RefCell::new(0));
    let count2 = count.clone();
    event_loop.register_timer(Duration::from_millis(10), TimerFlags::empty(), move |id| {
        *count2.borrow_mut() += 1;
        EventLoop::current().unwrap().unregister_timer(id);
    });
    event_loop.register_timer(Duration::from_millis(100), TimerFlags::SINGLE_SHOT, move |_| {
        EventLoop::current().unwrap().quit();
    });

    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert_eq!(*count.borrow(), 1, "cancelled repeating timer fired again");
}

#[test]
fn test_zero_interval_repeat_does_not_starve_the_loop() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let count = Rc::new(RefCell::new(0u64));
    let count2 = count.clone();
    event_loop.register_timer(Duration::ZERO, TimerFlags::empty(), move |_| {
        *count2.borrow_mut() += 1;
    });
    event_loop.register_timer(Duration::from_millis(50), TimerFlags::SINGLE_SHOT, move |_| {
        EventLoop::current().unwrap().quit();
    });

    // The interval-0 timer fires once per iteration; the 50 ms timer still
    // gets through, which it would not if the loop span on the zero timer.
    assert_eq!(event_loop.exec(Some(Duration::from_secs(5))), ExecResult::Success);
    assert!(*count.borrow() >= 2);
}

#[test]
fn test_timer_ids_are_nonzero_and_distinct() {
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopFlags::empty()).unwrap();

    let a = event_loop.register_timer(Duration::from_secs(60), TimerFlags::SINGLE_SHOT, |_| {});
    let b = event_loop.register_timer(Duration::from_secs(60), TimerFlags::SINGLE_SHOT, |_| {});
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
    event_loop.unregister_timer(a);
    event_loop.unregister_timer(b);
}
