// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use serial_test::serial;
use ws_engine_rs::reactor::{
    Callback,
    EventKind, EventMode,
    event::{Event, EventType},
};

use crate::integration_tests::common::{spawn_loop, test_base, wait_until};

#[test]
#[serial]
fn periodic_timer_fires_within_the_cadence_bound() {
    let base = test_base();
    let fires = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let fires = fires.clone();
        Arc::new(move |_fd: RawFd, kind| {
            if kind == EventKind::Timer {
                fires.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let mut tfd: RawFd = -1;
    assert!(base.add(&mut tfd, cb, Duration::from_millis(50), true));
    assert!(tfd < 0, "timer descriptors are reactor-allocated");
    assert!(base.mode(tfd, EventKind::Timer, EventMode::Enabled));

    let handle = spawn_loop(&base);
    thread::sleep(Duration::from_millis(1050));
    let count = fires.load(Ordering::SeqCst);
    // Period is >= 50ms and <= 50 + frequency + 100 ms under no load, so a
    // second of wall time yields between ~5 and ~21 firings.
    assert!((4..=25).contains(&count), "unexpected cadence: {count} fires");

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn one_shot_timer_fires_exactly_once() {
    let base = test_base();
    let fires = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let fires = fires.clone();
        Arc::new(move |_fd: RawFd, _kind| {
            fires.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut tfd: RawFd = -1;
    assert!(base.add(&mut tfd, cb, Duration::from_millis(40), false));
    assert!(base.mode(tfd, EventKind::Timer, EventMode::Enabled));

    let handle = spawn_loop(&base);
    assert!(wait_until(Duration::from_secs(2), || {
        fires.load(Ordering::SeqCst) > 0
    }));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(fires.load(Ordering::SeqCst), 1, "one-shot must not repeat");

    // Re-enabling re-arms the same registration.
    assert!(base.mode(tfd, EventKind::Timer, EventMode::Enabled));
    assert!(wait_until(Duration::from_secs(2), || {
        fires.load(Ordering::SeqCst) == 2
    }));

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn timer_del_stops_firing() {
    let base = test_base();
    let fires = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let fires = fires.clone();
        Arc::new(move |_fd: RawFd, _kind| {
            fires.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut tfd: RawFd = -1;
    assert!(base.add(&mut tfd, cb, Duration::from_millis(30), true));
    assert!(base.mode(tfd, EventKind::Timer, EventMode::Enabled));

    let handle = spawn_loop(&base);
    assert!(wait_until(Duration::from_secs(2), || {
        fires.load(Ordering::SeqCst) > 2
    }));
    assert!(base.del(tfd));
    let snapshot = fires.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(fires.load(Ordering::SeqCst), snapshot);

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn timer_event_handle_owns_its_registration() {
    let base = test_base();
    let fires = Arc::new(AtomicUsize::new(0));

    let event = Event::new(EventType::Timer);
    event.set_base(base.clone());
    event.timeout(Duration::from_millis(40), true);
    event.set_callback({
        let fires = fires.clone();
        Arc::new(move |_fd, _kind| {
            fires.fetch_add(1, Ordering::SeqCst);
        })
    });
    assert!(event.start());
    assert!(event.fd() < 0);

    let handle = spawn_loop(&base);
    assert!(wait_until(Duration::from_secs(2), || {
        fires.load(Ordering::SeqCst) > 1
    }));

    // Dropping the handle unregisters the timer.
    let fd = event.fd();
    drop(event);
    assert!(!base.registered(fd));
    let snapshot = fires.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(200));
    assert!(fires.load(Ordering::SeqCst) <= snapshot + 1);

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn unbound_event_handle_start_is_a_noop() {
    let event = Event::new(EventType::Event);
    assert!(!event.start());

    let base = test_base();
    let event = Event::new(EventType::Event);
    event.set_base(base);
    event.set_callback(Arc::new(|_fd, _kind| {}));
    // No descriptor bound: a logic error, logged and refused.
    assert!(!event.start());

    let timer = Event::new(EventType::Timer);
    timer.set_callback(Arc::new(|_fd, _kind| {}));
    // Zero delay on a timer handle is just as invalid.
    assert!(!timer.start());
}
