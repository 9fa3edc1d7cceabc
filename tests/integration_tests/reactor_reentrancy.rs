// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::Write,
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serial_test::serial;
use ws_engine_rs::reactor::{Callback, EventKind, EventMode};

use crate::integration_tests::common::{socket_pair, spawn_loop, test_base, wait_until};

#[test]
#[serial]
fn callback_may_del_itself_and_add_another() {
    let base = test_base();
    let (mut client_a, server_a) = socket_pair();
    let (mut client_b, server_b) = socket_pair();
    let fd_a = server_a.as_raw_fd();
    let fd_b = server_b.as_raw_fd();

    let a_events = Arc::new(AtomicUsize::new(0));
    let b_events = Arc::new(AtomicUsize::new(0));

    // Inside A's READ callback: del(A), then add(B). A must see no further
    // events in the same iteration; B becomes eligible from the next one.
    let cb_a: Callback = {
        let base = base.clone();
        let a_events = a_events.clone();
        let b_events = b_events.clone();
        Arc::new(move |fd: std::os::fd::RawFd, _kind: EventKind| {
            a_events.fetch_add(1, Ordering::SeqCst);
            assert!(base.del(fd));
            let b_cb: Callback = {
                let b_events = b_events.clone();
                Arc::new(move |_fd: std::os::fd::RawFd, _kind: EventKind| {
                    b_events.fetch_add(1, Ordering::SeqCst);
                })
            };
            let mut reg = fd_b;
            assert!(base.add(&mut reg, b_cb, Duration::ZERO, false));
            assert!(base.mode(fd_b, EventKind::Read, EventMode::Enabled));
        })
    };
    let mut reg_a = fd_a;
    assert!(base.add(&mut reg_a, cb_a, Duration::ZERO, false));
    assert!(base.mode(fd_a, EventKind::Read, EventMode::Enabled));

    let handle = spawn_loop(&base);

    // Readiness for both peers lands in the same selector sweep.
    client_b.write_all(b"bbb").expect("write b");
    client_a.write_all(b"aaa").expect("write a");

    assert!(
        wait_until(Duration::from_secs(2), || {
            a_events.load(Ordering::SeqCst) == 1
        }),
        "A must fire exactly once"
    );
    assert!(
        wait_until(Duration::from_secs(2), || b_events.load(Ordering::SeqCst) > 0),
        "B must be eligible from the next iteration"
    );

    // Additional traffic on the deleted descriptor changes nothing.
    client_a.write_all(b"ignored").expect("write a");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(a_events.load(Ordering::SeqCst), 1);
    assert!(!base.registered(fd_a));
    assert!(base.registered(fd_b));

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn callback_may_toggle_its_own_modes() {
    let base = test_base();
    let (mut client, server) = socket_pair();
    let fd = server.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let base = base.clone();
        let reads = reads.clone();
        Arc::new(move |fd: std::os::fd::RawFd, kind: EventKind| {
            if kind == EventKind::Read {
                reads.fetch_add(1, Ordering::SeqCst);
                // One-shot emulation from inside the callback.
                assert!(base.mode(fd, EventKind::Read, EventMode::Disabled));
            }
        })
    };
    let mut reg = fd;
    assert!(base.add(&mut reg, cb, Duration::ZERO, false));
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    let handle = spawn_loop(&base);

    client.write_all(b"first").expect("write");
    assert!(wait_until(Duration::from_secs(2), || {
        reads.load(Ordering::SeqCst) == 1
    }));
    // Data is still pending, but the kind disabled itself.
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(reads.load(Ordering::SeqCst), 1);

    // Re-enable from outside: the pending readiness is delivered again.
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    assert!(wait_until(Duration::from_secs(2), || {
        reads.load(Ordering::SeqCst) == 2
    }));

    base.stop();
    handle.join().expect("loop thread");
}
