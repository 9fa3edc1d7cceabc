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
fn read_readiness_reaches_the_callback() {
    let base = test_base();
    let (mut client, server) = socket_pair();
    let mut fd = server.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let reads = reads.clone();
        Arc::new(move |_fd, kind| {
            if kind == EventKind::Read {
                reads.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    let handle = spawn_loop(&base);

    client.write_all(b"ping").expect("write");
    assert!(
        wait_until(Duration::from_secs(2), || reads.load(Ordering::SeqCst) > 0),
        "READ readiness was never delivered"
    );

    base.stop();
    handle.join().expect("loop thread");
    assert!(!base.launched());
}

#[test]
#[serial]
fn disabled_mode_suppresses_delivery() {
    let base = test_base();
    let (mut client, server) = socket_pair();
    let mut fd = server.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let reads = reads.clone();
        Arc::new(move |_fd, _kind| {
            reads.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));
    // Registration starts with every kind disabled: no delivery.
    let handle = spawn_loop(&base);
    client.write_all(b"quiet").expect("write");
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(reads.load(Ordering::SeqCst), 0);

    // Enabling the kind starts delivery of the still-pending readiness.
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    assert!(
        wait_until(Duration::from_secs(2), || reads.load(Ordering::SeqCst) > 0),
        "enabling READ must start delivery"
    );

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn del_is_synchronous_across_threads() {
    let base = test_base();
    let (mut client, server) = socket_pair();
    let mut fd = server.as_raw_fd();

    let reads = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let reads = reads.clone();
        Arc::new(move |_fd, _kind| {
            reads.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    let handle = spawn_loop(&base);

    client.write_all(b"one").expect("write");
    assert!(wait_until(Duration::from_secs(2), || {
        reads.load(Ordering::SeqCst) > 0
    }));

    // After del returns, no further callback may fire for this fd.
    assert!(base.del(fd));
    let snapshot = reads.load(Ordering::SeqCst);
    client.write_all(b"two").expect("write");
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(reads.load(Ordering::SeqCst), snapshot);

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn close_is_delivered_on_peer_hangup() {
    let base = test_base();
    let (client, server) = socket_pair();
    let mut fd = server.as_raw_fd();

    let closes = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let closes = closes.clone();
        Arc::new(move |_fd, kind| {
            if kind == EventKind::Close {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));
    assert!(base.mode(fd, EventKind::Close, EventMode::Enabled));
    let handle = spawn_loop(&base);

    drop(client);
    assert!(
        wait_until(Duration::from_secs(2), || closes.load(Ordering::SeqCst) > 0),
        "peer hangup must surface as CLOSE"
    );

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn duplicate_add_is_refused() {
    let base = test_base();
    let (_client, server) = socket_pair();
    let mut fd = server.as_raw_fd();
    let cb: Callback = Arc::new(|_fd, _kind| {});
    assert!(base.add(&mut fd, cb.clone(), Duration::ZERO, false));
    let mut again = server.as_raw_fd();
    assert!(!base.add(&mut again, cb, Duration::ZERO, false));
    assert_eq!(base.count(), 1);
}

#[test]
#[serial]
fn capacity_cap_refuses_additions() {
    // A tiny reactor: the internal wakeup pipe occupies the only slot.
    let base = ws_engine_rs::reactor::base::Base::new(1).expect("selector");
    let (_client, server) = socket_pair();
    let mut fd = server.as_raw_fd();
    let cb: Callback = Arc::new(|_fd, _kind| {});
    assert!(!base.add(&mut fd, cb, Duration::ZERO, false));
    assert_eq!(base.count(), 0);
}

#[test]
#[serial]
fn del_kind_removes_single_kinds_then_the_registration() {
    let base = test_base();
    let (_client, server) = socket_pair();
    let mut fd = server.as_raw_fd();
    let cb: Callback = Arc::new(|_fd, _kind| {});
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));

    // Dropping READ leaves WRITE and CLOSE behind.
    assert!(base.del_kind(fd, EventKind::Read));
    assert!(base.registered(fd));
    // Dropping the same kind twice is refused.
    assert!(!base.del_kind(fd, EventKind::Read));

    // Once only CLOSE is left, the whole registration goes away.
    assert!(base.del_kind(fd, EventKind::Write));
    assert!(!base.registered(fd));
    assert!(!base.del_kind(fd, EventKind::Close));
}

#[test]
#[serial]
fn clear_removes_everything() {
    let base = test_base();
    let (_client, server) = socket_pair();
    let (_client2, server2) = socket_pair();
    let mut fd1 = server.as_raw_fd();
    let mut fd2 = server2.as_raw_fd();
    let cb: Callback = Arc::new(|_fd, _kind| {});
    assert!(base.add(&mut fd1, cb.clone(), Duration::ZERO, false));
    assert!(base.add(&mut fd2, cb, Duration::ZERO, false));
    assert_eq!(base.count(), 2);
    base.clear();
    assert_eq!(base.count(), 0);
    assert!(!base.registered(fd1));
    assert!(!base.registered(fd2));
}

#[test]
#[serial]
fn callback_panic_keeps_the_registration() {
    let base = test_base();
    let (mut client, server) = socket_pair();
    let mut fd = server.as_raw_fd();

    let hits = Arc::new(AtomicUsize::new(0));
    let cb: Callback = {
        let hits = hits.clone();
        Arc::new(move |_fd, _kind| {
            hits.fetch_add(1, Ordering::SeqCst);
            panic!("deliberate callback panic");
        })
    };
    assert!(base.add(&mut fd, cb, Duration::ZERO, false));
    assert!(base.mode(fd, EventKind::Read, EventMode::Enabled));
    let handle = spawn_loop(&base);

    client.write_all(b"boom").expect("write");
    assert!(
        wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) >= 2),
        "a panicking callback must keep firing on later readiness"
    );
    assert!(base.registered(fd));

    base.stop();
    handle.join().expect("loop thread");
}
