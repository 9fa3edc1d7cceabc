// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use serial_test::serial;

use crate::integration_tests::common::{spawn_loop, test_base, wait_until};

#[test]
#[serial]
fn words_are_delivered_fifo_on_the_reactor_thread() {
    let base = test_base();
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sid = base
        .emplace_upstream({
            let seen = seen.clone();
            Arc::new(move |word| {
                seen.lock().expect("poisoned").push(word);
            })
        })
        .expect("emplace upstream");
    let handle = spawn_loop(&base);

    // Post from a foreign thread; delivery happens on the loop, in order.
    let poster = {
        let base = base.clone();
        thread::spawn(move || {
            for word in [1u64, 2, 3, 42] {
                assert!(base.launch_upstream(sid, word));
            }
        })
    };
    poster.join().expect("poster thread");

    assert!(
        wait_until(Duration::from_secs(2), || {
            seen.lock().expect("poisoned").len() == 4
        }),
        "all posted words must arrive"
    );
    assert_eq!(*seen.lock().expect("poisoned"), vec![1, 2, 3, 42]);

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn erase_drops_pending_invocations_silently() {
    let base = test_base();
    let seen: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sid = base
        .emplace_upstream({
            let seen = seen.clone();
            Arc::new(move |word| {
                seen.lock().expect("poisoned").push(word);
            })
        })
        .expect("emplace upstream");

    // Loop not running yet: the wake sits unobserved in the pipe.
    assert!(base.launch_upstream(sid, 7));
    assert!(base.erase_upstream(sid));
    // Posting after erase is refused.
    assert!(!base.launch_upstream(sid, 8));

    let handle = spawn_loop(&base);
    thread::sleep(Duration::from_millis(200));
    assert!(
        seen.lock().expect("poisoned").is_empty(),
        "erased upstream must never deliver"
    );

    base.stop();
    handle.join().expect("loop thread");
}

#[test]
#[serial]
fn independent_upstreams_do_not_interfere() {
    let base = test_base();
    let first: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let second: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let sid_a = base
        .emplace_upstream({
            let first = first.clone();
            Arc::new(move |word| first.lock().expect("poisoned").push(word))
        })
        .expect("emplace a");
    let sid_b = base
        .emplace_upstream({
            let second = second.clone();
            Arc::new(move |word| second.lock().expect("poisoned").push(word))
        })
        .expect("emplace b");
    assert_ne!(sid_a, sid_b);
    let handle = spawn_loop(&base);

    assert!(base.launch_upstream(sid_a, 10));
    assert!(base.launch_upstream(sid_b, 20));
    assert!(wait_until(Duration::from_secs(2), || {
        !first.lock().expect("poisoned").is_empty()
            && !second.lock().expect("poisoned").is_empty()
    }));
    assert_eq!(*first.lock().expect("poisoned"), vec![10]);
    assert_eq!(*second.lock().expect("poisoned"), vec![20]);

    base.stop();
    handle.join().expect("loop thread");
}
