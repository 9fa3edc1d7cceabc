// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::TcpStream,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use serial_test::serial;
use ws_engine_rs::{error::WsError, server::acceptor::WsServer, ws::hooks::Hooks};

use crate::integration_tests::common::{
    read_http_head, send_upgrade, test_base, wait_until,
};

#[test]
#[serial]
fn connections_beyond_total_are_refused_with_503() {
    let capacity_errors = Arc::new(AtomicUsize::new(0));
    let hooks = Hooks::new().on_error({
        let capacity_errors = capacity_errors.clone();
        move |_bid, _severity, error| {
            if matches!(error, WsError::Capacity(_)) {
                capacity_errors.fetch_add(1, Ordering::SeqCst);
            }
        }
    });

    let server = WsServer::new(test_base(), hooks);
    server.total(1);
    server
        .listen("127.0.0.1:0".parse().expect("addr"))
        .expect("listen");
    let addr = server.local_addr().expect("bound addr");
    let thread = server.launch().expect("server thread");

    // First connection occupies the single slot.
    let mut first = TcpStream::connect(addr).expect("connect #1");
    send_upgrade(&mut first);
    let head = read_http_head(&mut first);
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(wait_until(Duration::from_secs(2), || server.connections() == 1));

    // The second one is answered with 503 and dropped at once.
    let mut second = TcpStream::connect(addr).expect("connect #2");
    let head = read_http_head(&mut second);
    assert!(
        head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "unexpected refusal: {head}"
    );
    assert!(wait_until(Duration::from_secs(2), || {
        capacity_errors.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(server.connections(), 1, "the refused peer never became a session");

    server.stop();
    thread.join().expect("server thread");
}
