// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use ws_engine_rs::{cfg::logger::init_logger, reactor::base::Base};

/// Installs the test logging subscriber; later calls are no-ops because the
/// global default can only be set once per process.
pub fn init_test_logging() {
    let _ = init_logger("tests/config.yaml");
}

/// Fresh reactor with a snappy poll cadence for tests.
pub fn test_base() -> Base {
    init_test_logging();
    let base = Base::with_defaults().expect("selector must be available");
    base.frequency(10);
    base
}

/// Runs the dispatch loop on its own thread and waits until it is live.
pub fn spawn_loop(base: &Base) -> JoinHandle<()> {
    let clone = base.clone();
    let handle = thread::Builder::new()
        .name("test-reactor".to_string())
        .spawn(move || clone.start())
        .expect("spawn reactor thread");
    assert!(
        wait_until(Duration::from_secs(2), || base.launched()),
        "dispatch loop did not come up"
    );
    handle
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Connected non-blocking loopback pair for raw reactor tests.
pub fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    server.set_nonblocking(true).expect("nonblocking");
    server.set_nodelay(true).expect("nodelay");
    client.set_nodelay(true).expect("nodelay");
    (client, server)
}

/// Blocking-reads one HTTP header block (through the final CRLF CRLF).
pub fn read_http_head(stream: &mut TcpStream) -> String {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    while !collected.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => collected.push(byte[0]),
            Ok(_) => break,
            Err(e) => panic!("header read failed: {e} (got {collected:?})"),
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

/// Sends the literal upgrade request from the handshake scenario.
pub fn send_upgrade(stream: &mut TcpStream) {
    let request = "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    stream
        .write_all(request.as_bytes())
        .expect("send upgrade request");
}
