// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    net::TcpStream,
    time::Duration,
};

use serial_test::serial;
use ws_engine_rs::{server::acceptor::WsServer, ws::hooks::Hooks};

use crate::integration_tests::common::{read_http_head, send_upgrade, test_base};

fn plain_server() -> (WsServer, std::net::SocketAddr, std::thread::JoinHandle<()>) {
    let server = WsServer::new(test_base(), Hooks::new());
    server
        .listen("127.0.0.1:0".parse().expect("addr"))
        .expect("listen");
    let addr = server.local_addr().expect("bound addr");
    let thread = server.launch().expect("server thread");
    (server, addr, thread)
}

#[test]
#[serial]
fn version_7_gets_505_and_a_closed_connection() {
    let (server, addr, thread) = plain_server();

    let mut peer = TcpStream::connect(addr).expect("connect");
    let request = "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                   Sec-WebSocket-Version: 7\r\n\r\n";
    peer.write_all(request.as_bytes()).expect("send request");

    let head = read_http_head(&mut peer);
    assert!(
        head.starts_with("HTTP/1.1 505 Unsupported protocol version\r\n"),
        "unexpected response: {head}"
    );

    // The server closes after the rejection: EOF follows the headers.
    peer.set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let mut rest = Vec::new();
    let n = peer.read_to_end(&mut rest).expect("read to EOF");
    assert_eq!(n, 0, "no body expected after the rejection");

    server.stop();
    thread.join().expect("server thread");
}

#[test]
#[serial]
fn wrong_key_gets_400() {
    let (server, addr, thread) = plain_server();

    let mut peer = TcpStream::connect(addr).expect("connect");
    let request = "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\
                   Connection: Upgrade\r\nSec-WebSocket-Key: bm90LXZhbGlk\r\n\
                   Sec-WebSocket-Version: 13\r\n\r\n";
    peer.write_all(request.as_bytes()).expect("send request");

    let head = read_http_head(&mut peer);
    assert!(
        head.starts_with("HTTP/1.1 400 Wrong client key\r\n"),
        "unexpected response: {head}"
    );

    server.stop();
    thread.join().expect("server thread");
}

#[test]
#[serial]
fn happy_path_101_is_byte_exact() {
    let (server, addr, thread) = plain_server();

    let mut peer = TcpStream::connect(addr).expect("connect");
    send_upgrade(&mut peer);
    let head = read_http_head(&mut peer);
    assert_eq!(
        head,
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
    );

    server.stop();
    thread.join().expect("server thread");
}
