// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ws_engine_rs::{
    cfg::{cli::resolve_config_path, config::Config},
    ws::extension::CompressMethod,
};

#[test]
fn test_defaults() {
    let cfg = Config::default();
    assert_eq!(cfg.engine.max_sockets, 0x5000);
    assert_eq!(cfg.engine.frequency, 100);
    assert!(!cfg.engine.easily);
    assert_eq!(cfg.websocket.ping_interval, 5);
    assert_eq!(cfg.websocket.wait_pong, 10);
    assert_eq!(cfg.websocket.segment_size, 16 * 1024);
    assert_eq!(cfg.websocket.max_requests, 100);
    assert!(!cfg.websocket.encryption.enabled);
    assert_eq!(cfg.server.port, 8080);
    assert_eq!(cfg.server.total, 100);
    cfg.validate().expect("defaults must validate");
}

#[test]
fn test_load_from_file() {
    let cfg = resolve_config_path("tests/config.yaml")
        .and_then(Config::load_from_file)
        .expect("fixture loads");
    assert_eq!(cfg.websocket.ping_interval, 1);
    assert_eq!(cfg.websocket.wait_pong, 2);
    assert_eq!(cfg.websocket.segment_size, 4096);
    assert_eq!(cfg.websocket.compressors, vec![
        CompressMethod::Deflate,
        CompressMethod::Gzip
    ]);
    assert_eq!(cfg.websocket.subprotocols, vec!["chat".to_string()]);
    assert_eq!(cfg.server.host, "127.0.0.1");
    assert_eq!(cfg.server.total, 8);
    assert_eq!(
        cfg.server.addr().expect("addr parses").to_string(),
        "127.0.0.1:9000"
    );
    assert_eq!(cfg.client.host, "127.0.0.1:9000");
    assert_eq!(cfg.client.path, "/chat");
}

#[test]
fn test_json_roundtrip() {
    // The config also travels as JSON (management surfaces); the wire
    // names must match the YAML ones.
    let cfg = Config::load_from_file("tests/config.yaml").expect("fixture loads");
    let json = serde_json::to_string(&cfg).expect("serialize");
    assert!(json.contains("\"PingInterval\":1"));
    assert!(json.contains("\"Compressors\":[\"deflate\",\"gzip\"]"));
    let back: Config = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back.websocket.segment_size, cfg.websocket.segment_size);
    assert_eq!(back.server.total, cfg.server.total);
    assert_eq!(back.websocket.compressors, cfg.websocket.compressors);
}

#[test]
fn test_validation_rejects_nonsense() {
    let mut cfg = Config::default();
    cfg.websocket.segment_size = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.websocket.ping_interval = 10;
    cfg.websocket.wait_pong = 5;
    assert!(cfg.validate().is_err());

    let mut cfg = Config::default();
    cfg.server.total = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_bad_listen_address_is_an_error() {
    let mut cfg = Config::default();
    cfg.server.host = "not an address".to_string();
    assert!(cfg.server.addr().is_err());
}
