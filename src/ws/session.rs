// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Shutdown, sync::Arc, time::{Duration, Instant}};

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::{
    error::{Severity, WsError, close_code},
    net::{socket::IoStatus, tls::Transport},
    utils,
    ws::{
        cipher::PayloadCipher,
        deflate::{
            Compressor, MessageCodec, PayloadCodec, build_codec, takeover_flags,
        },
        extension::{CompressMethod, DeflateParams, Extension},
        frame::{self, Decoded, Frame, Opcode},
        handshake::{
            self, ClientOptions, ServerOptions, ServerVerdict, parse_request,
            parse_response,
        },
        hooks::{Agent, Emit, EndDirection, StreamEvent},
    },
};

/// Messages at or above this size are compressed when a codec is negotiated.
pub const COMPRESS_THRESHOLD: usize = 1024;

const READ_CHUNK: usize = 16 * 1024;
const FRAGMENT_FAILURE: &str = "Fragmented Message Transfer Protocol Failure";
const PONG_FAILURE: &str = "PING response not received";
const DECODE_FAILURE: &str = "Received data decompression error";

/// Which side of the connection this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-connection lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    HandshakeSent,
    Open,
    Closing,
    Closed,
}

/// Tunables applied to every new session.
#[derive(Clone)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub max_frame_size: usize,
    pub max_requests: u32,
    pub buffer_cap: usize,
    pub crypted: bool,
    pub cipher: Option<Arc<dyn PayloadCipher>>,
    pub external_compressor: Option<Arc<dyn Compressor>>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5),
            pong_wait: Duration::from_secs(10),
            max_frame_size: 16 * 1024,
            max_requests: 100,
            buffer_cap: 16 * 1024 * 1024,
            crypted: false,
            cipher: None,
            external_compressor: None,
        }
    }
}

enum Plan {
    Server(ServerOptions),
    Client { key: String, opts: ClientOptions },
}

struct FragmentBuffer {
    opcode: Opcode,
    compressed: bool,
    data: BytesMut,
}

/// One Websocket connection: handshake, framing, fragmentation, negotiated
/// compression, optional payload encryption, ping bookkeeping and the close
/// protocol, driven entirely by reactor callbacks.
///
/// Methods that make protocol progress return deferred [`Emit`]s; the owner
/// fires them only after releasing its session lock.
pub struct Session {
    bid: u64,
    sid: u16,
    role: Role,
    phase: Phase,
    transport: Box<dyn Transport>,
    plan: Plan,

    inbound: BytesMut,
    outbound: BytesMut,
    fragment: Option<FragmentBuffer>,

    codec: Option<PayloadCodec>,
    method: CompressMethod,
    deflate: DeflateParams,
    subprotocol: Option<String>,
    extensions: Vec<Extension>,
    crypted: bool,
    cipher: Option<Arc<dyn PayloadCipher>>,
    external_compressor: Option<Arc<dyn Compressor>>,

    last_ping_sent: Instant,
    last_pong_seen: Instant,
    ping_interval: Duration,
    pong_wait: Duration,

    allow_send: bool,
    allow_receive: bool,
    stopped: bool,
    frozen: bool,
    close_sent: bool,
    close_received: bool,
    was_open: bool,
    closed_emitted: bool,
    end_send_emitted: bool,

    max_frame_size: usize,
    max_requests: u32,
    requests_seen: u32,
    buffer_cap: usize,
}

impl Session {
    fn new(
        bid: u64,
        sid: u16,
        role: Role,
        transport: Box<dyn Transport>,
        settings: &SessionSettings,
        plan: Plan,
    ) -> Self {
        let now = Instant::now();
        Self {
            bid,
            sid,
            role,
            phase: Phase::Connecting,
            transport,
            plan,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
            fragment: None,
            codec: None,
            method: CompressMethod::None,
            deflate: DeflateParams::default(),
            subprotocol: None,
            extensions: Vec::new(),
            crypted: settings.crypted,
            cipher: settings.cipher.clone(),
            external_compressor: settings.external_compressor.clone(),
            last_ping_sent: now,
            last_pong_seen: now,
            ping_interval: settings.ping_interval,
            pong_wait: settings.pong_wait,
            allow_send: true,
            allow_receive: true,
            stopped: false,
            frozen: false,
            close_sent: false,
            close_received: false,
            was_open: false,
            closed_emitted: false,
            end_send_emitted: false,
            max_frame_size: settings.max_frame_size.max(1),
            max_requests: settings.max_requests,
            requests_seen: 0,
            buffer_cap: settings.buffer_cap,
        }
    }

    pub fn server(
        bid: u64,
        sid: u16,
        transport: Box<dyn Transport>,
        settings: &SessionSettings,
        opts: ServerOptions,
    ) -> Self {
        Self::new(bid, sid, Role::Server, transport, settings, Plan::Server(opts))
    }

    pub fn client(
        bid: u64,
        sid: u16,
        transport: Box<dyn Transport>,
        settings: &SessionSettings,
        opts: ClientOptions,
    ) -> Self {
        let key = utils::generate_ws_key();
        Self::new(bid, sid, Role::Client, transport, settings, Plan::Client {
            key,
            opts,
        })
    }

    pub fn bid(&self) -> u64 {
        self.bid
    }

    pub fn sid(&self) -> u16 {
        self.sid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    pub fn compress_method(&self) -> CompressMethod {
        self.method
    }

    pub fn negotiated_extensions(&self) -> &[Extension] {
        &self.extensions
    }

    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Back-pressure valve: `true` pauses reads (the owner disables the fd's
    /// READ mode); writes stay possible. Returns whether the flag changed.
    pub fn freeze(&mut self, on: bool) -> bool {
        if self.frozen == on {
            return false;
        }
        self.frozen = on;
        true
    }

    pub fn set_allow(&mut self, send: bool, receive: bool) {
        self.allow_send = send;
        self.allow_receive = receive;
    }

    pub fn set_segment_size(&mut self, bytes: usize) {
        self.max_frame_size = bytes.max(1);
    }

    pub fn set_ping_interval(&mut self, interval: Duration) {
        self.ping_interval = interval;
    }

    pub fn set_pong_wait(&mut self, wait: Duration) {
        self.pong_wait = wait;
    }

    pub fn set_max_requests(&mut self, cap: u32) {
        self.max_requests = cap;
    }

    fn mask(&self) -> Option<[u8; 4]> {
        match self.role {
            Role::Client => Some(utils::generate_mask_key()),
            Role::Server => None,
        }
    }

    /// Pushes the upgrade request; client sessions call this once the
    /// non-blocking connect has completed.
    pub fn begin_client_handshake(&mut self) {
        if self.phase != Phase::Connecting {
            return;
        }
        let Plan::Client { key, opts } = &self.plan else {
            return;
        };
        let request = handshake::build_request(key, opts);
        self.outbound.extend_from_slice(&request);
        self.phase = Phase::HandshakeSent;
        trace!(bid = self.bid, "upgrade request queued");
    }

    /// Drains the transport and advances the protocol. `raw_filter` may
    /// claim chunks before the engine sees them.
    pub fn on_readable(
        &mut self,
        raw_filter: Option<&(dyn Fn(u64, &[u8]) -> bool + Send + Sync)>,
    ) -> Vec<Emit> {
        let mut emits = Vec::new();
        if self.phase == Phase::Closed {
            return emits;
        }
        let mut peer_gone = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.inbound.len() >= self.buffer_cap {
                self.protocol_failure(
                    &mut emits,
                    close_code::PROTOCOL,
                    "inbound buffer cap exceeded",
                );
                break;
            }
            match self.transport.read(&mut chunk) {
                IoStatus::Bytes(n) => {
                    let data = &chunk[..n];
                    if let Some(filter) = raw_filter
                        && filter(self.bid, data)
                    {
                        continue;
                    }
                    self.inbound.extend_from_slice(data);
                },
                IoStatus::WouldBlock => break,
                IoStatus::Interrupted => continue,
                IoStatus::Closed => {
                    peer_gone = true;
                    break;
                },
                IoStatus::Error(e) => {
                    self.transport_failure(&mut emits, e);
                    return emits;
                },
            }
        }
        self.process_inbound(&mut emits);
        if peer_gone && self.phase != Phase::Closed {
            self.finish_closed(&mut emits);
        }
        emits
    }

    /// Flushes queued bytes; completes the close protocol once the final
    /// CLOSE left the socket.
    pub fn on_writable(&mut self) -> Vec<Emit> {
        let mut emits = Vec::new();
        while !self.outbound.is_empty() {
            match self.transport.write(&self.outbound) {
                IoStatus::Bytes(n) => {
                    self.outbound.advance(n);
                },
                IoStatus::WouldBlock => break,
                IoStatus::Interrupted => continue,
                IoStatus::Closed => {
                    self.finish_closed(&mut emits);
                    return emits;
                },
                IoStatus::Error(e) => {
                    self.transport_failure(&mut emits, e);
                    return emits;
                },
            }
        }
        if self.outbound.is_empty() && self.phase == Phase::Closing {
            if !self.end_send_emitted {
                self.end_send_emitted = true;
                emits.push(Emit::End(EndDirection::Send));
            }
            if self.close_received || self.stopped {
                self.transport.shutdown(Shutdown::Write);
                self.finish_closed(&mut emits);
            }
        }
        emits
    }

    /// Peer hangup reported by the reactor: salvage whatever is still
    /// buffered in the kernel, then close.
    pub fn on_transport_close(&mut self) -> Vec<Emit> {
        let mut emits = Vec::new();
        if self.phase == Phase::Closed {
            return emits;
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.transport.read(&mut chunk) {
                IoStatus::Bytes(n) => self.inbound.extend_from_slice(&chunk[..n]),
                IoStatus::Interrupted => continue,
                _ => break,
            }
        }
        self.process_inbound(&mut emits);
        if self.phase != Phase::Closed {
            self.finish_closed(&mut emits);
        }
        emits
    }

    /// Ping supervision, driven by the owner's `ping_interval / 2` timer.
    pub fn on_ping_tick(&mut self, now: Instant) -> Vec<Emit> {
        let mut emits = Vec::new();
        if self.phase != Phase::Open {
            return emits;
        }
        if !self.pong_wait.is_zero()
            && now.duration_since(self.last_pong_seen) >= self.pong_wait
        {
            emits.push(Emit::Error(
                Severity::Warning,
                WsError::Timeout(PONG_FAILURE.to_string()),
            ));
            self.send_error(close_code::INTERNAL, PONG_FAILURE);
            return emits;
        }
        if !self.ping_interval.is_zero()
            && now.duration_since(self.last_ping_sent) > self.ping_interval / 2
        {
            let payload = self.bid.to_le_bytes();
            let mask = self.mask();
            let encoded = frame::ping(&payload, mask);
            self.outbound.extend_from_slice(&encoded);
            self.last_ping_sent = now;
            trace!(bid = self.bid, "ping queued");
        }
        emits
    }

    /// Queues one message: compression at or above the threshold, optional
    /// encryption, fragmentation above `max_frame_size`.
    pub fn send_message(&mut self, data: &[u8], is_text: bool) -> Result<(), WsError> {
        if self.phase != Phase::Open || !self.allow_send || self.stopped {
            return Err(WsError::ProtocolViolation("session is not open for sending"));
        }
        let mut rsv1 = false;
        let mut payload: Vec<u8>;
        if data.len() >= COMPRESS_THRESHOLD
            && let Some(codec) = &mut self.codec
        {
            match codec.compress(data) {
                Ok(compressed) => {
                    rsv1 = true;
                    payload = compressed;
                },
                Err(e) => {
                    warn!(bid = self.bid, "compression failed, sending plain: {e}");
                    payload = data.to_vec();
                },
            }
        } else {
            payload = data.to_vec();
        }
        if self.crypted && let Some(cipher) = &self.cipher {
            payload = cipher
                .encode(&payload)
                .map_err(|e| WsError::DecodeError(e.to_string()))?;
        }

        let opcode = if is_text { Opcode::Text } else { Opcode::Binary };
        if payload.len() <= self.max_frame_size {
            self.queue_frame(opcode, true, rsv1, &payload);
            return Ok(());
        }
        let total = payload.len().div_ceil(self.max_frame_size);
        for (index, piece) in payload.chunks(self.max_frame_size).enumerate() {
            let first = index == 0;
            let last = index + 1 == total;
            let op = if first { opcode } else { Opcode::Continuation };
            self.queue_frame(op, last, first && rsv1, piece);
        }
        Ok(())
    }

    /// Queues a CLOSE with the given code and reason and blocks further
    /// writes; the session heads to CLOSED as soon as the frame is flushed.
    pub fn send_error(&mut self, code: u16, reason: &str) {
        if self.phase == Phase::Closed {
            return;
        }
        if !self.close_sent {
            let mask = self.mask();
            let encoded = frame::close(code, reason, mask);
            self.outbound.extend_from_slice(&encoded);
            self.close_sent = true;
        }
        self.stopped = true;
        self.allow_send = false;
        self.phase = Phase::Closing;
        debug!(bid = self.bid, code, reason, "error close queued");
    }

    /// Graceful local close: CLOSE is queued once, then the session waits
    /// for the peer's echo (or the disconnect sweep).
    pub fn close(&mut self, code: u16, reason: &str) {
        if self.phase == Phase::Closed || self.close_sent {
            return;
        }
        let mask = self.mask();
        let encoded = frame::close(code, reason, mask);
        self.outbound.extend_from_slice(&encoded);
        self.close_sent = true;
        self.allow_send = false;
        self.phase = Phase::Closing;
    }

    fn queue_frame(&mut self, opcode: Opcode, fin: bool, rsv1: bool, payload: &[u8]) {
        let mask = self.mask();
        let encoded = frame::encode(opcode, fin, rsv1, payload, mask);
        self.outbound.extend_from_slice(&encoded);
    }

    fn process_inbound(&mut self, emits: &mut Vec<Emit>) {
        loop {
            match self.phase {
                Phase::Connecting => {
                    if !self.handshake_server_step(emits) {
                        return;
                    }
                },
                Phase::HandshakeSent => {
                    if !self.handshake_client_step(emits) {
                        return;
                    }
                },
                Phase::Open | Phase::Closing => {
                    if !self.frame_step(emits) {
                        return;
                    }
                },
                Phase::Closed => return,
            }
        }
    }

    /// One server handshake attempt; `true` when progress was made and the
    /// loop should continue.
    fn handshake_server_step(&mut self, emits: &mut Vec<Emit>) -> bool {
        let Plan::Server(opts) = &self.plan else {
            return false;
        };
        match parse_request(&self.inbound) {
            Ok(None) => false,
            Ok(Some((request, consumed))) => {
                self.inbound.advance(consumed);
                self.requests_seen += 1;
                if self.requests_seen > self.max_requests {
                    self.protocol_failure(
                        emits,
                        close_code::PROTOCOL,
                        "keep-alive request cap exceeded",
                    );
                    return false;
                }
                match handshake::accept(&request, opts) {
                    ServerVerdict::Accepted(accepted) => {
                        self.outbound.extend_from_slice(&accepted.response);
                        self.subprotocol = accepted.subprotocol;
                        self.method = accepted.method;
                        self.deflate = accepted.deflate;
                        self.extensions = accepted.extensions;
                        let (own, peer) = takeover_flags(&self.deflate, true);
                        self.codec = build_codec(
                            self.method,
                            own,
                            peer,
                            self.external_compressor.clone(),
                        );
                        self.open(emits);
                        true
                    },
                    ServerVerdict::Rejected {
                        code,
                        reason,
                        response,
                    } => {
                        self.outbound.extend_from_slice(&response);
                        self.stopped = true;
                        self.phase = Phase::Closing;
                        emits.push(Emit::Error(
                            Severity::Warning,
                            WsError::HandshakeFailed(format!("{code} {reason}")),
                        ));
                        false
                    },
                }
            },
            Err(e) => {
                emits.push(Emit::Error(Severity::Warning, e));
                self.stopped = true;
                self.phase = Phase::Closing;
                false
            },
        }
    }

    /// One client handshake attempt; `true` when the session just opened.
    fn handshake_client_step(&mut self, emits: &mut Vec<Emit>) -> bool {
        let Plan::Client { key, opts } = &self.plan else {
            return false;
        };
        match parse_response(&self.inbound) {
            Ok(None) => false,
            Ok(Some((response, consumed))) => {
                let verdict = handshake::validate_response(key, &response, opts);
                self.inbound.advance(consumed);
                match verdict {
                    Ok(negotiated) => {
                        self.subprotocol = negotiated.subprotocol;
                        self.method = negotiated.method;
                        self.deflate = negotiated.deflate;
                        self.extensions = negotiated.extensions;
                        let (own, peer) = takeover_flags(&self.deflate, false);
                        self.codec = build_codec(
                            self.method,
                            own,
                            peer,
                            self.external_compressor.clone(),
                        );
                        self.open(emits);
                        true
                    },
                    Err(e) => {
                        emits.push(Emit::Error(Severity::Critical, e));
                        self.finish_closed(emits);
                        false
                    },
                }
            },
            Err(e) => {
                emits.push(Emit::Error(Severity::Critical, e));
                self.finish_closed(emits);
                false
            },
        }
    }

    fn open(&mut self, emits: &mut Vec<Emit>) {
        self.phase = Phase::Open;
        self.was_open = true;
        let now = Instant::now();
        self.last_ping_sent = now;
        self.last_pong_seen = now;
        emits.push(Emit::Stream(StreamEvent::Open));
        emits.push(Emit::Handshake(Agent::Websocket));
        debug!(bid = self.bid, role = ?self.role, method = ?self.method, "session open");
    }

    /// One frame decode attempt; `true` when a frame was consumed.
    fn frame_step(&mut self, emits: &mut Vec<Emit>) -> bool {
        match frame::decode(&self.inbound) {
            Decoded::Partial => false,
            Decoded::Bad(reason) => {
                self.protocol_failure(emits, close_code::PROTOCOL, reason);
                false
            },
            Decoded::Frame { frame, consumed } => {
                self.inbound.advance(consumed);
                self.handle_frame(frame, emits);
                self.phase != Phase::Closed
            },
        }
    }

    fn handle_frame(&mut self, frame: Frame, emits: &mut Vec<Emit>) {
        match self.role {
            Role::Server if !frame.header.masked => {
                self.protocol_failure(
                    emits,
                    close_code::PROTOCOL,
                    "unmasked frame from client",
                );
                return;
            },
            Role::Client if frame.header.masked => {
                self.protocol_failure(
                    emits,
                    close_code::PROTOCOL,
                    "masked frame from server",
                );
                return;
            },
            _ => {},
        }

        match frame.header.opcode {
            Opcode::Ping => {
                self.last_pong_seen = Instant::now();
                if self.phase == Phase::Open {
                    let mask = self.mask();
                    let encoded = frame::pong(&frame.payload, mask);
                    self.outbound.extend_from_slice(&encoded);
                }
            },
            Opcode::Pong => {
                if frame.payload.as_ref() == self.bid.to_le_bytes() {
                    self.last_pong_seen = Instant::now();
                } else {
                    debug!(
                        bid = self.bid,
                        "pong payload does not match this session, ignored"
                    );
                }
            },
            Opcode::Close => {
                if self.close_received {
                    return;
                }
                let (code, reason) = frame::parse_close(&frame.payload);
                self.close_received = true;
                emits.push(Emit::Error(
                    Severity::Warning,
                    WsError::PeerClosed { code, reason },
                ));
                emits.push(Emit::End(EndDirection::Recv));
                if !self.close_sent {
                    let mask = self.mask();
                    let encoded = frame::close(code, "", mask);
                    self.outbound.extend_from_slice(&encoded);
                    self.close_sent = true;
                }
                self.allow_send = false;
                self.phase = Phase::Closing;
            },
            Opcode::Text | Opcode::Binary => {
                if self.phase != Phase::Open {
                    return;
                }
                if self.fragment.is_some() {
                    self.protocol_failure(
                        emits,
                        close_code::INTERNAL,
                        FRAGMENT_FAILURE,
                    );
                    return;
                }
                let is_text = frame.header.opcode == Opcode::Text;
                if frame.header.fin {
                    self.finalize_message(
                        frame.payload,
                        is_text,
                        frame.header.rsv[0],
                        emits,
                    );
                } else {
                    let mut data = BytesMut::with_capacity(frame.payload.len() * 2);
                    data.extend_from_slice(&frame.payload);
                    self.fragment = Some(FragmentBuffer {
                        opcode: frame.header.opcode,
                        compressed: frame.header.rsv[0],
                        data,
                    });
                }
            },
            Opcode::Continuation => {
                if self.phase != Phase::Open {
                    return;
                }
                let Some(fragment) = &mut self.fragment else {
                    self.protocol_failure(
                        emits,
                        close_code::INTERNAL,
                        FRAGMENT_FAILURE,
                    );
                    return;
                };
                if fragment.data.len() + frame.payload.len() > self.buffer_cap {
                    self.protocol_failure(
                        emits,
                        close_code::PROTOCOL,
                        "fragmented message exceeds the buffer cap",
                    );
                    return;
                }
                fragment.data.extend_from_slice(&frame.payload);
                if frame.header.fin {
                    let finished = self
                        .fragment
                        .take()
                        .map(|f| (f.data.freeze(), f.opcode, f.compressed));
                    if let Some((data, opcode, compressed)) = finished {
                        self.finalize_message(
                            data,
                            opcode == Opcode::Text,
                            compressed,
                            emits,
                        );
                    }
                }
            },
        }
    }

    /// Decryption, decompression and delivery of one finished message.
    fn finalize_message(
        &mut self,
        payload: Bytes,
        is_text: bool,
        compressed: bool,
        emits: &mut Vec<Emit>,
    ) {
        let mut data = payload;
        if self.crypted && let Some(cipher) = &self.cipher {
            match cipher.decode(&data) {
                Ok(plain) => data = Bytes::from(plain),
                Err(e) => {
                    debug!(bid = self.bid, "payload decryption failed: {e}");
                    emits.push(Emit::Error(
                        Severity::Warning,
                        WsError::DecodeError(DECODE_FAILURE.to_string()),
                    ));
                    self.send_error(close_code::INVALID_PAYLOAD, DECODE_FAILURE);
                    return;
                },
            }
        }
        if compressed {
            let Some(codec) = &mut self.codec else {
                self.protocol_failure(
                    emits,
                    close_code::PROTOCOL,
                    "compressed frame without a negotiated extension",
                );
                return;
            };
            match codec.decompress(&data, self.buffer_cap) {
                Ok(plain) => data = Bytes::from(plain),
                Err(e) => {
                    debug!(bid = self.bid, "payload decompression failed: {e}");
                    emits.push(Emit::Error(
                        Severity::Warning,
                        WsError::DecodeError(DECODE_FAILURE.to_string()),
                    ));
                    self.send_error(close_code::INVALID_PAYLOAD, DECODE_FAILURE);
                    return;
                },
            }
        }
        if self.allow_receive {
            emits.push(Emit::Message(data, is_text));
        }
    }

    fn protocol_failure(&mut self, emits: &mut Vec<Emit>, code: u16, reason: &'static str) {
        emits.push(Emit::Error(
            Severity::Warning,
            WsError::ProtocolViolation(reason),
        ));
        self.fragment = None;
        self.send_error(code, reason);
    }

    fn transport_failure(&mut self, emits: &mut Vec<Emit>, error: std::io::Error) {
        emits.push(Emit::Error(
            Severity::Critical,
            WsError::TransportError(error),
        ));
        self.finish_closed(emits);
    }

    /// Terminal transition; `stream(CLOSE)` fires exactly once and only for
    /// sessions that actually reached OPEN.
    fn finish_closed(&mut self, emits: &mut Vec<Emit>) {
        self.phase = Phase::Closed;
        self.allow_send = false;
        self.fragment = None;
        self.transport.shutdown(Shutdown::Both);
        if self.was_open && !self.closed_emitted {
            self.closed_emitted = true;
            emits.push(Emit::Stream(StreamEvent::Close));
        }
    }
}
