// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Close codes the engine puts on the wire.
pub mod close_code {
    /// Normal closure requested by the application.
    pub const NORMAL: u16 = 1000;
    /// Protocol error detected while parsing a frame.
    pub const PROTOCOL: u16 = 1002;
    /// Internal failure (ping supervision, framing recovery).
    pub const INTERNAL: u16 = 1005;
    /// Payload could not be decompressed or decrypted.
    pub const INVALID_PAYLOAD: u16 = 1007;
}

/// Error kinds surfaced to user callbacks and returned by the public API.
///
/// Recoverable errors are converted into a local CLOSE frame and a session
/// transition to CLOSING; transport errors skip the CLOSE attempt and move
/// the session directly to CLOSED.
#[derive(Debug, Error)]
pub enum WsError {
    /// Upgrade was rejected: bad version, missing key, auth failure or an
    /// invalid accept hash on the client side.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The peer violated RFC 6455 framing rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Decompression or decryption of a finished message failed.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// The peer did not answer PINGs within the configured window.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Graceful CLOSE received from the peer; the wire code is preserved.
    #[error("peer closed connection: {code} {reason}")]
    PeerClosed { code: u16, reason: String },

    /// Underlying socket or TLS failure.
    #[error("transport error: {0}")]
    TransportError(#[from] std::io::Error),

    /// Reactor registration table full or `total` connections exceeded.
    #[error("capacity exceeded: {0}")]
    Capacity(String),
}

impl WsError {
    /// Close code this error maps to when the session can still say goodbye.
    pub fn close_code(&self) -> u16 {
        match self {
            WsError::HandshakeFailed(_) => close_code::PROTOCOL,
            WsError::ProtocolViolation(_) => close_code::PROTOCOL,
            WsError::DecodeError(_) => close_code::INVALID_PAYLOAD,
            WsError::Timeout(_) => close_code::INTERNAL,
            WsError::PeerClosed { code, .. } => *code,
            WsError::TransportError(_) => close_code::INTERNAL,
            WsError::Capacity(_) => close_code::INTERNAL,
        }
    }

    /// True when the error still allows a CLOSE frame on the wire.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, WsError::TransportError(_))
    }
}

/// Severity attached to the `error` hook, mirroring log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Critical,
}
