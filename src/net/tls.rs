// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::net::Shutdown;

use anyhow::Result;

use crate::net::socket::{IoStatus, Socket};

/// Side of the TLS handshake a wrapped socket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Client,
    Server,
}

/// Byte transport the session state machine runs on.
///
/// Both the plain [`Socket`] and any TLS wrapper speak the same non-blocking
/// contract: renegotiation and record buffering stay behind `WouldBlock`.
pub trait Transport: Send {
    fn read(&mut self, buf: &mut [u8]) -> IoStatus;
    fn write(&mut self, buf: &[u8]) -> IoStatus;
    fn shutdown(&self, how: Shutdown);
}

impl Transport for Socket {
    fn read(&mut self, buf: &mut [u8]) -> IoStatus {
        Socket::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> IoStatus {
        Socket::write(self, buf)
    }

    fn shutdown(&self, how: Shutdown) {
        Socket::shutdown(self, how)
    }
}

/// External TLS collaborator. Implementations wrap an established socket and
/// return a transport with transparent encryption; the engine itself never
/// touches record framing or certificates.
pub trait TlsEngine: Send + Sync {
    fn wrap(
        &self,
        socket: Socket,
        role: TlsRole,
        host: Option<&str>,
    ) -> Result<Box<dyn Transport>>;
}
