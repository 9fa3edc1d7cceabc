// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr},
    os::fd::{AsRawFd, RawFd},
    time::Duration,
};

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};
use tracing::trace;

/// Outcome of one non-blocking read or write attempt.
///
/// The kernel error space is collapsed into the four cases the session state
/// machine cares about; everything else is carried through as `Error`.
#[derive(Debug)]
pub enum IoStatus {
    /// `n` bytes were transferred.
    Bytes(usize),
    /// EAGAIN / EWOULDBLOCK: retry after the next readiness event.
    WouldBlock,
    /// EINTR: retry immediately.
    Interrupted,
    /// Orderly or abortive peer shutdown (0-byte read, ECONNRESET, EPIPE).
    Closed,
    /// Any other socket failure.
    Error(io::Error),
}

impl IoStatus {
    fn from_read(res: io::Result<usize>) -> Self {
        match res {
            Ok(0) => IoStatus::Closed,
            Ok(n) => IoStatus::Bytes(n),
            Err(e) => Self::from_err(e),
        }
    }

    fn from_write(res: io::Result<usize>) -> Self {
        match res {
            Ok(n) => IoStatus::Bytes(n),
            Err(e) => Self::from_err(e),
        }
    }

    fn from_err(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => IoStatus::WouldBlock,
            io::ErrorKind::Interrupted => IoStatus::Interrupted,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => IoStatus::Closed,
            _ => IoStatus::Error(e),
        }
    }
}

/// Thin owned wrapper around one OS socket.
///
/// The descriptor belongs to exactly one `Socket`; dropping it closes the fd
/// and thereby removes any reactor registrations that referenced it.
#[derive(Debug)]
pub struct Socket {
    inner: RawSocket,
}

impl Socket {
    /// Builds a listening TCP socket bound to `addr`.
    pub fn listen(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let inner = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("failed to create listener socket")?;
        inner
            .set_reuse_address(true)
            .context("failed to set SO_REUSEADDR")?;
        if addr.is_ipv6() {
            inner
                .set_only_v6(false)
                .context("failed to clear IPV6_V6ONLY")?;
        }
        inner
            .bind(&SockAddr::from(addr))
            .with_context(|| format!("failed to bind {addr}"))?;
        inner.listen(backlog).context("listen() failed")?;
        inner
            .set_nonblocking(true)
            .context("failed to switch listener to non-blocking")?;
        Ok(Self { inner })
    }

    /// Starts a non-blocking connect; EINPROGRESS is not an error, the caller
    /// waits for WRITE readiness and then checks [`Socket::take_error`].
    pub fn connect_start(addr: SocketAddr) -> Result<Self> {
        let domain = Domain::for_address(addr);
        let inner = RawSocket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .context("failed to create client socket")?;
        inner
            .set_nonblocking(true)
            .context("failed to switch client socket to non-blocking")?;
        match inner.connect(&SockAddr::from(addr)) {
            Ok(()) => {},
            Err(e)
                if e.raw_os_error() == Some(libc::EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => return Err(e).with_context(|| format!("connect {addr} failed")),
        }
        Ok(Self { inner })
    }

    /// Adopts an already-connected descriptor (accept path).
    pub fn from_raw(inner: RawSocket) -> Result<Self> {
        inner
            .set_nonblocking(true)
            .context("failed to switch accepted socket to non-blocking")?;
        Ok(Self { inner })
    }

    /// Accepts one pending connection, `None` when the backlog is drained.
    pub fn accept(&self) -> Result<Option<(Socket, SocketAddr)>> {
        match self.inner.accept() {
            Ok((sock, addr)) => {
                let peer = addr
                    .as_socket()
                    .context("accepted a non-IP peer address")?;
                trace!(peer = %peer, "accepted connection");
                Ok(Some((Socket::from_raw(sock)?, peer)))
            },
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            },
            Err(e) => Err(e).context("accept() failed"),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> IoStatus {
        IoStatus::from_read((&self.inner).read(buf))
    }

    pub fn write(&mut self, buf: &[u8]) -> IoStatus {
        IoStatus::from_write((&self.inner).write(buf))
    }

    pub fn shutdown(&self, how: Shutdown) {
        // Peer may already be gone, nothing actionable in that case.
        let _ = self.inner.shutdown(how);
    }

    /// Pending asynchronous error (SO_ERROR), used to finish a non-blocking
    /// connect.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        self.inner.take_error()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr().ok().and_then(|a| a.as_socket())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr().ok().and_then(|a| a.as_socket())
    }

    pub fn set_nodelay(&self, on: bool) -> Result<()> {
        self.inner.set_nodelay(on).context("failed to set TCP_NODELAY")
    }

    pub fn set_keepalive(&self, on: bool) -> Result<()> {
        self.inner
            .set_keepalive(on)
            .context("failed to set SO_KEEPALIVE")
    }

    pub fn set_send_buffer_size(&self, bytes: usize) -> Result<()> {
        self.inner
            .set_send_buffer_size(bytes)
            .context("failed to set SO_SNDBUF")
    }

    pub fn set_recv_buffer_size(&self, bytes: usize) -> Result<()> {
        self.inner
            .set_recv_buffer_size(bytes)
            .context("failed to set SO_RCVBUF")
    }

    pub fn set_linger(&self, dur: Option<Duration>) -> Result<()> {
        self.inner.set_linger(dur).context("failed to set SO_LINGER")
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
