// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io,
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    cfg::config::Config,
    error::{Severity, WsError},
    net::socket::Socket,
    reactor::{Callback, EventKind, EventMode, base::Base},
    utils,
    ws::{
        cipher::{CipherKind, Encryption, PayloadCipher},
        deflate::Compressor,
        extension::CompressMethod,
        handshake::ClientOptions,
        hooks::{Activity, Emit, Hooks},
        session::{Session, SessionSettings},
    },
};

struct Connection {
    bid: u64,
    fd: RawFd,
    session: Mutex<Session>,
    established: AtomicBool,
}

struct ClientInner {
    sid: u16,
    base: Base,
    hooks: Hooks,
    settings: Mutex<SessionSettings>,
    options: Mutex<ClientOptions>,
    encryption: Mutex<Encryption>,
    connection: Mutex<Option<Arc<Connection>>>,
    ping_timer: OnceCell<RawFd>,
}

/// Websocket client: drives one connection through non-blocking connect,
/// the upgrade request and the OPEN session, all on the reactor thread.
#[derive(Clone)]
pub struct WsClient {
    inner: Arc<ClientInner>,
}

impl WsClient {
    pub fn new(base: Base, hooks: Hooks) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                sid: utils::next_sid(),
                base,
                hooks,
                settings: Mutex::new(SessionSettings::default()),
                options: Mutex::new(ClientOptions::default()),
                encryption: Mutex::new(Encryption::default()),
                connection: Mutex::new(None),
                ping_timer: OnceCell::new(),
            }),
        }
    }

    /// Applies the `websocket` and `client` sections of a loaded config.
    pub fn configure(&self, cfg: &Config) {
        {
            let mut settings = self.inner.settings.lock();
            settings.ping_interval =
                Duration::from_secs(u64::from(cfg.websocket.ping_interval));
            settings.pong_wait = Duration::from_secs(u64::from(cfg.websocket.wait_pong));
            settings.max_frame_size = cfg.websocket.segment_size;
            settings.max_requests = cfg.websocket.max_requests;
            settings.crypted = cfg.websocket.encryption.enabled;
        }
        {
            let mut options = self.inner.options.lock();
            options.host = cfg.client.host.clone();
            options.path = cfg.client.path.clone();
            options.compressors = cfg.websocket.compressors.clone();
            options.subprotocols = cfg.websocket.subprotocols.clone();
            options.authorization = cfg.client.authorization.clone();
        }
        *self.inner.encryption.lock() = cfg.websocket.encryption.clone();
    }

    pub fn sid(&self) -> u16 {
        self.inner.sid
    }

    pub fn base(&self) -> &Base {
        &self.inner.base
    }

    pub fn ping_interval(&self, sec: u16) {
        self.inner.settings.lock().ping_interval =
            Duration::from_secs(u64::from(sec));
    }

    pub fn wait_pong(&self, sec: u16) {
        self.inner.settings.lock().pong_wait = Duration::from_secs(u64::from(sec));
    }

    pub fn segment_size(&self, bytes: usize) {
        self.inner.settings.lock().max_frame_size = bytes;
    }

    pub fn max_requests(&self, cap: u32) {
        self.inner.settings.lock().max_requests = cap;
    }

    pub fn compressors(&self, list: Vec<CompressMethod>) {
        self.inner.options.lock().compressors = list;
    }

    pub fn subprotocols(&self, set: Vec<String>) {
        self.inner.options.lock().subprotocols = set;
    }

    pub fn authorization(&self, value: Option<String>) {
        self.inner.options.lock().authorization = value;
    }

    pub fn proxy_authorization(&self, value: Option<String>) {
        self.inner.options.lock().proxy_authorization = value;
    }

    pub fn encryption(&self, enabled: bool, pass: &str, salt: &str, cipher: CipherKind) {
        *self.inner.encryption.lock() = Encryption {
            enabled,
            pass: pass.to_string(),
            salt: salt.to_string(),
            cipher,
        };
        self.inner.settings.lock().crypted = enabled;
    }

    pub fn set_cipher(&self, cipher: Arc<dyn PayloadCipher>) {
        self.inner.settings.lock().cipher = Some(cipher);
    }

    pub fn set_compressor_backend(&self, backend: Arc<dyn Compressor>) {
        self.inner.settings.lock().external_compressor = Some(backend);
    }

    /// Starts a non-blocking connect; the handshake continues on the reactor
    /// thread once WRITE readiness confirms the connection.
    pub fn connect(&self, addr: SocketAddr) -> Result<u64> {
        let mut guard = self.inner.connection.lock();
        if guard.is_some() {
            bail!("client already holds a connection");
        }
        let socket = Socket::connect_start(addr)
            .with_context(|| format!("failed to start connect to {addr}"))?;
        let fd = socket.as_raw_fd();
        let bid = utils::next_bid();
        let session = {
            let settings = self.inner.settings.lock().clone();
            let mut options = self.inner.options.lock().clone();
            if options.host.is_empty() {
                options.host = addr.to_string();
            }
            Session::client(bid, self.inner.sid, Box::new(socket), &settings, options)
        };
        let connection = Arc::new(Connection {
            bid,
            fd,
            session: Mutex::new(session),
            established: AtomicBool::new(false),
        });

        let cb: Callback = {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |fd, kind| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                connection_event(&inner, fd, kind);
            })
        };
        let mut reg_fd = fd;
        if !self.inner.base.add(&mut reg_fd, cb, Duration::ZERO, false) {
            bail!("reactor refused the client descriptor");
        }
        self.inner.base.mode(fd, EventKind::Write, EventMode::Enabled);
        self.inner.base.mode(fd, EventKind::Close, EventMode::Enabled);
        *guard = Some(connection);
        drop(guard);

        self.arm_ping_timer()?;
        debug!(bid, %addr, "connect started");
        Ok(bid)
    }

    fn arm_ping_timer(&self) -> Result<()> {
        if self.inner.ping_timer.get().is_some() {
            return Ok(());
        }
        let period = {
            let settings = self.inner.settings.lock();
            (settings.ping_interval / 2).max(Duration::from_millis(100))
        };
        let mut tfd: RawFd = -1;
        let cb: Callback = {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |_fd, _kind| {
                if let Some(inner) = inner.upgrade() {
                    ping_tick(&inner);
                }
            })
        };
        if !self.inner.base.add(&mut tfd, cb, period, true) {
            bail!("reactor refused the ping timer");
        }
        if !self
            .inner
            .base
            .mode(tfd, EventKind::Timer, EventMode::Enabled)
        {
            bail!("failed to enable the ping timer");
        }
        let _ = self.inner.ping_timer.set(tfd);
        Ok(())
    }

    /// Runs the reactor loop on the calling thread.
    pub fn start(&self) {
        self.inner.base.start();
    }

    /// Runs the reactor loop on a dedicated thread.
    pub fn launch(&self) -> Result<thread::JoinHandle<()>> {
        let base = self.inner.base.clone();
        thread::Builder::new()
            .name("ws-client-reactor".to_string())
            .spawn(move || base.start())
            .context("failed to spawn the reactor thread")
    }

    pub fn stop(&self) {
        self.inner.base.stop();
    }

    pub fn send_message(&self, data: &[u8], is_text: bool) -> Result<(), WsError> {
        let Some(connection) = self.inner.connection.lock().clone() else {
            return Err(WsError::ProtocolViolation("client is not connected"));
        };
        let result = {
            let mut session = connection.session.lock();
            session.send_message(data, is_text)
        };
        pump(&self.inner, &connection);
        result
    }

    pub fn send_error(&self, code: u16, reason: &str) -> bool {
        let Some(connection) = self.inner.connection.lock().clone() else {
            return false;
        };
        {
            let mut session = connection.session.lock();
            session.send_error(code, reason);
        }
        pump(&self.inner, &connection);
        true
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        let Some(connection) = self.inner.connection.lock().clone() else {
            return false;
        };
        {
            let mut session = connection.session.lock();
            session.close(code, reason);
        }
        pump(&self.inner, &connection);
        true
    }

    pub fn freeze(&self, on: bool) -> bool {
        let Some(connection) = self.inner.connection.lock().clone() else {
            return false;
        };
        let changed = {
            let mut session = connection.session.lock();
            session.freeze(on)
        };
        if changed {
            let mode = if on {
                EventMode::Disabled
            } else {
                EventMode::Enabled
            };
            self.inner.base.mode(connection.fd, EventKind::Read, mode);
        }
        changed
    }

    pub fn bid(&self) -> Option<u64> {
        self.inner.connection.lock().as_ref().map(|c| c.bid)
    }
}

/// SO_ERROR probe used to finish a non-blocking connect.
fn pending_socket_error(fd: RawFd) -> Option<io::Error> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let res = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&raw mut err).cast(),
            &mut len,
        )
    };
    if res != 0 {
        return Some(io::Error::last_os_error());
    }
    if err == 0 {
        None
    } else {
        Some(io::Error::from_raw_os_error(err))
    }
}

fn connection_event(inner: &Arc<ClientInner>, fd: RawFd, kind: EventKind) {
    let Some(connection) = inner.connection.lock().clone() else {
        return;
    };
    if connection.fd != fd {
        return;
    }

    if !connection.established.load(Ordering::SeqCst) {
        match kind {
            EventKind::Write => {
                if let Some(e) = pending_socket_error(fd) {
                    fail_connect(inner, &connection, e);
                    return;
                }
                connection.established.store(true, Ordering::SeqCst);
                inner.hooks.dispatch(
                    inner.sid,
                    connection.bid,
                    Emit::Active(Activity::Connect),
                );
                let emits = {
                    let mut session = connection.session.lock();
                    session.begin_client_handshake();
                    session.on_writable()
                };
                for emit in emits {
                    inner.hooks.dispatch(inner.sid, connection.bid, emit);
                }
                inner.base.mode(fd, EventKind::Read, EventMode::Enabled);
                settle(inner, &connection);
            },
            EventKind::Close => {
                let error = pending_socket_error(fd)
                    .unwrap_or_else(|| io::ErrorKind::ConnectionRefused.into());
                fail_connect(inner, &connection, error);
            },
            _ => {},
        }
        return;
    }

    let emits = {
        let mut session = connection.session.lock();
        let mut emits = match kind {
            EventKind::Read => session.on_readable(inner.hooks.raw.as_deref()),
            EventKind::Write => session.on_writable(),
            EventKind::Close => session.on_transport_close(),
            EventKind::Timer => Vec::new(),
        };
        emits.extend(session.on_writable());
        emits
    };
    for emit in emits {
        inner.hooks.dispatch(inner.sid, connection.bid, emit);
    }
    settle(inner, &connection);
}

fn fail_connect(inner: &Arc<ClientInner>, connection: &Arc<Connection>, e: io::Error) {
    warn!(bid = connection.bid, "connect failed: {e}");
    inner.hooks.dispatch(
        inner.sid,
        connection.bid,
        Emit::Error(Severity::Critical, WsError::TransportError(e)),
    );
    retire(inner, connection);
}

fn settle(inner: &Arc<ClientInner>, connection: &Arc<Connection>) {
    let (closed, wants_write) = {
        let session = connection.session.lock();
        (session.is_closed(), session.wants_write())
    };
    if closed {
        retire(inner, connection);
        return;
    }
    let mode = if wants_write {
        EventMode::Enabled
    } else {
        EventMode::Disabled
    };
    inner.base.mode(connection.fd, EventKind::Write, mode);
}

fn pump(inner: &Arc<ClientInner>, connection: &Arc<Connection>) {
    let emits = {
        let mut session = connection.session.lock();
        session.on_writable()
    };
    for emit in emits {
        inner.hooks.dispatch(inner.sid, connection.bid, emit);
    }
    settle(inner, connection);
}

/// Drops the finished connection; the client has no disconnection map, the
/// record is erased as soon as the socket is unregistered.
fn retire(inner: &Arc<ClientInner>, connection: &Arc<Connection>) {
    let removed = {
        let mut guard = inner.connection.lock();
        match guard.as_ref() {
            Some(current) if current.bid == connection.bid => guard.take(),
            _ => None,
        }
    };
    if removed.is_none() {
        return;
    }
    inner.base.del(connection.fd);
    trace!(bid = connection.bid, "client connection retired");
    inner.hooks.dispatch(
        inner.sid,
        connection.bid,
        Emit::Active(Activity::Disconnect),
    );
    if let Some(erase) = &inner.hooks.erase {
        erase(connection.bid);
    }
}

fn ping_tick(inner: &Arc<ClientInner>) {
    let Some(connection) = inner.connection.lock().clone() else {
        return;
    };
    if !connection.established.load(Ordering::SeqCst) {
        return;
    }
    let now = Instant::now();
    let emits = {
        let mut session = connection.session.lock();
        let mut emits = session.on_ping_tick(now);
        emits.extend(session.on_writable());
        emits
    };
    for emit in emits {
        inner.hooks.dispatch(inner.sid, connection.bid, emit);
    }
    settle(inner, &connection);
}
