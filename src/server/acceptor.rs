// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    cfg::config::Config,
    error::{Severity, WsError},
    net::socket::{IoStatus, Socket},
    reactor::{Callback, EventKind, EventMode, base::Base},
    utils,
    ws::{
        cipher::{CipherKind, Encryption, PayloadCipher},
        deflate::Compressor,
        extension::CompressMethod,
        handshake::{Request, ServerOptions},
        hooks::{Activity, Emit, Hooks},
        session::{Session, SessionSettings},
    },
};

/// Disconnected sessions are erased once they have been gone this long.
const DISCONNECT_RETENTION: Duration = Duration::from_secs(3);
const SWEEP_PERIOD: Duration = Duration::from_secs(3);
const ACCEPT_BACKLOG: i32 = 1024;
const BUSY_RESPONSE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

struct SessionCell {
    fd: RawFd,
    session: Mutex<Session>,
}

struct ServerInner {
    sid: u16,
    base: Base,
    hooks: Hooks,
    settings: Mutex<SessionSettings>,
    options: Mutex<ServerOptions>,
    encryption: Mutex<Encryption>,
    total: AtomicU32,
    listener: Mutex<Option<Socket>>,
    sessions: DashMap<u64, Arc<SessionCell>>,
    fd_index: DashMap<RawFd, u64>,
    disconnected: DashMap<u64, Instant>,
}

/// Websocket server: a listening socket, a reactor and the `bid → session`
/// map, glued together by reactor callbacks.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<ServerInner>,
}

impl WsServer {
    pub fn new(base: Base, hooks: Hooks) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                sid: utils::next_sid(),
                base,
                hooks,
                settings: Mutex::new(SessionSettings::default()),
                options: Mutex::new(ServerOptions::default()),
                encryption: Mutex::new(Encryption::default()),
                total: AtomicU32::new(100),
                listener: Mutex::new(None),
                sessions: DashMap::new(),
                fd_index: DashMap::new(),
                disconnected: DashMap::new(),
            }),
        }
    }

    /// Applies the `websocket` and `server` sections of a loaded config.
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
            options.compressors = cfg.websocket.compressors.clone();
            options.subprotocols = cfg.websocket.subprotocols.clone();
        }
        *self.inner.encryption.lock() = cfg.websocket.encryption.clone();
        self.inner.total.store(cfg.server.total, Ordering::SeqCst);
    }

    pub fn sid(&self) -> u16 {
        self.inner.sid
    }

    pub fn base(&self) -> &Base {
        &self.inner.base
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().as_ref().and_then(Socket::local_addr)
    }

    pub fn ping_interval(&self, sec: u16) {
        let interval = Duration::from_secs(u64::from(sec));
        self.inner.settings.lock().ping_interval = interval;
        self.for_each_session(|session| session.set_ping_interval(interval));
    }

    pub fn wait_pong(&self, sec: u16) {
        let wait = Duration::from_secs(u64::from(sec));
        self.inner.settings.lock().pong_wait = wait;
        self.for_each_session(|session| session.set_pong_wait(wait));
    }

    pub fn max_requests(&self, cap: u32) {
        self.inner.settings.lock().max_requests = cap;
        self.for_each_session(|session| session.set_max_requests(cap));
    }

    pub fn segment_size(&self, bytes: usize) {
        self.inner.settings.lock().max_frame_size = bytes;
        self.for_each_session(|session| session.set_segment_size(bytes));
    }

    pub fn compressors(&self, list: Vec<CompressMethod>) {
        self.inner.options.lock().compressors = list;
    }

    pub fn subprotocols(&self, set: Vec<String>) {
        self.inner.options.lock().subprotocols = set;
    }

    pub fn extensions(&self, extensions: Vec<Vec<String>>) {
        self.inner.options.lock().extensions = extensions;
    }

    /// Payload encryption switch; the actual cipher is installed through
    /// [`WsServer::set_cipher`].
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

    pub fn set_auth(
        &self,
        auth: impl Fn(&Request) -> bool + Send + Sync + 'static,
    ) {
        self.inner.options.lock().auth = Some(Arc::new(auth));
    }

    pub fn total(&self, cap: u32) {
        self.inner.total.store(cap, Ordering::SeqCst);
    }

    /// Cooperative worker mode: the reactor yields between iterations so
    /// sibling threads get CPU time; codecs themselves stay inline.
    pub fn multi_threads(&self, workers: usize) {
        self.inner.base.easily(workers > 0);
    }

    /// Binds the listener and wires the accept path, the ping supervisor
    /// and the disconnect sweep into the reactor.
    pub fn listen(&self, addr: SocketAddr) -> Result<()> {
        let listener = Socket::listen(addr, ACCEPT_BACKLOG)
            .with_context(|| format!("failed to listen on {addr}"))?;
        let mut fd = listener.as_raw_fd();

        let accept_cb: Callback = {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |_fd, kind| {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                if kind == EventKind::Read {
                    accept_ready(&inner);
                }
            })
        };
        if !self.inner.base.add(&mut fd, accept_cb, Duration::ZERO, false) {
            bail!("reactor refused the listener descriptor");
        }
        self.inner.base.mode(fd, EventKind::Read, EventMode::Enabled);
        *self.inner.listener.lock() = Some(listener);

        self.arm_timer(SWEEP_PERIOD, {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |_fd, _kind| {
                if let Some(inner) = inner.upgrade() {
                    sweep_disconnected(&inner);
                }
            })
        })?;

        let ping_period = {
            let settings = self.inner.settings.lock();
            (settings.ping_interval / 2).max(Duration::from_millis(100))
        };
        self.arm_timer(ping_period, {
            let inner = Arc::downgrade(&self.inner);
            Arc::new(move |_fd, _kind| {
                if let Some(inner) = inner.upgrade() {
                    ping_sessions(&inner);
                }
            })
        })?;

        debug!(sid = self.inner.sid, %addr, "listener armed");
        Ok(())
    }

    fn arm_timer(&self, period: Duration, callback: Callback) -> Result<()> {
        let mut tfd: RawFd = -1;
        if !self.inner.base.add(&mut tfd, callback, period, true) {
            bail!("reactor refused a timer registration");
        }
        if !self
            .inner
            .base
            .mode(tfd, EventKind::Timer, EventMode::Enabled)
        {
            bail!("failed to enable a timer registration");
        }
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
            .name("ws-server-reactor".to_string())
            .spawn(move || base.start())
            .context("failed to spawn the reactor thread")
    }

    pub fn stop(&self) {
        self.inner.base.stop();
    }

    /// Queues a message for one connection.
    pub fn send_message(&self, bid: u64, data: &[u8], is_text: bool) -> Result<(), WsError> {
        let Some(cell) = self.inner.sessions.get(&bid).map(|e| e.value().clone()) else {
            return Err(WsError::ProtocolViolation("unknown connection id"));
        };
        let result = {
            let mut session = cell.session.lock();
            session.send_message(data, is_text)
        };
        pump(&self.inner, bid, &cell);
        result
    }

    /// Sends CLOSE with the given code and text, then stops the connection.
    pub fn send_error(&self, bid: u64, code: u16, reason: &str) -> bool {
        let Some(cell) = self.inner.sessions.get(&bid).map(|e| e.value().clone()) else {
            return false;
        };
        {
            let mut session = cell.session.lock();
            session.send_error(code, reason);
        }
        pump(&self.inner, bid, &cell);
        true
    }

    /// Starts a graceful close for one connection.
    pub fn close(&self, bid: u64, code: u16, reason: &str) -> bool {
        let Some(cell) = self.inner.sessions.get(&bid).map(|e| e.value().clone()) else {
            return false;
        };
        {
            let mut session = cell.session.lock();
            session.close(code, reason);
        }
        pump(&self.inner, bid, &cell);
        true
    }

    /// Back-pressure valve: pauses or resumes reads for one connection.
    pub fn freeze(&self, bid: u64, on: bool) -> bool {
        let Some(cell) = self.inner.sessions.get(&bid).map(|e| e.value().clone()) else {
            return false;
        };
        let changed = {
            let mut session = cell.session.lock();
            session.freeze(on)
        };
        if changed {
            let mode = if on {
                EventMode::Disabled
            } else {
                EventMode::Enabled
            };
            self.inner.base.mode(cell.fd, EventKind::Read, mode);
        }
        changed
    }

    /// Number of live (not yet erased) connections.
    pub fn connections(&self) -> usize {
        self.inner.sessions.len()
    }

    fn for_each_session(&self, f: impl Fn(&mut Session)) {
        let cells: Vec<Arc<SessionCell>> = self
            .inner
            .sessions
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for cell in cells {
            f(&mut cell.session.lock());
        }
    }
}

/// Accepts until the backlog reports WouldBlock; each connection gets a
/// session and a reactor registration routing READ/WRITE/CLOSE to it.
fn accept_ready(inner: &Arc<ServerInner>) {
    loop {
        let accepted = {
            let guard = inner.listener.lock();
            let Some(listener) = guard.as_ref() else {
                return;
            };
            listener.accept()
        };
        match accepted {
            Ok(Some((socket, peer))) => place_connection(inner, socket, peer),
            Ok(None) => return,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            },
        }
    }
}

fn place_connection(inner: &Arc<ServerInner>, mut socket: Socket, peer: SocketAddr) {
    let live = inner.sessions.len() as u32;
    if live >= inner.total.load(Ordering::SeqCst) {
        // Over capacity: answer with 503 and drop the connection at once.
        if let IoStatus::Error(e) = socket.write(BUSY_RESPONSE) {
            trace!("refusal write failed: {e}");
        }
        warn!(%peer, "connection refused: server is full");
        inner.hooks.dispatch(
            inner.sid,
            0,
            Emit::Error(
                Severity::Warning,
                WsError::Capacity("total connections exceeded".to_string()),
            ),
        );
        return;
    }

    if let Err(e) = socket.set_nodelay(true) {
        trace!("nodelay: {e}");
    }
    if let Err(e) = socket.set_keepalive(true) {
        trace!("keepalive: {e}");
    }

    let bid = utils::next_bid();
    let fd = socket.as_raw_fd();
    let session = {
        let settings = inner.settings.lock().clone();
        let options = inner.options.lock().clone();
        Session::server(bid, inner.sid, Box::new(socket), &settings, options)
    };
    let cell = Arc::new(SessionCell {
        fd,
        session: Mutex::new(session),
    });

    let conn_cb: Callback = {
        let inner = Arc::downgrade(inner);
        Arc::new(move |fd, kind| {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            connection_event(&inner, fd, kind);
        })
    };
    let mut reg_fd = fd;
    if !inner.base.add(&mut reg_fd, conn_cb, Duration::ZERO, false) {
        warn!(%peer, "reactor refused the accepted descriptor");
        return;
    }
    inner.base.mode(fd, EventKind::Read, EventMode::Enabled);
    inner.base.mode(fd, EventKind::Close, EventMode::Enabled);

    inner.sessions.insert(bid, cell);
    inner.fd_index.insert(fd, bid);
    debug!(bid, %peer, "connection accepted");
    inner
        .hooks
        .dispatch(inner.sid, bid, Emit::Active(Activity::Connect));
}

fn connection_event(inner: &Arc<ServerInner>, fd: RawFd, kind: EventKind) {
    let Some(bid) = inner.fd_index.get(&fd).map(|e| *e.value()) else {
        return;
    };
    let Some(cell) = inner.sessions.get(&bid).map(|e| e.value().clone()) else {
        return;
    };
    let emits = {
        let mut session = cell.session.lock();
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
        inner.hooks.dispatch(inner.sid, bid, emit);
    }
    settle(inner, bid, &cell);
}

/// Post-I/O bookkeeping: retire closed sessions, otherwise align the WRITE
/// interest with the outbound backlog.
fn settle(inner: &Arc<ServerInner>, bid: u64, cell: &Arc<SessionCell>) {
    let (closed, wants_write) = {
        let session = cell.session.lock();
        (session.is_closed(), session.wants_write())
    };
    if closed {
        retire(inner, bid, cell.fd);
        return;
    }
    let mode = if wants_write {
        EventMode::Enabled
    } else {
        EventMode::Disabled
    };
    inner.base.mode(cell.fd, EventKind::Write, mode);
}

fn pump(inner: &Arc<ServerInner>, bid: u64, cell: &Arc<SessionCell>) {
    let emits = {
        let mut session = cell.session.lock();
        session.on_writable()
    };
    for emit in emits {
        inner.hooks.dispatch(inner.sid, bid, emit);
    }
    settle(inner, bid, cell);
}

/// Unregisters a finished connection and parks it in the disconnection map
/// until the sweep erases it.
fn retire(inner: &Arc<ServerInner>, bid: u64, fd: RawFd) {
    if inner.fd_index.remove(&fd).is_none() {
        return;
    }
    inner.base.del(fd);
    inner.disconnected.insert(bid, Instant::now());
    debug!(bid, "connection retired");
    inner
        .hooks
        .dispatch(inner.sid, bid, Emit::Active(Activity::Disconnect));
}

/// Periodic 3-second sweep over the disconnection map; records older than
/// the retention window are erased and reported through `erase`.
fn sweep_disconnected(inner: &Arc<ServerInner>) {
    let now = Instant::now();
    let expired: Vec<u64> = inner
        .disconnected
        .iter()
        .filter(|e| now.duration_since(*e.value()) >= DISCONNECT_RETENTION)
        .map(|e| *e.key())
        .collect();
    for bid in expired {
        inner.disconnected.remove(&bid);
        inner.sessions.remove(&bid);
        trace!(bid, "session record erased");
        if let Some(erase) = &inner.hooks.erase {
            erase(bid);
        }
    }
}

/// Ping supervision across every live session.
fn ping_sessions(inner: &Arc<ServerInner>) {
    let now = Instant::now();
    let cells: Vec<(u64, Arc<SessionCell>)> = inner
        .sessions
        .iter()
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    for (bid, cell) in cells {
        let emits = {
            let mut session = cell.session.lock();
            let mut emits = session.on_ping_tick(now);
            emits.extend(session.on_writable());
            emits
        };
        for emit in emits {
            inner.hooks.dispatch(inner.sid, bid, emit);
        }
        settle(inner, bid, &cell);
    }
}
