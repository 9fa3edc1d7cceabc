// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, HashSet},
    os::fd::RawFd,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::reactor::{
    Callback, EventKind, EventMode, NetGuard, Readiness,
    pipe::Pipe,
    selector::{Selector, SelectorEvent},
};

/// Default registration cap, the original event base's MAX_COUNT_FDS.
pub const DEFAULT_MAX_COUNT: u32 = 0x5000;

const DEFAULT_FREQUENCY_MS: u32 = 100;
const EMPTY_SET_NAP: Duration = Duration::from_millis(100);
const FROZEN_NAP: Duration = Duration::from_millis(10);
const EASILY_FALLBACK_NAP: Duration = Duration::from_millis(10);

/// One tracked registration: a socket (fd ≥ 0) or a timer (reactor-allocated
/// negative descriptor, nothing to close on removal).
struct Peer {
    #[allow(dead_code)]
    id: u64,
    fd: RawFd,
    callback: Callback,
    modes: HashMap<EventKind, EventMode>,
    delay: Duration,
    remaining: Duration,
    series: bool,
}

impl Peer {
    fn is_timer(&self) -> bool {
        self.fd < 0
    }

    fn readiness(&self) -> Readiness {
        let mut readiness = Readiness::empty();
        if self.modes.get(&EventKind::Read) == Some(&EventMode::Enabled) {
            readiness |= Readiness::READ;
        }
        if self.modes.get(&EventKind::Write) == Some(&EventMode::Enabled) {
            readiness |= Readiness::WRITE;
        }
        readiness
    }
}

struct State {
    peers: HashMap<RawFd, Peer>,
    upstreams: HashMap<u64, Arc<Pipe>>,
    /// Descriptor whose callback is currently executing.
    dispatching: Option<RawFd>,
    /// Descriptors removed during the current dispatch sweep; no further
    /// events are delivered to them within this iteration.
    exiled: HashSet<RawFd>,
    next_timer_fd: RawFd,
    next_ident: u64,
    next_upstream: u64,
    restart: bool,
    failures: u32,
}

struct Inner {
    state: Mutex<State>,
    selector: RwLock<Selector>,
    cond: Condvar,
    running: AtomicBool,
    launched: AtomicBool,
    frozen: AtomicBool,
    easily: AtomicBool,
    frequency_ms: AtomicU32,
    max_count: u32,
    wake: Arc<Pipe>,
    wake_fd: RawFd,
    reactor_thread: Mutex<Option<ThreadId>>,
    _net: NetGuard,
}

/// Portable readiness reactor: a selector-backed dispatch loop with timer
/// support and cross-thread wakeups.
///
/// Cloning yields another handle onto the same loop. All mutators are safe
/// from any thread; user callbacks only ever run on the thread that called
/// [`Base::start`], and the loop never holds its lock while a callback runs,
/// so callbacks may freely add, remove and toggle registrations.
#[derive(Clone)]
pub struct Base {
    inner: Arc<Inner>,
}

impl Base {
    pub fn new(max_count: u32) -> Result<Self> {
        let net = NetGuard::acquire();
        let selector = Selector::new().context("failed to create OS selector")?;
        let wake = Arc::new(Pipe::new().context("failed to create wakeup pipe")?);
        let wake_fd = wake.read_fd();

        let base = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    peers: HashMap::new(),
                    upstreams: HashMap::new(),
                    dispatching: None,
                    exiled: HashSet::new(),
                    next_timer_fd: -2,
                    next_ident: 0,
                    next_upstream: 0,
                    restart: false,
                    failures: 0,
                }),
                selector: RwLock::new(selector),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                launched: AtomicBool::new(false),
                frozen: AtomicBool::new(false),
                easily: AtomicBool::new(false),
                frequency_ms: AtomicU32::new(DEFAULT_FREQUENCY_MS),
                max_count,
                wake: wake.clone(),
                wake_fd,
                reactor_thread: Mutex::new(None),
                _net: net,
            }),
        };

        // The wakeup pipe lives in the peer table like everything else; its
        // callback just drains pending words.
        let drainer: Callback =
            Arc::new(move |_fd, _kind| while wake.drain_one().is_some() {});
        let mut fd = wake_fd;
        if !base.add(&mut fd, drainer, Duration::ZERO, false)
            || !base.mode(wake_fd, EventKind::Read, EventMode::Enabled)
        {
            bail!("failed to register the internal wakeup pipe");
        }
        Ok(base)
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(DEFAULT_MAX_COUNT)
    }

    /// Registers a descriptor (or, when `delay` is non-zero, allocates a
    /// timer descriptor and stores it into `fd`). Every kind starts disabled.
    pub fn add(
        &self,
        fd: &mut RawFd,
        callback: Callback,
        delay: Duration,
        series: bool,
    ) -> bool {
        let mut st = self.inner.state.lock();
        if st.peers.len() >= self.inner.max_count as usize {
            warn!(
                max = self.inner.max_count,
                "registration table is full, descriptor rejected"
            );
            return false;
        }
        st.next_ident += 1;
        let id = st.next_ident;

        if !delay.is_zero() {
            let tfd = st.next_timer_fd;
            st.next_timer_fd -= 1;
            *fd = tfd;
            let mut modes = HashMap::with_capacity(1);
            modes.insert(EventKind::Timer, EventMode::Disabled);
            st.peers.insert(tfd, Peer {
                id,
                fd: tfd,
                callback,
                modes,
                delay,
                remaining: delay,
                series,
            });
            trace!(fd = tfd, delay_ms = delay.as_millis() as u64, "timer registered");
            // The loop may be parked on a longer timeout than this deadline.
            let _ = self.inner.wake.notify(0);
            return true;
        }

        if *fd < 0 {
            warn!("attempted to register an invalid descriptor");
            return false;
        }
        if st.peers.contains_key(fd) {
            warn!(fd = *fd, "descriptor is already registered");
            return false;
        }
        if let Err(e) = self.inner.selector.read().register(*fd, Readiness::empty()) {
            warn!(fd = *fd, "selector rejected descriptor: {e}");
            return false;
        }
        let mut modes = HashMap::with_capacity(3);
        modes.insert(EventKind::Close, EventMode::Disabled);
        modes.insert(EventKind::Read, EventMode::Disabled);
        modes.insert(EventKind::Write, EventMode::Disabled);
        st.peers.insert(*fd, Peer {
            id,
            fd: *fd,
            callback,
            modes,
            delay: Duration::ZERO,
            remaining: Duration::ZERO,
            series: false,
        });
        trace!(fd = *fd, "descriptor registered");
        true
    }

    /// Flips one event kind; idempotent; `false` when the registration or the
    /// kind does not exist, or when the selector refuses the change.
    pub fn mode(&self, fd: RawFd, kind: EventKind, mode: EventMode) -> bool {
        let mut st = self.inner.state.lock();
        let Some(peer) = st.peers.get_mut(&fd) else {
            return false;
        };
        let Some(current) = peer.modes.get(&kind).copied() else {
            return false;
        };
        if current == mode {
            return true;
        }
        peer.modes.insert(kind, mode);
        if !peer.is_timer() && matches!(kind, EventKind::Read | EventKind::Write) {
            let readiness = peer.readiness();
            if let Err(e) = self.inner.selector.read().modify(fd, readiness) {
                warn!(fd, "selector refused interest change: {e}");
                peer.modes.insert(kind, current);
                return false;
            }
        }
        if kind == EventKind::Timer && mode == EventMode::Enabled {
            peer.remaining = peer.delay;
            let _ = self.inner.wake.notify(0);
        }
        true
    }

    /// Removes the whole registration. Synchronous: once this returns, the
    /// callback will not fire for `fd` again, from any thread's perspective.
    pub fn del(&self, fd: RawFd) -> bool {
        let mut st = self.inner.state.lock();
        if !self.on_reactor_thread() {
            while st.dispatching == Some(fd) {
                self.inner.cond.wait(&mut st);
            }
        }
        self.remove_locked(&mut st, fd)
    }

    /// Removes a single kind; removing the last kind besides CLOSE removes
    /// the whole registration.
    pub fn del_kind(&self, fd: RawFd, kind: EventKind) -> bool {
        let mut st = self.inner.state.lock();
        if !self.on_reactor_thread() {
            while st.dispatching == Some(fd) {
                self.inner.cond.wait(&mut st);
            }
        }
        let Some(peer) = st.peers.get_mut(&fd) else {
            return false;
        };
        if peer.modes.remove(&kind).is_none() {
            return false;
        }
        let only_close_left = peer
            .modes
            .keys()
            .all(|kind| *kind == EventKind::Close);
        if only_close_left {
            return self.remove_locked(&mut st, fd);
        }
        if !peer.is_timer() {
            let readiness = peer.readiness();
            if let Err(e) = self.inner.selector.read().modify(fd, readiness) {
                warn!(fd, "selector refused interest change: {e}");
            }
        }
        true
    }

    fn remove_locked(&self, st: &mut State, fd: RawFd) -> bool {
        if st.peers.remove(&fd).is_none() {
            return false;
        }
        st.exiled.insert(fd);
        if fd >= 0
            && let Err(e) = self.inner.selector.read().deregister(fd)
        {
            trace!(fd, "deregister after removal: {e}");
        }
        trace!(fd, "descriptor removed");
        true
    }

    /// True between the first iteration of `start` and the loop's exit.
    pub fn launched(&self) -> bool {
        self.inner.launched.load(Ordering::SeqCst)
    }

    pub fn registered(&self, fd: RawFd) -> bool {
        self.inner.state.lock().peers.contains_key(&fd)
    }

    /// Number of user registrations (the internal wakeup pipe not counted).
    pub fn count(&self) -> usize {
        self.inner.state.lock().peers.len().saturating_sub(1)
    }

    /// Removes every registration and closes everything the reactor owns.
    pub fn clear(&self) {
        let mut st = self.inner.state.lock();
        let fds: Vec<RawFd> = st
            .peers
            .keys()
            .copied()
            .filter(|fd| *fd != self.inner.wake_fd)
            .collect();
        for fd in fds {
            self.remove_locked(&mut st, fd);
        }
        st.upstreams.clear();
        debug!("event base cleared");
    }

    /// Signals the loop to exit and blocks (when called from another thread)
    /// until the loop has actually left `start`.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.wake.notify(0);
        if !self.on_reactor_thread() {
            let mut st = self.inner.state.lock();
            while self.inner.launched.load(Ordering::SeqCst) {
                self.inner.cond.wait(&mut st);
            }
        }
    }

    /// Wakes the loop and makes it rebuild its interest snapshot, observable
    /// as a stop + start without tearing the dispatch thread down.
    pub fn kick(&self) {
        self.inner.state.lock().restart = true;
        let _ = self.inner.wake.notify(0);
    }

    /// Recreates the OS selector and re-registers every live interest.
    pub fn rebase(&self) {
        let _ = self.inner.wake.notify(0);
        let st = self.inner.state.lock();
        let mut selector = self.inner.selector.write();
        match Selector::new() {
            Ok(fresh) => {
                for (fd, peer) in st.peers.iter().filter(|(fd, _)| **fd >= 0) {
                    if let Err(e) = fresh.register(*fd, peer.readiness()) {
                        warn!(fd = *fd, "re-registration failed during rebase: {e}");
                    }
                }
                *selector = fresh;
                debug!("selector recreated");
            },
            Err(e) => error!("failed to recreate selector: {e}"),
        }
    }

    /// Temporarily suspends dispatch without touching registrations.
    pub fn freeze(&self, mode: bool) {
        self.inner.frozen.store(mode, Ordering::SeqCst);
        let _ = self.inner.wake.notify(0);
    }

    /// Cooperative mode: every iteration yields the CPU for `frequency` ms.
    pub fn easily(&self, mode: bool) {
        self.inner.easily.store(mode, Ordering::SeqCst);
        let _ = self.inner.wake.notify(0);
    }

    /// Selector timeout used whenever at least one interest is registered.
    pub fn frequency(&self, msec: u32) {
        self.inner.frequency_ms.store(msec, Ordering::SeqCst);
        let _ = self.inner.wake.notify(0);
    }

    fn on_reactor_thread(&self) -> bool {
        self.inner
            .reactor_thread
            .lock()
            .map(|tid| tid == thread::current().id())
            .unwrap_or(false)
    }

    /// Registers a fresh upstream record and returns its id. The callback
    /// runs on the reactor thread with each word posted via
    /// [`Base::launch_upstream`].
    pub fn emplace_upstream(
        &self,
        callback: Arc<dyn Fn(u64) + Send + Sync>,
    ) -> Result<u64> {
        let pipe =
            Arc::new(Pipe::new().context("failed to create upstream pipe")?);
        let read_fd = pipe.read_fd();
        let drainer: Callback = {
            let pipe = pipe.clone();
            Arc::new(move |_fd, _kind| {
                while let Some(word) = pipe.drain_one() {
                    callback(word);
                }
            })
        };
        let mut fd = read_fd;
        if !self.add(&mut fd, drainer, Duration::ZERO, false) {
            bail!("failed to register upstream pipe with the reactor");
        }
        if !self.mode(read_fd, EventKind::Read, EventMode::Enabled) {
            self.del(read_fd);
            bail!("failed to enable READ on the upstream pipe");
        }
        let mut st = self.inner.state.lock();
        st.next_upstream += 1;
        let sid = st.next_upstream;
        st.upstreams.insert(sid, pipe);
        Ok(sid)
    }

    /// Posts a word to an upstream record from any thread. FIFO per record.
    pub fn launch_upstream(&self, sid: u64, tid: u64) -> bool {
        let Some(pipe) = self.inner.state.lock().upstreams.get(&sid).cloned() else {
            return false;
        };
        pipe.notify(tid).is_ok()
    }

    /// Drops an upstream record; a word posted but not yet observed is
    /// discarded silently.
    pub fn erase_upstream(&self, sid: u64) -> bool {
        let Some(pipe) = self.inner.state.lock().upstreams.remove(&sid) else {
            return false;
        };
        self.del(pipe.read_fd());
        true
    }

    /// Enters the dispatch loop on the calling thread until [`Base::stop`].
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("event loop is already running");
            return;
        }
        {
            let _st = self.inner.state.lock();
            *self.inner.reactor_thread.lock() = Some(thread::current().id());
            self.inner.launched.store(true, Ordering::SeqCst);
        }
        debug!("event loop started");

        let mut events: Vec<SelectorEvent> = Vec::with_capacity(1024);
        let mut last_tick = Instant::now();

        while self.inner.running.load(Ordering::SeqCst) {
            if self.inner.frozen.load(Ordering::SeqCst) {
                thread::sleep(FROZEN_NAP);
                last_tick = Instant::now();
                continue;
            }

            let (occupied, nearest) = {
                let mut st = self.inner.state.lock();
                st.exiled.clear();
                st.restart = false;
                let occupied = st.peers.len() > 1;
                let nearest = st
                    .peers
                    .values()
                    .filter(|p| {
                        p.is_timer()
                            && p.modes.get(&EventKind::Timer)
                                == Some(&EventMode::Enabled)
                    })
                    .map(|p| p.remaining)
                    .min();
                (occupied, nearest)
            };

            if !occupied {
                // Nothing but the wakeup pipe: doze instead of busy-spinning,
                // still interruptible through the pipe itself.
                events.clear();
                let sel = self.inner.selector.read();
                let _ = sel.wait(&mut events, EMPTY_SET_NAP.as_millis() as i32);
                drop(sel);
                for ev in &events {
                    self.dispatch_slot(*ev);
                }
                last_tick = Instant::now();
                continue;
            }

            let easily = self.inner.easily.load(Ordering::SeqCst);
            let frequency = self.inner.frequency_ms.load(Ordering::SeqCst);
            let timeout_ms: i32 = if easily {
                0
            } else {
                let mut timeout = i64::from(frequency.max(1));
                if let Some(rem) = nearest {
                    // Never oversleep the nearest deadline, never go negative.
                    timeout = timeout.min(rem.as_millis().max(1) as i64);
                }
                timeout as i32
            };

            events.clear();
            let wait_res = {
                let sel = self.inner.selector.read();
                sel.wait(&mut events, timeout_ms)
            };
            match wait_res {
                Ok(_) => self.inner.state.lock().failures = 0,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
                Err(e) => {
                    error!("event base dispatch failed: {e}");
                    let failures = {
                        let mut st = self.inner.state.lock();
                        st.failures += 1;
                        st.failures
                    };
                    if failures > 1 {
                        self.rebase();
                        self.inner.state.lock().failures = 0;
                    }
                    last_tick = Instant::now();
                    continue;
                },
            }

            for slot in 0..events.len() {
                let ev = events[slot];
                self.dispatch_slot(ev);
            }

            let elapsed = last_tick.elapsed();
            last_tick = Instant::now();
            self.redistribute(elapsed);

            if easily {
                let nap = if frequency > 0 {
                    Duration::from_millis(u64::from(frequency))
                } else {
                    EASILY_FALLBACK_NAP
                };
                thread::sleep(nap);
            }
        }

        {
            let _st = self.inner.state.lock();
            self.inner.launched.store(false, Ordering::SeqCst);
            *self.inner.reactor_thread.lock() = None;
            self.inner.cond.notify_all();
        }
        debug!("event loop stopped");
    }

    fn dispatch_slot(&self, ev: SelectorEvent) {
        // Hangup beats data: when the error path is armed it is the only
        // notification delivered for this descriptor in this iteration.
        if ev.readiness.contains(Readiness::CLOSE) {
            self.fire(ev.fd, EventKind::Close);
            return;
        }
        if ev.readiness.contains(Readiness::READ) {
            self.fire(ev.fd, EventKind::Read);
        }
        if ev.readiness.contains(Readiness::WRITE) {
            self.fire(ev.fd, EventKind::Write);
        }
    }

    fn fire(&self, fd: RawFd, kind: EventKind) {
        let callback = {
            let mut st = self.inner.state.lock();
            if st.exiled.contains(&fd) {
                return;
            }
            let Some(peer) = st.peers.get(&fd) else {
                trace!(fd, "readiness for a descriptor that is no longer tracked");
                return;
            };
            if peer.modes.get(&kind) != Some(&EventMode::Enabled) {
                return;
            }
            let callback = peer.callback.clone();
            st.dispatching = Some(fd);
            callback
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(fd, kind)));
        {
            let mut st = self.inner.state.lock();
            st.dispatching = None;
            self.inner.cond.notify_all();
        }
        if outcome.is_err() {
            error!(fd, ?kind, "event callback panicked; registration kept");
        }
    }

    /// Advances every enabled timer by `elapsed`, firing those that reached
    /// their deadline and re-arming the periodic ones.
    fn redistribute(&self, elapsed: Duration) {
        let mut due: Vec<(RawFd, bool)> = Vec::new();
        {
            let mut st = self.inner.state.lock();
            for peer in st.peers.values_mut() {
                if !peer.is_timer()
                    || peer.modes.get(&EventKind::Timer)
                        != Some(&EventMode::Enabled)
                {
                    continue;
                }
                if peer.remaining <= elapsed {
                    peer.remaining = peer.delay;
                    due.push((peer.fd, peer.series));
                } else {
                    peer.remaining -= elapsed;
                }
            }
        }
        for (fd, series) in due {
            self.fire(fd, EventKind::Timer);
            if !series {
                let mut st = self.inner.state.lock();
                if let Some(peer) = st.peers.get_mut(&fd) {
                    peer.modes.insert(EventKind::Timer, EventMode::Disabled);
                }
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Peer callbacks, upstream pipes and the selector all close with
        // their owners; only the trace is left to emit.
        trace!("event base destroyed");
    }
}
