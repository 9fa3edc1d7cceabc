// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{os::fd::RawFd, time::Duration};

use parking_lot::Mutex;
use tracing::warn;

use crate::reactor::{Callback, EventKind, EventMode, base::Base};

/// Flavour of the registration a handle owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Readiness events on a caller-supplied descriptor.
    Event,
    /// A reactor-allocated timer.
    Timer,
}

const INVALID_FD: RawFd = -1;

struct EventState {
    base: Option<Base>,
    fd: RawFd,
    delay: Duration,
    series: bool,
    callback: Option<Callback>,
    started: bool,
}

/// User-facing handle that exclusively owns one reactor registration.
///
/// Constructed detached; `set_*` binds a reactor, a descriptor (or a timer
/// delay) and a callback; `start` inserts the registration, `stop` or drop
/// removes it. The handle captures its identity, so callers never juggle raw
/// descriptors after setup.
pub struct Event {
    ty: EventType,
    state: Mutex<EventState>,
}

impl Event {
    pub fn new(ty: EventType) -> Self {
        Self {
            ty,
            state: Mutex::new(EventState {
                base: None,
                fd: INVALID_FD,
                delay: Duration::ZERO,
                series: false,
                callback: None,
                started: false,
            }),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.ty
    }

    pub fn set_base(&self, base: Base) {
        self.state.lock().base = Some(base);
    }

    pub fn set_fd(&self, fd: RawFd) {
        self.state.lock().fd = fd;
    }

    pub fn set_callback(&self, callback: Callback) {
        self.state.lock().callback = Some(callback);
    }

    /// Configures the timer delay; `series` keeps the timer periodic, a
    /// one-shot timer disarms itself after firing and can be re-enabled.
    pub fn timeout(&self, delay: Duration, series: bool) {
        let mut st = self.state.lock();
        st.delay = delay;
        st.series = series;
    }

    /// Descriptor currently owned by the handle (a timer learns its
    /// reactor-allocated descriptor on `start`).
    pub fn fd(&self) -> RawFd {
        self.state.lock().fd
    }

    /// Inserts the registration into the bound reactor. A handle without a
    /// reactor, without a callback, or with neither descriptor nor delay is
    /// a configuration error: logged, nothing happens.
    pub fn start(&self) -> bool {
        let mut st = self.state.lock();
        if st.started {
            return true;
        }
        let Some(base) = st.base.clone() else {
            warn!("event handle started without a reactor bound");
            return false;
        };
        let Some(callback) = st.callback.clone() else {
            warn!("event handle started without a callback");
            return false;
        };
        let (delay, series) = match self.ty {
            EventType::Timer => {
                if st.delay.is_zero() {
                    warn!("timer handle started with a zero delay");
                    return false;
                }
                (st.delay, st.series)
            },
            EventType::Event => {
                if st.fd < 0 {
                    warn!("event handle started with an invalid descriptor");
                    return false;
                }
                (Duration::ZERO, false)
            },
        };
        let mut fd = st.fd;
        if !base.add(&mut fd, callback, delay, series) {
            return false;
        }
        st.fd = fd;
        st.started = true;
        if self.ty == EventType::Timer {
            base.mode(fd, EventKind::Timer, EventMode::Enabled);
        }
        true
    }

    /// Removes the registration; the handle may be started again later.
    pub fn stop(&self) {
        // The handle lock is released before `del`, which may block on an
        // in-flight callback that could itself re-enter this handle.
        let (base, fd) = {
            let mut st = self.state.lock();
            if !st.started {
                return;
            }
            st.started = false;
            let fd = st.fd;
            if self.ty == EventType::Timer {
                st.fd = INVALID_FD;
            }
            (st.base.clone(), fd)
        };
        if let Some(base) = base {
            base.del(fd);
        }
    }

    /// Flips one event kind on the owned registration.
    pub fn mode(&self, kind: EventKind, mode: EventMode) -> bool {
        let st = self.state.lock();
        if !st.started {
            return false;
        }
        match &st.base {
            Some(base) => base.mode(st.fd, kind, mode),
            None => false,
        }
    }

    /// Drops a single kind from the owned registration.
    pub fn del_kind(&self, kind: EventKind) -> bool {
        let (base, fd) = {
            let st = self.state.lock();
            if !st.started {
                return false;
            }
            let Some(base) = st.base.clone() else {
                return false;
            };
            (base, st.fd)
        };
        let removed = base.del_kind(fd, kind);
        if removed && !base.registered(fd) {
            let mut st = self.state.lock();
            st.started = false;
            if self.ty == EventType::Timer {
                st.fd = INVALID_FD;
            }
        }
        removed
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.stop();
    }
}
