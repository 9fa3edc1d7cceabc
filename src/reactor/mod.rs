// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    os::fd::RawFd,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bitflags::bitflags;
use tracing::debug;

pub mod base;
pub mod event;
pub mod pipe;
pub mod selector;

/// Activation flag of one event kind inside a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMode {
    Enabled,
    Disabled,
}

/// Kind of readiness delivered to a callback.
///
/// `Close` is synthesised by the reactor on peer hangup or socket error and,
/// within one iteration, always wins over `Read`/`Write` for the same fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Close,
    Read,
    Write,
    Timer,
}

bitflags! {
    /// Readiness reported by a selector backend for one descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const CLOSE = 0b0100;
    }
}

/// Callback invoked by the reactor on the reactor thread.
pub type Callback = Arc<dyn Fn(RawFd, EventKind) + Send + Sync>;

static NET_REFCOUNT: AtomicUsize = AtomicUsize::new(0);

/// Process-wide, reference-counted network subsystem guard.
///
/// On unix this only tracks reactor lifetimes; the slot exists so that the
/// WinSock / TLS-library global init has exactly one place to live. The guard
/// must survive repeated acquire/release cycles within one process.
#[derive(Debug)]
pub struct NetGuard(());

impl NetGuard {
    pub fn acquire() -> Self {
        let prev = NET_REFCOUNT.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            debug!("network subsystem initialised");
        }
        NetGuard(())
    }

    pub fn active() -> usize {
        NET_REFCOUNT.load(Ordering::SeqCst)
    }
}

impl Drop for NetGuard {
    fn drop(&mut self) {
        let prev = NET_REFCOUNT.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            debug!("network subsystem torn down");
        }
    }
}
