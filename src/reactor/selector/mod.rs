// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-platform readiness selectors behind one surface: `epoll` on Linux,
//! `kqueue` on the BSD family and macOS. Backends are level-triggered; the
//! reactor filters delivery through its per-kind mode map.

use std::os::fd::RawFd;

use crate::reactor::Readiness;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
pub use epoll::Selector;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub use kqueue::Selector;

/// One readiness slot returned by [`Selector::wait`].
#[derive(Debug, Clone, Copy)]
pub struct SelectorEvent {
    pub fd: RawFd,
    pub readiness: Readiness,
}

pub(crate) fn cvt(res: i32) -> std::io::Result<i32> {
    if res < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(res)
    }
}
