// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, os::fd::RawFd};

use crate::reactor::{
    Readiness,
    selector::{SelectorEvent, cvt},
};

const WAIT_CAPACITY: usize = 1024;

/// Linux `epoll` backend.
#[derive(Debug)]
pub struct Selector {
    epfd: RawFd,
}

fn interest_bits(readiness: Readiness) -> u32 {
    // Hangup detection rides along for free, irrespective of enabled kinds.
    let mut bits = libc::EPOLLRDHUP as u32;
    if readiness.contains(Readiness::READ) {
        bits |= libc::EPOLLIN as u32;
    }
    if readiness.contains(Readiness::WRITE) {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        let epfd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest_bits(readiness),
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) })?;
        Ok(())
    }

    pub fn register(&self, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, readiness)
    }

    pub fn modify(&self, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, readiness)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // The kernel drops registrations of closed fds on its own; ENOENT and
        // EBADF here only mean we raced that cleanup.
        match self.ctl(libc::EPOLL_CTL_DEL, fd, Readiness::empty()) {
            Err(e)
                if e.raw_os_error() == Some(libc::ENOENT)
                    || e.raw_os_error() == Some(libc::EBADF) =>
            {
                Ok(())
            },
            other => other,
        }
    }

    /// Blocks up to `timeout_ms` (`-1` = forever) and appends readiness slots
    /// to `out`. Returns the number of slots produced.
    pub fn wait(
        &self,
        out: &mut Vec<SelectorEvent>,
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let mut raw: [libc::epoll_event; WAIT_CAPACITY] = unsafe { std::mem::zeroed() };
        let n = cvt(unsafe {
            libc::epoll_wait(
                self.epfd,
                raw.as_mut_ptr(),
                WAIT_CAPACITY as libc::c_int,
                timeout_ms,
            )
        })?;
        for ev in raw.iter().take(n as usize) {
            let mut readiness = Readiness::empty();
            if ev.events & (libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32
                != 0
            {
                readiness |= Readiness::CLOSE;
            }
            if ev.events & libc::EPOLLIN as u32 != 0 {
                readiness |= Readiness::READ;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                readiness |= Readiness::WRITE;
            }
            out.push(SelectorEvent {
                fd: ev.u64 as RawFd,
                readiness,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}
