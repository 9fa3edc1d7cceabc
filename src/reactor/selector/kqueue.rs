// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, os::fd::RawFd, ptr, time::Duration};

use crate::reactor::{
    Readiness,
    selector::{SelectorEvent, cvt},
};

const WAIT_CAPACITY: usize = 1024;

/// BSD / macOS `kqueue` backend.
///
/// Read and write filters are managed independently; a disabled kind simply
/// has no filter installed, which keeps `wait` quiet for it.
#[derive(Debug)]
pub struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Self> {
        let kq = cvt(unsafe { libc::kqueue() })?;
        cvt(unsafe { libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        Ok(Self { kq })
    }

    fn apply(&self, fd: RawFd, filter: i16, flags: u16) -> io::Result<()> {
        let change = libc::kevent {
            ident: fd as libc::uintptr_t,
            filter,
            flags,
            fflags: 0,
            data: 0,
            udata: ptr::null_mut(),
        };
        let res = unsafe {
            libc::kevent(self.kq, &change, 1, ptr::null_mut(), 0, ptr::null())
        };
        match cvt(res) {
            Ok(_) => Ok(()),
            // Deleting a filter that was never installed is not a fault.
            Err(e)
                if flags & libc::EV_DELETE != 0
                    && e.raw_os_error() == Some(libc::ENOENT) =>
            {
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    fn sync(&self, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        if readiness.contains(Readiness::READ) {
            self.apply(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_ENABLE)?;
        } else {
            self.apply(fd, libc::EVFILT_READ, libc::EV_DELETE)?;
        }
        if readiness.contains(Readiness::WRITE) {
            self.apply(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_ENABLE)?;
        } else {
            self.apply(fd, libc::EVFILT_WRITE, libc::EV_DELETE)?;
        }
        Ok(())
    }

    pub fn register(&self, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        self.sync(fd, readiness)
    }

    pub fn modify(&self, fd: RawFd, readiness: Readiness) -> io::Result<()> {
        self.sync(fd, readiness)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.sync(fd, Readiness::empty())
    }

    /// Blocks up to `timeout_ms` (`-1` = forever) and appends readiness slots
    /// to `out`. Returns the number of slots produced.
    pub fn wait(
        &self,
        out: &mut Vec<SelectorEvent>,
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let mut raw: [libc::kevent; WAIT_CAPACITY] = unsafe { std::mem::zeroed() };
        let timeout;
        let timeout_ptr = if timeout_ms < 0 {
            ptr::null()
        } else {
            let dur = Duration::from_millis(timeout_ms as u64);
            timeout = libc::timespec {
                tv_sec: dur.as_secs() as libc::time_t,
                tv_nsec: i64::from(dur.subsec_nanos()) as libc::c_long,
            };
            &timeout
        };
        let n = cvt(unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                raw.as_mut_ptr(),
                WAIT_CAPACITY as libc::c_int,
                timeout_ptr,
            )
        })?;
        for ev in raw.iter().take(n as usize) {
            let mut readiness = Readiness::empty();
            if ev.flags & libc::EV_EOF != 0 || ev.flags & libc::EV_ERROR != 0 {
                readiness |= Readiness::CLOSE;
            }
            if ev.filter == libc::EVFILT_READ {
                readiness |= Readiness::READ;
            }
            if ev.filter == libc::EVFILT_WRITE {
                readiness |= Readiness::WRITE;
            }
            out.push(SelectorEvent {
                fd: ev.ident as RawFd,
                readiness,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
