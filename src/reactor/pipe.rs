// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{io, os::fd::RawFd};

use parking_lot::Mutex;

use crate::reactor::selector::cvt;

/// Connected descriptor pair used to post 64-bit words onto the reactor
/// thread from anywhere else.
///
/// The read end is non-blocking and registered with the reactor; the write
/// end stays blocking so producers queue up in the kernel instead of losing
/// wakeups. Words are delivered FIFO per the stream socket guarantee.
#[derive(Debug)]
pub struct Pipe {
    read_fd: RawFd,
    write_fd: RawFd,
    // A stream socket may split an 8-byte word across reads; the remainder
    // is parked here until the next READ readiness. Reader side only.
    pending: Mutex<Vec<u8>>,
}

impl Pipe {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as RawFd; 2];
        cvt(unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        })?;
        let (read_fd, write_fd) = (fds[0], fds[1]);
        unsafe {
            libc::fcntl(read_fd, libc::F_SETFD, libc::FD_CLOEXEC);
            libc::fcntl(write_fd, libc::F_SETFD, libc::FD_CLOEXEC);
            let flags = libc::fcntl(read_fd, libc::F_GETFL);
            libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(Self {
            read_fd,
            write_fd,
            pending: Mutex::new(Vec::with_capacity(8)),
        })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Posts one word to the reactor thread. Callable from any thread.
    pub fn notify(&self, value: u64) -> io::Result<()> {
        let bytes = value.to_le_bytes();
        let mut written = 0usize;
        while written < bytes.len() {
            let res = unsafe {
                libc::write(
                    self.write_fd,
                    bytes[written..].as_ptr().cast(),
                    bytes.len() - written,
                )
            };
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            written += res as usize;
        }
        Ok(())
    }

    /// Pops the next complete word, `None` once the read end is drained.
    /// Reactor thread only.
    pub fn drain_one(&self) -> Option<u64> {
        let mut pending = self.pending.lock();
        loop {
            if pending.len() >= 8 {
                let word: Vec<u8> = pending.drain(..8).collect();
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&word);
                return Some(u64::from_le_bytes(raw));
            }
            let mut chunk = [0u8; 64];
            let res = unsafe {
                libc::read(self.read_fd, chunk.as_mut_ptr().cast(), chunk.len())
            };
            if res > 0 {
                pending.extend_from_slice(&chunk[..res as usize]);
                continue;
            }
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
            }
            return None;
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}
