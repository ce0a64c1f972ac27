// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Reactor: epoll-backed readiness notification.
//!
//! Blocking wrappers register the descriptor they are about to use, tagged
//! with the id of the thread that will sleep on it. The scheduler polls the
//! reactor on every pass and wakes the threads whose descriptors are ready.
//! Registrations are one-shot, so a descriptor that stays readable cannot
//! re-wake a thread that is already runnable.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::task::ThreadId;

/// Most events collected per poll.
const MAX_EVENTS: usize = 16;

/// Readiness a parked thread waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn to_epoll_events(self) -> u32 {
        let base = match self {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        };
        (base | libc::EPOLLONESHOT) as u32
    }
}

#[derive(Debug)]
struct Registration {
    thread: ThreadId,
    interest: Interest,
}

/// One epoll instance plus the fd -> sleeper table.
///
/// Supports one waiter per descriptor.
#[derive(Debug)]
pub(crate) struct Reactor {
    epoll_fd: RawFd,
    registrations: HashMap<RawFd, Registration>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            registrations: HashMap::new(),
        })
    }

    /// Watch `fd` for `interest` on behalf of `thread`.
    ///
    /// Fails if the descriptor already has a sleeper or epoll rejects it.
    pub fn register(&mut self, fd: RawFd, interest: Interest, thread: ThreadId) -> io::Result<()> {
        if let Some(existing) = self.registrations.get(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!(
                    "fd {fd} already has thread {} waiting until {:?}",
                    existing.thread, existing.interest
                ),
            ));
        }

        let mut ev = libc::epoll_event {
            events: interest.to_epoll_events(),
            u64: thread.as_u64(),
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        self.registrations.insert(fd, Registration { thread, interest });
        Ok(())
    }

    /// Stop watching `fd`. Unknown descriptors are ignored.
    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registrations.remove(&fd).is_some() {
            let ret = unsafe {
                libc::epoll_ctl(
                    self.epoll_fd,
                    libc::EPOLL_CTL_DEL,
                    fd,
                    std::ptr::null_mut(),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected if the fd was closed meanwhile.
                if err.raw_os_error() != Some(libc::ENOENT)
                    && err.raw_os_error() != Some(libc::EBADF)
                {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Collect the threads whose descriptors became ready.
    ///
    /// `timeout_ms` follows epoll: 0 returns at once, -1 blocks until at
    /// least one event arrives. An interrupted wait reports no events.
    pub fn poll(&mut self, timeout_ms: i32) -> io::Result<Vec<ThreadId>> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        Ok(events[..n as usize]
            .iter()
            .map(|ev| ThreadId::from_u64(ev.u64))
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        for &fd in self.registrations.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        unsafe { libc::close(self.epoll_fd) };
    }
}
