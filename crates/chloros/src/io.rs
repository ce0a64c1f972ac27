// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Blocking I/O that suspends the calling green thread instead of the carrier.
//!
//! Each wrapper registers the descriptor with the reactor, parks the caller,
//! and performs the real syscall once the scheduler reports the descriptor
//! ready. The syscall itself is unchanged, so results and errno match the
//! plain libc call. While another thread is already parked on the same
//! descriptor the caller keeps yielding and retries the registration. A
//! descriptor epoll cannot watch at all (invalid fd, regular file) gets the
//! syscall right away.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;

use crate::preempt;
use crate::reactor::Interest;
use crate::scheduler::{self, Park};

/// `read(2)`, parking until `fd` is readable.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    suspended(fd, Interest::Readable, || {
        // SAFETY: the slice is valid for `buf.len()` writable bytes.
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    })
}

/// `write(2)`, parking until `fd` is writable.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    suspended(fd, Interest::Writable, || {
        // SAFETY: the slice is valid for `buf.len()` readable bytes.
        cvt(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    })
}

/// `accept(2)` on a listening socket, parking until a connection is pending.
///
/// The new descriptor is close-on-exec. The caller owns it. The peer is
/// `None` for families without an IP address, such as Unix sockets.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    suspended(fd, Interest::Readable, || {
        // SAFETY: all-zero is a valid sockaddr_storage.
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        // SAFETY: storage and len describe a buffer large enough for any family.
        let conn = unsafe {
            libc::accept4(
                fd,
                (&mut storage as *mut libc::sockaddr_storage).cast(),
                &mut len,
                libc::SOCK_CLOEXEC,
            )
        };
        if conn < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((conn, peer_addr(&storage)))
    })
}

/// Park on `fd` until it is ready, then run `op`.
///
/// `op` runs inside the critical section so its errno cannot be clobbered
/// by a switch before it is read.
fn suspended<R>(
    fd: RawFd,
    interest: Interest,
    op: impl FnOnce() -> io::Result<R>,
) -> io::Result<R> {
    preempt::preempt_disable();
    let mut warned = false;
    let parked = loop {
        match scheduler::with(|s| s.park_on(fd, interest)) {
            Park::Parked => {
                scheduler::reschedule();
                break true;
            }
            Park::Busy => {
                if !warned {
                    log::warn!("fd {fd} already has a waiter, retrying after a yield");
                    warned = true;
                }
                scheduler::reschedule();
            }
            Park::Unwatchable => break false,
        }
    };
    let result = op();
    if parked {
        scheduler::with(|s| s.unpark(fd));
    }
    preempt::preempt_enable();
    result
}

fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Peer address from `accept4`, if the family carries one.
fn peer_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            // SAFETY: the family tag says the storage holds a sockaddr_in.
            let sin = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>()
            };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            // SAFETY: the family tag says the storage holds a sockaddr_in6.
            let sin6 = unsafe {
                &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>()
            };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_return_reads_errno() {
        unsafe { *libc::__errno_location() = libc::EAGAIN };
        let err = cvt(-1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(cvt(12).unwrap(), 12);
    }

    #[test]
    fn peer_addr_decodes_ipv4() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sin = unsafe {
            &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>()
        };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = 8080u16.to_be();
        sin.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
        assert_eq!(peer_addr(&storage), Some("127.0.0.1:8080".parse::<SocketAddr>().unwrap()));
    }

    #[test]
    fn unix_family_has_no_peer_addr() {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        storage.ss_family = libc::AF_UNIX as libc::sa_family_t;
        assert_eq!(peer_addr(&storage), None);
    }
}
