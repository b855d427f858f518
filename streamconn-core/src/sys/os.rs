//! Linux implementation of the syscall layer.
//!
//! Option toggles and address handling go through `socket2` on a borrowed
//! descriptor; epoll, `FIONREAD`, `socketpair` and the data path call libc
//! directly.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::BorrowedFd;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::time::Duration;

use libc::c_int;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};

use super::{CtlOp, ReadyEvent, Syscall};

/// Upper bound of events fetched by one `epoll_pwait` call.
const WAIT_BATCH: usize = 256;

/// Syscall layer backed by the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSyscall;

fn cvt(ret: c_int) -> io::Result<c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_len(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn with_sock<R>(fd: RawFd, f: impl FnOnce(SockRef<'_>) -> io::Result<R>) -> io::Result<R> {
    if fd < 0 {
        return Err(io::Error::from_raw_os_error(libc::EBADF));
    }
    // SAFETY: fd is non-negative and owned by the caller for the duration of the call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    f(SockRef::from(&borrowed))
}

impl Syscall for OsSyscall {
    fn socket(&self, domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<RawFd> {
        Ok(Socket::new(domain, ty, protocol)?.into_raw_fd())
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        with_sock(fd, |sock| sock.bind(addr))
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()> {
        with_sock(fd, |sock| sock.listen(backlog))
    }

    fn accept(&self, fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
        let (accepted, peer) = with_sock(fd, |sock| sock.accept())?;
        accepted.set_nonblocking(true)?;
        Ok((accepted.into_raw_fd(), peer))
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        with_sock(fd, |sock| sock.connect(addr))
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for buf.len() bytes.
        let ret = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
        cvt_len(ret)
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let ret = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        cvt_len(ret)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: closing a raw descriptor has no memory safety requirements.
        cvt(unsafe { libc::close(fd) }).map(drop)
    }

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()> {
        with_sock(fd, |sock| sock.set_nonblocking(nonblocking))
    }

    fn set_nodelay(&self, fd: RawFd, nodelay: bool) -> io::Result<()> {
        with_sock(fd, |sock| sock.set_nodelay(nodelay))
    }

    fn set_linger(&self, fd: RawFd, linger: Option<Duration>) -> io::Result<()> {
        with_sock(fd, |sock| sock.set_linger(linger))
    }

    fn set_reuse_address(&self, fd: RawFd, reuse: bool) -> io::Result<()> {
        with_sock(fd, |sock| sock.set_reuse_address(reuse))
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SockAddr> {
        with_sock(fd, |sock| sock.local_addr())
    }

    fn take_error(&self, fd: RawFd) -> io::Result<Option<io::Error>> {
        with_sock(fd, |sock| sock.take_error())
    }

    fn wake_pair(&self) -> io::Result<(RawFd, RawFd)> {
        let mut fds: [c_int; 2] = [-1, -1];
        // SAFETY: fds has room for the two descriptors socketpair writes.
        cvt(unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        })?;
        Ok((fds[0], fds[1]))
    }

    fn epoll_create(&self) -> io::Result<RawFd> {
        // SAFETY: plain syscall without pointer arguments.
        cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })
    }

    fn epoll_ctl(&self, epfd: RawFd, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()> {
        let op = match op {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Modify => libc::EPOLL_CTL_MOD,
            CtlOp::Delete => libc::EPOLL_CTL_DEL,
        };
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        // SAFETY: event outlives the call; DEL ignores it on current kernels.
        cvt(unsafe { libc::epoll_ctl(epfd, op, fd, &mut event) }).map(drop)
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [ReadyEvent],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let mut raw = [libc::epoll_event { events: 0, u64: 0 }; WAIT_BATCH];
        let max = events.len().min(WAIT_BATCH).max(1);
        // SAFETY: raw holds at least `max` entries; a null sigmask keeps the current mask.
        let n = cvt(unsafe {
            libc::epoll_pwait(
                epfd,
                raw.as_mut_ptr(),
                max as c_int,
                timeout_ms,
                std::ptr::null(),
            )
        })? as usize;

        for (slot, event) in events.iter_mut().zip(raw.iter().take(n)) {
            let mask = event.events;
            let token = event.u64;
            *slot = ReadyEvent {
                fd: token as RawFd,
                events: mask,
            };
        }
        Ok(n.min(events.len()))
    }

    fn bytes_available(&self, fd: RawFd) -> io::Result<usize> {
        let mut count: c_int = 0;
        // SAFETY: FIONREAD writes one c_int into count.
        cvt(unsafe { libc::ioctl(fd, libc::FIONREAD, &mut count) })?;
        Ok(count.max(0) as usize)
    }
}
