//! Deterministic fault injection over another syscall layer.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockAddr, Type};

use super::{CtlOp, ReadyEvent, SharedSyscall, Syscall};

/// Names the calls that can be failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyscallKind {
    Socket,
    Bind,
    Listen,
    Accept,
    Connect,
    Send,
    Recv,
    EpollCreate,
    EpollCtl,
    EpollWait,
    BytesAvailable,
}

#[derive(Debug, Default)]
struct Plan {
    queued: VecDeque<i32>,
    sticky: Option<i32>,
    calls: usize,
}

/// Wraps a syscall layer and fails selected calls with chosen errno values.
///
/// ```
/// use streamconn_core::sys::{self, FaultInjection, SyscallKind};
///
/// let faults = FaultInjection::new(sys::os());
/// faults.fail_next(SyscallKind::Connect, libc::ECONNREFUSED);
/// ```
#[derive(Debug)]
pub struct FaultInjection {
    inner: SharedSyscall,
    plans: Mutex<HashMap<SyscallKind, Plan>>,
}

impl FaultInjection {
    #[must_use]
    pub fn new(inner: SharedSyscall) -> Self {
        Self {
            inner,
            plans: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next call of `kind` with `errno`. Queued failures are used in order.
    pub fn fail_next(&self, kind: SyscallKind, errno: i32) {
        self.plans.lock().entry(kind).or_default().queued.push_back(errno);
    }

    /// Fail every call of `kind` until [`clear`](Self::clear).
    pub fn fail_always(&self, kind: SyscallKind, errno: i32) {
        self.plans.lock().entry(kind).or_default().sticky = Some(errno);
    }

    /// Drop queued and sticky failures for `kind`.
    pub fn clear(&self, kind: SyscallKind) {
        if let Some(plan) = self.plans.lock().get_mut(&kind) {
            plan.queued.clear();
            plan.sticky = None;
        }
    }

    /// Number of calls of `kind` seen so far, failed ones included.
    pub fn calls(&self, kind: SyscallKind) -> usize {
        self.plans.lock().get(&kind).map_or(0, |plan| plan.calls)
    }

    fn check(&self, kind: SyscallKind) -> io::Result<()> {
        let mut plans = self.plans.lock();
        let plan = plans.entry(kind).or_default();
        plan.calls += 1;
        match plan.queued.pop_front().or(plan.sticky) {
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
            None => Ok(()),
        }
    }
}

impl Syscall for FaultInjection {
    fn socket(&self, domain: Domain, ty: Type, protocol: Option<Protocol>) -> io::Result<RawFd> {
        self.check(SyscallKind::Socket)?;
        self.inner.socket(domain, ty, protocol)
    }

    fn bind(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        self.check(SyscallKind::Bind)?;
        self.inner.bind(fd, addr)
    }

    fn listen(&self, fd: RawFd, backlog: i32) -> io::Result<()> {
        self.check(SyscallKind::Listen)?;
        self.inner.listen(fd, backlog)
    }

    fn accept(&self, fd: RawFd) -> io::Result<(RawFd, SockAddr)> {
        self.check(SyscallKind::Accept)?;
        self.inner.accept(fd)
    }

    fn connect(&self, fd: RawFd, addr: &SockAddr) -> io::Result<()> {
        self.check(SyscallKind::Connect)?;
        self.inner.connect(fd, addr)
    }

    fn send(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        self.check(SyscallKind::Send)?;
        self.inner.send(fd, buf)
    }

    fn recv(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        self.check(SyscallKind::Recv)?;
        self.inner.recv(fd, buf)
    }

    fn close(&self, fd: RawFd) -> io::Result<()> {
        self.inner.close(fd)
    }

    fn set_nonblocking(&self, fd: RawFd, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(fd, nonblocking)
    }

    fn set_nodelay(&self, fd: RawFd, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(fd, nodelay)
    }

    fn set_linger(&self, fd: RawFd, linger: Option<Duration>) -> io::Result<()> {
        self.inner.set_linger(fd, linger)
    }

    fn set_reuse_address(&self, fd: RawFd, reuse: bool) -> io::Result<()> {
        self.inner.set_reuse_address(fd, reuse)
    }

    fn local_addr(&self, fd: RawFd) -> io::Result<SockAddr> {
        self.inner.local_addr(fd)
    }

    fn take_error(&self, fd: RawFd) -> io::Result<Option<io::Error>> {
        self.inner.take_error(fd)
    }

    fn wake_pair(&self) -> io::Result<(RawFd, RawFd)> {
        self.inner.wake_pair()
    }

    fn epoll_create(&self) -> io::Result<RawFd> {
        self.check(SyscallKind::EpollCreate)?;
        self.inner.epoll_create()
    }

    fn epoll_ctl(&self, epfd: RawFd, op: CtlOp, fd: RawFd, events: u32) -> io::Result<()> {
        self.check(SyscallKind::EpollCtl)?;
        self.inner.epoll_ctl(epfd, op, fd, events)
    }

    fn epoll_wait(
        &self,
        epfd: RawFd,
        events: &mut [ReadyEvent],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        self.check(SyscallKind::EpollWait)?;
        self.inner.epoll_wait(epfd, events, timeout_ms)
    }

    fn bytes_available(&self, fd: RawFd) -> io::Result<usize> {
        self.check(SyscallKind::BytesAvailable)?;
        self.inner.bytes_available(fd)
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_queued_failures_then_passthrough() {
        let faults = FaultInjection::new(crate::sys::os());
        faults.fail_next(SyscallKind::Socket, libc::EMFILE);

        let err = faults
            .socket(Domain::IPV4, Type::STREAM, None)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EMFILE));

        let fd = faults.socket(Domain::IPV4, Type::STREAM, None).unwrap();
        assert!(fd >= 0);
        faults.close(fd).unwrap();
        assert_eq!(faults.calls(SyscallKind::Socket), 2);
    }

    #[test]
    fn test_sticky_failure_and_clear() {
        let faults = FaultInjection::new(crate::sys::os());
        faults.fail_always(SyscallKind::EpollCreate, libc::ENOMEM);
        assert!(faults.epoll_create().is_err());
        assert!(faults.epoll_create().is_err());

        faults.clear(SyscallKind::EpollCreate);
        let epfd = faults.epoll_create().unwrap();
        faults.close(epfd).unwrap();
    }
}
